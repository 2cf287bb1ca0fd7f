//! Boundary to the authentication/data service.
//!
//! The session store only ever talks to a `Backend`. The workspace ships a
//! SQLite-backed implementation (`LocalBackend`); tests substitute scripted
//! fakes.

mod local;

pub use local::{LocalBackend, NewAccount};

use crate::model::{Profile, ProfilePatch};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

/// Opaque reference to an authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    #[serde(skip_serializing)]
    pub access_token: String,
    pub user: AuthUser,
    pub expires_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthChange {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// One auth-state notification. `session` is the session active after the change.
#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub change: AuthChange,
    pub session: Option<AuthSession>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("email already registered: {0}")]
    EmailTaken(String),
    #[error("password must be at least {0} characters")]
    WeakPassword(usize),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("{0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::InvalidCredentials => "invalid_credentials",
            BackendError::EmailTaken(_) => "email_taken",
            BackendError::WeakPassword(_) => "weak_password",
            BackendError::UserNotFound(_) => "not_found",
            BackendError::Hash(_) => "hash_failed",
            BackendError::Storage(_) => "db_query_failed",
            BackendError::Unavailable(_) => "backend_unavailable",
        }
    }
}

/// Standing listener registered with `Backend::on_auth_state_change`.
///
/// Dropping the subscription detaches it.
pub struct Subscription {
    rx: broadcast::Receiver<AuthEvent>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<AuthEvent>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` once the backend is gone.
    pub async fn recv(&mut self) -> Option<AuthEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                // Every event forces a full refresh, so skipped ones carry nothing extra.
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "auth listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {
        // Dropping the receiver detaches it from the channel.
        drop(self.rx);
    }
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn get_session(&self) -> Result<Option<AuthSession>, BackendError>;

    fn on_auth_state_change(&self) -> Subscription;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>, BackendError>;

    /// Applies `patch` and returns the stored row, or `None` if no row has `id`.
    async fn update_profile(
        &self,
        id: &str,
        patch: &ProfilePatch,
    ) -> Result<Option<Profile>, BackendError>;
}
