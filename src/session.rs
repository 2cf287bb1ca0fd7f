//! Session store: who is signed in, and as what.
//!
//! State is published through a `watch` channel so observers always read a
//! whole snapshot. Identity and profile live together in one `Option`, which
//! keeps "identity without role" unrepresentable.
//!
//! Async resyncs race each other at await points. Each one captures the
//! store generation before its first await and commits only if nothing has
//! bumped it since. Sign-out, sign-in failures and "no session" notifications
//! bump the generation.

use crate::backend::{AuthEvent, AuthUser, Backend, BackendError, Subscription};
use crate::model::{Profile, ProfilePatch, Role};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub identity: AuthUser,
    pub profile: Profile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    auth: Option<AuthContext>,
    pub loading: bool,
    pub initialized: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            auth: None,
            loading: true,
            initialized: false,
        }
    }
}

impl SessionState {
    pub fn auth(&self) -> Option<&AuthContext> {
        self.auth.as_ref()
    }

    pub fn identity(&self) -> Option<&AuthUser> {
        self.auth.as_ref().map(|a| &a.identity)
    }

    pub fn profile(&self) -> Option<&Profile> {
        self.auth.as_ref().map(|a| &a.profile)
    }

    pub fn role(&self) -> Option<Role> {
        self.auth.as_ref().map(|a| a.profile.role)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "identity": self.identity(),
            "profile": self.profile(),
            "role": self.role(),
            "loading": self.loading,
            "initialized": self.initialized,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("invalid role: expected {expected} but got {actual}")]
    RoleMismatch { expected: Role, actual: Role },
    #[error("no profile found")]
    ProfileNotFound,
    #[error("no user logged in")]
    NotAuthenticated,
    #[error("error fetching user profile: {0}")]
    ProfileFetchFailed(#[source] BackendError),
    #[error("error updating profile: {0}")]
    ProfileUpdateFailed(#[source] BackendError),
    #[error("sign-in superseded by a later sign-out")]
    Superseded,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidCredentials => "invalid_credentials",
            SessionError::RoleMismatch { .. } => "role_mismatch",
            SessionError::ProfileNotFound => "profile_not_found",
            SessionError::NotAuthenticated => "not_authenticated",
            SessionError::ProfileFetchFailed(_) => "profile_fetch_failed",
            SessionError::ProfileUpdateFailed(_) => "profile_update_failed",
            SessionError::Superseded => "superseded",
            SessionError::Backend(_) => "backend_error",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            SessionError::RoleMismatch { expected, actual } => {
                Some(json!({ "expected": expected, "actual": actual }))
            }
            _ => None,
        }
    }
}

struct Inner<B: Backend> {
    backend: Arc<B>,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
    in_flight: AtomicUsize,
    init_started: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Marks an operation in flight for the `loading` flag.
struct Busy<'a, B: Backend> {
    inner: &'a Inner<B>,
}

impl<B: Backend> Drop for Busy<'_, B> {
    fn drop(&mut self) {
        let left = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.inner.state.send_if_modified(|s| {
            let loading = left > 0 || !s.initialized;
            let changed = s.loading != loading;
            s.loading = loading;
            changed
        });
    }
}

impl<B: Backend> Inner<B> {
    fn busy(&self) -> Busy<'_, B> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|s| !std::mem::replace(&mut s.loading, true));
        Busy { inner: self }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Back to anonymous. Invalidates every resync still in flight.
    fn reset(&self) {
        self.bump();
        self.state.send_if_modified(|s| s.auth.take().is_some());
    }

    /// Replaces the auth half of the state if no reset happened since `seen`.
    fn commit(&self, seen: u64, auth: Option<AuthContext>) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|s| {
            if self.generation() != seen {
                return false;
            }
            applied = true;
            if s.auth == auth {
                return false;
            }
            s.auth = auth;
            true
        });
        applied
    }

    async fn load_context(&self) -> Result<Option<AuthContext>, BackendError> {
        let Some(session) = self.backend.get_session().await? else {
            return Ok(None);
        };
        let profile = self.backend.fetch_profile(&session.user.id).await?;
        Ok(profile.map(|profile| AuthContext {
            identity: session.user,
            profile,
        }))
    }

    /// Full refresh from the backend; every notification is treated as authoritative.
    async fn apply(&self, event: AuthEvent) {
        if event.session.is_none() {
            tracing::debug!(change = ?event.change, "auth notification without session");
            self.reset();
            return;
        }
        let seen = self.generation();
        match self.load_context().await {
            Ok(auth) => {
                let role = auth.as_ref().map(|a| a.profile.role);
                if self.commit(seen, auth) {
                    tracing::debug!(change = ?event.change, role = ?role, "session resynced");
                } else {
                    tracing::debug!(change = ?event.change, "stale resync discarded");
                }
            }
            Err(e) => {
                tracing::warn!(change = ?event.change, error = %e, "session resync failed");
            }
        }
    }
}

impl<B: Backend> Drop for Inner<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

async fn listen<B: Backend>(inner: Weak<Inner<B>>, mut sub: Subscription) {
    tracing::debug!("auth listener started");
    while let Some(event) = sub.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply(event).await;
    }
    sub.unsubscribe();
    tracing::debug!("auth listener stopped");
}

pub struct SessionStore<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for SessionStore<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> SessionStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            inner: Arc::new(Inner {
                backend,
                state,
                generation: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                init_started: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Restores any persisted session and starts the auth-change listener.
    /// Runs once; later calls return immediately. Never fails: problems are
    /// logged and the store settles anonymous.
    pub async fn initialize(&self) {
        if self.inner.init_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        let _busy = inner.busy();

        // Subscribe before the first fetch so nothing slips between the two.
        let sub = inner.backend.on_auth_state_change();
        let handle = tokio::spawn(listen(Arc::downgrade(inner), sub));
        *inner.listener.lock() = Some(handle);

        let seen = inner.generation();
        match inner.load_context().await {
            Ok(Some(auth)) => {
                let role = auth.profile.role;
                if inner.commit(seen, Some(auth)) {
                    tracing::info!(role = %role, "restored persisted session");
                }
            }
            Ok(None) => tracing::debug!("no persisted session"),
            Err(e) => tracing::warn!(error = %e, "session restore failed; starting anonymous"),
        }
        inner.state.send_modify(|s| s.initialized = true);
    }

    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
        expected: Role,
    ) -> Result<Profile, SessionError> {
        let inner = &self.inner;
        let _busy = inner.busy();
        let seen = inner.generation();

        let session = match inner.backend.sign_in_with_password(email, password).await {
            Ok(s) => s,
            Err(BackendError::InvalidCredentials) => {
                return Err(self.revert(SessionError::InvalidCredentials).await)
            }
            Err(e) => return Err(self.revert(SessionError::Backend(e)).await),
        };

        let profile = match inner.backend.fetch_profile(&session.user.id).await {
            Ok(Some(p)) => p,
            Ok(None) => return Err(self.revert(SessionError::ProfileNotFound).await),
            Err(e) => return Err(self.revert(SessionError::ProfileFetchFailed(e)).await),
        };
        if profile.role != expected {
            let err = SessionError::RoleMismatch {
                expected,
                actual: profile.role,
            };
            return Err(self.revert(err).await);
        }

        let auth = AuthContext {
            identity: session.user,
            profile: profile.clone(),
        };
        if !inner.commit(seen, Some(auth)) {
            // A sign-out landed while we were waiting; do not resurrect the session.
            if let Err(e) = inner.backend.sign_out().await {
                tracing::warn!(error = %e, "revoking superseded sign-in failed");
            }
            tracing::info!(user = %profile.id, "sign-in superseded");
            return Err(SessionError::Superseded);
        }
        tracing::info!(user = %profile.id, role = %profile.role, "signed in");
        Ok(profile)
    }

    /// Any failed sign-in ends anonymous on both sides, including a session
    /// that existed before the attempt.
    async fn revert(&self, err: SessionError) -> SessionError {
        if let Err(e) = self.inner.backend.sign_out().await {
            tracing::warn!(error = %e, "revoking rejected sign-in failed");
        }
        self.inner.reset();
        tracing::info!(code = err.code(), "sign-in failed: {}", err);
        err
    }

    /// Local state is cleared even when the backend call fails.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let _busy = inner.busy();
        inner.bump();
        let result = inner.backend.sign_out().await;
        inner.reset();
        match result {
            Ok(()) => {
                tracing::info!("signed out");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "remote sign-out failed; local session cleared");
                Err(SessionError::Backend(e))
            }
        }
    }

    /// Self-service update. The role cannot be changed this way; the stored
    /// row returned by the backend replaces the cached profile.
    pub async fn update_profile(&self, patch: ProfilePatch) -> Result<Profile, SessionError> {
        let inner = &self.inner;
        let Some(id) = self.snapshot().identity().map(|i| i.id.clone()) else {
            return Err(SessionError::NotAuthenticated);
        };
        let _busy = inner.busy();
        let seen = inner.generation();
        let patch = ProfilePatch { role: None, ..patch };

        let row = match inner.backend.update_profile(&id, &patch).await {
            Ok(Some(row)) => row,
            Ok(None) => return Err(SessionError::ProfileNotFound),
            Err(e) => return Err(SessionError::ProfileUpdateFailed(e)),
        };
        let replacement = row.clone();
        inner.state.send_if_modified(|s| {
            if inner.generation() != seen {
                return false;
            }
            match s.auth.as_mut() {
                Some(auth) if auth.identity.id == id && auth.profile != replacement => {
                    auth.profile = replacement;
                    true
                }
                _ => false,
            }
        });
        tracing::debug!(user = %id, "profile updated");
        Ok(row)
    }

    /// Stops the auth-change listener.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{AuthChange, AuthSession};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::{broadcast, Notify};

    /// Scripted in-memory backend.
    pub(crate) struct FakeBackend {
        accounts: HashMap<String, (String, String)>,
        profiles: Mutex<HashMap<String, Profile>>,
        current: Mutex<Option<AuthSession>>,
        events: broadcast::Sender<AuthEvent>,
        pub calls: AtomicUsize,
        pub fail_sign_out: AtomicBool,
        pub fail_profile_fetch: AtomicBool,
        pub failed_fetches: AtomicUsize,
        sign_in_gate: Mutex<Option<Arc<Notify>>>,
    }

    pub(crate) fn profile(id: &str, role: Role) -> Profile {
        Profile {
            id: id.to_string(),
            role,
            email: format!("{}@school.test", id),
            first_name: "Test".to_string(),
            last_name: id.to_string(),
            avatar_url: None,
            department: None,
        }
    }

    impl FakeBackend {
        /// One account per entry; password is always `correct-password`.
        /// A `None` role means the account has no profile row.
        pub(crate) fn with_accounts(accounts: &[(&str, Option<Role>)]) -> Self {
            let (events, _) = broadcast::channel(32);
            let mut map = HashMap::new();
            let mut profiles = HashMap::new();
            for (id, role) in accounts {
                map.insert(
                    format!("{}@school.test", id),
                    ("correct-password".to_string(), id.to_string()),
                );
                if let Some(role) = role {
                    profiles.insert(id.to_string(), profile(id, *role));
                }
            }
            Self {
                accounts: map,
                profiles: Mutex::new(profiles),
                current: Mutex::new(None),
                events,
                calls: AtomicUsize::new(0),
                fail_sign_out: AtomicBool::new(false),
                fail_profile_fetch: AtomicBool::new(false),
                failed_fetches: AtomicUsize::new(0),
                sign_in_gate: Mutex::new(None),
            }
        }

        pub(crate) fn gate_next_sign_in(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.sign_in_gate.lock() = Some(Arc::clone(&gate));
            gate
        }

        pub(crate) fn current(&self) -> Option<AuthSession> {
            self.current.lock().clone()
        }

        pub(crate) fn revoke_externally(&self) {
            *self.current.lock() = None;
            let _ = self.events.send(AuthEvent {
                change: AuthChange::SignedOut,
                session: None,
            });
        }

        pub(crate) fn remove_profile(&self, id: &str) {
            self.profiles.lock().remove(id);
        }

        /// Broadcasts `change` carrying the current session.
        pub(crate) fn announce(&self, change: AuthChange) {
            let _ = self.events.send(AuthEvent {
                change,
                session: self.current(),
            });
        }

        fn touch(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn get_session(&self) -> Result<Option<AuthSession>, BackendError> {
            self.touch();
            Ok(self.current.lock().clone())
        }

        fn on_auth_state_change(&self) -> Subscription {
            Subscription::new(self.events.subscribe())
        }

        async fn sign_in_with_password(
            &self,
            email: &str,
            password: &str,
        ) -> Result<AuthSession, BackendError> {
            self.touch();
            let gate = self.sign_in_gate.lock().take();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let Some((pw, id)) = self.accounts.get(email) else {
                return Err(BackendError::InvalidCredentials);
            };
            if pw != password {
                return Err(BackendError::InvalidCredentials);
            }
            let session = AuthSession {
                access_token: format!("token-{}", id),
                user: AuthUser {
                    id: id.clone(),
                    email: email.to_string(),
                },
                expires_at: "2999-01-01T00:00:00.000Z".to_string(),
            };
            *self.current.lock() = Some(session.clone());
            let _ = self.events.send(AuthEvent {
                change: AuthChange::SignedIn,
                session: Some(session.clone()),
            });
            Ok(session)
        }

        async fn sign_out(&self) -> Result<(), BackendError> {
            self.touch();
            if self.fail_sign_out.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("network down".into()));
            }
            *self.current.lock() = None;
            let _ = self.events.send(AuthEvent {
                change: AuthChange::SignedOut,
                session: None,
            });
            Ok(())
        }

        async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>, BackendError> {
            self.touch();
            if self.fail_profile_fetch.load(Ordering::SeqCst) {
                self.failed_fetches.fetch_add(1, Ordering::SeqCst);
                return Err(BackendError::Unavailable("profile service down".into()));
            }
            Ok(self.profiles.lock().get(id).cloned())
        }

        async fn update_profile(
            &self,
            id: &str,
            patch: &ProfilePatch,
        ) -> Result<Option<Profile>, BackendError> {
            self.touch();
            let mut profiles = self.profiles.lock();
            let Some(row) = profiles.get_mut(id) else {
                return Ok(None);
            };
            if let Some(role) = patch.role {
                row.role = role;
            }
            if let Some(first) = &patch.first_name {
                row.first_name = first.clone();
            }
            // Server-side default the client never sent.
            row.department = Some("General".to_string());
            Ok(Some(row.clone()))
        }
    }

    fn email(id: &str) -> String {
        format!("{}@school.test", id)
    }

    fn assert_consistent(state: &SessionState) {
        let set = [
            state.identity().is_some(),
            state.profile().is_some(),
            state.role().is_some(),
        ];
        assert!(set.iter().all(|b| *b) || set.iter().all(|b| !*b), "partial session: {:?}", state);
    }

    async fn store_with(accounts: &[(&str, Option<Role>)]) -> (Arc<FakeBackend>, SessionStore<FakeBackend>) {
        let backend = Arc::new(FakeBackend::with_accounts(accounts));
        let store = SessionStore::new(Arc::clone(&backend));
        store.initialize().await;
        (backend, store)
    }

    #[tokio::test]
    async fn sign_in_with_matching_role_authenticates() {
        let (_backend, store) = store_with(&[("admin", Some(Role::Admin))]).await;
        let profile = store
            .sign_in(&email("admin"), "correct-password", Role::Admin)
            .await
            .expect("sign in");
        assert_eq!(profile.role, Role::Admin);
        let state = store.snapshot();
        assert_eq!(state.role(), Some(Role::Admin));
        assert_eq!(state.identity().map(|i| i.id.as_str()), Some("admin"));
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn role_mismatch_reverts_and_revokes() {
        let (backend, store) = store_with(&[("sam", Some(Role::Student))]).await;
        let err = store
            .sign_in(&email("sam"), "correct-password", Role::Teacher)
            .await
            .expect_err("must reject");
        match err {
            SessionError::RoleMismatch { expected, actual } => {
                assert_eq!(expected, Role::Teacher);
                assert_eq!(actual, Role::Student);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.snapshot().identity().is_none());
        assert_eq!(backend.get_session().await.expect("get"), None);
    }

    #[tokio::test]
    async fn missing_profile_signs_out_externally() {
        let (backend, store) = store_with(&[("ghost", None)]).await;
        let err = store
            .sign_in(&email("ghost"), "correct-password", Role::Student)
            .await
            .expect_err("must reject");
        assert!(matches!(err, SessionError::ProfileNotFound));
        assert!(backend.current().is_none());
        assert!(store.snapshot().auth().is_none());
    }

    #[tokio::test]
    async fn bad_password_leaves_anonymous() {
        let (_backend, store) = store_with(&[("tess", Some(Role::Teacher))]).await;
        let err = store
            .sign_in(&email("tess"), "wrong", Role::Teacher)
            .await
            .expect_err("must reject");
        assert!(matches!(err, SessionError::InvalidCredentials));
        assert_consistent(&store.snapshot());
        assert!(store.snapshot().auth().is_none());
    }

    #[tokio::test]
    async fn sign_out_clears_even_when_backend_fails() {
        let (backend, store) = store_with(&[("pat", Some(Role::Parent))]).await;
        store
            .sign_in(&email("pat"), "correct-password", Role::Parent)
            .await
            .expect("sign in");
        backend.fail_sign_out.store(true, Ordering::SeqCst);
        let result = store.sign_out().await;
        assert!(result.is_err());
        assert!(store.snapshot().auth().is_none());
    }

    #[tokio::test]
    async fn update_profile_while_anonymous_makes_no_call() {
        let (backend, store) = store_with(&[]).await;
        let before = backend.calls.load(Ordering::SeqCst);
        let patch = ProfilePatch {
            first_name: Some("X".into()),
            ..ProfilePatch::default()
        };
        let err = store.update_profile(patch).await.expect_err("anonymous");
        assert!(matches!(err, SessionError::NotAuthenticated));
        assert_eq!(backend.calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn update_profile_takes_server_row_and_keeps_role() {
        let (_backend, store) = store_with(&[("tess", Some(Role::Teacher))]).await;
        store
            .sign_in(&email("tess"), "correct-password", Role::Teacher)
            .await
            .expect("sign in");
        let patch = ProfilePatch {
            first_name: Some("Tessa".into()),
            role: Some(Role::Admin),
            ..ProfilePatch::default()
        };
        let row = store.update_profile(patch).await.expect("update");
        assert_eq!(row.role, Role::Teacher);
        let cached = store.snapshot().profile().cloned().expect("profile");
        assert_eq!(cached.first_name, "Tessa");
        assert_eq!(cached.department.as_deref(), Some("General"));
    }

    #[tokio::test]
    async fn initialize_runs_once() {
        let (backend, store) = store_with(&[]).await;
        let calls = backend.calls.load(Ordering::SeqCst);
        store.initialize().await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), calls);
        let state = store.snapshot();
        assert!(state.initialized);
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn initialize_swallows_profile_errors() {
        let backend = Arc::new(FakeBackend::with_accounts(&[("sam", Some(Role::Student))]));
        backend
            .sign_in_with_password(&email("sam"), "correct-password")
            .await
            .expect("seed session");
        backend.fail_profile_fetch.store(true, Ordering::SeqCst);
        let store = SessionStore::new(Arc::clone(&backend));
        store.initialize().await;
        let state = store.snapshot();
        assert!(state.auth().is_none());
        assert!(state.initialized);
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn initialize_restores_persisted_session() {
        let backend = Arc::new(FakeBackend::with_accounts(&[("tess", Some(Role::Teacher))]));
        backend
            .sign_in_with_password(&email("tess"), "correct-password")
            .await
            .expect("seed session");
        let store = SessionStore::new(Arc::clone(&backend));
        assert!(store.snapshot().loading);
        store.initialize().await;
        assert_eq!(store.snapshot().role(), Some(Role::Teacher));
    }

    #[tokio::test]
    async fn external_revoke_clears_state() {
        let (backend, store) = store_with(&[("admin", Some(Role::Admin))]).await;
        store
            .sign_in(&email("admin"), "correct-password", Role::Admin)
            .await
            .expect("sign in");
        let mut rx = store.subscribe();
        backend.revoke_externally();
        let state = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.auth().is_none()),
        )
        .await
        .expect("listener applied revoke")
        .expect("store alive")
        .clone();
        assert_consistent(&state);
    }

    #[tokio::test]
    async fn refresh_without_profile_row_clears_state() {
        let (backend, store) = store_with(&[("tess", Some(Role::Teacher))]).await;
        store
            .sign_in(&email("tess"), "correct-password", Role::Teacher)
            .await
            .expect("sign in");
        let mut rx = store.subscribe();
        backend.remove_profile("tess");
        backend.announce(AuthChange::UserUpdated);
        let state = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.auth().is_none()),
        )
        .await
        .expect("listener cleared state")
        .expect("store alive")
        .clone();
        assert_consistent(&state);
        assert!(backend.current().is_some());
    }

    #[tokio::test]
    async fn refresh_fetch_error_keeps_previous_state() {
        let (backend, store) = store_with(&[("pat", Some(Role::Parent))]).await;
        store
            .sign_in(&email("pat"), "correct-password", Role::Parent)
            .await
            .expect("sign in");
        backend.fail_profile_fetch.store(true, Ordering::SeqCst);
        backend.announce(AuthChange::TokenRefreshed);
        tokio::time::timeout(Duration::from_secs(2), async {
            while backend.failed_fetches.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("listener attempted a refresh");
        tokio::task::yield_now().await;
        let state = store.snapshot();
        assert_eq!(state.role(), Some(Role::Parent));
        assert_eq!(state.identity().map(|i| i.id.as_str()), Some("pat"));
    }

    #[tokio::test]
    async fn late_sign_in_after_sign_out_is_discarded() {
        let backend = Arc::new(FakeBackend::with_accounts(&[("admin", Some(Role::Admin))]));
        let store = SessionStore::new(Arc::clone(&backend));
        let gate = backend.gate_next_sign_in();

        let pending = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .sign_in(&email("admin"), "correct-password", Role::Admin)
                    .await
            })
        };
        tokio::task::yield_now().await;

        store.sign_out().await.expect("sign out");
        gate.notify_one();

        let result = pending.await.expect("join");
        assert!(matches!(result, Err(SessionError::Superseded)));
        assert!(store.snapshot().auth().is_none());
        assert!(backend.current().is_none());
    }

    #[tokio::test]
    async fn sign_in_sign_out_sequences_never_leave_partial_state() {
        let (_backend, store) = store_with(&[
            ("admin", Some(Role::Admin)),
            ("sam", Some(Role::Student)),
            ("ghost", None),
        ])
        .await;
        let steps: [(&str, &str, Role); 6] = [
            ("admin", "correct-password", Role::Admin),
            ("sam", "correct-password", Role::Teacher),
            ("ghost", "correct-password", Role::Student),
            ("sam", "correct-password", Role::Student),
            ("admin", "nope", Role::Admin),
            ("admin", "correct-password", Role::Admin),
        ];
        for (i, (id, pw, role)) in steps.iter().enumerate() {
            let _ = store.sign_in(&email(id), pw, *role).await;
            assert_consistent(&store.snapshot());
            if i % 2 == 1 {
                let _ = store.sign_out().await;
                assert_consistent(&store.snapshot());
                assert!(store.snapshot().auth().is_none());
            }
        }
    }
}
