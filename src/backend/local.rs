use super::{AuthChange, AuthEvent, AuthSession, AuthUser, Backend, BackendError, Subscription};
use crate::db::{self, Database};
use crate::model::{Profile, ProfilePatch, Role, PROFILE_COLUMNS};
use crate::settings;
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use password_hash::{PasswordHash, SaltString};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use uuid::Uuid;

const CURRENT_SESSION_KEY: &str = "auth.current_session";
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub department: Option<String>,
}

/// Auth and profile service backed by the workspace database.
///
/// The "current session" is this client's persisted login, kept in the
/// settings table so a restarted process picks it back up.
pub struct LocalBackend {
    db: Database,
    events: broadcast::Sender<AuthEvent>,
}

fn hash_password(password: &str) -> Result<String, BackendError> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| BackendError::Hash(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| BackendError::Hash(e.to_string()))?;
    let phc = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| BackendError::Hash(e.to_string()))?
        .to_string();
    Ok(phc)
}

fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn new_token() -> Result<String, BackendError> {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| BackendError::Hash(e.to_string()))?;
    Ok(hex::encode(buf))
}

fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn select_profile(conn: &Connection, id: &str) -> rusqlite::Result<Option<Profile>> {
    conn.query_row(
        &format!("SELECT {} FROM profiles WHERE id = ?", PROFILE_COLUMNS),
        [id],
        |r| Profile::from_row(r, 0),
    )
    .optional()
}

fn read_current(conn: &Connection) -> Result<Option<AuthSession>, BackendError> {
    let stored = db::settings_get_json(conn, CURRENT_SESSION_KEY)
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;
    let Some(v) = stored else {
        return Ok(None);
    };
    let field = |k: &str| v.get(k).and_then(|x| x.as_str()).map(|s| s.to_string());
    let (Some(token), Some(user_id), Some(email), Some(expires_at)) = (
        field("accessToken"),
        field("userId"),
        field("email"),
        field("expiresAt"),
    ) else {
        clear_current(conn)?;
        return Ok(None);
    };

    // Revoked elsewhere or expired: the persisted copy is dead.
    let live: Option<String> = conn
        .query_row(
            "SELECT expires_at FROM auth_sessions WHERE token_hash = ? AND user_id = ?",
            (token_hash(&token), &user_id),
            |r| r.get(0),
        )
        .optional()?;
    let still_valid = live
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc) > Utc::now())
        .unwrap_or(false);
    if !still_valid {
        clear_current(conn)?;
        return Ok(None);
    }

    Ok(Some(AuthSession {
        access_token: token,
        user: AuthUser { id: user_id, email },
        expires_at,
    }))
}

fn write_current(conn: &Connection, session: &AuthSession) -> Result<(), BackendError> {
    db::settings_set_json(
        conn,
        CURRENT_SESSION_KEY,
        &json!({
            "accessToken": session.access_token,
            "userId": session.user.id,
            "email": session.user.email,
            "expiresAt": session.expires_at,
        }),
    )
    .map_err(|e| BackendError::Unavailable(e.to_string()))
}

fn clear_current(conn: &Connection) -> Result<(), BackendError> {
    db::settings_delete(conn, CURRENT_SESSION_KEY)
        .map_err(|e| BackendError::Unavailable(e.to_string()))
}

fn issue_session(conn: &Connection, user: AuthUser) -> Result<AuthSession, BackendError> {
    let auth = settings::auth(conn).map_err(|e| BackendError::Unavailable(e.to_string()))?;
    let token = new_token()?;
    let now = Utc::now();
    conn.execute(
        "DELETE FROM auth_sessions WHERE expires_at < ?",
        [now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)],
    )?;
    let expires_at = (now + Duration::minutes(auth.session_ttl_minutes))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    conn.execute(
        "INSERT INTO auth_sessions(token_hash, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (token_hash(&token), &user.id, db::now_ts(), &expires_at),
    )?;
    let session = AuthSession {
        access_token: token,
        user,
        expires_at,
    };
    write_current(conn, &session)?;
    Ok(session)
}

impl LocalBackend {
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { db, events }
    }

    fn publish(&self, change: AuthChange, session: Option<AuthSession>) {
        // No listeners is not an error.
        let _ = self.events.send(AuthEvent { change, session });
    }

    fn current_user_id(&self) -> Option<String> {
        let conn = self.db.lock();
        read_current(&conn).ok().flatten().map(|s| s.user.id)
    }

    fn sign_in_blocking(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
        let email = normalize_email(email);
        let conn = self.db.lock();
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT id, email, password_hash FROM auth_users WHERE email = ?",
                [&email],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((id, email, hash)) = row else {
            return Err(BackendError::InvalidCredentials);
        };
        if !verify_password(&hash, password) {
            return Err(BackendError::InvalidCredentials);
        }
        // A new login replaces this client's previous token.
        if let Some(previous) = read_current(&conn)? {
            conn.execute(
                "DELETE FROM auth_sessions WHERE token_hash = ?",
                [token_hash(&previous.access_token)],
            )?;
        }
        issue_session(&conn, AuthUser { id, email })
    }

    fn sign_out_blocking(&self) -> Result<(), BackendError> {
        let conn = self.db.lock();
        let current = read_current(&conn);
        // Drop the local copy before touching the token table.
        let cleared = clear_current(&conn);
        if let Ok(Some(session)) = &current {
            conn.execute(
                "DELETE FROM auth_sessions WHERE token_hash = ?",
                [token_hash(&session.access_token)],
            )?;
        }
        current?;
        cleared
    }

    fn update_profile_blocking(
        &self,
        id: &str,
        patch: &ProfilePatch,
    ) -> Result<Option<Profile>, BackendError> {
        let conn = self.db.lock();
        if patch.is_empty() {
            return Ok(select_profile(&conn, id)?);
        }
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(role) = patch.role {
            sets.push("role = ?");
            values.push(Value::Text(role.as_str().to_string()));
        }
        if let Some(email) = &patch.email {
            sets.push("email = ?");
            values.push(Value::Text(normalize_email(email)));
        }
        if let Some(first) = &patch.first_name {
            sets.push("first_name = ?");
            values.push(Value::Text(first.clone()));
        }
        if let Some(last) = &patch.last_name {
            sets.push("last_name = ?");
            values.push(Value::Text(last.clone()));
        }
        if let Some(avatar) = &patch.avatar_url {
            sets.push("avatar_url = ?");
            values.push(avatar.clone().map(Value::Text).unwrap_or(Value::Null));
        }
        if let Some(dept) = &patch.department {
            sets.push("department = ?");
            values.push(dept.clone().map(Value::Text).unwrap_or(Value::Null));
        }
        sets.push("updated_at = ?");
        values.push(Value::Text(db::now_ts()));
        values.push(Value::Text(id.to_string()));

        if let Some(email) = &patch.email {
            let email = normalize_email(email);
            let owner: Option<String> = conn
                .query_row("SELECT id FROM auth_users WHERE email = ?", [&email], |r| r.get(0))
                .optional()?;
            if owner.is_some_and(|o| o != id) {
                return Err(BackendError::EmailTaken(email));
            }
        }

        let tx = conn.unchecked_transaction()?;
        let sql = format!("UPDATE profiles SET {} WHERE id = ?", sets.join(", "));
        let changed = tx.execute(&sql, params_from_iter(values.iter()))?;
        if changed == 0 {
            return Ok(None);
        }
        // Login email follows the profile.
        if let Some(email) = &patch.email {
            tx.execute(
                "UPDATE auth_users SET email = ? WHERE id = ?",
                (normalize_email(email), id),
            )?;
        }
        tx.commit()?;
        Ok(select_profile(&conn, id)?)
    }

    /// Creates an auth user together with its profile row.
    pub fn sign_up(&self, account: &NewAccount) -> Result<Profile, BackendError> {
        let email = normalize_email(&account.email);
        let conn = self.db.lock();
        let auth = settings::auth(&conn).map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if account.password.chars().count() < auth.min_password_length {
            return Err(BackendError::WeakPassword(auth.min_password_length));
        }
        let taken: Option<i64> = conn
            .query_row("SELECT 1 FROM auth_users WHERE email = ?", [&email], |r| r.get(0))
            .optional()?;
        if taken.is_some() {
            return Err(BackendError::EmailTaken(email));
        }
        let hash = hash_password(&account.password)?;
        let id = Uuid::new_v4().to_string();
        let now = db::now_ts();

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO auth_users(id, email, password_hash, created_at) VALUES(?, ?, ?, ?)",
            (&id, &email, &hash, &now),
        )?;
        tx.execute(
            "INSERT INTO profiles(id, role, email, first_name, last_name, avatar_url, department, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, NULL, ?, ?, ?)",
            (
                &id,
                account.role.as_str(),
                &email,
                account.first_name.trim(),
                account.last_name.trim(),
                &account.department,
                &now,
                &now,
            ),
        )?;
        tx.commit()?;

        tracing::info!(user = %id, role = %account.role, "auth user created");
        select_profile(&conn, &id)?.ok_or(BackendError::UserNotFound(id))
    }

    /// Removes an account, its sessions and its profile. Signs this client out
    /// if the account owned the current session.
    pub fn admin_delete_user(&self, id: &str) -> Result<(), BackendError> {
        let owned_current = self.current_user_id().as_deref() == Some(id);
        {
            let conn = self.db.lock();
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM auth_users WHERE id = ?", [id], |r| r.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(BackendError::UserNotFound(id.to_string()));
            }

            let tx = conn.unchecked_transaction()?;
            tx.execute("UPDATE courses SET teacher_id = NULL WHERE teacher_id = ?", [id])?;
            tx.execute("UPDATE students SET parent_id = NULL WHERE parent_id = ?", [id])?;
            tx.execute("DELETE FROM submissions WHERE student_id = ?", [id])?;
            tx.execute("DELETE FROM attendance WHERE student_id = ?", [id])?;
            tx.execute("DELETE FROM students WHERE profile_id = ?", [id])?;
            tx.execute("DELETE FROM profiles WHERE id = ?", [id])?;
            tx.execute("DELETE FROM auth_sessions WHERE user_id = ?", [id])?;
            tx.execute("DELETE FROM auth_users WHERE id = ?", [id])?;
            if owned_current {
                db::settings_delete(&tx, CURRENT_SESSION_KEY)
                    .map_err(|e| BackendError::Unavailable(e.to_string()))?;
            }
            tx.commit()?;
        }

        tracing::info!(user = %id, "auth user deleted");
        if owned_current {
            self.publish(AuthChange::SignedOut, None);
        }
        Ok(())
    }

    /// Rotates the current session's token. `None` when nobody is signed in.
    pub async fn refresh_session(&self) -> Result<Option<AuthSession>, BackendError> {
        let refreshed = {
            let conn = self.db.lock();
            match read_current(&conn)? {
                None => None,
                Some(old) => {
                    let tx = conn.unchecked_transaction()?;
                    tx.execute(
                        "DELETE FROM auth_sessions WHERE token_hash = ?",
                        [token_hash(&old.access_token)],
                    )?;
                    let session = issue_session(&tx, old.user)?;
                    tx.commit()?;
                    Some(session)
                }
            }
        };
        if let Some(session) = &refreshed {
            tracing::debug!(user = %session.user.id, "session token refreshed");
            self.publish(AuthChange::TokenRefreshed, Some(session.clone()));
        }
        Ok(refreshed)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn get_session(&self) -> Result<Option<AuthSession>, BackendError> {
        let conn = self.db.lock();
        read_current(&conn)
    }

    fn on_auth_state_change(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError> {
        let session = self.sign_in_blocking(email, password)?;
        tracing::debug!(user = %session.user.id, "credentials accepted");
        self.publish(AuthChange::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let result = self.sign_out_blocking();
        self.publish(AuthChange::SignedOut, None);
        result
    }

    async fn fetch_profile(&self, id: &str) -> Result<Option<Profile>, BackendError> {
        let conn = self.db.lock();
        Ok(select_profile(&conn, id)?)
    }

    async fn update_profile(
        &self,
        id: &str,
        patch: &ProfilePatch,
    ) -> Result<Option<Profile>, BackendError> {
        let updated = self.update_profile_blocking(id, patch)?;
        if let Some(profile) = &updated {
            let current = {
                let conn = self.db.lock();
                match read_current(&conn)?.filter(|s| s.user.id == id) {
                    // The persisted identity follows the login email.
                    Some(mut session) if session.user.email != profile.email => {
                        session.user.email = profile.email.clone();
                        write_current(&conn, &session)?;
                        Some(session)
                    }
                    other => other,
                }
            };
            if let Some(session) = current {
                self.publish(AuthChange::UserUpdated, Some(session));
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_backend(prefix: &str) -> LocalBackend {
        let p: PathBuf = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let conn = db::open_db(&p).expect("open db");
        LocalBackend::new(db::shared(conn))
    }

    fn account(email: &str, role: Role) -> NewAccount {
        NewAccount {
            email: email.to_string(),
            password: "correct-password".to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            role,
            department: None,
        }
    }

    #[tokio::test]
    async fn sign_in_persists_session_and_sign_out_revokes_it() {
        let backend = temp_backend("schoold-backend-signin");
        backend.sign_up(&account("Admin@School.test", Role::Admin)).expect("sign up");

        let session = backend
            .sign_in_with_password("admin@school.test", "correct-password")
            .await
            .expect("sign in");
        assert_eq!(session.user.email, "admin@school.test");
        assert_eq!(backend.get_session().await.expect("get"), Some(session.clone()));

        backend.sign_out().await.expect("sign out");
        assert_eq!(backend.get_session().await.expect("get"), None);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_look_the_same() {
        let backend = temp_backend("schoold-backend-badcreds");
        backend.sign_up(&account("t@school.test", Role::Teacher)).expect("sign up");
        let a = backend.sign_in_with_password("t@school.test", "nope").await;
        let b = backend.sign_in_with_password("who@school.test", "nope").await;
        assert!(matches!(a, Err(BackendError::InvalidCredentials)));
        assert!(matches!(b, Err(BackendError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn deleting_current_user_broadcasts_signed_out() {
        let backend = temp_backend("schoold-backend-delete");
        let profile = backend.sign_up(&account("s@school.test", Role::Student)).expect("sign up");
        let mut sub = backend.on_auth_state_change();
        backend
            .sign_in_with_password("s@school.test", "correct-password")
            .await
            .expect("sign in");

        backend.admin_delete_user(&profile.id).expect("delete");

        let first = sub.recv().await.expect("signed in event");
        assert_eq!(first.change, AuthChange::SignedIn);
        let second = sub.recv().await.expect("signed out event");
        assert_eq!(second.change, AuthChange::SignedOut);
        assert!(second.session.is_none());
        assert_eq!(backend.get_session().await.expect("get"), None);
    }

    #[tokio::test]
    async fn refresh_rotates_token() {
        let backend = temp_backend("schoold-backend-refresh");
        backend.sign_up(&account("p@school.test", Role::Parent)).expect("sign up");
        let before = backend
            .sign_in_with_password("p@school.test", "correct-password")
            .await
            .expect("sign in");
        let after = backend.refresh_session().await.expect("refresh").expect("session");
        assert_ne!(before.access_token, after.access_token);
        assert_eq!(backend.get_session().await.expect("get"), Some(after));
    }

    #[tokio::test]
    async fn email_change_updates_persisted_identity() {
        let backend = temp_backend("schoold-backend-email");
        let profile = backend.sign_up(&account("a@school.test", Role::Admin)).expect("sign up");
        backend
            .sign_in_with_password("a@school.test", "correct-password")
            .await
            .expect("sign in");
        let patch = ProfilePatch {
            email: Some("New@School.test".into()),
            ..ProfilePatch::default()
        };
        let row = backend
            .update_profile(&profile.id, &patch)
            .await
            .expect("update")
            .expect("row");
        assert_eq!(row.email, "new@school.test");
        let session = backend.get_session().await.expect("get").expect("session");
        assert_eq!(session.user.email, "new@school.test");
        backend
            .sign_in_with_password("new@school.test", "correct-password")
            .await
            .expect("sign in with new email");
    }

    fn session_rows(backend: &LocalBackend) -> i64 {
        backend
            .db
            .lock()
            .query_row("SELECT COUNT(*) FROM auth_sessions", [], |r| r.get(0))
            .expect("count")
    }

    #[tokio::test]
    async fn repeated_sign_in_replaces_token_and_prunes_expired() {
        let backend = temp_backend("schoold-backend-tokens");
        let profile = backend.sign_up(&account("t@school.test", Role::Teacher)).expect("sign up");
        backend
            .db
            .lock()
            .execute(
                "INSERT INTO auth_sessions(token_hash, user_id, created_at, expires_at)
                 VALUES('stale', ?, '2000-01-01T00:00:00.000Z', '2000-01-01T01:00:00.000Z')",
                [&profile.id],
            )
            .expect("seed expired row");

        for _ in 0..3 {
            backend
                .sign_in_with_password("t@school.test", "correct-password")
                .await
                .expect("sign in");
        }
        assert_eq!(session_rows(&backend), 1);
        assert!(backend.get_session().await.expect("get").is_some());
    }

    #[test]
    fn short_passwords_are_rejected() {
        let backend = temp_backend("schoold-backend-weak");
        let mut acct = account("x@school.test", Role::Student);
        acct.password = "short".into();
        assert!(matches!(backend.sign_up(&acct), Err(BackendError::WeakPassword(8))));
    }
}
