use crate::backend::NewAccount;
use crate::guard;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_str, report, services};
use crate::ipc::types::{AppState, Request};
use crate::model::{ProfilePatch, Role};
use serde_json::json;

fn handle_session(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let svc = services(state)?;
    Ok(svc.session.snapshot().to_json())
}

/// Creates the first admin of an empty school. Refused once any admin exists.
fn handle_bootstrap(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let svc = services(state)?;
    let account = NewAccount {
        email: get_required_str(&req.params, "email")?,
        password: get_required_str(&req.params, "password")?,
        first_name: get_required_str(&req.params, "firstName")?,
        last_name: get_required_str(&req.params, "lastName")?,
        role: Role::Admin,
        department: None,
    };
    let admins: i64 = {
        let conn = svc.db.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM profiles WHERE role = 'admin'",
            [],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?
    };
    if admins > 0 {
        return Err(HandlerErr::new("forbidden", "school already has an admin"));
    }
    let profile = svc.backend.sign_up(&account)?;
    tracing::info!(user = %profile.id, "bootstrap admin created");
    Ok(json!({ "profile": profile }))
}

async fn handle_sign_in(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let svc = services(state)?;
    let email = get_required_str(&req.params, "email")?;
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    let role = get_required_str(&req.params, "role")?
        .parse::<Role>()
        .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    let from = get_optional_str(&req.params, "from")?;

    let result = svc
        .session
        .sign_in(&email, password, role)
        .await
        .map_err(HandlerErr::from);
    let profile = report(
        &mut svc.notifier,
        result,
        "Successfully signed in",
        "Error signing in",
    )?;
    let snapshot = svc.session.snapshot();
    Ok(json!({
        "profile": profile,
        "session": snapshot.to_json(),
        "redirect": guard::landing(&snapshot, from.as_deref()),
    }))
}

async fn handle_sign_out(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let svc = services(state)?;
    let remote_revoked = match svc.session.sign_out().await {
        Ok(()) => {
            svc.notifier.success("Successfully signed out");
            true
        }
        Err(_) => {
            svc.notifier.error("Error signing out");
            false
        }
    };
    Ok(json!({
        "session": svc.session.snapshot().to_json(),
        "remoteRevoked": remote_revoked,
    }))
}

async fn handle_update_profile(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let svc = services(state)?;
    let patch = ProfilePatch::from_json(&req.params, false).map_err(HandlerErr::bad_params)?;
    let result = svc
        .session
        .update_profile(patch)
        .await
        .map_err(HandlerErr::from);
    let profile = report(
        &mut svc.notifier,
        result,
        "Profile updated successfully",
        "Error updating profile",
    )?;
    Ok(json!({ "profile": profile }))
}

async fn handle_refresh(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let svc = services(state)?;
    match svc.backend.refresh_session().await? {
        Some(session) => Ok(json!({ "expiresAt": session.expires_at })),
        None => Err(HandlerErr::new("not_authenticated", "no active session")),
    }
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.session" => handle_session(state),
        "auth.bootstrap" => handle_bootstrap(state, req),
        "auth.signIn" => handle_sign_in(state, req).await,
        "auth.signOut" => handle_sign_out(state).await,
        "auth.updateProfile" => handle_update_profile(state, req).await,
        "auth.refresh" => handle_refresh(state).await,
        _ => return None,
    };
    Some(respond(&req.id, result))
}
