use crate::backend::{Backend, NewAccount};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, list_profiles, report, report_failure, require_role,
    services,
};
use crate::ipc::types::{AppState, Request, Services};
use crate::model::{ProfilePatch, Role};
use serde_json::json;

pub(super) fn account_from_params(
    params: &serde_json::Value,
    role: Role,
) -> Result<NewAccount, HandlerErr> {
    Ok(NewAccount {
        email: get_required_str(params, "email")?,
        password: get_required_str(params, "password")?,
        first_name: get_required_str(params, "firstName")?,
        last_name: get_required_str(params, "lastName")?,
        role,
        department: get_optional_str(params, "department")?,
    })
}

fn list(svc: &Services) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let conn = svc.db.lock();
    let users = list_profiles(&conn, None)?;
    Ok(json!({ "users": users }))
}

fn create(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let role = get_required_str(params, "role")?
        .parse::<Role>()
        .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    let account = account_from_params(params, role)?;
    let profile = svc.backend.sign_up(&account)?;
    Ok(json!({ "user": profile }))
}

async fn update(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let raw = params
        .get("patch")
        .ok_or_else(|| HandlerErr::bad_params("missing/invalid patch"))?;
    let patch = ProfilePatch::from_json(raw, true).map_err(HandlerErr::bad_params)?;
    match svc.backend.update_profile(&id, &patch).await? {
        Some(profile) => Ok(json!({ "user": profile })),
        None => Err(HandlerErr::not_found("user not found")),
    }
}

fn delete(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    svc.backend.admin_delete_user(&id)?;
    Ok(json!({ "ok": true }))
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("users.") {
        return None;
    }
    let svc = match services(state) {
        Ok(svc) => svc,
        Err(e) => return Some(e.response(&req.id)),
    };
    let result = match req.method.as_str() {
        "users.list" => {
            let result = list(svc);
            report_failure(&mut svc.notifier, result, "Error fetching users")
        }
        "users.create" => {
            let result = create(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "User created successfully",
                "Error creating user",
            )
        }
        "users.update" => {
            let result = update(svc, &req.params).await;
            report(
                &mut svc.notifier,
                result,
                "User updated successfully",
                "Error updating user",
            )
        }
        "users.delete" => {
            let result = delete(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "User deleted successfully",
                "Error deleting user",
            )
        }
        _ => return None,
    };
    Some(respond(&req.id, result))
}
