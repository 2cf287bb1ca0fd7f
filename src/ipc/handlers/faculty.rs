use super::users::account_from_params;
use crate::backend::Backend;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_required_str, list_profiles, profile_with_role, report, report_failure, require_role,
    services,
};
use crate::ipc::types::{AppState, Request, Services};
use crate::model::{ProfilePatch, Role};
use serde_json::json;

fn list(svc: &Services) -> Result<serde_json::Value, HandlerErr> {
    let conn = svc.db.lock();
    let faculty = list_profiles(&conn, Some(Role::Teacher))?;
    Ok(json!({ "faculty": faculty }))
}

fn create(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let account = account_from_params(params, Role::Teacher)?;
    let profile = svc.backend.sign_up(&account)?;
    Ok(json!({ "member": profile }))
}

fn ensure_teacher(svc: &Services, id: &str) -> Result<(), HandlerErr> {
    let conn = svc.db.lock();
    profile_with_role(&conn, id, Role::Teacher).map(|_| ())
}

async fn update(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let raw = params
        .get("patch")
        .ok_or_else(|| HandlerErr::bad_params("missing/invalid patch"))?;
    let patch = ProfilePatch::from_json(raw, false).map_err(HandlerErr::bad_params)?;
    ensure_teacher(svc, &id)?;
    match svc.backend.update_profile(&id, &patch).await? {
        Some(profile) => Ok(json!({ "member": profile })),
        None => Err(HandlerErr::not_found("teacher not found")),
    }
}

fn delete(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    ensure_teacher(svc, &id)?;
    svc.backend.admin_delete_user(&id)?;
    Ok(json!({ "ok": true }))
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("faculty.") {
        return None;
    }
    let svc = match services(state) {
        Ok(svc) => svc,
        Err(e) => return Some(e.response(&req.id)),
    };
    let result = match req.method.as_str() {
        "faculty.list" => {
            let result = list(svc);
            report_failure(&mut svc.notifier, result, "Error fetching faculty")
        }
        "faculty.create" => {
            let result = create(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Faculty member created successfully",
                "Error creating faculty member",
            )
        }
        "faculty.update" => {
            let result = update(svc, &req.params).await;
            report(
                &mut svc.notifier,
                result,
                "Faculty member updated successfully",
                "Error updating faculty member",
            )
        }
        "faculty.delete" => {
            let result = delete(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Faculty member deleted successfully",
                "Error deleting faculty member",
            )
        }
        _ => return None,
    };
    Some(respond(&req.id, result))
}
