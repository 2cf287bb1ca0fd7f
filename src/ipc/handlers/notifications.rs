use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::services;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_list(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let svc = services(state)?;
    Ok(json!({ "notices": svc.notifier.live() }))
}

fn handle_dismiss(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let id = req
        .params
        .get("id")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing id"))?;
    let svc = services(state)?;
    if !svc.notifier.dismiss(id) {
        return Err(HandlerErr::not_found("notice not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notifications.list" => handle_list(state),
        "notifications.dismiss" => handle_dismiss(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
