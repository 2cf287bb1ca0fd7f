use crate::guard::{self, RouteGuard};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_str, services};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_resolve(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let path = get_required_str(&req.params, "path")?;
    let route = match state.services.as_ref() {
        Some(svc) => RouteGuard::new(svc.session.subscribe(), path),
        None => RouteGuard::detached(path),
    };
    Ok(route.resolution().to_json())
}

fn handle_landing(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let from = get_optional_str(&req.params, "from")?;
    let svc = services(state)?;
    let snapshot = svc.session.snapshot();
    Ok(json!({ "to": guard::landing(&snapshot, from.as_deref()) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "routes.resolve" => handle_resolve(state, req),
        "routes.landing" => handle_landing(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
