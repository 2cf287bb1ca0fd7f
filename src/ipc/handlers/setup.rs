use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_patch, require_role, services};
use crate::ipc::types::{AppState, Request};
use crate::model::Role;
use crate::settings::{self, Section};
use serde_json::{json, Map, Value};
use std::time::Duration;

fn handle_setup_get(state: &mut AppState) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    let conn = svc.db.lock();
    let mut out = Map::new();
    for section in Section::ALL {
        let value = settings::load_section(&conn, section).map_err(HandlerErr::query)?;
        out.insert(section.name().to_string(), value);
    }
    Ok(Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let svc = services(state)?;
    require_role(svc, &[Role::Admin])?;
    let section_raw = req
        .params
        .get("section")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing section"))?;
    let section =
        Section::parse(section_raw).ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
    let patch = get_patch(&req.params)?;

    let current = {
        let conn = svc.db.lock();
        let mut current = settings::load_section(&conn, section).map_err(HandlerErr::query)?;
        settings::merge_section_patch(section, &mut current, patch)
            .map_err(HandlerErr::bad_params)?;
        settings::save_section(&conn, section, &current)
            .map_err(|e| HandlerErr::update("settings", e))?;
        current
    };

    if section == Section::Notifications {
        if let Some(ms) = current.get("dismissAfterMs").and_then(|v| v.as_u64()) {
            svc.notifier.set_dismiss_after(Duration::from_millis(ms));
        }
    }
    tracing::info!(section = section.name(), "settings updated");
    Ok(json!({ "ok": true, (section.name()): current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "setup.get" => handle_setup_get(state),
        "setup.update" => handle_setup_update(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
