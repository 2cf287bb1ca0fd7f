use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_patch, get_required_str, new_id, parse_date, patch_text, report,
    report_failure, require_role, services,
};
use crate::ipc::types::{AppState, Request, Services};
use crate::model::Role;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;

const EVENT_TYPES: [&str; 4] = ["academic", "sports", "cultural", "other"];

fn parse_type(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim().to_ascii_lowercase();
    if !EVENT_TYPES.contains(&t.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "type must be one of {}",
            EVENT_TYPES.join("|")
        )));
    }
    Ok(t)
}

fn check_range(start: &str, end: &str) -> Result<(), HandlerErr> {
    let s = parse_date(start, "startDate")?;
    let e = parse_date(end, "endDate")?;
    if e < s {
        return Err(HandlerErr::bad_params("endDate must not be before startDate")
            .with_details(json!({ "startDate": start, "endDate": end })));
    }
    Ok(())
}

const EVENT_SELECT: &str = "SELECT id, title, description, start_date, end_date, location, type, created_by, created_at
     FROM events";

fn event_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "description": r.get::<_, String>(2)?,
        "startDate": r.get::<_, String>(3)?,
        "endDate": r.get::<_, String>(4)?,
        "location": r.get::<_, String>(5)?,
        "type": r.get::<_, String>(6)?,
        "createdBy": r.get::<_, String>(7)?,
        "createdAt": r.get::<_, String>(8)?,
    }))
}

fn load(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE id = ?", EVENT_SELECT), [id], event_row)
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("event not found"))
}

fn list(svc: &Services) -> Result<serde_json::Value, HandlerErr> {
    let conn = svc.db.lock();
    let mut stmt = conn
        .prepare(&format!("{} ORDER BY start_date ASC, title", EVENT_SELECT))
        .map_err(HandlerErr::query)?;
    let events = stmt
        .query_map([], event_row)
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "events": events }))
}

fn create(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_role(svc, &[Role::Admin])?;
    let title = get_required_str(params, "title")?;
    let description = get_optional_str(params, "description")?.unwrap_or_default();
    let start = get_required_str(params, "startDate")?;
    let end = get_required_str(params, "endDate")?;
    let location = get_optional_str(params, "location")?.unwrap_or_default();
    let event_type = parse_type(&get_required_str(params, "type")?)?;
    check_range(&start, &end)?;

    let conn = svc.db.lock();
    let id = new_id();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO events(id, title, description, start_date, end_date, location, type, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &title,
            &description,
            &start,
            &end,
            &location,
            &event_type,
            &auth.profile.id,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::insert("events", e))?;
    Ok(json!({ "event": load(&conn, &id)? }))
}

fn update(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let patch = get_patch(params)?;
    let conn = svc.db.lock();

    let existing = load(&conn, &id)?;
    let mut start = existing["startDate"].as_str().unwrap_or_default().to_string();
    let mut end = existing["endDate"].as_str().unwrap_or_default().to_string();

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "title" => {
                set_parts.push("title = ?");
                bind_values.push(Value::Text(patch_text(v, k)?));
            }
            "description" | "location" => {
                let s = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be a string", k)))?;
                set_parts.push(if k == "description" {
                    "description = ?"
                } else {
                    "location = ?"
                });
                bind_values.push(Value::Text(s.trim().to_string()));
            }
            "startDate" => {
                start = patch_text(v, k)?;
                set_parts.push("start_date = ?");
                bind_values.push(Value::Text(start.clone()));
            }
            "endDate" => {
                end = patch_text(v, k)?;
                set_parts.push("end_date = ?");
                bind_values.push(Value::Text(end.clone()));
            }
            "type" => {
                set_parts.push("type = ?");
                bind_values.push(Value::Text(parse_type(&patch_text(v, k)?)?));
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown event field: {}", k))),
        }
    }
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }
    check_range(&start, &end)?;
    set_parts.push("updated_at = ?");
    bind_values.push(Value::Text(db::now_ts()));
    bind_values.push(Value::Text(id.clone()));

    let sql = format!("UPDATE events SET {} WHERE id = ?", set_parts.join(", "));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::update("events", e))?;
    Ok(json!({ "event": load(&conn, &id)? }))
}

fn delete(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let conn = svc.db.lock();
    let changed = conn
        .execute("DELETE FROM events WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::delete("events", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("event not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("events.") {
        return None;
    }
    let svc = match services(state) {
        Ok(svc) => svc,
        Err(e) => return Some(e.response(&req.id)),
    };
    let result = match req.method.as_str() {
        "events.list" => {
            let result = list(svc);
            report_failure(&mut svc.notifier, result, "Error fetching events")
        }
        "events.create" => {
            let result = create(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Event created successfully",
                "Error creating event",
            )
        }
        "events.update" => {
            let result = update(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Event updated successfully",
                "Error updating event",
            )
        }
        "events.delete" => {
            let result = delete(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Event deleted successfully",
                "Error deleting event",
            )
        }
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_before_start_is_rejected() {
        assert!(check_range("2024-05-01", "2024-05-01").is_ok());
        assert!(check_range("2024-05-02", "2024-05-01").is_err());
        assert!(check_range("May 1", "2024-05-01").is_err());
    }

    #[test]
    fn event_types_are_closed() {
        assert_eq!(parse_type(" Sports ").ok().as_deref(), Some("sports"));
        assert!(parse_type("party").is_err());
    }
}
