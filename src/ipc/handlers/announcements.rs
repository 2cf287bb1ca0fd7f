use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_patch, get_required_str, joined_profile, new_id, patch_text, profile_columns, report,
    report_failure, require_role, services,
};
use crate::ipc::types::{AppState, Request, Services};
use crate::model::Role;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;

fn announcement_select() -> String {
    format!(
        "SELECT a.id, a.title, a.content, a.author_id, a.created_at, a.updated_at, {}
         FROM announcements a
         LEFT JOIN profiles p ON p.id = a.author_id",
        profile_columns("p")
    )
}

fn announcement_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "content": r.get::<_, String>(2)?,
        "authorId": r.get::<_, String>(3)?,
        "createdAt": r.get::<_, String>(4)?,
        "updatedAt": r.get::<_, String>(5)?,
        "author": joined_profile(r, 6)?,
    }))
}

fn load(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE a.id = ?", announcement_select()),
        [id],
        announcement_row,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("announcement not found"))
}

fn list(svc: &Services) -> Result<serde_json::Value, HandlerErr> {
    let conn = svc.db.lock();
    let mut stmt = conn
        .prepare(&format!(
            "{} ORDER BY a.created_at DESC, a.rowid DESC",
            announcement_select()
        ))
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([], announcement_row)
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "announcements": rows }))
}

fn create(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_role(svc, &[Role::Admin])?;
    let title = get_required_str(params, "title")?;
    let content = get_required_str(params, "content")?;
    let conn = svc.db.lock();
    let id = new_id();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO announcements(id, title, content, author_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &title, &content, &auth.profile.id, &now, &now),
    )
    .map_err(|e| HandlerErr::insert("announcements", e))?;
    Ok(json!({ "announcement": load(&conn, &id)? }))
}

fn update(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let patch = get_patch(params)?;

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "title" => set_parts.push("title = ?"),
            "content" => set_parts.push("content = ?"),
            _ => {
                return Err(HandlerErr::bad_params(format!(
                    "unknown announcement field: {}",
                    k
                )))
            }
        }
        bind_values.push(Value::Text(patch_text(v, k)?));
    }
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }
    set_parts.push("updated_at = ?");
    bind_values.push(Value::Text(db::now_ts()));
    bind_values.push(Value::Text(id.clone()));

    let conn = svc.db.lock();
    let sql = format!("UPDATE announcements SET {} WHERE id = ?", set_parts.join(", "));
    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::update("announcements", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("announcement not found"));
    }
    Ok(json!({ "announcement": load(&conn, &id)? }))
}

fn delete(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let conn = svc.db.lock();
    let changed = conn
        .execute("DELETE FROM announcements WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::delete("announcements", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("announcement not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("announcements.") {
        return None;
    }
    let svc = match services(state) {
        Ok(svc) => svc,
        Err(e) => return Some(e.response(&req.id)),
    };
    let result = match req.method.as_str() {
        "announcements.list" => {
            let result = list(svc);
            report_failure(&mut svc.notifier, result, "Error fetching announcements")
        }
        "announcements.create" => {
            let result = create(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Announcement created successfully",
                "Error creating announcement",
            )
        }
        "announcements.update" => {
            let result = update(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Announcement updated successfully",
                "Error updating announcement",
            )
        }
        "announcements.delete" => {
            let result = delete(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Announcement deleted successfully",
                "Error deleting announcement",
            )
        }
        _ => return None,
    };
    Some(respond(&req.id, result))
}
