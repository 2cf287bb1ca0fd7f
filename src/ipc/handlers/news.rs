use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_optional_bool, get_patch, get_required_str, joined_profile, new_id, patch_text,
    profile_columns, report, report_failure, require_role, services,
};
use crate::ipc::types::{AppState, Request, Services};
use crate::model::Role;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;

fn news_select() -> String {
    format!(
        "SELECT n.id, n.title, n.content, n.published, n.author_id, n.created_at, n.updated_at, {}
         FROM news n
         LEFT JOIN profiles p ON p.id = n.author_id",
        profile_columns("p")
    )
}

fn news_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "content": r.get::<_, String>(2)?,
        "published": r.get::<_, i64>(3)? != 0,
        "authorId": r.get::<_, String>(4)?,
        "createdAt": r.get::<_, String>(5)?,
        "updatedAt": r.get::<_, String>(6)?,
        "author": joined_profile(r, 7)?,
    }))
}

fn load(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE n.id = ?", news_select()), [id], news_row)
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("news item not found"))
}

/// Drafts are visible to admins only.
fn list(svc: &Services) -> Result<serde_json::Value, HandlerErr> {
    let is_admin = svc.session.snapshot().role() == Some(Role::Admin);
    let conn = svc.db.lock();
    let filter = if is_admin { "" } else { "WHERE n.published = 1" };
    let mut stmt = conn
        .prepare(&format!(
            "{} {} ORDER BY n.created_at DESC, n.rowid DESC",
            news_select(),
            filter
        ))
        .map_err(HandlerErr::query)?;
    let items = stmt
        .query_map([], news_row)
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "news": items }))
}

fn create(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_role(svc, &[Role::Admin])?;
    let title = get_required_str(params, "title")?;
    let content = get_required_str(params, "content")?;
    let published = get_optional_bool(params, "published")?.unwrap_or(false);
    let conn = svc.db.lock();
    let id = new_id();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO news(id, title, content, published, author_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &title, &content, published as i64, &auth.profile.id, &now, &now),
    )
    .map_err(|e| HandlerErr::insert("news", e))?;
    Ok(json!({ "item": load(&conn, &id)? }))
}

fn update(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let patch = get_patch(params)?;

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "title" => {
                set_parts.push("title = ?");
                bind_values.push(Value::Text(patch_text(v, k)?));
            }
            "content" => {
                set_parts.push("content = ?");
                bind_values.push(Value::Text(patch_text(v, k)?));
            }
            "published" => {
                let b = v
                    .as_bool()
                    .ok_or_else(|| HandlerErr::bad_params("patch.published must be boolean"))?;
                set_parts.push("published = ?");
                bind_values.push(Value::Integer(b as i64));
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown news field: {}", k))),
        }
    }
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }
    set_parts.push("updated_at = ?");
    bind_values.push(Value::Text(db::now_ts()));
    bind_values.push(Value::Text(id.clone()));

    let conn = svc.db.lock();
    let sql = format!("UPDATE news SET {} WHERE id = ?", set_parts.join(", "));
    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::update("news", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("news item not found"));
    }
    Ok(json!({ "item": load(&conn, &id)? }))
}

fn delete(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let conn = svc.db.lock();
    let changed = conn
        .execute("DELETE FROM news WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::delete("news", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("news item not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("news.") {
        return None;
    }
    let svc = match services(state) {
        Ok(svc) => svc,
        Err(e) => return Some(e.response(&req.id)),
    };
    let result = match req.method.as_str() {
        "news.list" => {
            let result = list(svc);
            report_failure(&mut svc.notifier, result, "Error fetching news")
        }
        "news.create" => {
            let result = create(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "News created successfully",
                "Error creating news",
            )
        }
        "news.update" => {
            let result = update(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "News updated successfully",
                "Error updating news",
            )
        }
        "news.delete" => {
            let result = delete(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "News deleted successfully",
                "Error deleting news",
            )
        }
        _ => return None,
    };
    Some(respond(&req.id, result))
}
