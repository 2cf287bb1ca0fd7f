use super::error::HandlerErr;
use super::types::{AppState, Services};
use crate::model::{Profile, Role, PROFILE_COLUMNS};
use crate::notify::Notifier;
use crate::session::AuthContext;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};

pub fn services(state: &mut AppState) -> Result<&mut Services, HandlerErr> {
    state
        .services
        .as_mut()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?
        .trim();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s.to_string())
}

/// Absent, null and blank all read as `None`.
pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_patch(params: &Value) -> Result<&Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing/invalid patch"))
}

pub fn patch_text(v: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = v
        .as_str()
        .ok_or_else(|| HandlerErr::bad_params(format!("patch.{} must be a string", key)))?
        .trim();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s.to_string())
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn require_auth(svc: &Services) -> Result<AuthContext, HandlerErr> {
    svc.session
        .snapshot()
        .auth()
        .cloned()
        .ok_or_else(|| HandlerErr::new("not_authenticated", "sign in first"))
}

pub fn require_role(svc: &Services, allowed: &[Role]) -> Result<AuthContext, HandlerErr> {
    let auth = require_auth(svc)?;
    if !allowed.contains(&auth.profile.role) {
        return Err(HandlerErr::new(
            "forbidden",
            format!("role {} may not perform this action", auth.profile.role),
        )
        .with_details(json!({ "role": auth.profile.role, "allowed": allowed })));
    }
    Ok(auth)
}

/// Pushes the outcome notice for a write and passes the result through.
pub fn report<T>(
    notifier: &mut Notifier,
    result: Result<T, HandlerErr>,
    success: &str,
    failure: &str,
) -> Result<T, HandlerErr> {
    match &result {
        Ok(_) => {
            notifier.success(success);
        }
        Err(e) => {
            tracing::warn!(code = e.code, error = %e.message, "{}", failure);
            notifier.error(failure);
        }
    }
    result
}

/// Reads only announce failures.
pub fn report_failure<T>(
    notifier: &mut Notifier,
    result: Result<T, HandlerErr>,
    failure: &str,
) -> Result<T, HandlerErr> {
    if let Err(e) = &result {
        tracing::warn!(code = e.code, error = %e.message, "{}", failure);
        notifier.error(failure);
    }
    result
}

pub fn select_profile(conn: &Connection, id: &str) -> Result<Option<Profile>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM profiles WHERE id = ?", PROFILE_COLUMNS),
        [id],
        |r| Profile::from_row(r, 0),
    )
    .optional()
    .map_err(HandlerErr::query)
}

/// Loads a profile that must exist with the given role.
pub fn profile_with_role(conn: &Connection, id: &str, role: Role) -> Result<Profile, HandlerErr> {
    match select_profile(conn, id)? {
        Some(p) if p.role == role => Ok(p),
        _ => Err(HandlerErr::not_found(format!("{} not found", role))
            .with_details(json!({ "id": id }))),
    }
}

pub fn list_profiles(conn: &Connection, role: Option<Role>) -> Result<Vec<Profile>, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM profiles WHERE (?1 IS NULL OR role = ?1) ORDER BY last_name, first_name",
        PROFILE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([role.map(|r| r.as_str())], |r| Profile::from_row(r, 0))
        .map_err(HandlerErr::query)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(HandlerErr::query)
}

/// Profile columns prefixed with a table alias, for joins.
pub fn profile_columns(alias: &str) -> String {
    PROFILE_COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reads an optional LEFT JOINed profile starting at `offset`.
pub fn joined_profile(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Option<Profile>> {
    let id: Option<String> = row.get(offset)?;
    match id {
        Some(_) => Profile::from_row(row, offset).map(Some),
        None => Ok(None),
    }
}
