use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, new_id, report, report_failure, require_role, services,
};
use crate::ipc::types::{AppState, Request, Services};
use crate::model::Role;
use crate::settings;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdmissionStatus {
    Pending,
    Approved,
    Rejected,
    Waitlisted,
}

impl AdmissionStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "waitlisted" => Some(Self::Waitlisted),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Waitlisted => "waitlisted",
        }
    }

    /// Approved and rejected are final.
    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved | Self::Rejected | Self::Waitlisted)
                | (Self::Waitlisted, Self::Approved | Self::Rejected)
        )
    }
}

const ADMISSION_SELECT: &str = "SELECT id, applicant_name, email, phone, grade_applying_for, status, documents_json, notes, reviewed_by, created_at, updated_at
     FROM admissions";

fn admission_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let documents_raw: String = r.get(6)?;
    let documents: serde_json::Value =
        serde_json::from_str(&documents_raw).unwrap_or_else(|_| json!([]));
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "applicantName": r.get::<_, String>(1)?,
        "email": r.get::<_, String>(2)?,
        "phone": r.get::<_, Option<String>>(3)?,
        "gradeApplyingFor": r.get::<_, String>(4)?,
        "status": r.get::<_, String>(5)?,
        "documents": documents,
        "notes": r.get::<_, Option<String>>(7)?,
        "reviewedBy": r.get::<_, Option<String>>(8)?,
        "createdAt": r.get::<_, String>(9)?,
        "updatedAt": r.get::<_, String>(10)?,
    }))
}

fn load(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE id = ?", ADMISSION_SELECT), [id], admission_row)
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("application not found"))
}

fn submit(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let applicant_name = get_required_str(params, "applicantName")?;
    let email = get_required_str(params, "email")?;
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("email must be an email address"));
    }
    let phone = get_optional_str(params, "phone")?;
    let grade = get_required_str(params, "gradeApplyingFor")?;
    let notes = get_optional_str(params, "notes")?;
    let documents = match params.get("documents") {
        None | Some(serde_json::Value::Null) => json!([]),
        Some(v) if v.as_array().is_some_and(|a| a.iter().all(|d| d.is_string())) => v.clone(),
        Some(_) => return Err(HandlerErr::bad_params("documents must be an array of strings")),
    };

    let conn = svc.db.lock();
    if !settings::admissions_open(&conn).map_err(HandlerErr::query)? {
        return Err(HandlerErr::new("admissions_closed", "admissions are closed"));
    }
    let id = new_id();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO admissions(id, applicant_name, email, phone, grade_applying_for, status, documents_json, notes, reviewed_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 'pending', ?, ?, NULL, ?, ?)",
        (
            &id,
            &applicant_name,
            email.to_ascii_lowercase(),
            &phone,
            &grade,
            documents.to_string(),
            &notes,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::insert("admissions", e))?;
    tracing::info!(application = %id, "admission application submitted");
    Ok(json!({ "application": load(&conn, &id)? }))
}

fn list(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let status = match get_optional_str(params, "status")? {
        Some(s) => Some(
            AdmissionStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s)))?,
        ),
        None => None,
    };
    let conn = svc.db.lock();
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC, rowid DESC",
            ADMISSION_SELECT
        ))
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([status.map(AdmissionStatus::as_str)], admission_row)
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "applications": rows }))
}

fn update_status(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let raw = get_required_str(params, "status")?;
    let next = AdmissionStatus::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", raw)))?;

    let conn = svc.db.lock();
    let current_raw: Option<String> = conn
        .query_row("SELECT status FROM admissions WHERE id = ?", [&id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(current_raw) = current_raw else {
        return Err(HandlerErr::not_found("application not found"));
    };
    let current = AdmissionStatus::parse(&current_raw).unwrap_or(AdmissionStatus::Pending);
    if !current.can_become(next) {
        return Err(HandlerErr::new(
            "invalid_transition",
            format!("cannot move from {} to {}", current.as_str(), next.as_str()),
        )
        .with_details(json!({ "from": current.as_str(), "to": next.as_str() })));
    }
    conn.execute(
        "UPDATE admissions SET status = ?, reviewed_by = ?, updated_at = ? WHERE id = ?",
        (next.as_str(), &auth.profile.id, db::now_ts(), &id),
    )
    .map_err(|e| HandlerErr::update("admissions", e))?;
    tracing::info!(application = %id, from = current.as_str(), to = next.as_str(), "admission reviewed");
    Ok(json!({ "application": load(&conn, &id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("admissions.") {
        return None;
    }
    let svc = match services(state) {
        Ok(svc) => svc,
        Err(e) => return Some(e.response(&req.id)),
    };
    let result = match req.method.as_str() {
        "admissions.submit" => {
            let result = submit(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Application submitted successfully",
                "Error submitting application",
            )
        }
        "admissions.list" => {
            let result = list(svc, &req.params);
            report_failure(&mut svc.notifier, result, "Error fetching applications")
        }
        "admissions.updateStatus" => {
            let result = update_status(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Application status updated successfully",
                "Error updating application status",
            )
        }
        _ => return None,
    };
    Some(respond(&req.id, result))
}
