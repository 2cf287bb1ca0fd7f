use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, new_id, profile_with_role, report, require_role, services,
};
use crate::ipc::types::{AppState, Request, Services};
use crate::model::Role;
use rusqlite::OptionalExtension;
use serde_json::json;

/// Creates or replaces the enrollment row that links a student to a grade
/// and, optionally, a parent.
fn enroll(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let profile_id = get_required_str(params, "profileId")?;
    let grade = get_required_str(params, "grade")?;
    let parent_id = get_optional_str(params, "parentId")?;

    let conn = svc.db.lock();
    profile_with_role(&conn, &profile_id, Role::Student)?;
    if let Some(pid) = &parent_id {
        profile_with_role(&conn, pid, Role::Parent)?;
    }
    let now = db::now_ts();
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE profile_id = ?",
            [&profile_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let id = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE students SET grade = ?, parent_id = ?, updated_at = ? WHERE id = ?",
                (&grade, &parent_id, &now, &id),
            )
            .map_err(|e| HandlerErr::update("students", e))?;
            id
        }
        None => {
            let id = new_id();
            let enrolled_on = chrono::Utc::now().date_naive().to_string();
            conn.execute(
                "INSERT INTO students(id, profile_id, grade, enrollment_date, parent_id, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (&id, &profile_id, &grade, &enrolled_on, &parent_id, &now, &now),
            )
            .map_err(|e| HandlerErr::insert("students", e))?;
            id
        }
    };
    let enrollment_date: String = conn
        .query_row(
            "SELECT enrollment_date FROM students WHERE id = ?",
            [&id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    Ok(json!({
        "student": {
            "id": id,
            "profileId": profile_id,
            "grade": grade,
            "enrollmentDate": enrollment_date,
            "parentId": parent_id,
        }
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method != "students.enroll" {
        return None;
    }
    let result = services(state).and_then(|svc| {
        let result = enroll(svc, &req.params);
        report(
            &mut svc.notifier,
            result,
            "Student enrolled successfully",
            "Error enrolling student",
        )
    });
    Some(respond(&req.id, result))
}
