use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, new_id, parse_date, profile_with_role, report,
    report_failure, require_auth, require_role, services,
};
use crate::ipc::types::{AppState, Request, Services};
use crate::model::Role;
use crate::session::AuthContext;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const ATTENDANCE_STATUSES: [&str; 3] = ["present", "absent", "late"];

fn parse_attendance_status(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let s = get_required_str(params, "status")?.to_ascii_lowercase();
    if !ATTENDANCE_STATUSES.contains(&s.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "status must be one of {}",
            ATTENDANCE_STATUSES.join("|")
        )));
    }
    Ok(s)
}

fn forbidden(message: &str) -> HandlerErr {
    HandlerErr::new("forbidden", message)
}

/// Students see themselves, parents see their linked children, staff see everyone.
fn ensure_can_read(conn: &Connection, auth: &AuthContext, student_id: &str) -> Result<(), HandlerErr> {
    match auth.profile.role {
        Role::Admin | Role::Teacher => Ok(()),
        Role::Student if auth.profile.id == student_id => Ok(()),
        Role::Parent => {
            let linked: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM students WHERE profile_id = ? AND parent_id = ?",
                    (student_id, &auth.profile.id),
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::query)?;
            linked
                .map(|_| ())
                .ok_or_else(|| forbidden("not a linked child"))
        }
        Role::Student => Err(forbidden("students may only read their own records")),
    }
}

/// Teachers may only write to courses they teach; admins to any.
fn ensure_teaches(conn: &Connection, auth: &AuthContext, course_id: &str) -> Result<(), HandlerErr> {
    let teacher: Option<Option<String>> = conn
        .query_row("SELECT teacher_id FROM courses WHERE id = ?", [course_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(teacher) = teacher else {
        return Err(HandlerErr::not_found("course not found"));
    };
    if auth.profile.role == Role::Teacher && teacher.as_deref() != Some(auth.profile.id.as_str()) {
        return Err(forbidden("course is taught by someone else"));
    }
    Ok(())
}

fn grades(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_auth(svc)?;
    let student_id = get_required_str(params, "studentId")?;
    let conn = svc.db.lock();
    ensure_can_read(&conn, &auth, &student_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.assignment_id, s.student_id, s.content, s.grade, s.submitted_at,
                    a.title, a.due_date, c.id, c.name
             FROM submissions s
             JOIN assignments a ON a.id = s.assignment_id
             JOIN courses c ON c.id = a.course_id
             WHERE s.student_id = ?
             ORDER BY s.submitted_at DESC",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "assignmentId": r.get::<_, String>(1)?,
                "studentId": r.get::<_, String>(2)?,
                "content": r.get::<_, String>(3)?,
                "grade": r.get::<_, Option<f64>>(4)?,
                "submittedAt": r.get::<_, String>(5)?,
                "assignment": {
                    "title": r.get::<_, String>(6)?,
                    "dueDate": r.get::<_, String>(7)?,
                },
                "course": {
                    "id": r.get::<_, String>(8)?,
                    "name": r.get::<_, String>(9)?,
                },
            }))
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "grades": rows }))
}

fn attendance_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "courseId": r.get::<_, String>(2)?,
        "date": r.get::<_, String>(3)?,
        "status": r.get::<_, String>(4)?,
        "course": { "name": r.get::<_, Option<String>>(5)? },
    }))
}

const ATTENDANCE_SELECT: &str = "SELECT at.id, at.student_id, at.course_id, at.date, at.status, c.name
     FROM attendance at
     LEFT JOIN courses c ON c.id = at.course_id";

fn load_attendance(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE at.id = ?", ATTENDANCE_SELECT),
        [id],
        attendance_json,
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("attendance record not found"))
}

fn attendance(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_auth(svc)?;
    let student_id = get_required_str(params, "studentId")?;
    let conn = svc.db.lock();
    ensure_can_read(&conn, &auth, &student_id)?;
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE at.student_id = ? ORDER BY at.date DESC",
            ATTENDANCE_SELECT
        ))
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([&student_id], attendance_json)
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "attendance": rows }))
}

fn update_grade(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_role(svc, &[Role::Teacher, Role::Admin])?;
    let submission_id = get_required_str(params, "submissionId")?;
    let grade = params
        .get("grade")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params("grade must be a number"))?;
    if !(0.0..=100.0).contains(&grade) {
        return Err(HandlerErr::bad_params("grade must be in 0..=100"));
    }
    let conn = svc.db.lock();
    let course_id: Option<String> = conn
        .query_row(
            "SELECT a.course_id FROM submissions s JOIN assignments a ON a.id = s.assignment_id WHERE s.id = ?",
            [&submission_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(course_id) = course_id else {
        return Err(HandlerErr::not_found("submission not found"));
    };
    ensure_teaches(&conn, &auth, &course_id)?;
    conn.execute(
        "UPDATE submissions SET grade = ?, updated_at = ? WHERE id = ?",
        (grade, db::now_ts(), &submission_id),
    )
    .map_err(|e| HandlerErr::update("submissions", e))?;
    Ok(json!({ "submissionId": submission_id, "grade": grade }))
}

fn update_attendance(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_role(svc, &[Role::Teacher, Role::Admin])?;
    let attendance_id = get_required_str(params, "attendanceId")?;
    let status = parse_attendance_status(params)?;
    let conn = svc.db.lock();
    let course_id: Option<String> = conn
        .query_row(
            "SELECT course_id FROM attendance WHERE id = ?",
            [&attendance_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(course_id) = course_id else {
        return Err(HandlerErr::not_found("attendance record not found"));
    };
    ensure_teaches(&conn, &auth, &course_id)?;
    conn.execute(
        "UPDATE attendance SET status = ?, updated_at = ? WHERE id = ?",
        (&status, db::now_ts(), &attendance_id),
    )
    .map_err(|e| HandlerErr::update("attendance", e))?;
    Ok(json!({ "record": load_attendance(&conn, &attendance_id)? }))
}

/// One row per student, course and day; recording again overwrites the status.
fn record_attendance(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_role(svc, &[Role::Teacher, Role::Admin])?;
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_required_str(params, "courseId")?;
    let date = get_required_str(params, "date")?;
    parse_date(&date, "date")?;
    let status = parse_attendance_status(params)?;

    let conn = svc.db.lock();
    ensure_teaches(&conn, &auth, &course_id)?;
    profile_with_role(&conn, &student_id, Role::Student)?;
    let now = db::now_ts();
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance WHERE student_id = ? AND course_id = ? AND date = ?",
            (&student_id, &course_id, &date),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let id = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE attendance SET status = ?, updated_at = ? WHERE id = ?",
                (&status, &now, &id),
            )
            .map_err(|e| HandlerErr::update("attendance", e))?;
            id
        }
        None => {
            let id = new_id();
            conn.execute(
                "INSERT INTO attendance(id, student_id, course_id, date, status, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)",
                (&id, &student_id, &course_id, &date, &status, &now, &now),
            )
            .map_err(|e| HandlerErr::insert("attendance", e))?;
            id
        }
    };
    Ok(json!({ "record": load_attendance(&conn, &id)? }))
}

fn create_assignment(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_role(svc, &[Role::Teacher, Role::Admin])?;
    let course_id = get_required_str(params, "courseId")?;
    let title = get_required_str(params, "title")?;
    let description = get_optional_str(params, "description")?.unwrap_or_default();
    let due_date = get_required_str(params, "dueDate")?;
    parse_date(&due_date, "dueDate")?;

    let conn = svc.db.lock();
    ensure_teaches(&conn, &auth, &course_id)?;
    let id = new_id();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO assignments(id, course_id, title, description, due_date, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &course_id, &title, &description, &due_date, &now, &now),
    )
    .map_err(|e| HandlerErr::insert("assignments", e))?;
    Ok(json!({
        "assignment": {
            "id": id,
            "courseId": course_id,
            "title": title,
            "description": description,
            "dueDate": due_date,
        }
    }))
}

/// Resubmitting replaces the content and clears any earlier grade.
fn submit(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let auth = require_role(svc, &[Role::Student])?;
    let assignment_id = get_required_str(params, "assignmentId")?;
    let content = get_required_str(params, "content")?;
    let conn = svc.db.lock();
    let known: Option<i64> = conn
        .query_row("SELECT 1 FROM assignments WHERE id = ?", [&assignment_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    if known.is_none() {
        return Err(HandlerErr::not_found("assignment not found"));
    }
    let now = db::now_ts();
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM submissions WHERE assignment_id = ? AND student_id = ?",
            (&assignment_id, &auth.profile.id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let id = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE submissions SET content = ?, grade = NULL, submitted_at = ?, updated_at = ? WHERE id = ?",
                (&content, &now, &now, &id),
            )
            .map_err(|e| HandlerErr::update("submissions", e))?;
            id
        }
        None => {
            let id = new_id();
            conn.execute(
                "INSERT INTO submissions(id, assignment_id, student_id, content, grade, submitted_at, created_at, updated_at)
                 VALUES(?, ?, ?, ?, NULL, ?, ?, ?)",
                (&id, &assignment_id, &auth.profile.id, &content, &now, &now, &now),
            )
            .map_err(|e| HandlerErr::insert("submissions", e))?;
            id
        }
    };
    Ok(json!({ "submissionId": id, "submittedAt": now }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("academic.") {
        return None;
    }
    let svc = match services(state) {
        Ok(svc) => svc,
        Err(e) => return Some(e.response(&req.id)),
    };
    let result = match req.method.as_str() {
        "academic.grades" => {
            let result = grades(svc, &req.params);
            report_failure(&mut svc.notifier, result, "Error fetching grades")
        }
        "academic.attendance" => {
            let result = attendance(svc, &req.params);
            report_failure(&mut svc.notifier, result, "Error fetching attendance")
        }
        "academic.updateGrade" => {
            let result = update_grade(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Grade updated successfully",
                "Error updating grade",
            )
        }
        "academic.updateAttendance" => {
            let result = update_attendance(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Attendance updated successfully",
                "Error updating attendance",
            )
        }
        "academic.recordAttendance" => {
            let result = record_attendance(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Attendance recorded successfully",
                "Error recording attendance",
            )
        }
        "academic.createAssignment" => {
            let result = create_assignment(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Assignment created successfully",
                "Error creating assignment",
            )
        }
        "academic.submit" => {
            let result = submit(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Assignment submitted successfully",
                "Error submitting assignment",
            )
        }
        _ => return None,
    };
    Some(respond(&req.id, result))
}
