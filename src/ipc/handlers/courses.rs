use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_patch, get_required_str, joined_profile, new_id, patch_text,
    profile_columns, profile_with_role, report, report_failure, require_role, services,
};
use crate::ipc::types::{AppState, Request, Services};
use crate::model::Role;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;

fn course_select() -> String {
    format!(
        "SELECT c.id, c.name, c.description, c.department, c.teacher_id, c.created_at, {}
         FROM courses c
         LEFT JOIN profiles p ON p.id = c.teacher_id",
        profile_columns("p")
    )
}

fn course_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let teacher = joined_profile(r, 6)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "description": r.get::<_, String>(2)?,
        "department": r.get::<_, String>(3)?,
        "teacherId": r.get::<_, Option<String>>(4)?,
        "createdAt": r.get::<_, String>(5)?,
        "teacher": teacher,
    }))
}

fn load_course(conn: &Connection, id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE c.id = ?", course_select()), [id], course_row)
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("course not found"))
}

fn list(svc: &Services) -> Result<serde_json::Value, HandlerErr> {
    let conn = svc.db.lock();
    let mut stmt = conn
        .prepare(&format!("{} ORDER BY c.name", course_select()))
        .map_err(HandlerErr::query)?;
    let courses = stmt
        .query_map([], course_row)
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "courses": courses }))
}

fn create(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let name = get_required_str(params, "name")?;
    let department = get_required_str(params, "department")?;
    let description = get_optional_str(params, "description")?.unwrap_or_default();
    let teacher_id = get_optional_str(params, "teacherId")?;

    let conn = svc.db.lock();
    if let Some(tid) = &teacher_id {
        profile_with_role(&conn, tid, Role::Teacher)?;
    }
    let id = new_id();
    let now = db::now_ts();
    conn.execute(
        "INSERT INTO courses(id, name, description, department, teacher_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &name, &description, &department, &teacher_id, &now, &now),
    )
    .map_err(|e| HandlerErr::insert("courses", e))?;
    Ok(json!({ "course": load_course(&conn, &id)? }))
}

fn update(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let patch = get_patch(params)?;
    let conn = svc.db.lock();

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                set_parts.push("name = ?");
                bind_values.push(Value::Text(patch_text(v, k)?));
            }
            "department" => {
                set_parts.push("department = ?");
                bind_values.push(Value::Text(patch_text(v, k)?));
            }
            "description" => {
                let s = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("patch.description must be a string"))?;
                set_parts.push("description = ?");
                bind_values.push(Value::Text(s.trim().to_string()));
            }
            "teacherId" => {
                set_parts.push("teacher_id = ?");
                if v.is_null() {
                    bind_values.push(Value::Null);
                } else {
                    let tid = patch_text(v, k)?;
                    profile_with_role(&conn, &tid, Role::Teacher)?;
                    bind_values.push(Value::Text(tid));
                }
            }
            _ => return Err(HandlerErr::bad_params(format!("unknown course field: {}", k))),
        }
    }
    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }
    set_parts.push("updated_at = ?");
    bind_values.push(Value::Text(db::now_ts()));
    bind_values.push(Value::Text(id.clone()));

    let sql = format!("UPDATE courses SET {} WHERE id = ?", set_parts.join(", "));
    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::update("courses", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("course not found"));
    }
    Ok(json!({ "course": load_course(&conn, &id)? }))
}

fn delete(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let id = get_required_str(params, "id")?;
    let conn = svc.db.lock();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::delete("courses", e))?;
    tx.execute(
        "DELETE FROM submissions WHERE assignment_id IN (SELECT id FROM assignments WHERE course_id = ?)",
        [&id],
    )
    .map_err(|e| HandlerErr::delete("submissions", e))?;
    tx.execute("DELETE FROM assignments WHERE course_id = ?", [&id])
        .map_err(|e| HandlerErr::delete("assignments", e))?;
    tx.execute("DELETE FROM attendance WHERE course_id = ?", [&id])
        .map_err(|e| HandlerErr::delete("attendance", e))?;
    let changed = tx
        .execute("DELETE FROM courses WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::delete("courses", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("course not found"));
    }
    tx.commit().map_err(|e| HandlerErr::delete("courses", e))?;
    Ok(json!({ "ok": true }))
}

fn assign_teacher(svc: &Services, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_role(svc, &[Role::Admin])?;
    let course_id = get_required_str(params, "courseId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let conn = svc.db.lock();
    profile_with_role(&conn, &teacher_id, Role::Teacher)?;
    let changed = conn
        .execute(
            "UPDATE courses SET teacher_id = ?, updated_at = ? WHERE id = ?",
            (&teacher_id, db::now_ts(), &course_id),
        )
        .map_err(|e| HandlerErr::update("courses", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("course not found"));
    }
    Ok(json!({ "course": load_course(&conn, &course_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("courses.") {
        return None;
    }
    let svc = match services(state) {
        Ok(svc) => svc,
        Err(e) => return Some(e.response(&req.id)),
    };
    let result = match req.method.as_str() {
        "courses.list" => {
            let result = list(svc);
            report_failure(&mut svc.notifier, result, "Error fetching courses")
        }
        "courses.create" => {
            let result = create(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Course created successfully",
                "Error creating course",
            )
        }
        "courses.update" => {
            let result = update(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Course updated successfully",
                "Error updating course",
            )
        }
        "courses.delete" => {
            let result = delete(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Course deleted successfully",
                "Error deleting course",
            )
        }
        "courses.assignTeacher" => {
            let result = assign_teacher(svc, &req.params);
            report(
                &mut svc.notifier,
                result,
                "Teacher assigned successfully",
                "Error assigning teacher",
            )
        }
        _ => return None,
    };
    Some(respond(&req.id, result))
}
