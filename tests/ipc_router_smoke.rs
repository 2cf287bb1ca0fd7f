mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::spawn_sidecar;

#[test]
fn requests_before_workspace_fail_cleanly() {
    let mut sc = spawn_sidecar();

    let health = sc.request_ok("health", json!({}));
    assert!(health["version"].is_string());
    assert!(health["workspacePath"].is_null());

    for method in ["auth.session", "courses.list", "setup.get", "notifications.list"] {
        assert_eq!(sc.request_err(method, json!({})), "no_workspace", "{}", method);
    }

    // Route resolution works against a session that has not loaded yet.
    let r = sc.request_ok("routes.resolve", json!({ "path": "/dashboard/admin" }));
    assert_eq!(r["decision"]["kind"], "pending");
    let r = sc.request_ok("routes.resolve", json!({ "path": "/about" }));
    assert_eq!(r["decision"]["kind"], "render");

    assert_eq!(sc.request_err("workspace.select", json!({})), "bad_params");
    sc.shutdown();
}

#[test]
fn bad_json_and_unknown_methods() {
    let mut sc = spawn_sidecar();
    writeln!(sc.stdin, "{{not json").expect("write");
    writeln!(sc.stdin).expect("write blank");
    sc.stdin.flush().expect("flush");
    let mut line = String::new();
    sc.reader.read_line(&mut line).expect("read");
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(v["ok"], false);
    assert_eq!(v["error"]["code"], "bad_json");

    sc.select_workspace("schoold-smoke-unknown");
    assert_eq!(sc.request_err("grades.explode", json!({})), "not_implemented");
    sc.shutdown();
}

#[test]
fn every_family_answers_after_workspace_select() {
    let mut sc = spawn_sidecar();
    let workspace = sc.select_workspace("schoold-smoke-families");
    let health = sc.request_ok("health", json!({}));
    assert_eq!(
        health["workspacePath"].as_str(),
        Some(workspace.to_string_lossy().as_ref())
    );
    assert!(workspace.join("school.sqlite3").is_file());

    let session = sc.request_ok("auth.session", json!({}));
    assert_eq!(session["loading"], false);
    assert_eq!(session["initialized"], true);
    assert!(session["identity"].is_null());

    // Public reads.
    for method in [
        "courses.list",
        "faculty.list",
        "announcements.list",
        "events.list",
        "news.list",
        "setup.get",
        "notifications.list",
    ] {
        sc.request_ok(method, json!({}));
    }

    // Gated families refuse anonymous callers rather than being unknown.
    for method in [
        "users.list",
        "admissions.list",
        "students.enroll",
        "academic.grades",
        "courses.create",
    ] {
        let code = sc.request_err(method, json!({ "studentId": "x" }));
        assert!(
            code == "not_authenticated" || code == "bad_params",
            "{} -> {}",
            method,
            code
        );
    }
    sc.shutdown();
}
