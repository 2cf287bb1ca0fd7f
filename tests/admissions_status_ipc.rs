mod test_support;

use serde_json::json;
use test_support::spawn_sidecar;

fn application(name: &str) -> serde_json::Value {
    json!({
        "applicantName": name,
        "email": format!("{}@family.test", name.to_lowercase()),
        "phone": "555-0100",
        "gradeApplyingFor": "Grade 7",
        "documents": ["birth-certificate.pdf"]
    })
}

#[test]
fn public_submission_and_review_transitions() {
    let mut sc = spawn_sidecar();
    sc.select_workspace("schoold-admissions");

    // Anyone may apply.
    let a = sc.request_ok("admissions.submit", application("Alice"));
    assert_eq!(a["application"]["status"], "pending");
    assert_eq!(a["application"]["documents"][0], "birth-certificate.pdf");
    let alice = a["application"]["id"].as_str().expect("id").to_string();
    let b = sc.request_ok("admissions.submit", application("Bob"));
    let bob = b["application"]["id"].as_str().expect("id").to_string();

    assert_eq!(
        sc.request_err(
            "admissions.submit",
            json!({ "applicantName": "Eve", "email": "nope", "gradeApplyingFor": "1" })
        ),
        "bad_params"
    );
    assert_eq!(sc.request_err("admissions.list", json!({})), "not_authenticated");

    let admin = sc.bootstrap_admin();
    let list = sc.request_ok("admissions.list", json!({}));
    let apps = list["applications"].as_array().expect("applications");
    assert_eq!(apps.len(), 2);
    assert_eq!(apps[0]["applicantName"], "Bob");

    let w = sc.request_ok(
        "admissions.updateStatus",
        json!({ "id": alice, "status": "waitlisted" }),
    );
    assert_eq!(w["application"]["status"], "waitlisted");
    assert_eq!(w["application"]["reviewedBy"], admin.as_str());

    let resp = sc.request(
        "admissions.updateStatus",
        json!({ "id": alice, "status": "pending" }),
    );
    assert_eq!(resp["error"]["code"], "invalid_transition");
    assert_eq!(resp["error"]["details"]["from"], "waitlisted");
    assert_eq!(resp["error"]["details"]["to"], "pending");

    sc.request_ok(
        "admissions.updateStatus",
        json!({ "id": alice, "status": "approved" }),
    );
    assert_eq!(
        sc.request_err(
            "admissions.updateStatus",
            json!({ "id": alice, "status": "rejected" })
        ),
        "invalid_transition"
    );

    sc.request_ok(
        "admissions.updateStatus",
        json!({ "id": bob, "status": "rejected" }),
    );
    assert_eq!(
        sc.request_err(
            "admissions.updateStatus",
            json!({ "id": bob, "status": "expelled" })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.request_err(
            "admissions.updateStatus",
            json!({ "id": "missing", "status": "approved" })
        ),
        "not_found"
    );

    let approved = sc.request_ok("admissions.list", json!({ "status": "approved" }));
    let apps = approved["applications"].as_array().expect("applications");
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0]["applicantName"], "Alice");
    sc.shutdown();
}

#[test]
fn closed_admissions_refuse_applications() {
    let mut sc = spawn_sidecar();
    sc.select_workspace("schoold-admissions-closed");
    sc.bootstrap_admin();
    sc.request_ok(
        "setup.update",
        json!({ "section": "school", "patch": { "admissionsOpen": false } }),
    );
    sc.request_ok("auth.signOut", json!({}));
    assert_eq!(
        sc.request_err("admissions.submit", application("Carol")),
        "admissions_closed"
    );
    sc.shutdown();
}
