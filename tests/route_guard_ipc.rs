mod test_support;

use serde_json::json;
use test_support::spawn_sidecar;

fn resolve(sc: &mut test_support::Sidecar, path: &str) -> serde_json::Value {
    sc.request_ok("routes.resolve", json!({ "path": path }))
}

#[test]
fn dashboards_follow_session_role() {
    let mut sc = spawn_sidecar();
    sc.select_workspace("schoold-routes");

    let r = resolve(&mut sc, "/dashboard/admin");
    assert_eq!(r["view"], "dashboard.admin");
    assert_eq!(r["decision"]["kind"], "redirect");
    assert_eq!(r["decision"]["to"], "/login");
    assert_eq!(r["decision"]["from"], "/dashboard/admin");
    assert_eq!(r["decision"]["invalidRole"], false);

    let r = resolve(&mut sc, "/news");
    assert_eq!(r["view"], "news");
    assert_eq!(r["decision"]["kind"], "render");

    let r = resolve(&mut sc, "/dashboard/janitor");
    assert_eq!(r["view"], "notFound");

    sc.bootstrap_admin();
    sc.create_user("tess@school.test", "teacher", "Tess", "Teacher");
    sc.request_ok("auth.signOut", json!({}));
    sc.sign_in("tess@school.test", "teacher");

    let r = resolve(&mut sc, "/dashboard/teacher");
    assert_eq!(r["decision"]["kind"], "render");
    let r = resolve(&mut sc, "/dashboard/admin");
    assert_eq!(r["decision"]["kind"], "redirect");
    assert_eq!(r["decision"]["invalidRole"], true);

    let l = sc.request_ok("routes.landing", json!({ "from": "/dashboard/admin" }));
    assert_eq!(l["to"], "/dashboard/teacher");
    let l = sc.request_ok("routes.landing", json!({ "from": "/events" }));
    assert_eq!(l["to"], "/events");
    let l = sc.request_ok("routes.landing", json!({}));
    assert_eq!(l["to"], "/dashboard/teacher");

    sc.request_ok("auth.signOut", json!({}));
    let r = resolve(&mut sc, "/dashboard/teacher");
    assert_eq!(r["decision"]["invalidRole"], false);
    let l = sc.request_ok("routes.landing", json!({}));
    assert!(l["to"].is_null());
    sc.shutdown();
}

#[test]
fn sign_in_redirects_back_to_origin() {
    let mut sc = spawn_sidecar();
    sc.select_workspace("schoold-routes-origin");
    sc.bootstrap_admin();
    sc.request_ok("auth.signOut", json!({}));
    let res = sc.request_ok(
        "auth.signIn",
        json!({
            "email": "admin@school.test",
            "password": test_support::PASSWORD,
            "role": "admin",
            "from": "/dashboard/admin"
        }),
    );
    assert_eq!(res["redirect"], "/dashboard/admin");
    sc.shutdown();
}
