use crate::backend::LocalBackend;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Services};
use crate::notify::Notifier;
use crate::session::SessionStore;
use crate::settings;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

/// Opens `path` and swaps in a fresh set of services. The previous session
/// store, if any, stops listening before the new one initializes.
pub async fn open_workspace(state: &mut AppState, path: PathBuf) -> anyhow::Result<()> {
    let conn = db::open_db(&path)?;
    let dismiss_ms = settings::dismiss_after_ms(&conn)?;
    let db = db::shared(conn);
    let backend = Arc::new(LocalBackend::new(Arc::clone(&db)));
    let session = SessionStore::new(Arc::clone(&backend));

    if let Some(previous) = state.services.take() {
        previous.session.shutdown();
    }
    session.initialize().await;
    tracing::info!(workspace = %path.to_string_lossy(), "workspace opened");

    let mut notifier = Notifier::new(Duration::from_millis(dismiss_ms));
    if let Some(profile) = session.snapshot().profile() {
        notifier.info(format!("Welcome back, {}", profile.display_name()));
    }
    state.workspace = Some(path);
    state.services = Some(Services {
        db,
        backend,
        session,
        notifier,
    });
    Ok(())
}

async fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, path.clone()).await {
        Ok(()) => {
            let session = state
                .services
                .as_ref()
                .map(|s| s.session.snapshot().to_json());
            ok(
                &req.id,
                json!({ "workspacePath": path.to_string_lossy(), "session": session }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub async fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req).await),
        _ => None,
    }
}
