use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::LocalBackend;
use crate::db::Database;
use crate::notify::Notifier;
use crate::session::SessionStore;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Everything that exists once a workspace is open.
pub struct Services {
    pub db: Database,
    pub backend: Arc<LocalBackend>,
    pub session: SessionStore<LocalBackend>,
    pub notifier: Notifier,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub services: Option<Services>,
}
