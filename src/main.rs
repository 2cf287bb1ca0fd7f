mod backend;
mod db;
mod guard;
mod ipc;
mod model;
mod notify;
mod session;
mod settings;

use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // stdout carries the protocol; logs go to stderr only.
    let filter = EnvFilter::try_from_env("SCHOOLD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) {
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    if let Err(e) = stdout.write_all(buf.as_bytes()).await {
        tracing::error!(error = %e, "failed to write response");
        return;
    }
    let _ = stdout.flush().await;
}

async fn serve() {
    let mut state = ipc::AppState::default();

    if let Some(path) = std::env::var_os("SCHOOLD_WORKSPACE") {
        let path = PathBuf::from(path);
        if let Err(e) = ipc::open_workspace(&mut state, path.clone()).await {
            tracing::error!(workspace = %path.to_string_lossy(), error = ?e, "failed to open workspace");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(v)) => v,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                write_line(&mut stdout, &resp.to_string()).await;
                continue;
            }
        };

        tracing::debug!(id = %req.id, method = %req.method, "request");
        let resp = ipc::handle_request(&mut state, req).await;
        let out = serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string());
        write_line(&mut stdout, &out).await;

        // Let the auth listener catch up before the next request.
        tokio::task::yield_now().await;
    }

    if let Some(svc) = state.services.take() {
        svc.session.shutdown();
    }
    tracing::debug!("stdin closed; exiting");
}

fn main() {
    init_tracing();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            std::process::exit(1);
        }
    };
    runtime.block_on(serve());
}
