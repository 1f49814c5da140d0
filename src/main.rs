mod calc;
mod config;
mod db;
mod ipc;

use std::io::{self, BufRead, Write};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let cfg = config::DaemonConfig::from_env();

    // stdout carries the protocol; logs go to stderr.
    let filter = EnvFilter::try_new(&cfg.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "marksheetd starting");

    let mut state = ipc::AppState::default();
    if let Some(path) = cfg.workspace.clone() {
        if let Err(e) = state.open_workspace(path.clone()) {
            tracing::error!(workspace = %path.to_string_lossy(), error = ?e, "startup workspace open failed");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                // No usable id to answer with.
                tracing::warn!(error = %e, "unparseable request line");
                ipc::err("", "bad_json", e.to_string(), None)
            }
        };
        let out = serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string());
        let _ = writeln!(stdout, "{}", out);
        let _ = stdout.flush();
    }

    tracing::info!("marksheetd exiting");
}
