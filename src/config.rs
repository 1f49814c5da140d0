use std::env;
use std::path::PathBuf;

pub const DEFAULT_LOG_FILTER: &str = "marksheetd=info";

/// Process-level settings. Everything stored per workspace (grade
/// thresholds and the rest) lives in the workspace database instead.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    /// Workspace opened at startup, before any `workspace.select`.
    pub workspace: Option<PathBuf>,
    pub log_filter: String,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        // A missing .env is fine; the process environment still applies.
        dotenvy::dotenv().ok();

        let workspace = non_empty_var("MARKSHEETD_WORKSPACE").map(PathBuf::from);
        let log_filter = non_empty_var("MARKSHEETD_LOG")
            .or_else(|| non_empty_var("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Self {
            workspace,
            log_filter,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
