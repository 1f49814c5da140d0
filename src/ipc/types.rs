use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::db;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    /// Open (creating if needed) the workspace database and make it current.
    /// The previous workspace stays selected if this fails.
    pub fn open_workspace(&mut self, path: PathBuf) -> anyhow::Result<()> {
        let conn = db::open_db(&path)?;
        tracing::info!(workspace = %path.to_string_lossy(), "workspace selected");
        self.workspace = Some(path);
        self.db = Some(conn);
        Ok(())
    }
}
