use rusqlite::Connection;
use serde_json::json;

use crate::calc::GradeScale;
use crate::db;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    optional_str(req, key)
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

/// Trimmed string param; empty strings count as absent.
pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    str_field(&req.params, key)
}

pub fn str_field(obj: &serde_json::Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn db_err(req: &Request, code: &str, e: impl std::fmt::Display) -> serde_json::Value {
    // `{:#}` keeps any context chain on anyhow errors.
    let message = format!("{:#}", e);
    tracing::error!(method = %req.method, code, error = %message, "request failed");
    err(&req.id, code, message, None)
}

pub fn grade_scale(conn: &Connection, req: &Request) -> Result<GradeScale, serde_json::Value> {
    db::load_grade_scale(conn).map_err(|e| db_err(req, "db_query_failed", e))
}

pub fn not_found(req: &Request, what: &str, id: &str) -> serde_json::Value {
    err(
        &req.id,
        "not_found",
        format!("{} not found", what),
        Some(json!({ "id": id })),
    )
}
