use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, not_found, optional_str, required_str, str_field};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StudentRow {
    id: String,
    first_name: String,
    last_name: String,
    class: Option<String>,
    section: Option<String>,
    academic_year: Option<String>,
    status: String,
}

impl StudentRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "firstName": self.first_name,
            "lastName": self.last_name,
            "displayName": format!("{} {}", self.first_name, self.last_name),
            "class": self.class,
            "section": self.section,
            "academicYear": self.academic_year,
            "status": self.status,
        })
    }
}

fn load_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<StudentRow>> {
    conn.query_row(
        "SELECT id, first_name, last_name, class, section, academic_year, status
         FROM students
         WHERE id = ?",
        [student_id],
        |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                first_name: r.get(1)?,
                last_name: r.get(2)?,
                class: r.get(3)?,
                section: r.get(4)?,
                academic_year: r.get(5)?,
                status: r.get(6)?,
            })
        },
    )
    .optional()
}

/// `Ok(None)` means "leave as is", `Ok(Some(None))` clears the field.
fn parse_nullable(patch: &serde_json::Value, key: &str) -> Result<Option<Option<String>>, String> {
    match patch.get(key) {
        None => Ok(None),
        Some(serde_json::Value::Null) => Ok(Some(None)),
        Some(serde_json::Value::String(s)) => {
            let t = s.trim();
            Ok(Some(if t.is_empty() { None } else { Some(t.to_string()) }))
        }
        Some(_) => Err(format!("{} must be a string or null", key)),
    }
}

fn parse_status(v: Option<&serde_json::Value>) -> Result<Option<String>, String> {
    match v {
        None => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str().map(|s| s.trim().to_ascii_lowercase()) else {
                return Err("status must be a string".into());
            };
            if s.is_empty() || s.len() > 24 {
                return Err("status must be 1-24 characters".into());
            }
            Ok(Some(s))
        }
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (key, clause) in [
        ("class", "class = ?"),
        ("section", "section = ?"),
        ("academicYear", "academic_year = ?"),
        ("status", "status = ?"),
    ] {
        if let Some(v) = optional_str(req, key) {
            clauses.push(clause);
            binds.push(Value::Text(if key == "status" {
                v.to_ascii_lowercase()
            } else {
                v
            }));
        }
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT id, first_name, last_name, class, section, academic_year, status
         FROM students
         {}
         ORDER BY sort_order",
        where_sql
    );

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                first_name: r.get(1)?,
                last_name: r.get(2)?,
                class: r.get(3)?,
                section: r.get(4)?,
                academic_year: r.get(5)?,
                status: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => {
            let out: Vec<serde_json::Value> = students.iter().map(StudentRow::to_json).collect();
            ok(&req.id, json!({ "students": out }))
        }
        Err(e) => db_err(req, "db_query_failed", e),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status = match parse_status(req.params.get("status")) {
        Ok(v) => v.unwrap_or_else(|| "active".to_string()),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return db_err(req, "db_query_failed", e),
    };

    let student_id = optional_str(req, "id").unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Err(e) = conn.execute(
        "INSERT INTO students(
           id, first_name, last_name, class, section, academic_year, status, sort_order, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        rusqlite::params![
            student_id,
            first_name,
            last_name,
            optional_str(req, "class"),
            optional_str(req, "section"),
            optional_str(req, "academicYear"),
            status,
            sort_order,
        ],
    ) {
        tracing::warn!(error = %e, student_id = %student_id, "student insert failed");
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    tracing::info!(student_id = %student_id, "student created");
    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut row = match load_student(conn, &student_id) {
        Ok(Some(r)) => r,
        Ok(None) => return not_found(req, "student", &student_id),
        Err(e) => return db_err(req, "db_query_failed", e),
    };

    for key in ["firstName", "lastName"] {
        if patch.get(key).is_some() {
            let Some(v) = str_field(patch, key) else {
                return err(&req.id, "bad_params", format!("{} must not be empty", key), None);
            };
            if key == "firstName" {
                row.first_name = v;
            } else {
                row.last_name = v;
            }
        }
    }
    for (key, slot) in [
        ("class", &mut row.class),
        ("section", &mut row.section),
        ("academicYear", &mut row.academic_year),
    ] {
        match parse_nullable(patch, key) {
            Ok(Some(v)) => *slot = v,
            Ok(None) => {}
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        }
    }
    match parse_status(patch.get("status")) {
        Ok(Some(s)) => row.status = s,
        Ok(None) => {}
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    }

    if let Err(e) = conn.execute(
        "UPDATE students
         SET first_name = ?, last_name = ?, class = ?, section = ?, academic_year = ?, status = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        rusqlite::params![
            row.first_name,
            row.last_name,
            row.class,
            row.section,
            row.academic_year,
            row.status,
            row.id,
        ],
    ) {
        return db_err(req, "db_update_failed", e);
    }
    ok(&req.id, json!({ "student": row.to_json() }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let force = req
        .params
        .get("force")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    match load_student(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(req, "student", &student_id),
        Err(e) => return db_err(req, "db_query_failed", e),
    }

    let marksheet_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM marksheets WHERE student_id = ?",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    if marksheet_count > 0 && !force {
        return err(
            &req.id,
            "bad_params",
            "student has marksheets; pass force=true to delete them too",
            Some(json!({ "marksheetCount": marksheet_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return db_err(req, "db_tx_failed", e),
    };
    if let Err(e) = tx.execute("DELETE FROM marksheets WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "marksheets" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.commit() {
        return db_err(req, "db_tx_failed", e);
    }

    tracing::info!(student_id = %student_id, marksheets = marksheet_count, "student deleted");
    ok(
        &req.id,
        json!({ "ok": true, "deletedMarksheets": marksheet_count }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
