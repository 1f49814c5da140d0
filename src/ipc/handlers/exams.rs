use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, not_found, optional_str, required_str, str_field};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExamSubject {
    pub id: Option<String>,
    pub name: String,
    pub date: Option<String>,
    pub time: Option<String>,
    pub duration: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExamRow {
    pub id: String,
    pub name: String,
    pub class: Option<String>,
    pub exam_type: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub academic_year: Option<String>,
    pub subjects: Vec<ExamSubject>,
}

impl ExamRow {
    pub fn to_json(&self) -> serde_json::Value {
        let subjects: Vec<serde_json::Value> = self
            .subjects
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "name": s.name,
                    "date": s.date,
                    "time": s.time,
                    "duration": s.duration,
                })
            })
            .collect();
        json!({
            "id": self.id,
            "name": self.name,
            "class": self.class,
            "examType": self.exam_type,
            "startDate": self.start_date,
            "endDate": self.end_date,
            "academicYear": self.academic_year,
            "subjects": subjects,
        })
    }
}

fn parse_date(v: Option<&serde_json::Value>, key: &str) -> Result<Option<String>, String> {
    match v {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(|d| Some(d.format("%Y-%m-%d").to_string()))
            .map_err(|_| format!("{} must be a YYYY-MM-DD date", key)),
        Some(_) => Err(format!("{} must be a string", key)),
    }
}

fn check_date_order(start: &Option<String>, end: &Option<String>) -> Result<(), String> {
    if let (Some(s), Some(e)) = (start, end) {
        // Both are normalized YYYY-MM-DD, so string order is date order.
        if e < s {
            return Err("endDate must not be before startDate".into());
        }
    }
    Ok(())
}

fn parse_exam_subjects(raw: &serde_json::Value) -> Result<Vec<ExamSubject>, String> {
    let Some(rows) = raw.as_array() else {
        return Err("subjects must be an array".into());
    };
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if !row.is_object() {
            return Err(format!("subjects[{}] must be an object", i));
        }
        let Some(name) = str_field(row, "name") else {
            return Err(format!("subjects[{}].name is required", i));
        };
        if out.iter().any(|s: &ExamSubject| s.name == name) {
            return Err(format!("duplicate subject {}", name));
        }
        out.push(ExamSubject {
            id: str_field(row, "id"),
            name,
            date: parse_date(row.get("date"), &format!("subjects[{}].date", i))?,
            time: str_field(row, "time"),
            duration: row.get("duration").and_then(|v| match v {
                serde_json::Value::Number(n) => Some(n.to_string()),
                serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            }),
        });
    }
    Ok(out)
}

fn load_subjects(conn: &Connection, exam_id: &str) -> rusqlite::Result<Vec<ExamSubject>> {
    let mut stmt = conn.prepare_cached(
        "SELECT subject_id, name, date, time, duration
         FROM exam_subjects
         WHERE exam_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok(ExamSubject {
                id: r.get(0)?,
                name: r.get(1)?,
                date: r.get(2)?,
                time: r.get(3)?,
                duration: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn write_subjects(conn: &Connection, exam_id: &str, subjects: &[ExamSubject]) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM exam_subjects WHERE exam_id = ?", [exam_id])?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO exam_subjects(exam_id, sort_order, subject_id, name, date, time, duration)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
    )?;
    for (i, s) in subjects.iter().enumerate() {
        stmt.execute(rusqlite::params![
            exam_id, i as i64, s.id, s.name, s.date, s.time, s.duration
        ])?;
    }
    Ok(())
}

fn query_exams(conn: &Connection, where_sql: &str, binds: Vec<Value>) -> rusqlite::Result<Vec<ExamRow>> {
    let sql = format!(
        "SELECT id, name, class, exam_type, start_date, end_date, academic_year
         FROM exams
         {}
         ORDER BY COALESCE(start_date, ''), rowid",
        where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut exams = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(ExamRow {
                id: r.get(0)?,
                name: r.get(1)?,
                class: r.get(2)?,
                exam_type: r.get(3)?,
                start_date: r.get(4)?,
                end_date: r.get(5)?,
                academic_year: r.get(6)?,
                subjects: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for exam in &mut exams {
        exam.subjects = load_subjects(conn, &exam.id)?;
    }
    Ok(exams)
}

pub fn load_exam(conn: &Connection, exam_id: &str) -> rusqlite::Result<Option<ExamRow>> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM exams WHERE id = ?", [exam_id], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Ok(None);
    }
    Ok(query_exams(conn, "WHERE id = ?", vec![Value::Text(exam_id.to_string())])?
        .into_iter()
        .next())
}

/// The exam a marksheet belongs to, matched on exam type plus class and
/// academic year where the exam records them.
pub fn find_exam_for(
    conn: &Connection,
    exam_type: &str,
    class: Option<&str>,
    year: &str,
) -> rusqlite::Result<Option<ExamRow>> {
    let exams = query_exams(
        conn,
        "WHERE exam_type = ?",
        vec![Value::Text(exam_type.to_string())],
    )?;
    Ok(exams.into_iter().find(|e| {
        let class_ok = match (e.class.as_deref(), class) {
            (Some(ec), Some(c)) => ec == c,
            _ => true,
        };
        let year_ok = e
            .academic_year
            .as_deref()
            .map(|y| year.is_empty() || y == year)
            .unwrap_or(true);
        class_ok && year_ok
    }))
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (key, clause) in [
        ("class", "class = ?"),
        ("academicYear", "academic_year = ?"),
        ("examType", "exam_type = ?"),
    ] {
        if let Some(v) = optional_str(req, key) {
            clauses.push(clause);
            binds.push(Value::Text(v));
        }
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    match query_exams(conn, &where_sql, binds) {
        Ok(exams) => {
            let out: Vec<serde_json::Value> = exams.iter().map(ExamRow::to_json).collect();
            ok(&req.id, json!({ "exams": out }))
        }
        Err(e) => db_err(req, "db_query_failed", e),
    }
}

fn handle_exams_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_exam(conn, &exam_id) {
        Ok(Some(exam)) => ok(&req.id, json!({ "exam": exam.to_json() })),
        Ok(None) => not_found(req, "exam", &exam_id),
        Err(e) => db_err(req, "db_query_failed", e),
    }
}

/// Apply the exam fields present in `src` onto `exam`.
fn apply_exam_fields(exam: &mut ExamRow, src: &serde_json::Value) -> Result<(), String> {
    if src.get("name").is_some() {
        exam.name = str_field(src, "name").ok_or("name must not be empty")?;
    }
    if src.get("examType").is_some() {
        exam.exam_type = str_field(src, "examType").ok_or("examType must not be empty")?;
    }
    if src.get("class").is_some() {
        exam.class = str_field(src, "class");
    }
    if src.get("academicYear").is_some() {
        exam.academic_year = str_field(src, "academicYear");
    }
    if src.get("startDate").is_some() {
        exam.start_date = parse_date(src.get("startDate"), "startDate")?;
    }
    if src.get("endDate").is_some() {
        exam.end_date = parse_date(src.get("endDate"), "endDate")?;
    }
    if let Some(raw) = src.get("subjects") {
        exam.subjects = parse_exam_subjects(raw)?;
    }
    check_date_order(&exam.start_date, &exam.end_date)
}

fn write_exam(conn: &Connection, exam: &ExamRow, insert: bool) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    if insert {
        tx.execute(
            "INSERT INTO exams(id, name, class, exam_type, start_date, end_date, academic_year, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
            rusqlite::params![
                exam.id,
                exam.name,
                exam.class,
                exam.exam_type,
                exam.start_date,
                exam.end_date,
                exam.academic_year,
            ],
        )?;
    } else {
        tx.execute(
            "UPDATE exams
             SET name = ?, class = ?, exam_type = ?, start_date = ?, end_date = ?, academic_year = ?,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?",
            rusqlite::params![
                exam.name,
                exam.class,
                exam.exam_type,
                exam.start_date,
                exam.end_date,
                exam.academic_year,
                exam.id,
            ],
        )?;
    }
    write_subjects(&tx, &exam.id, &exam.subjects)?;
    tx.commit()
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    for key in ["name", "examType"] {
        if let Err(e) = required_str(req, key) {
            return e;
        }
    }
    let mut exam = ExamRow {
        id: optional_str(req, "id").unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: String::new(),
        class: None,
        exam_type: String::new(),
        start_date: None,
        end_date: None,
        academic_year: None,
        subjects: Vec::new(),
    };
    if let Err(msg) = apply_exam_fields(&mut exam, &req.params) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = write_exam(conn, &exam, true) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }
    tracing::info!(exam_id = %exam.id, exam_type = %exam.exam_type, "exam created");
    ok(&req.id, json!({ "examId": exam.id }))
}

fn handle_exams_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };
    let mut exam = match load_exam(conn, &exam_id) {
        Ok(Some(e)) => e,
        Ok(None) => return not_found(req, "exam", &exam_id),
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    if let Err(msg) = apply_exam_fields(&mut exam, patch) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = write_exam(conn, &exam, false) {
        return db_err(req, "db_update_failed", e);
    }
    ok(&req.id, json!({ "exam": exam.to_json() }))
}

fn handle_exams_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM exams WHERE id = ?", [&exam_id]) {
        Ok(0) => not_found(req, "exam", &exam_id),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => db_err(req, "db_delete_failed", e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.list" => Some(handle_exams_list(state, req)),
        "exams.get" => Some(handle_exams_get(state, req)),
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.update" => Some(handle_exams_update(state, req)),
        "exams.delete" => Some(handle_exams_delete(state, req)),
        _ => None,
    }
}
