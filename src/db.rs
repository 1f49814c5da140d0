use anyhow::Context;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use crate::calc::grading::{parse_thresholds, GradeScale};
use crate::calc::{MarksheetRecord, SubjectScore};

pub const DB_FILE: &str = "marksheets.sqlite3";
pub const GRADE_THRESHOLDS_KEY: &str = "grading.thresholds";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            class TEXT,
            section TEXT,
            academic_year TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_section ON students(class, section)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class TEXT,
            exam_type TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            academic_year TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_subjects(
            exam_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            subject_id TEXT,
            name TEXT NOT NULL,
            date TEXT,
            time TEXT,
            duration TEXT,
            PRIMARY KEY(exam_id, sort_order),
            FOREIGN KEY(exam_id) REFERENCES exams(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // student_id/exam_type are lookup keys, not foreign keys: marksheets may
    // arrive for students this workspace has never seen.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS marksheets(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL DEFAULT '',
            class TEXT,
            section TEXT,
            exam_type TEXT NOT NULL,
            year TEXT NOT NULL DEFAULT '',
            total_obtained REAL NOT NULL,
            total_marks REAL NOT NULL,
            percentage REAL NOT NULL,
            overall_grade TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marksheets_exam ON marksheets(exam_type, year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marksheets_student ON marksheets(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS marksheet_subjects(
            marksheet_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            subject_id TEXT,
            subject_name TEXT NOT NULL,
            marks_obtained REAL NOT NULL,
            total_marks REAL NOT NULL,
            grade TEXT NOT NULL,
            PRIMARY KEY(marksheet_id, sort_order),
            FOREIGN KEY(marksheet_id) REFERENCES marksheets(id) ON DELETE CASCADE
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        None => Ok(None),
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("setting {} is not valid json", key))?,
        )),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn settings_delete(conn: &Connection, key: &str) -> anyhow::Result<()> {
    conn.execute("DELETE FROM settings WHERE key = ?", [key])?;
    Ok(())
}

/// Active grade bands for this workspace. A stored table that no longer
/// validates is ignored in favour of the defaults.
pub fn load_grade_scale(conn: &Connection) -> anyhow::Result<GradeScale> {
    let Some(saved) = settings_get_json(conn, GRADE_THRESHOLDS_KEY)? else {
        return Ok(GradeScale::default());
    };
    match parse_thresholds(&saved) {
        Ok(thresholds) => Ok(GradeScale::new(thresholds)),
        Err(msg) => {
            tracing::warn!(error = %msg, "stored grade thresholds rejected; using defaults");
            Ok(GradeScale::default())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarksheetFilter {
    pub exam_type: Option<String>,
    pub year: Option<String>,
    pub class: Option<String>,
    pub section: Option<String>,
    pub student_id: Option<String>,
}

type MarksheetRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    f64,
    f64,
    f64,
    String,
);

/// Marksheets matching `filter`, in the order they were first saved.
pub fn load_marksheets(conn: &Connection, filter: &MarksheetFilter) -> anyhow::Result<Vec<MarksheetRecord>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (clause, v) in [
        ("exam_type = ?", &filter.exam_type),
        ("year = ?", &filter.year),
        ("class = ?", &filter.class),
        ("section = ?", &filter.section),
        ("student_id = ?", &filter.student_id),
    ] {
        if let Some(v) = v {
            clauses.push(clause);
            binds.push(Value::Text(v.clone()));
        }
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT id, student_id, student_name, class, section, exam_type, year,
                total_obtained, total_marks, percentage, overall_grade
         FROM marksheets
         {}
         ORDER BY rowid",
        where_sql
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<MarksheetRow> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
                r.get(8)?,
                r.get(9)?,
                r.get(10)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(marksheet_from_row(conn, row)?);
    }
    Ok(out)
}

pub fn load_marksheet(conn: &Connection, marksheet_id: &str) -> anyhow::Result<Option<MarksheetRecord>> {
    let row: Option<MarksheetRow> = conn
        .query_row(
            "SELECT id, student_id, student_name, class, section, exam_type, year,
                    total_obtained, total_marks, percentage, overall_grade
             FROM marksheets
             WHERE id = ?",
            [marksheet_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some(row) => Ok(Some(marksheet_from_row(conn, row)?)),
        None => Ok(None),
    }
}

fn marksheet_from_row(conn: &Connection, row: MarksheetRow) -> anyhow::Result<MarksheetRecord> {
    let (
        id,
        student_id,
        student_name,
        class,
        section,
        exam_type,
        year,
        total_obtained,
        total_marks,
        percentage,
        overall_grade,
    ) = row;
    let mut stmt = conn.prepare_cached(
        "SELECT subject_id, subject_name, marks_obtained, total_marks, grade
         FROM marksheet_subjects
         WHERE marksheet_id = ?
         ORDER BY sort_order",
    )?;
    let subjects = stmt
        .query_map([&id], |r| {
            Ok(SubjectScore {
                subject_id: r.get(0)?,
                subject_name: r.get(1)?,
                marks_obtained: r.get(2)?,
                total_marks: r.get(3)?,
                grade: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MarksheetRecord {
        id,
        student_id,
        student_name,
        class,
        section,
        exam_type,
        year,
        subjects,
        total_obtained,
        total_marks,
        percentage,
        overall_grade,
    })
}

/// Insert `record`, or replace the stored marksheet with the same id
/// wholesale (subjects included). The row keeps its original position in
/// listing order.
pub fn write_marksheet(conn: &Connection, record: &MarksheetRecord) -> anyhow::Result<()> {
    let updated = conn.execute(
        "UPDATE marksheets
         SET student_id = ?, student_name = ?, class = ?, section = ?, exam_type = ?, year = ?,
             total_obtained = ?, total_marks = ?, percentage = ?, overall_grade = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        rusqlite::params![
            record.student_id,
            record.student_name,
            record.class,
            record.section,
            record.exam_type,
            record.year,
            record.total_obtained,
            record.total_marks,
            record.percentage,
            record.overall_grade,
            record.id,
        ],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO marksheets(
               id, student_id, student_name, class, section, exam_type, year,
               total_obtained, total_marks, percentage, overall_grade, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
            rusqlite::params![
                record.id,
                record.student_id,
                record.student_name,
                record.class,
                record.section,
                record.exam_type,
                record.year,
                record.total_obtained,
                record.total_marks,
                record.percentage,
                record.overall_grade,
            ],
        )?;
    } else {
        conn.execute(
            "DELETE FROM marksheet_subjects WHERE marksheet_id = ?",
            [&record.id],
        )?;
    }

    let mut stmt = conn.prepare_cached(
        "INSERT INTO marksheet_subjects(
           marksheet_id, sort_order, subject_id, subject_name, marks_obtained, total_marks, grade
         ) VALUES(?, ?, ?, ?, ?, ?, ?)",
    )?;
    for (i, s) in record.subjects.iter().enumerate() {
        stmt.execute(rusqlite::params![
            record.id,
            i as i64,
            s.subject_id,
            s.subject_name,
            s.marks_obtained,
            s.total_marks,
            s.grade,
        ])?;
    }
    Ok(())
}

/// Year of the most recently created marksheet for an exam type and class
/// section, if any.
pub fn latest_marksheet_year(
    conn: &Connection,
    exam_type: &str,
    class: &str,
    section: &str,
) -> anyhow::Result<Option<String>> {
    let year = conn
        .query_row(
            "SELECT year FROM marksheets
             WHERE exam_type = ? AND class = ? AND section = ?
             ORDER BY rowid DESC
             LIMIT 1",
            (exam_type, class, section),
            |r| r.get(0),
        )
        .optional()?;
    Ok(year)
}

/// `studentId -> "First Last"` for every student in the workspace.
pub fn student_display_names(conn: &Connection) -> anyhow::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT id, first_name, last_name FROM students")?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let first: String = r.get(1)?;
            let last: String = r.get(2)?;
            Ok((id, format!("{} {}", first, last).trim().to_string()))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}
