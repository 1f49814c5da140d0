use crate::calc::aggregate::{aggregate, grade_subjects, validate_subjects, ValidationIssue};
use crate::calc::{lenient_f64, GradeScale, MarksheetRecord, SubjectScore, DEFAULT_SUBJECT_TOTAL};
use crate::db::{self, MarksheetFilter};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, grade_scale, not_found, optional_str, required_str, str_field};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Why a submitted marksheet could not be built.
enum EntryError {
    Params(String),
    Invalid(Vec<ValidationIssue>),
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for EntryError {
    fn from(e: rusqlite::Error) -> Self {
        EntryError::Db(e)
    }
}

fn issue(index: usize, field: &str, message: &str) -> ValidationIssue {
    ValidationIssue {
        index,
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Entry-form read of subject rows: unlike the lenient extractor read, marks
/// that are not numbers are reported instead of becoming 0.
fn parse_entry_subjects(raw: Option<&serde_json::Value>) -> Result<Vec<SubjectScore>, EntryError> {
    let Some(rows) = raw.and_then(|v| v.as_array()) else {
        return Err(EntryError::Params("subjects must be an array".into()));
    };
    let mut out = Vec::with_capacity(rows.len());
    let mut issues = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if !row.is_object() {
            issues.push(issue(i, "subjects", "must be an object"));
            continue;
        }
        let name = str_field(row, "subjectName")
            .or_else(|| str_field(row, "name"))
            .unwrap_or_default();
        let Some(marks_obtained) = lenient_f64(row.get("marksObtained")) else {
            issues.push(issue(i, "marksObtained", "must be a number"));
            continue;
        };
        let total_marks = match row.get("totalMarks") {
            None | Some(serde_json::Value::Null) => DEFAULT_SUBJECT_TOTAL,
            Some(v) => match lenient_f64(Some(v)) {
                Some(t) => t,
                None => {
                    issues.push(issue(i, "totalMarks", "must be a number"));
                    continue;
                }
            },
        };
        out.push(SubjectScore {
            subject_id: str_field(row, "subjectId"),
            subject_name: name,
            marks_obtained,
            total_marks,
            grade: String::new(),
        });
    }
    if !issues.is_empty() {
        return Err(EntryError::Invalid(issues));
    }
    let issues = validate_subjects(&out);
    if !issues.is_empty() {
        return Err(EntryError::Invalid(issues));
    }
    Ok(out)
}

/// Class, section and name on file for a student, used to fill in fields the
/// entry form left blank.
fn student_defaults(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<Option<(String, Option<String>, Option<String>)>> {
    conn.query_row(
        "SELECT first_name || ' ' || last_name, class, section FROM students WHERE id = ?",
        [student_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()
}

/// Build a complete, graded marksheet from an entry. Fields missing from
/// `entry` are taken from `header` (bulk entry), then from the student on
/// file.
fn build_record(
    conn: &Connection,
    scale: &GradeScale,
    entry: &serde_json::Value,
    header: Option<&serde_json::Value>,
    id: String,
) -> Result<MarksheetRecord, EntryError> {
    let field = |key: &str| str_field(entry, key).or_else(|| header.and_then(|h| str_field(h, key)));

    let student_id = field("studentId").ok_or_else(|| EntryError::Params("missing studentId".into()))?;
    let exam_type = field("examType").ok_or_else(|| EntryError::Params("missing examType".into()))?;
    let mut subjects = parse_entry_subjects(entry.get("subjects"))?;

    let on_file = student_defaults(conn, &student_id)?;
    let (file_name, file_class, file_section) = on_file.unwrap_or_default();

    grade_subjects(&mut subjects, scale);
    let totals = aggregate(&subjects, scale);
    Ok(MarksheetRecord {
        id,
        student_name: field("studentName").unwrap_or(file_name),
        class: field("class").or(file_class),
        section: field("section").or(file_section),
        year: field("year").unwrap_or_default(),
        student_id,
        exam_type,
        subjects,
        total_obtained: totals.total_obtained,
        total_marks: totals.total_marks,
        percentage: totals.percentage,
        overall_grade: totals.overall_grade,
    })
}

fn entry_error(req: &Request, e: EntryError, entry_index: Option<usize>) -> serde_json::Value {
    match e {
        EntryError::Params(msg) => err(
            &req.id,
            "bad_params",
            msg,
            entry_index.map(|i| json!({ "entry": i })),
        ),
        EntryError::Invalid(issues) => err(
            &req.id,
            "bad_params",
            "marksheet failed validation",
            Some(json!({ "entry": entry_index, "issues": issues })),
        ),
        EntryError::Db(e) => db_err(req, "db_query_failed", e),
    }
}

fn marksheet_exists(conn: &Connection, marksheet_id: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM marksheets WHERE id = ?", [marksheet_id], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn handle_marksheets_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let filter = MarksheetFilter {
        exam_type: optional_str(req, "examType"),
        year: optional_str(req, "year"),
        class: optional_str(req, "class"),
        section: optional_str(req, "section"),
        student_id: optional_str(req, "studentId"),
    };
    match db::load_marksheets(conn, &filter) {
        Ok(records) => ok(&req.id, json!({ "marksheets": records })),
        Err(e) => db_err(req, "db_query_failed", e),
    }
}

fn handle_marksheets_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let marksheet_id = match required_str(req, "marksheetId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::load_marksheet(conn, &marksheet_id) {
        Ok(Some(r)) => ok(&req.id, json!({ "marksheet": r })),
        Ok(None) => not_found(req, "marksheet", &marksheet_id),
        Err(e) => db_err(req, "db_query_failed", e),
    }
}

fn handle_marksheets_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scale = match grade_scale(conn, req) {
        Ok(s) => s,
        Err(e) => return e,
    };

    let id = match optional_str(req, "id") {
        Some(id) => match marksheet_exists(conn, &id) {
            Ok(true) => id,
            Ok(false) => return not_found(req, "marksheet", &id),
            Err(e) => return db_err(req, "db_query_failed", e),
        },
        None => Uuid::new_v4().to_string(),
    };

    let record = match build_record(conn, &scale, &req.params, None, id) {
        Ok(r) => r,
        Err(e) => return entry_error(req, e, None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return db_err(req, "db_tx_failed", e),
    };
    if let Err(e) = db::write_marksheet(&tx, &record) {
        let _ = tx.rollback();
        return db_err(req, "db_update_failed", e);
    }
    if let Err(e) = tx.commit() {
        return db_err(req, "db_tx_failed", e);
    }

    tracing::info!(
        marksheet_id = %record.id,
        student_id = %record.student_id,
        exam_type = %record.exam_type,
        percentage = record.percentage,
        "marksheet saved"
    );
    ok(&req.id, json!({ "marksheet": record }))
}

fn handle_marksheets_bulk_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scale = match grade_scale(conn, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "entries must be an array", None);
    };
    if entries.is_empty() {
        return err(&req.id, "bad_params", "entries must not be empty", None);
    }
    let header = &req.params;

    // Everything is built and validated before anything is written.
    let mut records: Vec<MarksheetRecord> = Vec::with_capacity(entries.len());
    let mut created = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let field = |key: &str| str_field(entry, key).or_else(|| str_field(header, key));
        let existing: rusqlite::Result<Option<String>> =
            match (field("studentId"), field("examType")) {
                (Some(sid), Some(et)) => conn
                    .query_row(
                        "SELECT id FROM marksheets
                         WHERE student_id = ? AND exam_type = ? AND year = ?
                         ORDER BY rowid
                         LIMIT 1",
                        (&sid, &et, field("year").unwrap_or_default()),
                        |r| r.get(0),
                    )
                    .optional(),
                _ => Ok(None),
            };
        let id = match (str_field(entry, "id"), existing) {
            (Some(id), _) => match marksheet_exists(conn, &id) {
                Ok(true) => id,
                Ok(false) => {
                    created += 1;
                    id
                }
                Err(e) => return db_err(req, "db_query_failed", e),
            },
            (None, Ok(Some(id))) => id,
            (None, Ok(None)) => {
                created += 1;
                Uuid::new_v4().to_string()
            }
            (None, Err(e)) => return db_err(req, "db_query_failed", e),
        };
        if records.iter().any(|r| r.id == id) {
            return err(
                &req.id,
                "bad_params",
                "two entries resolve to the same marksheet",
                Some(json!({ "entry": i })),
            );
        }
        match build_record(conn, &scale, entry, Some(header), id) {
            Ok(r) => records.push(r),
            Err(e) => return entry_error(req, e, Some(i)),
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return db_err(req, "db_tx_failed", e),
    };
    for r in &records {
        if let Err(e) = db::write_marksheet(&tx, r) {
            let _ = tx.rollback();
            return db_err(req, "db_update_failed", e);
        }
    }
    if let Err(e) = tx.commit() {
        return db_err(req, "db_tx_failed", e);
    }

    tracing::info!(
        saved = records.len(),
        created,
        "bulk marksheet entry saved"
    );
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    ok(
        &req.id,
        json!({
            "saved": records.len(),
            "created": created,
            "updated": records.len() - created,
            "marksheetIds": ids,
        }),
    )
}

fn handle_marksheets_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let marksheet_id = match required_str(req, "marksheetId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM marksheets WHERE id = ?", [&marksheet_id]) {
        Ok(0) => not_found(req, "marksheet", &marksheet_id),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => db_err(req, "db_delete_failed", e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marksheets.list" => Some(handle_marksheets_list(state, req)),
        "marksheets.get" => Some(handle_marksheets_get(state, req)),
        "marksheets.save" => Some(handle_marksheets_save(state, req)),
        "marksheets.bulkSave" => Some(handle_marksheets_bulk_save(state, req)),
        "marksheets.delete" => Some(handle_marksheets_delete(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_subjects_report_non_numeric_marks() {
        let res = parse_entry_subjects(Some(&json!([
            { "subjectName": "Math", "marksObtained": "abc", "totalMarks": 50 }
        ])));
        match res {
            Err(EntryError::Invalid(issues)) => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].field, "marksObtained");
            }
            _ => panic!("expected validation issues"),
        }
    }

    #[test]
    fn entry_subjects_reject_over_total() {
        let res = parse_entry_subjects(Some(&json!([
            { "subjectName": "Math", "marksObtained": 51, "totalMarks": 50 }
        ])));
        assert!(matches!(res, Err(EntryError::Invalid(_))));
    }

    #[test]
    fn entry_subjects_default_total_and_accept_numeric_strings() {
        let res = parse_entry_subjects(Some(&json!([
            { "name": "Math", "marksObtained": "45" }
        ])));
        let Ok(subjects) = res else {
            panic!("expected subjects");
        };
        assert_eq!(subjects[0].subject_name, "Math");
        assert_eq!(subjects[0].marks_obtained, 45.0);
        assert_eq!(subjects[0].total_marks, 100.0);
    }
}
