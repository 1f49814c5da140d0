use crate::calc::aggregate::refresh;
use crate::calc::extract::{extract, ExtractFilter, RawMarks};
use crate::calc::rank::rank;
use crate::calc::stats::summarize;
use crate::calc::{GradeScale, MarksheetRecord};
use crate::db::{self, MarksheetFilter};
use crate::ipc::error::ok;
use crate::ipc::helpers::{db_conn, db_err, grade_scale, not_found, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

use super::exams::{self, ExamRow};
use super::results::{select_records, ResultScope};

fn generated_at() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn display_name(names: &HashMap<String, String>, record: &MarksheetRecord) -> String {
    names
        .get(&record.student_id)
        .cloned()
        .unwrap_or_else(|| record.student_name.clone())
}

fn exam_header(
    conn: &Connection,
    req: &Request,
    exam_type: &str,
    class: Option<&str>,
    year: &str,
) -> Result<serde_json::Value, serde_json::Value> {
    let exam: Option<ExamRow> = exams::find_exam_for(conn, exam_type, class, year)
        .map_err(|e| db_err(req, "db_query_failed", e))?;
    Ok(match exam {
        Some(e) => json!({
            "examId": e.id,
            "name": e.name,
            "examType": e.exam_type,
            "startDate": e.start_date,
            "endDate": e.end_date,
            "academicYear": e.academic_year,
        }),
        None => json!({
            "examId": null,
            "name": exam_type,
            "examType": exam_type,
            "startDate": null,
            "endDate": null,
            "academicYear": if year.is_empty() { None } else { Some(year) },
        }),
    })
}

fn subject_rows(record: &MarksheetRecord, scale: &GradeScale) -> Vec<serde_json::Value> {
    record
        .subjects
        .iter()
        .map(|s| {
            json!({
                "subjectName": s.subject_name,
                "marksObtained": s.marks_obtained,
                "totalMarks": s.total_marks,
                "percentage": s.percentage(),
                "grade": s.grade,
                "gradeDescription": scale.description_for(&s.grade),
            })
        })
        .collect()
}

/// Position of one marksheet among its class section's marksheets for the
/// same exam type and year, ranked the same way `reports.classResults` does.
fn slip_position(
    conn: &Connection,
    record: &MarksheetRecord,
    scale: &GradeScale,
) -> anyhow::Result<Option<(usize, usize)>> {
    let (Some(class), Some(section)) = (record.class.as_deref(), record.section.as_deref()) else {
        return Ok(None);
    };
    let filter = MarksheetFilter {
        exam_type: Some(record.exam_type.clone()),
        year: Some(record.year.clone()),
        class: Some(class.to_string()),
        section: Some(section.to_string()),
        ..Default::default()
    };
    let peers = db::load_marksheets(conn, &filter)?;
    let scope = ExtractFilter {
        exam_type: Some(record.exam_type.as_str()),
        year: Some(record.year.as_str()),
        class: Some(class),
        section: Some(section),
    };
    let extracted = extract(&RawMarks::from_records(&peers), &scope);
    let refreshed: Vec<MarksheetRecord> = extracted
        .records
        .iter()
        .map(|r| refresh(r, scale))
        .collect();
    let ranked = rank(&refreshed);
    Ok(ranked
        .find_marksheet(&record.id)
        .map(|r| (r.position, r.total_students)))
}

/// Year a class listing covers when the caller names none: the year of the
/// newest marksheet for that class section, else the matching exam's academic
/// year. Listings are always single-year so they agree with slip positions.
fn default_year(
    conn: &Connection,
    exam_type: &str,
    class: &str,
    section: &str,
) -> anyhow::Result<Option<String>> {
    if let Some(year) = db::latest_marksheet_year(conn, exam_type, class, section)? {
        return Ok(Some(year));
    }
    let exam = exams::find_exam_for(conn, exam_type, Some(class), "")?;
    Ok(exam.and_then(|e| e.academic_year))
}

fn handle_reports_marksheet_slip(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let marksheet_id = match required_str(req, "marksheetId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scale = match grade_scale(conn, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let stored = match db::load_marksheet(conn, &marksheet_id) {
        Ok(Some(r)) => r,
        Ok(None) => return not_found(req, "marksheet", &marksheet_id),
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let record = refresh(&stored, &scale);

    let names = match db::student_display_names(conn) {
        Ok(n) => n,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let exam = match exam_header(
        conn,
        req,
        &record.exam_type,
        record.class.as_deref(),
        &record.year,
    ) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let position = match slip_position(conn, &record, &scale) {
        Ok(p) => p,
        Err(e) => return db_err(req, "db_query_failed", e),
    };

    ok(
        &req.id,
        json!({
            "generatedAt": generated_at(),
            "marksheetId": record.id,
            "student": {
                "id": record.student_id,
                "displayName": display_name(&names, &record),
                "class": record.class,
                "section": record.section,
            },
            "exam": exam,
            "subjects": subject_rows(&record, &scale),
            "totals": {
                "totalObtained": record.total_obtained,
                "totalMarks": record.total_marks,
                "percentage": record.percentage,
                "overallGrade": record.overall_grade,
                "gradeDescription": scale.description_for(&record.overall_grade),
            },
            "position": position.map(|(p, _)| p),
            "totalStudents": position.map(|(_, n)| n),
        }),
    )
}

fn handle_reports_class_results(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut required = Vec::with_capacity(3);
    for key in ["examType", "class", "section"] {
        match required_str(req, key) {
            Ok(v) => required.push(v),
            Err(e) => return e,
        }
    }
    let (exam_type, class, section) = (&required[0], &required[1], &required[2]);
    let year = match optional_str(req, "year") {
        Some(y) => Some(y),
        None => match default_year(conn, exam_type, class, section) {
            Ok(y) => y,
            Err(e) => return db_err(req, "db_query_failed", e),
        },
    };
    let scope = ResultScope {
        exam_type: Some(exam_type.clone()),
        year: year.clone(),
        class: Some(class.clone()),
        section: Some(section.clone()),
    };

    let selection = match select_records(state, req, &scope) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let names = match db::student_display_names(conn) {
        Ok(n) => n,
        Err(e) => return db_err(req, "db_query_failed", e),
    };
    let exam = match exam_header(
        conn,
        req,
        exam_type,
        Some(class.as_str()),
        year.as_deref().unwrap_or(""),
    ) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let ranked = rank(&selection.records);
    let rows: Vec<serde_json::Value> = ranked
        .group(class, section)
        .map(|g| {
            g.records
                .iter()
                .map(|r| {
                    json!({
                        "position": r.position,
                        "marksheetId": r.record.id,
                        "studentId": r.record.student_id,
                        "displayName": display_name(&names, &r.record),
                        "totalObtained": r.record.total_obtained,
                        "totalMarks": r.record.total_marks,
                        "percentage": r.record.percentage,
                        "overallGrade": r.record.overall_grade,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let summary = summarize(&selection.records, &selection.scale);

    ok(
        &req.id,
        json!({
            "generatedAt": generated_at(),
            "exam": exam,
            "class": class,
            "section": section,
            "year": year,
            "totalStudents": rows.len(),
            "rows": rows,
            "summary": summary,
            "diagnostics": selection.diagnostics(),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.marksheetSlip" => Some(handle_reports_marksheet_slip(state, req)),
        "reports.classResults" => Some(handle_reports_class_results(state, req)),
        _ => None,
    }
}
