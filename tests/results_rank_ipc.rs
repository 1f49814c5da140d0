use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_marksheetd");
    let mut child = Command::new(exe)
        .env_remove("MARKSHEETD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn marksheetd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn tied_class_marks() -> serde_json::Value {
    json!([
        { "id": "m1", "studentId": "s1", "class": "5", "section": "A", "examType": "Final", "year": "2024", "percentage": 91.5 },
        { "id": "m2", "studentId": "s2", "class": "5", "section": "A", "examType": "Final", "year": "2024", "percentage": 91.5 },
        { "id": "m3", "studentId": "s3", "class": "5", "section": "A", "examType": "Final", "year": "2024", "percentage": 70.0 }
    ])
}

#[test]
fn rank_ties_keep_input_order_with_distinct_positions() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    // No workspace needed when marks come with the request.
    let ranked = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "results.rank",
        json!({ "marks": tied_class_marks() }),
    );
    assert_eq!(ranked["source"].as_str(), Some("request"));
    let groups = ranked["groups"].as_array().expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["class"].as_str(), Some("5"));
    assert_eq!(groups[0]["section"].as_str(), Some("A"));

    let rows = groups[0]["records"].as_array().expect("records");
    let got: Vec<(&str, u64, u64)> = rows
        .iter()
        .map(|r| {
            (
                r["studentId"].as_str().unwrap_or(""),
                r["position"].as_u64().unwrap_or(0),
                r["totalStudents"].as_u64().unwrap_or(0),
            )
        })
        .collect();
    assert_eq!(got, vec![("s1", 1, 3), ("s2", 2, 3), ("s3", 3, 3)]);
    // Grades are re-derived from the stored percentage.
    assert_eq!(rows[0]["overallGrade"].as_str(), Some("A+"));
    assert_eq!(rows[2]["overallGrade"].as_str(), Some("B+"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn rank_counts_records_without_class_or_section() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let ranked = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "results.rank",
        json!({
            "marks": [
                { "studentId": "s1", "class": "5", "section": "A", "examType": "Final", "percentage": 60 },
                { "studentId": "s2", "class": "5", "examType": "Final", "percentage": 80 },
                { "studentId": "s3", "class": "5", "section": "B", "examType": "Final", "percentage": 50 },
                { "studentId": "s1", "class": "5", "section": "A", "examType": "Final", "percentage": 99 }
            ]
        }),
    );
    assert_eq!(ranked["groups"].as_array().map(|g| g.len()), Some(2));
    assert_eq!(ranked["diagnostics"]["missingGroupingKey"].as_u64(), Some(1));
    assert_eq!(ranked["diagnostics"]["duplicatesDropped"].as_u64(), Some(1));
    // First occurrence wins for s1.
    assert_eq!(
        ranked["groups"][0]["records"][0]["percentage"].as_f64(),
        Some(60.0)
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn extract_skips_non_record_keys_in_keyed_container() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "results.extract",
        json!({
            "marks": {
                "m1": { "examType": "Final", "studentId": "7", "percentage": 64 },
                "id": "ignoredKey"
            }
        }),
    );
    let records = out["records"].as_array().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["studentId"].as_str(), Some("7"));
    assert_eq!(out["skippedMalformed"].as_u64(), Some(1));

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.extract",
        json!({
            "examType": "Midterm",
            "marks": { "marks": [
                { "examType": "Final", "studentId": "7" },
                { "examType": "Midterm", "studentId": "8" }
            ], "meta": "ignored" }
        }),
    );
    assert_eq!(filtered["records"].as_array().map(|r| r.len()), Some(1));
    assert_eq!(filtered["filteredOut"].as_u64(), Some(1));

    let missing = request(&mut stdin, &mut reader, "3", "results.extract", json!({}));
    assert_eq!(error_code(&missing), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn workspace_rank_and_summary_follow_saved_marksheets() {
    let workspace = temp_dir("marksheetd-results-workspace");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let early = request(&mut stdin, &mut reader, "0", "results.rank", json!({}));
    assert_eq!(error_code(&early), "no_workspace");

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "marksheets.bulkSave",
        json!({
            "examType": "Final",
            "year": "2024",
            "class": "5",
            "section": "A",
            "entries": [
                { "studentId": "s1", "subjects": [
                    { "subjectName": "Math", "marksObtained": 45, "totalMarks": 50 },
                    { "subjectName": "Science", "marksObtained": 38, "totalMarks": 50 }
                ] },
                { "studentId": "s2", "subjects": [
                    { "subjectName": "Math", "marksObtained": 30, "totalMarks": 50 }
                ] }
            ]
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "marksheets.save",
        json!({
            "studentId": "s3",
            "examType": "Midterm",
            "year": "2024",
            "class": "5",
            "section": "A",
            "subjects": [{ "subjectName": "Math", "marksObtained": 100 }]
        }),
    );

    let ranked = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.rank",
        json!({ "examType": "Final", "year": "2024" }),
    );
    assert_eq!(ranked["source"].as_str(), Some("workspace"));
    let rows = ranked["groups"][0]["records"].as_array().expect("records");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["studentId"].as_str(), Some("s1"));
    assert_eq!(rows[0]["position"].as_u64(), Some(1));
    assert_eq!(rows[1]["studentId"].as_str(), Some("s2"));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.summary",
        json!({ "examType": "Final", "class": "5", "section": "A" }),
    );
    let s = &summary["summary"];
    assert_eq!(s["totalStudents"].as_u64(), Some(2));
    // (83 + 60) / 2
    assert_eq!(s["averagePercentage"].as_f64(), Some(71.5));
    assert_eq!(s["gradeDistribution"]["A"].as_u64(), Some(1));
    assert_eq!(s["gradeDistribution"]["B"].as_u64(), Some(1));
    assert_eq!(s["gradeDistribution"]["F"].as_u64(), Some(0));
    assert_eq!(s["subjectPerformance"]["Math"]["average"].as_f64(), Some(75.0));
    assert_eq!(s["subjectPerformance"]["Science"]["records"].as_u64(), Some(1));

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "results.summary",
        json!({ "examType": "Annual" }),
    );
    assert!(empty["summary"].is_null());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn year_scope_applies_before_duplicate_students_are_dropped() {
    let workspace = temp_dir("marksheetd-results-cross-year");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let marks = json!([
        { "id": "old", "studentId": "s1", "class": "5", "section": "A", "examType": "Final", "year": "2023", "percentage": 50 },
        { "id": "new", "studentId": "s1", "class": "5", "section": "A", "examType": "Final", "year": "2024", "percentage": 90 },
        { "id": "other", "studentId": "s2", "class": "5", "section": "A", "examType": "Final", "year": "2024", "percentage": 70 }
    ]);
    let ranked = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "results.rank",
        json!({ "examType": "Final", "year": "2024", "marks": marks }),
    );
    let rows = ranked["groups"][0]["records"].as_array().expect("records");
    let got: Vec<(&str, u64)> = rows
        .iter()
        .map(|r| (r["id"].as_str().unwrap_or(""), r["position"].as_u64().unwrap_or(0)))
        .collect();
    assert_eq!(got, vec![("new", 1), ("other", 2)]);
    assert_eq!(ranked["diagnostics"]["duplicatesDropped"].as_u64(), Some(0));
    assert_eq!(ranked["diagnostics"]["filteredOut"].as_u64(), Some(1));

    // The same marksheets stored in a workspace rank the same way.
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    for (i, (student, year, obtained)) in [("s1", "2023", 50), ("s1", "2024", 90), ("s2", "2024", 70)]
        .into_iter()
        .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("save{}", i),
            "marksheets.save",
            json!({
                "studentId": student,
                "examType": "Final",
                "year": year,
                "class": "5",
                "section": "A",
                "subjects": [{ "subjectName": "Math", "marksObtained": obtained }]
            }),
        );
    }
    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.rank",
        json!({ "examType": "Final", "year": "2024" }),
    );
    let stored_rows: Vec<(&str, f64)> = stored["groups"][0]["records"]
        .as_array()
        .expect("records")
        .iter()
        .map(|r| (r["studentId"].as_str().unwrap_or(""), r["percentage"].as_f64().unwrap_or(0.0)))
        .collect();
    assert_eq!(stored_rows, vec![("s1", 90.0), ("s2", 70.0)]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unnamed_subject_rows_show_up_in_diagnostics() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let ranked = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "results.rank",
        json!({
            "marks": [{
                "studentId": "s1",
                "class": "5",
                "section": "A",
                "examType": "Final",
                "subjects": [
                    { "subjectName": "Math", "marksObtained": 40, "totalMarks": 50 },
                    { "marksObtained": 10, "totalMarks": 50 }
                ]
            }]
        }),
    );
    assert_eq!(ranked["diagnostics"]["skippedSubjectRows"].as_u64(), Some(1));
    assert_eq!(
        ranked["groups"][0]["records"][0]["percentage"].as_f64(),
        Some(80.0)
    );

    drop(stdin);
    let _ = child.wait();
}

