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

fn custom_table() -> serde_json::Value {
    json!([
        { "minPercentage": 0, "grade": "F", "description": "Fail" },
        { "minPercentage": 75, "grade": "H", "description": "Honours" },
        { "minPercentage": 50, "grade": "P", "description": "Pass" }
    ])
}

#[test]
fn grade_for_uses_default_table_without_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    for (i, (pct, grade)) in [(90.0, "A+"), (89.99, "A"), (40.0, "D"), (39.99, "F"), (-5.0, "F")]
        .into_iter()
        .enumerate()
    {
        let out = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grading.gradeFor",
            json!({ "percentage": pct }),
        );
        assert_eq!(out["grade"].as_str(), Some(grade), "grade for {}", pct);
    }

    let bad = request(
        &mut stdin,
        &mut reader,
        "x",
        "grading.gradeFor",
        json!({ "percentage": "high" }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn custom_thresholds_apply_to_saves_and_ranking() {
    let workspace = temp_dir("marksheetd-thresholds");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "2", "grading.thresholds.get", json!({}));
    assert_eq!(defaults["isDefault"].as_bool(), Some(true));
    assert_eq!(defaults["thresholds"].as_array().map(|t| t.len()), Some(7));
    assert_eq!(defaults["thresholds"][0]["grade"].as_str(), Some("A+"));

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "marksheets.save",
        json!({
            "studentId": "s1",
            "examType": "Final",
            "class": "5",
            "section": "A",
            "subjects": [{ "subjectName": "Math", "marksObtained": 80 }]
        }),
    );
    assert_eq!(saved["marksheet"]["overallGrade"].as_str(), Some("A"));

    let set = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grading.thresholds.set",
        json!({ "thresholds": custom_table() }),
    );
    assert_eq!(set["isDefault"].as_bool(), Some(false));
    let order: Vec<&str> = set["thresholds"]
        .as_array()
        .expect("thresholds")
        .iter()
        .filter_map(|t| t["grade"].as_str())
        .collect();
    assert_eq!(order, vec!["H", "P", "F"]);

    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grading.gradeFor",
        json!({ "percentage": 75 }),
    );
    assert_eq!(graded["grade"].as_str(), Some("H"));
    assert_eq!(graded["description"].as_str(), Some("Honours"));

    // Stored marksheets are re-graded on read paths that rank.
    let ranked = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "results.rank",
        json!({ "examType": "Final" }),
    );
    assert_eq!(
        ranked["groups"][0]["records"][0]["overallGrade"].as_str(),
        Some("H")
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "results.summary",
        json!({ "examType": "Final" }),
    );
    assert_eq!(summary["summary"]["gradeDistribution"]["H"].as_u64(), Some(1));
    assert_eq!(summary["summary"]["gradeDistribution"]["A"].as_u64(), Some(0));

    request_ok(&mut stdin, &mut reader, "8", "grading.thresholds.reset", json!({}));
    let after = request_ok(&mut stdin, &mut reader, "9", "grading.thresholds.get", json!({}));
    assert_eq!(after["isDefault"].as_bool(), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn invalid_threshold_tables_are_rejected_and_not_stored() {
    let workspace = temp_dir("marksheetd-thresholds-invalid");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let cases = [
        json!([]),
        json!([{ "minPercentage": 50, "grade": "P" }]),
        json!([
            { "minPercentage": 0, "grade": "F" },
            { "minPercentage": 50, "grade": "P" },
            { "minPercentage": 50, "grade": "Q" }
        ]),
        json!([
            { "minPercentage": 0, "grade": "F" },
            { "minPercentage": 120, "grade": "X" }
        ]),
        json!({ "minPercentage": 0, "grade": "F" }),
    ];
    for (i, table) in cases.into_iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad{}", i),
            "grading.thresholds.set",
            json!({ "thresholds": table }),
        );
        assert_eq!(error_code(&resp), "bad_params", "case {}", i);
    }

    let after = request_ok(&mut stdin, &mut reader, "2", "grading.thresholds.get", json!({}));
    assert_eq!(after["isDefault"].as_bool(), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn grade_for_compares_the_unrounded_percentage() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grading.gradeFor",
        json!({ "percentage": 89.996 }),
    );
    assert_eq!(out["grade"].as_str(), Some("A"));
    assert_eq!(out["percentage"].as_f64(), Some(89.996));
    assert_eq!(out["minPercentage"].as_f64(), Some(80.0));

    let at = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grading.gradeFor",
        json!({ "percentage": 90 }),
    );
    assert_eq!(at["grade"].as_str(), Some("A+"));

    drop(stdin);
    let _ = child.wait();
}

