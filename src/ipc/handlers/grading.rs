use crate::calc::grading::{parse_thresholds, GRADE_ORDER};
use crate::calc::GradeScale;
use crate::db::{self, GRADE_THRESHOLDS_KEY};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, grade_scale};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn scale_json(scale: &GradeScale, is_default: bool) -> serde_json::Value {
    json!({
        "thresholds": scale.bands(),
        "isDefault": is_default,
        "distributionGrades": GRADE_ORDER,
    })
}

fn handle_thresholds_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let scale = match grade_scale(conn, req) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let is_default = scale == GradeScale::default();
    ok(&req.id, scale_json(&scale, is_default))
}

fn handle_thresholds_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(raw) = req.params.get("thresholds") else {
        return err(&req.id, "bad_params", "missing thresholds", None);
    };
    let thresholds = match parse_thresholds(raw) {
        Ok(t) => t,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let stored = match serde_json::to_value(&thresholds) {
        Ok(v) => v,
        Err(e) => return db_err(req, "db_update_failed", e),
    };
    if let Err(e) = db::settings_set_json(conn, GRADE_THRESHOLDS_KEY, &stored) {
        return db_err(req, "db_update_failed", e);
    }
    tracing::info!(bands = thresholds.len(), "grade thresholds updated");
    let scale = GradeScale::new(thresholds);
    let is_default = scale == GradeScale::default();
    ok(&req.id, scale_json(&scale, is_default))
}

fn handle_thresholds_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = db::settings_delete(conn, GRADE_THRESHOLDS_KEY) {
        return db_err(req, "db_update_failed", e);
    }
    tracing::info!("grade thresholds reset to defaults");
    ok(&req.id, scale_json(&GradeScale::default(), true))
}

fn handle_grade_for(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(percentage) = req.params.get("percentage").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "percentage must be a number", None);
    };
    // Without a workspace the default table applies.
    let scale = match state.db.as_ref() {
        Some(conn) => match grade_scale(conn, req) {
            Ok(s) => s,
            Err(e) => return e,
        },
        None => GradeScale::default(),
    };
    // Graded as given; callers round for display, not for banding.
    let band = scale.band_for(percentage);
    ok(
        &req.id,
        json!({
            "percentage": percentage,
            "grade": scale.grade_for(percentage),
            "description": band.map(|b| b.description.clone()),
            "minPercentage": band.map(|b| b.min_percentage),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.thresholds.get" => Some(handle_thresholds_get(state, req)),
        "grading.thresholds.set" => Some(handle_thresholds_set(state, req)),
        "grading.thresholds.reset" => Some(handle_thresholds_reset(state, req)),
        "grading.gradeFor" => Some(handle_grade_for(state, req)),
        _ => None,
    }
}
