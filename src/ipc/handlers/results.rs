use crate::calc::aggregate::refresh;
use crate::calc::extract::{extract, ExtractFilter, ExtractOutcome, RawMarks};
use crate::calc::rank::rank;
use crate::calc::stats::summarize;
use crate::calc::{GradeScale, MarksheetRecord};
use crate::db::{self, MarksheetFilter};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_err, grade_scale, optional_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

/// Records after extraction and refresh, plus what extraction dropped.
pub struct Selection {
    pub source: &'static str,
    pub scale: GradeScale,
    pub records: Vec<MarksheetRecord>,
    pub extraction: ExtractOutcome,
}

impl Selection {
    pub fn diagnostics(&self) -> serde_json::Value {
        json!({
            "skippedMalformed": self.extraction.skipped_malformed,
            "duplicatesDropped": self.extraction.duplicates_dropped,
            "filteredOut": self.extraction.filtered_out,
            "skippedSubjectRows": self.extraction.skipped_subject_rows,
        })
    }
}

/// Which marksheets a results request covers. Every field is an exact match.
#[derive(Debug, Clone, Default)]
pub struct ResultScope {
    pub exam_type: Option<String>,
    pub year: Option<String>,
    pub class: Option<String>,
    pub section: Option<String>,
}

impl ResultScope {
    pub fn from_params(req: &Request) -> Self {
        Self {
            exam_type: optional_str(req, "examType"),
            year: optional_str(req, "year"),
            class: optional_str(req, "class"),
            section: optional_str(req, "section"),
        }
    }

    fn filter(&self) -> ExtractFilter<'_> {
        ExtractFilter {
            exam_type: self.exam_type.as_deref(),
            year: self.year.as_deref(),
            class: self.class.as_deref(),
            section: self.section.as_deref(),
        }
    }
}

/// Run the extract + refresh stages for a results request.
///
/// With a `marks` param the payload in the request is used and no workspace
/// is needed; otherwise stored marksheets are loaded (narrowed in SQL) and fed
/// through the same extractor. Either way the scope is applied to each record
/// before students are de-duplicated.
pub fn select_records(
    state: &AppState,
    req: &Request,
    scope: &ResultScope,
) -> Result<Selection, serde_json::Value> {
    let scale = match state.db.as_ref() {
        Some(conn) => grade_scale(conn, req)?,
        None => GradeScale::default(),
    };

    let (raw, source) = match req.params.get("marks") {
        Some(v) if !v.is_null() => (RawMarks::from(v.clone()), "request"),
        _ => {
            let Some(conn) = state.db.as_ref() else {
                return Err(err(
                    &req.id,
                    "no_workspace",
                    "select a workspace first or pass marks",
                    None,
                ));
            };
            let filter = MarksheetFilter {
                exam_type: scope.exam_type.clone(),
                year: scope.year.clone(),
                class: scope.class.clone(),
                section: scope.section.clone(),
                ..Default::default()
            };
            let stored = db::load_marksheets(conn, &filter)
                .map_err(|e| db_err(req, "db_query_failed", e))?;
            (RawMarks::from_records(&stored), "workspace")
        }
    };

    let extraction = extract(&raw, &scope.filter());
    let records: Vec<MarksheetRecord> = extraction
        .records
        .iter()
        .map(|r| refresh(r, &scale))
        .collect();

    tracing::debug!(
        source,
        selected = records.len(),
        skipped = extraction.skipped_malformed,
        filtered = extraction.filtered_out,
        duplicates = extraction.duplicates_dropped,
        "results selection"
    );

    Ok(Selection {
        source,
        scale,
        records,
        extraction,
    })
}

fn handle_results_extract(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(marks) = req.params.get("marks") else {
        return err(&req.id, "bad_params", "missing marks", None);
    };
    let raw = RawMarks::from(marks.clone());
    let scope = ResultScope::from_params(req);
    let outcome = extract(&raw, &scope.filter());
    ok(&req.id, json!(outcome))
}

fn handle_results_rank(state: &mut AppState, req: &Request) -> serde_json::Value {
    let selection = match select_records(state, req, &ResultScope::from_params(req)) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let ranked = rank(&selection.records);
    let mut diagnostics = selection.diagnostics();
    diagnostics["missingGroupingKey"] = json!(ranked.missing_grouping_key);
    ok(
        &req.id,
        json!({
            "source": selection.source,
            "groups": ranked.groups,
            "diagnostics": diagnostics,
        }),
    )
}

fn handle_results_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let selection = match select_records(state, req, &ResultScope::from_params(req)) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let summary = summarize(&selection.records, &selection.scale);
    ok(
        &req.id,
        json!({
            "source": selection.source,
            "summary": summary,
            "diagnostics": selection.diagnostics(),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.extract" => Some(handle_results_extract(state, req)),
        "results.rank" => Some(handle_results_rank(state, req)),
        "results.summary" => Some(handle_results_summary(state, req)),
        _ => None,
    }
}
