use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Grade handed out when no band matches (empty or malformed table).
pub const FALLBACK_GRADE: &str = "F";

/// Grade keys that always appear in a grade distribution, best first.
pub const GRADE_ORDER: [&str; 7] = ["A+", "A", "B+", "B", "C", "D", "F"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeThreshold {
    pub min_percentage: f64,
    pub grade: String,
    #[serde(default)]
    pub description: String,
}

impl GradeThreshold {
    pub fn new(min_percentage: f64, grade: &str, description: &str) -> Self {
        Self {
            min_percentage,
            grade: grade.to_string(),
            description: description.to_string(),
        }
    }
}

pub fn default_thresholds() -> Vec<GradeThreshold> {
    vec![
        GradeThreshold::new(90.0, "A+", "Outstanding"),
        GradeThreshold::new(80.0, "A", "Excellent"),
        GradeThreshold::new(70.0, "B+", "Very Good"),
        GradeThreshold::new(60.0, "B", "Good"),
        GradeThreshold::new(50.0, "C", "Satisfactory"),
        GradeThreshold::new(40.0, "D", "Pass"),
        GradeThreshold::new(0.0, "F", "Fail"),
    ]
}

fn by_min_descending(a: &GradeThreshold, b: &GradeThreshold) -> Ordering {
    b.min_percentage
        .partial_cmp(&a.min_percentage)
        .unwrap_or(Ordering::Equal)
}

/// Highest band whose `min_percentage` is at or below `percentage`.
///
/// The table is re-sorted (stable, descending) on every call, so caller order
/// does not matter; among equal minimums the one listed first wins.
pub fn band_for(percentage: f64, thresholds: &[GradeThreshold]) -> Option<&GradeThreshold> {
    let mut sorted: Vec<&GradeThreshold> = thresholds.iter().collect();
    sorted.sort_by(|a, b| by_min_descending(a, b));
    sorted
        .into_iter()
        .find(|t| percentage >= t.min_percentage)
}

pub fn grade_for(percentage: f64, thresholds: &[GradeThreshold]) -> &str {
    band_for(percentage, thresholds)
        .map(|t| t.grade.as_str())
        .unwrap_or(FALLBACK_GRADE)
}

/// The active threshold table. Built once per request from workspace
/// settings and passed by reference to every component that grades.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeScale {
    bands: Vec<GradeThreshold>,
}

impl GradeScale {
    pub fn new(mut thresholds: Vec<GradeThreshold>) -> Self {
        thresholds.sort_by(by_min_descending);
        Self { bands: thresholds }
    }

    pub fn bands(&self) -> &[GradeThreshold] {
        &self.bands
    }

    pub fn band_for(&self, percentage: f64) -> Option<&GradeThreshold> {
        band_for(percentage, &self.bands)
    }

    pub fn grade_for(&self, percentage: f64) -> &str {
        grade_for(percentage, &self.bands)
    }

    pub fn description_for(&self, grade: &str) -> Option<&str> {
        self.bands
            .iter()
            .find(|t| t.grade == grade)
            .map(|t| t.description.as_str())
    }
}

impl Default for GradeScale {
    fn default() -> Self {
        Self::new(default_thresholds())
    }
}

/// Validate a threshold table supplied by a client. The result is sorted
/// best band first.
pub fn parse_thresholds(raw: &Value) -> Result<Vec<GradeThreshold>, String> {
    let Some(rows) = raw.as_array() else {
        return Err("thresholds must be an array".into());
    };
    if rows.is_empty() {
        return Err("thresholds must contain at least one band".into());
    }

    let mut out: Vec<GradeThreshold> = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let Some(obj) = row.as_object() else {
            return Err(format!("thresholds[{}] must be an object", i));
        };
        let Some(min) = obj.get("minPercentage").and_then(|v| v.as_f64()) else {
            return Err(format!("thresholds[{}].minPercentage must be a number", i));
        };
        if !(0.0..=100.0).contains(&min) {
            return Err(format!(
                "thresholds[{}].minPercentage must be between 0 and 100",
                i
            ));
        }
        let grade = obj
            .get("grade")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if grade.is_empty() || grade.chars().count() > 8 {
            return Err(format!("thresholds[{}].grade must be 1-8 characters", i));
        }
        let description = match obj.get("description") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.trim().to_string(),
            Some(_) => {
                return Err(format!("thresholds[{}].description must be a string", i));
            }
        };
        if out.iter().any(|t| t.min_percentage == min) {
            return Err(format!("duplicate minPercentage {}", min));
        }
        if out.iter().any(|t| t.grade == grade) {
            return Err(format!("duplicate grade {}", grade));
        }
        out.push(GradeThreshold {
            min_percentage: min,
            grade,
            description,
        });
    }

    if !out.iter().any(|t| t.min_percentage == 0.0) {
        return Err("thresholds must include a band starting at 0".into());
    }

    out.sort_by(by_min_descending);
    Ok(out)
}
