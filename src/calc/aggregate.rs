use serde::Serialize;

use super::grading::GradeScale;
use super::{percent_of, round2, MarksheetRecord, SubjectScore};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarksheetTotals {
    pub total_obtained: f64,
    pub total_marks: f64,
    pub percentage: f64,
    pub overall_grade: String,
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

/// Sum a marksheet's subjects and grade the result. Input is summed as
/// given; obtained-vs-total checks belong to [`validate_subjects`].
pub fn aggregate(subjects: &[SubjectScore], scale: &GradeScale) -> MarksheetTotals {
    let total_obtained: f64 = subjects
        .iter()
        .map(|s| finite_or_zero(s.marks_obtained))
        .sum();
    let total_marks: f64 = subjects
        .iter()
        .map(|s| finite_or_zero(s.total_marks))
        .sum();
    let percentage = round2(percent_of(total_obtained, total_marks));
    MarksheetTotals {
        total_obtained,
        total_marks,
        percentage,
        overall_grade: scale.grade_for(percentage).to_string(),
    }
}

/// Fill in each subject's letter grade from its own percentage.
pub fn grade_subjects(subjects: &mut [SubjectScore], scale: &GradeScale) {
    for s in subjects {
        s.grade = scale.grade_for(round2(s.percentage())).to_string();
    }
}

/// Recompute a record's derived figures. Records carrying subject rows are
/// re-aggregated from them; records without subjects keep their stored
/// totals and percentage and only get their grade re-derived.
pub fn refresh(record: &MarksheetRecord, scale: &GradeScale) -> MarksheetRecord {
    let mut out = record.clone();
    if out.subjects.is_empty() {
        out.overall_grade = scale.grade_for(out.percentage).to_string();
        return out;
    }
    grade_subjects(&mut out.subjects, scale);
    let totals = aggregate(&out.subjects, scale);
    out.total_obtained = totals.total_obtained;
    out.total_marks = totals.total_marks;
    out.percentage = totals.percentage;
    out.overall_grade = totals.overall_grade;
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub index: usize,
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(index: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            index,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Entry-form checks run before a marksheet is saved.
pub fn validate_subjects(subjects: &[SubjectScore]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if subjects.is_empty() {
        issues.push(ValidationIssue::new(0, "subjects", "at least one subject is required"));
        return issues;
    }
    for (i, s) in subjects.iter().enumerate() {
        if s.subject_name.trim().is_empty() {
            issues.push(ValidationIssue::new(i, "subjectName", "must not be empty"));
        }
        if !s.total_marks.is_finite() || s.total_marks <= 0.0 {
            issues.push(ValidationIssue::new(i, "totalMarks", "must be greater than 0"));
        }
        if !s.marks_obtained.is_finite() || s.marks_obtained < 0.0 {
            issues.push(ValidationIssue::new(i, "marksObtained", "must not be negative"));
        } else if s.marks_obtained > s.total_marks {
            issues.push(ValidationIssue::new(
                i,
                "marksObtained",
                format!(
                    "{} exceeds total marks {} for {}",
                    s.marks_obtained, s.total_marks, s.subject_name
                ),
            ));
        }
    }
    issues
}
