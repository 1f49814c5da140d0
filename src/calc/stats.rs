use serde::Serialize;

use super::grading::{GradeScale, GRADE_ORDER};
use super::{round2, MarksheetRecord, OrderedMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectPerformance {
    pub average: f64,
    pub records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSummary {
    pub total_students: usize,
    pub average_percentage: f64,
    pub grade_distribution: OrderedMap<usize>,
    pub subject_performance: OrderedMap<SubjectPerformance>,
}

/// Summary figures over one exam's marksheets; `None` when there are none.
///
/// Grades are re-derived from each record's percentage with `scale` rather
/// than read from `overall_grade`. A subject's average only counts the
/// records that have that subject.
pub fn summarize(records: &[MarksheetRecord], scale: &GradeScale) -> Option<ExamSummary> {
    if records.is_empty() {
        return None;
    }

    let total_students = records.len();
    let pct_sum: f64 = records.iter().map(|r| r.percentage).sum();
    let average_percentage = round2(pct_sum / total_students as f64);

    let mut grade_distribution: OrderedMap<usize> = OrderedMap::new();
    for g in GRADE_ORDER {
        grade_distribution.get_or_insert_with(g, || 0);
    }
    for r in records {
        *grade_distribution.get_or_insert_with(scale.grade_for(r.percentage), || 0) += 1;
    }

    let mut subject_totals: OrderedMap<(f64, usize)> = OrderedMap::new();
    for r in records {
        for s in &r.subjects {
            let entry = subject_totals.get_or_insert_with(&s.subject_name, || (0.0, 0));
            entry.0 += s.percentage();
            entry.1 += 1;
        }
    }
    let subject_performance = subject_totals.map_values(|(sum, count)| SubjectPerformance {
        average: round2(sum / count as f64),
        records: count,
    });

    Some(ExamSummary {
        total_students,
        average_percentage,
        grade_distribution,
        subject_performance,
    })
}
