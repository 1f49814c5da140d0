use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use super::MarksheetRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedMarksheetRecord {
    #[serde(flatten)]
    pub record: MarksheetRecord,
    pub position: usize,
    pub total_students: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSectionGroup {
    pub class: String,
    pub section: String,
    pub total_students: usize,
    pub records: Vec<RankedMarksheetRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankOutcome {
    pub groups: Vec<ClassSectionGroup>,
    pub missing_grouping_key: usize,
}

impl RankOutcome {
    pub fn group(&self, class: &str, section: &str) -> Option<&ClassSectionGroup> {
        self.groups
            .iter()
            .find(|g| g.class == class && g.section == section)
    }

    pub fn find_marksheet(&self, marksheet_id: &str) -> Option<&RankedMarksheetRecord> {
        self.groups
            .iter()
            .flat_map(|g| g.records.iter())
            .find(|r| r.record.id == marksheet_id)
    }
}

/// Group records by exact `(class, section)` and rank each group by
/// percentage, best first.
///
/// Equal percentages keep their input order and still get distinct
/// positions: positions are always `1..=N` for a group of `N`. Records
/// lacking class or section are left out and counted. Groups come back in
/// the order their first member was seen.
pub fn rank(records: &[MarksheetRecord]) -> RankOutcome {
    let mut buckets: Vec<(String, String, Vec<&MarksheetRecord>)> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut missing_grouping_key = 0;

    for r in records {
        let (Some(class), Some(section)) = (r.class.as_deref(), r.section.as_deref()) else {
            tracing::debug!(
                marksheet_id = %r.id,
                student_id = %r.student_id,
                "marksheet has no class/section; left out of ranking"
            );
            missing_grouping_key += 1;
            continue;
        };
        let key = (class.to_string(), section.to_string());
        let slot = *index.entry(key).or_insert_with(|| {
            buckets.push((class.to_string(), section.to_string(), Vec::new()));
            buckets.len() - 1
        });
        buckets[slot].2.push(r);
    }

    let groups = buckets
        .into_iter()
        .map(|(class, section, mut members)| {
            // sort_by is stable: ties stay in input order.
            members.sort_by(|a, b| {
                b.percentage
                    .partial_cmp(&a.percentage)
                    .unwrap_or(Ordering::Equal)
            });
            let total_students = members.len();
            let records = members
                .into_iter()
                .enumerate()
                .map(|(i, r)| RankedMarksheetRecord {
                    record: r.clone(),
                    position: i + 1,
                    total_students,
                })
                .collect();
            ClassSectionGroup {
                class,
                section,
                total_students,
                records,
            }
        })
        .collect();

    RankOutcome {
        groups,
        missing_grouping_key,
    }
}
