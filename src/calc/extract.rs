use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use super::MarksheetRecord;

/// The shapes a marks payload arrives in, decided once when the payload is
/// read rather than on every extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMarks {
    /// `[record, record, ...]`
    FlatList(Vec<Value>),
    /// `{ "marks": [record, ...], ... }`; sibling keys are ignored.
    KeyedWithMarksField(Vec<Value>),
    /// Any other object. Each value may be a list of records, a container
    /// with its own `marks` list, or a single record.
    GenericKeyed(Vec<(String, Value)>),
}

impl From<Value> for RawMarks {
    fn from(v: Value) -> Self {
        match v {
            Value::Array(items) => RawMarks::FlatList(items),
            Value::Object(mut map) => {
                if matches!(map.get("marks"), Some(Value::Array(_))) {
                    if let Some(Value::Array(items)) = map.remove("marks") {
                        return RawMarks::KeyedWithMarksField(items);
                    }
                }
                RawMarks::GenericKeyed(map.into_iter().collect())
            }
            // Null or a bare scalar: nothing to extract.
            _ => RawMarks::FlatList(Vec::new()),
        }
    }
}

impl<'de> Deserialize<'de> for RawMarks {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(RawMarks::from)
    }
}

impl RawMarks {
    /// Present already-typed records (e.g. rows loaded from the workspace) as
    /// a flat list.
    pub fn from_records(records: &[MarksheetRecord]) -> Self {
        RawMarks::FlatList(
            records
                .iter()
                .filter_map(|r| serde_json::to_value(r).ok())
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractOutcome {
    pub records: Vec<MarksheetRecord>,
    pub skipped_malformed: usize,
    pub duplicates_dropped: usize,
    pub filtered_out: usize,
    /// Subject rows left out of otherwise readable records.
    pub skipped_subject_rows: usize,
}

/// Exact-match scoping applied to each record before de-duplication, so a
/// student's marksheet for another exam or year never shadows the one asked
/// for.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExtractFilter<'a> {
    pub exam_type: Option<&'a str>,
    pub year: Option<&'a str>,
    pub class: Option<&'a str>,
    pub section: Option<&'a str>,
}

impl<'a> ExtractFilter<'a> {
    pub fn exam_type(exam_type: &'a str) -> Self {
        Self {
            exam_type: Some(exam_type),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &MarksheetRecord) -> bool {
        let exact = |want: Option<&str>, have: Option<&str>| want.is_none() || want == have;
        exact(self.exam_type, Some(record.exam_type.as_str()))
            && exact(self.year, Some(record.year.as_str()))
            && exact(self.class, record.class.as_deref())
            && exact(self.section, record.section.as_deref())
    }
}

fn candidates<'a>(raw: &'a RawMarks, skipped: &mut usize) -> Vec<&'a Value> {
    match raw {
        RawMarks::FlatList(items) | RawMarks::KeyedWithMarksField(items) => items.iter().collect(),
        RawMarks::GenericKeyed(entries) => {
            let mut out = Vec::new();
            for (key, value) in entries {
                match value {
                    Value::Array(items) => out.extend(items.iter()),
                    Value::Object(obj) => {
                        if let Some(Value::Array(items)) = obj.get("marks") {
                            out.extend(items.iter());
                        } else if obj.contains_key("examType") {
                            out.push(value);
                        } else {
                            tracing::debug!(key = %key, "marks entry has no recognizable shape");
                            *skipped += 1;
                        }
                    }
                    _ => {
                        tracing::debug!(key = %key, "ignoring scalar marks entry");
                        *skipped += 1;
                    }
                }
            }
            out
        }
    }
}

/// Flatten a marks payload into marksheet records.
///
/// Unreadable entries are dropped and counted, as are unnamed subject rows
/// inside readable records. Records outside `filter` are counted and left
/// out. Afterwards the first record seen for each student wins; later ones
/// are counted as duplicates. Output keeps first-encountered order.
pub fn extract(raw: &RawMarks, filter: &ExtractFilter) -> ExtractOutcome {
    let mut outcome = ExtractOutcome::default();
    let mut seen_students: HashSet<String> = HashSet::new();

    for value in candidates(raw, &mut outcome.skipped_malformed) {
        let Some(record) = MarksheetRecord::from_value(value) else {
            outcome.skipped_malformed += 1;
            continue;
        };
        let subject_rows = value
            .get("subjects")
            .and_then(|v| v.as_array())
            .map(|rows| rows.len())
            .unwrap_or(0);
        if subject_rows > record.subjects.len() {
            tracing::debug!(
                student_id = %record.student_id,
                dropped = subject_rows - record.subjects.len(),
                "unreadable subject rows dropped"
            );
            outcome.skipped_subject_rows += subject_rows - record.subjects.len();
        }
        if !filter.matches(&record) {
            outcome.filtered_out += 1;
            continue;
        }
        if !seen_students.insert(record.student_id.clone()) {
            tracing::debug!(
                student_id = %record.student_id,
                marksheet_id = %record.id,
                "dropping duplicate marksheet for student"
            );
            outcome.duplicates_dropped += 1;
            continue;
        }
        outcome.records.push(record);
    }

    outcome
}
