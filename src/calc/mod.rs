//! Exam results core: grading, aggregation, extraction, ranking and summary
//! statistics over plain marksheet records. Nothing in here touches the
//! workspace database; callers load records and hand them in.

pub mod aggregate;
pub mod extract;
pub mod grading;
pub mod rank;
pub mod stats;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

pub use grading::GradeScale;

/// Total marks assumed for a subject that does not say otherwise.
pub const DEFAULT_SUBJECT_TOTAL: f64 = 100.0;

/// Round half away from zero to 2 decimals.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// `obtained / total * 100`, or 0 when there is nothing to divide by.
pub fn percent_of(obtained: f64, total: f64) -> f64 {
    if total > 0.0 {
        obtained / total * 100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectScore {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub subject_name: String,
    pub marks_obtained: f64,
    pub total_marks: f64,
    pub grade: String,
}

impl SubjectScore {
    #[cfg(test)]
    pub fn new(subject_name: impl Into<String>, marks_obtained: f64, total_marks: f64) -> Self {
        Self {
            subject_id: None,
            subject_name: subject_name.into(),
            marks_obtained,
            total_marks,
            grade: String::new(),
        }
    }

    /// Lenient read of one subject row. Returns `None` when the value is not
    /// an object or carries no subject name.
    pub fn from_value(v: &Value) -> Option<Self> {
        let obj = v.as_object()?;
        let subject_name = lenient_string(obj.get("subjectName"))
            .or_else(|| lenient_string(obj.get("name")))?;
        let marks_obtained = lenient_f64(obj.get("marksObtained")).unwrap_or(0.0);
        let total_marks = match obj.get("totalMarks") {
            None | Some(Value::Null) => DEFAULT_SUBJECT_TOTAL,
            Some(v) => lenient_f64(Some(v)).unwrap_or(0.0),
        };
        Some(Self {
            subject_id: lenient_string(obj.get("subjectId")),
            subject_name,
            marks_obtained,
            total_marks,
            grade: lenient_string(obj.get("grade")).unwrap_or_default(),
        })
    }

    pub fn percentage(&self) -> f64 {
        percent_of(self.marks_obtained, self.total_marks)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarksheetRecord {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub exam_type: String,
    pub year: String,
    pub subjects: Vec<SubjectScore>,
    pub total_obtained: f64,
    pub total_marks: f64,
    pub percentage: f64,
    pub overall_grade: String,
}

impl MarksheetRecord {
    /// Lenient read of one marksheet. A record needs to be an object with a
    /// student id; everything else falls back to empty/zero. Subject rows
    /// that cannot be read are left out; `extract` reports how many in
    /// `skipped_subject_rows`.
    pub fn from_value(v: &Value) -> Option<Self> {
        let obj = v.as_object()?;
        let student_id = lenient_string(obj.get("studentId"))?;
        let subjects = obj
            .get("subjects")
            .and_then(|v| v.as_array())
            .map(|rows| rows.iter().filter_map(SubjectScore::from_value).collect())
            .unwrap_or_default();
        Some(Self {
            id: lenient_string(obj.get("id")).unwrap_or_default(),
            student_id,
            student_name: lenient_string(obj.get("studentName")).unwrap_or_default(),
            class: lenient_string(obj.get("class")),
            section: lenient_string(obj.get("section")),
            exam_type: lenient_string(obj.get("examType")).unwrap_or_default(),
            year: lenient_string(obj.get("year")).unwrap_or_default(),
            subjects,
            total_obtained: lenient_f64(obj.get("totalObtained")).unwrap_or(0.0),
            total_marks: lenient_f64(obj.get("totalMarks")).unwrap_or(0.0),
            percentage: lenient_f64(obj.get("percentage")).unwrap_or(0.0),
            overall_grade: lenient_string(obj.get("overallGrade")).unwrap_or_default(),
        })
    }
}

/// Numbers and numeric strings; `None` for anything else.
pub(crate) fn lenient_f64(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|x| x.is_finite()),
        _ => None,
    }
}

/// Trimmed non-empty strings, and numbers rendered as text (ids often arrive
/// as integers).
pub(crate) fn lenient_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Small insertion-ordered string map that serializes as a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V>(Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with(&mut self, key: &str, f: impl FnOnce() -> V) -> &mut V {
        let idx = match self.0.iter().position(|(k, _)| k == key) {
            Some(i) => i,
            None => {
                self.0.push((key.to_string(), f()));
                self.0.len() - 1
            }
        };
        &mut self.0[idx].1
    }

    pub fn map_values<W>(self, mut f: impl FnMut(V) -> W) -> OrderedMap<W> {
        OrderedMap(self.0.into_iter().map(|(k, v)| (k, f(v))).collect())
    }
}

#[cfg(test)]
impl<V> OrderedMap<V> {
    pub fn get(&self, key: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round2_and_guarded_percent() {
        assert_eq!(round2(83.000000001), 83.0);
        assert_eq!(round2(66.666666), 66.67);
        assert_eq!(percent_of(5.0, 0.0), 0.0);
        assert_eq!(round2(percent_of(83.0, 100.0)), 83.0);
    }

    #[test]
    fn subject_total_defaults_to_100_only_when_absent() {
        let absent = SubjectScore::from_value(&json!({ "subjectName": "Math", "marksObtained": 40 }))
            .expect("subject");
        assert_eq!(absent.total_marks, 100.0);

        let junk = SubjectScore::from_value(
            &json!({ "name": "Art", "marksObtained": "x", "totalMarks": "n/a" }),
        )
        .expect("subject");
        assert_eq!(junk.subject_name, "Art");
        assert_eq!(junk.marks_obtained, 0.0);
        assert_eq!(junk.total_marks, 0.0);
    }

    #[test]
    fn record_reads_numeric_strings_and_integer_ids() {
        let r = MarksheetRecord::from_value(&json!({
            "studentId": 7,
            "examType": "Final",
            "class": "5",
            "section": "",
            "percentage": "91.5"
        }))
        .expect("record");
        assert_eq!(r.student_id, "7");
        assert_eq!(r.class.as_deref(), Some("5"));
        assert_eq!(r.section, None);
        assert_eq!(r.percentage, 91.5);
    }

    #[test]
    fn record_without_student_is_rejected() {
        assert!(MarksheetRecord::from_value(&json!({ "examType": "Final" })).is_none());
        assert!(MarksheetRecord::from_value(&json!("Final")).is_none());
    }

    #[test]
    fn ordered_map_serializes_in_insertion_order() {
        let mut m: OrderedMap<i32> = OrderedMap::new();
        *m.get_or_insert_with("z", || 0) += 1;
        *m.get_or_insert_with("a", || 0) += 2;
        *m.get_or_insert_with("z", || 0) += 1;
        let text = serde_json::to_string(&m).expect("serialize");
        assert_eq!(text, r#"{"z":2,"a":2}"#);
    }
}
