//! Quality issues and dataset statistics.
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_common::record::{Record, Value};

use super::quality::QualityDimension;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Critical,
    Major,
    #[default]
    Minor,
    Info,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSeverity::Critical => "critical",
            IssueSeverity::Major => "major",
            IssueSeverity::Minor => "minor",
            IssueSeverity::Info => "info",
        }
    }
}

/// One offending field of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityIssue {
    pub id: String,
    pub rule_id: String,
    pub dimension: QualityDimension,
    pub severity: IssueSeverity,
    pub field: String,
    pub value: Value,
    pub record_id: String,
    pub message: String,
    pub suggestion: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityStatistics {
    pub total_records: usize,
    pub valid_records: usize,
    pub invalid_records: usize,
    pub completed_fields: usize,
    pub total_fields: usize,
    pub duplicate_count: usize,
    pub null_value_count: usize,
    pub issues_by_dimension: BTreeMap<String, usize>,
    pub issues_by_severity: BTreeMap<String, usize>,
}

impl QualityStatistics {
    /// Field slots are the union of field names over every record.
    pub fn calculate(records: &[Record], issues: &[QualityIssue]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let fields: HashSet<&String> = records.iter().flat_map(Record::keys).collect();
        let total_fields = records.len() * fields.len();
        let completed_fields = records
            .iter()
            .map(|record| {
                fields
                    .iter()
                    .filter(|field| !record.value(field).is_empty_value())
                    .count()
            })
            .sum::<usize>();

        let mut hashes: HashMap<String, usize> = HashMap::new();
        for record in records {
            *hashes.entry(record.content_hash()).or_default() += 1;
        }
        let duplicate_count = hashes.values().map(|count| count - 1).sum();

        let mut issues_by_dimension = BTreeMap::new();
        let mut issues_by_severity = BTreeMap::new();
        for issue in issues {
            *issues_by_dimension
                .entry(issue.dimension.as_str().to_owned())
                .or_default() += 1;
            *issues_by_severity
                .entry(issue.severity.as_str().to_owned())
                .or_default() += 1;
        }

        let invalid_records = issues
            .iter()
            .map(|issue| issue.record_id.as_str())
            .collect::<HashSet<_>>()
            .len()
            .min(records.len());

        Self {
            total_records: records.len(),
            valid_records: records.len() - invalid_records,
            invalid_records,
            completed_fields,
            total_fields,
            duplicate_count,
            null_value_count: total_fields - completed_fields,
            issues_by_dimension,
            issues_by_severity,
        }
    }

    /// Percentages in [0, 100]; zero for an empty dataset.
    pub fn null_rate(&self) -> f64 {
        percent(self.null_value_count, self.total_fields)
    }

    pub fn duplicate_rate(&self) -> f64 {
        percent(self.duplicate_count, self.total_records)
    }

    pub fn invalid_rate(&self) -> f64 {
        percent(self.invalid_records, self.total_records)
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    match whole {
        0 => 0.0,
        _ => part as f64 / whole as f64 * 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statistics() {
        let records: Vec<Record> = [
            json!({"a": 1, "b": null}),
            json!({"a": 1, "b": null}),
            json!({"a": 2, "c": "x"}),
        ]
        .into_iter()
        .map(|v| Record::from_json(v).unwrap())
        .collect();

        let issue = QualityIssue {
            id: "r_b_0".to_owned(),
            rule_id: "r".to_owned(),
            dimension: QualityDimension::Completeness,
            severity: IssueSeverity::Major,
            field: "b".to_owned(),
            value: Value::Null,
            record_id: "record_0".to_owned(),
            message: String::new(),
            suggestion: String::new(),
            detected_at: Utc::now(),
        };

        let stats = QualityStatistics::calculate(&records, &[issue.clone(), issue]);

        assert_eq!(stats.total_fields, 9);
        assert_eq!(stats.completed_fields, 4);
        assert_eq!(stats.null_value_count, 5);
        assert_eq!(stats.duplicate_count, 1);
        assert_eq!(stats.invalid_records, 1);
        assert_eq!(stats.issues_by_severity["major"], 2);
        assert!((stats.duplicate_rate() - 100.0 / 3.0).abs() < 1e-9);
    }
}
