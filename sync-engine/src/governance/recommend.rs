use std::collections::HashSet;

use serde::Serialize;

use super::issues::{IssueSeverity, QualityIssue, QualityStatistics};
use super::quality::{QualityDimension, QualityRuleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationType {
    Cleansing,
    Validation,
    Transformation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: RecommendationType,
    pub priority: Priority,
    pub description: String,
    pub action: String,
    /// Expected score gain, in points.
    pub impact: f64,
}

impl Recommendation {
    fn new(
        kind: RecommendationType,
        priority: Priority,
        description: impl Into<String>,
        action: impl Into<String>,
        impact: f64,
    ) -> Self {
        Self {
            kind,
            priority,
            description: description.into(),
            action: action.into(),
            impact,
        }
    }
}

struct DimensionAdvice {
    below: f64,
    kind: RecommendationType,
    priority: Priority,
    cap: f64,
    action: &'static str,
}

fn advice(dimension: QualityDimension) -> DimensionAdvice {
    use RecommendationType::{Cleansing, Transformation, Validation};

    let (below, kind, priority, cap, action) = match dimension {
        QualityDimension::Completeness => (
            80.0,
            Cleansing,
            Priority::High,
            20.0,
            "fill missing values with defaults or fix the source extraction",
        ),
        QualityDimension::Accuracy => (
            90.0,
            Validation,
            Priority::High,
            15.0,
            "add format validation and normalisation rules",
        ),
        QualityDimension::Consistency => (
            85.0,
            Transformation,
            Priority::Medium,
            18.0,
            "standardise value formats with transformation rules",
        ),
        QualityDimension::Validity => (
            95.0,
            Validation,
            Priority::High,
            12.0,
            "tighten field validation rules",
        ),
        QualityDimension::Uniqueness => (
            98.0,
            Cleansing,
            Priority::Medium,
            10.0,
            "enable deduplication on the key fields",
        ),
        QualityDimension::Timeliness => (
            90.0,
            Cleansing,
            Priority::Low,
            8.0,
            "increase the sync frequency or drop stale records",
        ),
    };

    DimensionAdvice {
        below,
        kind,
        priority,
        cap,
        action,
    }
}

/// Turns weak rule scores and dataset statistics into prioritised action items.
pub fn recommend(
    rule_results: &[QualityRuleResult],
    issues: &[QualityIssue],
    statistics: &QualityStatistics,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    for result in rule_results {
        let advice = advice(result.dimension);
        if result.score < advice.below {
            out.push(Recommendation::new(
                advice.kind,
                advice.priority,
                format!(
                    "{} score of rule {} is {:.1}",
                    result.dimension.as_str(),
                    result.rule_id,
                    result.score
                ),
                advice.action,
                (100.0 - result.score).min(advice.cap),
            ));
        }
    }

    let null_rate = statistics.null_rate();
    if null_rate > 20.0 {
        out.push(Recommendation::new(
            RecommendationType::Cleansing,
            Priority::High,
            format!("null rate is {:.1}%", null_rate),
            "set default values for frequently empty fields",
            (null_rate / 2.0).min(15.0),
        ));
    }

    let duplicate_rate = statistics.duplicate_rate();
    if duplicate_rate > 5.0 {
        out.push(Recommendation::new(
            RecommendationType::Cleansing,
            Priority::Medium,
            format!("duplicate rate is {:.1}%", duplicate_rate),
            "enable deduplication",
            (duplicate_rate / 3.0).min(10.0),
        ));
    }

    let invalid_rate = statistics.invalid_rate();
    if invalid_rate > 10.0 {
        out.push(Recommendation::new(
            RecommendationType::Validation,
            Priority::High,
            format!("invalid record rate is {:.1}%", invalid_rate),
            "review the validation rules and fix the source data",
            (invalid_rate / 2.0).min(20.0),
        ));
    }

    let critical = count(issues, IssueSeverity::Critical);
    if critical > 0 {
        out.push(Recommendation::new(
            RecommendationType::Validation,
            Priority::High,
            format!("{} critical quality issue(s) found", critical),
            "resolve critical issues before syncing",
            25.0,
        ));
    }

    let major = count(issues, IssueSeverity::Major);
    if major > 10 {
        out.push(Recommendation::new(
            RecommendationType::Cleansing,
            Priority::Medium,
            format!("{} major quality issues found", major),
            "add cleansing rules for the most affected fields",
            15.0,
        ));
    }

    let mut seen = HashSet::new();
    out.retain(|r| seen.insert(r.description.clone()));
    out.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.impact.total_cmp(&a.impact))
    });
    out
}

fn count(issues: &[QualityIssue], severity: IssueSeverity) -> usize {
    issues.iter().filter(|i| i.severity == severity).count()
}
