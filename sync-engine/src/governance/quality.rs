//! Quality rules and the six dimension checkers.
use std::collections::{HashMap, HashSet};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sync_common::keys::KeyExtractor;
use sync_common::record::{Record, Value};

use super::issues::{IssueSeverity, QualityIssue};
use super::validator::{self, FieldValidation, PatternCache};
use crate::error::ConfigError;

pub const DEFAULT_MAX_AGE_HOURS: f64 = 24.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityDimension {
    Completeness,
    Accuracy,
    Consistency,
    Validity,
    Uniqueness,
    Timeliness,
}

impl QualityDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityDimension::Completeness => "completeness",
            QualityDimension::Accuracy => "accuracy",
            QualityDimension::Consistency => "consistency",
            QualityDimension::Validity => "validity",
            QualityDimension::Uniqueness => "uniqueness",
            QualityDimension::Timeliness => "timeliness",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Email,
    Phone,
    IdCard,
    Date,
    Number,
    Range,
    Pattern,
    Format,
    Type,
    Domain,
}

/// Dimension-specific settings. Each checker reads the keys it understands.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QualityRuleConfig {
    #[serde(default)]
    pub check_type: Option<CheckType>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub max_age_hours: Option<f64>,
    #[serde(default)]
    pub allowed_values: Option<Vec<Value>>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub max_length: Option<usize>,
}

impl QualityRuleConfig {
    fn validation(&self) -> FieldValidation {
        FieldValidation {
            required: self.required,
            value_type: self.value_type.clone(),
            max_length: self.max_length,
            pattern: self.pattern.clone(),
        }
    }

    fn max_age_hours(&self) -> f64 {
        match self.max_age_hours {
            Some(hours) if hours > 0.0 => hours,
            _ => DEFAULT_MAX_AGE_HOURS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QualityRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub dimension: QualityDimension,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Passing score in [0, 100].
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub severity: IssueSeverity,
    #[serde(default)]
    pub target_fields: Vec<String>,
    #[serde(default)]
    pub config: QualityRuleConfig,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl QualityRule {
    pub fn compile(&self, patterns: &mut PatternCache) -> Result<(), ConfigError> {
        match &self.config.pattern {
            Some(pattern) => patterns.compile(&self.id, pattern),
            None => Ok(()),
        }
    }

    /// Weight used when averaging rule scores. Non-positive weights count as 1.
    pub fn effective_weight(&self) -> f64 {
        match self.weight > 0.0 {
            true => self.weight,
            false => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityRuleResult {
    pub rule_id: String,
    pub rule_name: String,
    pub dimension: QualityDimension,
    pub score: f64,
    pub passed: bool,
    pub checked_count: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub message: String,
}

impl QualityRuleResult {
    fn scored(rule: &QualityRule, checked: usize, passed: usize) -> Self {
        let score = ratio(passed, checked);
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            dimension: rule.dimension,
            score,
            passed: score >= rule.threshold,
            checked_count: checked,
            passed_count: passed,
            failed_count: checked.saturating_sub(passed),
            message: format!(
                "{} score {:.2}%, threshold {:.2}%",
                rule.dimension.as_str(),
                score,
                rule.threshold
            ),
        }
    }

    fn no_records(rule: &QualityRule) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            dimension: rule.dimension,
            score: 0.0,
            passed: false,
            checked_count: 0,
            passed_count: 0,
            failed_count: 0,
            message: "no records to check".to_owned(),
        }
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    match whole {
        0 => 0.0,
        _ => part as f64 / whole as f64 * 100.0,
    }
}

/// A failing (record index, field, value) with its explanation.
pub struct Finding {
    pub index: usize,
    pub field: String,
    pub value: Value,
    pub message: String,
    pub suggestion: String,
}

/// Scores records along one dimension and explains the failures.
pub trait DimensionChecker: Sync {
    /// Returns the rule result and one finding per failing field.
    fn evaluate(
        &self,
        records: &[Record],
        rule: &QualityRule,
        patterns: &PatternCache,
    ) -> (QualityRuleResult, Vec<Finding>);

    /// Score the rule; issues are only reported when it fails.
    fn check(
        &self,
        records: &[Record],
        rule: &QualityRule,
        patterns: &PatternCache,
    ) -> (QualityRuleResult, Vec<QualityIssue>) {
        if records.is_empty() {
            return (QualityRuleResult::no_records(rule), vec![]);
        }

        let (result, findings) = self.evaluate(records, rule, patterns);
        if result.passed {
            return (result, vec![]);
        }

        let detected_at = Utc::now();
        let issues = findings
            .into_iter()
            .map(|finding| QualityIssue {
                id: format!("{}_{}_{}", rule.id, finding.field, finding.index),
                rule_id: rule.id.clone(),
                dimension: rule.dimension,
                severity: rule.severity,
                record_id: format!("record_{}", finding.index),
                field: finding.field,
                value: finding.value,
                message: finding.message,
                suggestion: finding.suggestion,
                detected_at,
            })
            .collect();
        (result, issues)
    }
}

/// Target fields of a rule, or every field of the record when none are listed.
fn fields_of<'a>(record: &'a Record, rule: &'a QualityRule) -> Vec<&'a str> {
    match rule.target_fields.is_empty() {
        true => record.keys().map(String::as_str).collect(),
        false => rule.target_fields.iter().map(String::as_str).collect(),
    }
}

pub struct CompletenessChecker;

impl DimensionChecker for CompletenessChecker {
    fn evaluate(
        &self,
        records: &[Record],
        rule: &QualityRule,
        _patterns: &PatternCache,
    ) -> (QualityRuleResult, Vec<Finding>) {
        let mut checked = 0;
        let mut findings = Vec::new();

        for (index, record) in records.iter().enumerate() {
            for field in fields_of(record, rule) {
                checked += 1;
                let value = record.value(field);
                if value.is_empty_value() {
                    findings.push(Finding {
                        index,
                        field: field.to_owned(),
                        value: value.clone(),
                        message: format!("field {} is empty or missing", field),
                        suggestion: format!("provide a value for {}", field),
                    });
                }
            }
        }

        let passed = checked - findings.len();
        (QualityRuleResult::scored(rule, checked, passed), findings)
    }
}

pub struct AccuracyChecker;

impl AccuracyChecker {
    /// Unknown or missing check types accept every value.
    pub fn is_accurate(value: &Value, config: &QualityRuleConfig, patterns: &PatternCache) -> bool {
        let text = value.to_string();
        match config.check_type {
            Some(CheckType::Email) => validator::is_email(&text),
            Some(CheckType::Phone) => validator::is_mobile(&text),
            Some(CheckType::IdCard) => validator::is_id_card(&text),
            Some(CheckType::Date) => validator::is_date(&text),
            Some(CheckType::Number) => validator::is_number(&text),
            Some(CheckType::Range) => match text.trim().parse::<f64>() {
                Ok(number) => {
                    config.min.map_or(true, |min| number >= min)
                        && config.max.map_or(true, |max| number <= max)
                }
                Err(_) => false,
            },
            Some(CheckType::Pattern) => match &config.pattern {
                Some(pattern) => patterns.is_match(pattern, &text),
                None => true,
            },
            _ => true,
        }
    }

    fn suggestion(check_type: Option<CheckType>) -> &'static str {
        match check_type {
            Some(CheckType::Email) => "use a valid email address such as user@domain.com",
            Some(CheckType::Phone) => "use a valid 11 digit mobile number such as 13812345678",
            Some(CheckType::IdCard) => "use a valid 18 digit id card number",
            Some(CheckType::Date) => "use a valid date such as 2023-01-01",
            Some(CheckType::Number) => "use a valid number",
            Some(CheckType::Range) => "keep the value within the configured range",
            Some(CheckType::Pattern) => "make the value match the configured pattern",
            _ => "check the value format",
        }
    }
}

impl DimensionChecker for AccuracyChecker {
    fn evaluate(
        &self,
        records: &[Record],
        rule: &QualityRule,
        patterns: &PatternCache,
    ) -> (QualityRuleResult, Vec<Finding>) {
        let mut checked = 0;
        let mut findings = Vec::new();

        for (index, record) in records.iter().enumerate() {
            for field in &rule.target_fields {
                let value = record.value(field);
                if value.is_null() {
                    continue;
                }
                checked += 1;
                if !Self::is_accurate(value, &rule.config, patterns) {
                    findings.push(Finding {
                        index,
                        field: field.clone(),
                        value: value.clone(),
                        message: format!("field {} value {} has an invalid format", field, value),
                        suggestion: Self::suggestion(rule.config.check_type).to_owned(),
                    });
                }
            }
        }

        let passed = checked - findings.len();
        (QualityRuleResult::scored(rule, checked, passed), findings)
    }
}

pub struct ConsistencyChecker;

impl ConsistencyChecker {
    /// Share of a field's non-null values in its most common class, and the values outside it.
    fn majority(
        records: &[Record],
        field: &str,
        classify: impl Fn(&Value) -> String,
    ) -> Option<(f64, String, Vec<(usize, String)>)> {
        let mut order: Vec<String> = Vec::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut classes = Vec::new();

        for (index, record) in records.iter().enumerate() {
            let value = record.value(field);
            if value.is_null() {
                continue;
            }
            let class = classify(value);
            if !counts.contains_key(&class) {
                order.push(class.clone());
            }
            *counts.entry(class.clone()).or_default() += 1;
            classes.push((index, class));
        }

        if classes.is_empty() {
            return None;
        }

        let mut major = &order[0];
        for class in &order {
            if counts[class] > counts[major] {
                major = class;
            }
        }
        let major = major.clone();
        let score = counts[&major] as f64 / classes.len() as f64 * 100.0;
        let minority = classes.into_iter().filter(|(_, c)| *c != major).collect();
        Some((score, major, minority))
    }

    /// Mean majority share over the target fields. Fields without values count as 0.
    fn class_score(
        records: &[Record],
        rule: &QualityRule,
        kind: &str,
        classify: impl Fn(&Value) -> String + Copy,
        findings: &mut Vec<Finding>,
    ) -> f64 {
        if rule.target_fields.is_empty() {
            return 0.0;
        }

        let mut total = 0.0;
        for field in &rule.target_fields {
            let Some((score, major, minority)) = Self::majority(records, field, classify) else {
                continue;
            };
            total += score;
            for (index, class) in minority {
                findings.push(Finding {
                    index,
                    field: field.clone(),
                    value: records[index].value(field).clone(),
                    message: format!(
                        "field {} {} {} differs from the majority {}",
                        field, kind, class, major
                    ),
                    suggestion: format!("convert field {} to {} {}", field, kind, major),
                });
            }
        }
        total / rule.target_fields.len() as f64
    }

    fn domain_score(records: &[Record], rule: &QualityRule, findings: &mut Vec<Finding>) -> f64 {
        let Some(allowed) = &rule.config.allowed_values else {
            return 100.0;
        };
        let allowed: HashSet<String> = allowed.iter().map(Value::to_string).collect();

        let mut checked = 0;
        let mut valid = 0;
        for (index, record) in records.iter().enumerate() {
            for field in &rule.target_fields {
                let value = record.value(field);
                if value.is_null() {
                    continue;
                }
                checked += 1;
                if allowed.contains(&value.to_string()) {
                    valid += 1;
                } else {
                    findings.push(Finding {
                        index,
                        field: field.clone(),
                        value: value.clone(),
                        message: format!("field {} value {} is not an allowed value", field, value),
                        suggestion: format!("restrict field {} to the allowed values", field),
                    });
                }
            }
        }

        match checked {
            0 => 100.0,
            _ => ratio(valid, checked),
        }
    }
}

fn format_class(value: &Value) -> String {
    validator::value_format(&value.to_string()).to_owned()
}

fn type_class(value: &Value) -> String {
    validator::value_type(value).to_owned()
}

impl DimensionChecker for ConsistencyChecker {
    fn evaluate(
        &self,
        records: &[Record],
        rule: &QualityRule,
        _patterns: &PatternCache,
    ) -> (QualityRuleResult, Vec<Finding>) {
        let mut findings = Vec::new();
        let score = match rule.config.check_type {
            Some(CheckType::Format) => {
                Self::class_score(records, rule, "format", format_class, &mut findings)
            }
            Some(CheckType::Type) => {
                Self::class_score(records, rule, "type", type_class, &mut findings)
            }
            Some(CheckType::Domain) => Self::domain_score(records, rule, &mut findings),
            _ => {
                let format = Self::class_score(records, rule, "format", format_class, &mut findings);
                let mut type_findings = Vec::new();
                let types = Self::class_score(records, rule, "type", type_class, &mut type_findings);
                (format + types) / 2.0
            }
        };

        let checked = records.len() * rule.target_fields.len();
        let passed = (checked as f64 * score / 100.0).floor() as usize;
        let mut result = QualityRuleResult::scored(rule, checked, passed);
        result.score = score;
        result.passed = score >= rule.threshold;
        (result, findings)
    }
}

pub struct ValidityChecker;

impl DimensionChecker for ValidityChecker {
    fn evaluate(
        &self,
        records: &[Record],
        rule: &QualityRule,
        patterns: &PatternCache,
    ) -> (QualityRuleResult, Vec<Finding>) {
        let validation = rule.config.validation();
        let mut checked = 0;
        let mut findings = Vec::new();

        for (index, record) in records.iter().enumerate() {
            for field in &rule.target_fields {
                let Some(value) = record.get(field) else {
                    continue;
                };
                checked += 1;
                if let Err(reason) = validation.validate(value, patterns) {
                    findings.push(Finding {
                        index,
                        field: field.clone(),
                        value: value.clone(),
                        message: format!("field {} failed validation: {}", field, reason),
                        suggestion: "check the value against the field requirements".to_owned(),
                    });
                }
            }
        }

        let passed = checked - findings.len();
        (QualityRuleResult::scored(rule, checked, passed), findings)
    }
}

pub struct UniquenessChecker;

impl DimensionChecker for UniquenessChecker {
    /// Records missing any key field are not compared. Every occurrence after the first of a
    /// key is a failure. Without target fields whole records are compared.
    fn evaluate(
        &self,
        records: &[Record],
        rule: &QualityRule,
        _patterns: &PatternCache,
    ) -> (QualityRuleResult, Vec<Finding>) {
        let extractor = KeyExtractor::new(&rule.target_fields);
        let label = match rule.target_fields.is_empty() {
            true => "record".to_owned(),
            false => rule.target_fields.join("+"),
        };

        let mut seen = HashSet::new();
        let mut compared = 0;
        let mut findings = Vec::new();

        for (index, record) in records.iter().enumerate() {
            let key = match rule.target_fields.is_empty() {
                true => record.content_hash(),
                false => match extractor.complete_key(record) {
                    Some(parts) => parts.join("|"),
                    None => continue,
                },
            };
            compared += 1;
            if !seen.insert(key.clone()) {
                findings.push(Finding {
                    index,
                    field: label.clone(),
                    value: Value::String(key),
                    message: format!("{} value is duplicated", label),
                    suggestion: "make the value unique".to_owned(),
                });
            }
        }

        let unique = compared - findings.len();
        let mut result = QualityRuleResult::scored(rule, records.len(), unique);
        result.failed_count = findings.len();
        (result, findings)
    }
}

pub struct TimelinessChecker;

impl DimensionChecker for TimelinessChecker {
    fn evaluate(
        &self,
        records: &[Record],
        rule: &QualityRule,
        _patterns: &PatternCache,
    ) -> (QualityRuleResult, Vec<Finding>) {
        let max_age = rule.config.max_age_hours();
        let cutoff = Utc::now() - Duration::seconds((max_age * 3600.0) as i64);
        let mut checked = 0;
        let mut findings = Vec::new();

        for (index, record) in records.iter().enumerate() {
            for field in &rule.target_fields {
                let value = record.value(field);
                if value.is_null() {
                    continue;
                }
                checked += 1;
                let timely = value.as_timestamp().map_or(false, |ts| ts > cutoff);
                if !timely {
                    findings.push(Finding {
                        index,
                        field: field.clone(),
                        value: value.clone(),
                        message: format!(
                            "field {} value {} is older than {:.0} hours",
                            field, value, max_age
                        ),
                        suggestion: "refresh the data".to_owned(),
                    });
                }
            }
        }

        let passed = checked - findings.len();
        (QualityRuleResult::scored(rule, checked, passed), findings)
    }
}

static COMPLETENESS: CompletenessChecker = CompletenessChecker;
static ACCURACY: AccuracyChecker = AccuracyChecker;
static CONSISTENCY: ConsistencyChecker = ConsistencyChecker;
static VALIDITY: ValidityChecker = ValidityChecker;
static UNIQUENESS: UniquenessChecker = UniquenessChecker;
static TIMELINESS: TimelinessChecker = TimelinessChecker;

pub fn checker_for(dimension: QualityDimension) -> &'static dyn DimensionChecker {
    match dimension {
        QualityDimension::Completeness => &COMPLETENESS,
        QualityDimension::Accuracy => &ACCURACY,
        QualityDimension::Consistency => &CONSISTENCY,
        QualityDimension::Validity => &VALIDITY,
        QualityDimension::Uniqueness => &UNIQUENESS,
        QualityDimension::Timeliness => &TIMELINESS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(values: Vec<serde_json::Value>) -> Vec<Record> {
        values
            .into_iter()
            .map(|v| Record::from_json(v).unwrap())
            .collect()
    }

    fn rule(value: serde_json::Value) -> QualityRule {
        serde_json::from_value(value).unwrap()
    }

    fn run(records: &[Record], rule: &QualityRule) -> (QualityRuleResult, Vec<QualityIssue>) {
        let mut patterns = PatternCache::default();
        rule.compile(&mut patterns).unwrap();
        checker_for(rule.dimension).check(records, rule, &patterns)
    }

    #[test]
    fn test_completeness_counts_field_slots() {
        let data = records(vec![json!({"a": 1, "b": null}), json!({"a": 2, "b": 2})]);
        let (result, issues) = run(
            &data,
            &rule(json!({"id": "c", "dimension": "completeness", "threshold": 50,
                         "target_fields": ["a", "b"]})),
        );

        assert_eq!(result.score, 75.0);
        assert!(result.passed);
        assert_eq!(result.checked_count, 4);
        assert!(issues.is_empty());

        let (result, issues) = run(
            &data,
            &rule(json!({"id": "c", "dimension": "completeness", "threshold": 80,
                         "target_fields": ["a", "b"], "severity": "major"})),
        );
        assert!(!result.passed);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, "c_b_0");
        assert_eq!(issues[0].record_id, "record_0");
        assert_eq!(issues[0].severity, IssueSeverity::Major);
    }

    #[test]
    fn test_accuracy_check_types() {
        let data = records(vec![
            json!({"email": "a@b.cn", "age": 30}),
            json!({"email": "broken", "age": 130}),
        ]);

        let (email, issues) = run(
            &data,
            &rule(json!({"id": "e", "dimension": "accuracy", "threshold": 90,
                         "target_fields": ["email"], "config": {"check_type": "email"}})),
        );
        assert_eq!(email.score, 50.0);
        assert_eq!(issues[0].field, "email");
        assert_eq!(issues[0].record_id, "record_1");

        let (range, _) = run(
            &data,
            &rule(json!({"id": "r", "dimension": "accuracy", "threshold": 90, "target_fields": ["age"],
                         "config": {"check_type": "range", "min": 0, "max": 120}})),
        );
        assert_eq!(range.score, 50.0);
    }

    #[test]
    fn test_consistency_majority_format() {
        let data = records(vec![
            json!({"d": "2024-01-01"}),
            json!({"d": "2024-01-02"}),
            json!({"d": "2024-01-03"}),
            json!({"d": "Jan 4"}),
        ]);
        let (result, issues) = run(
            &data,
            &rule(json!({"id": "f", "dimension": "consistency", "threshold": 90,
                         "target_fields": ["d"], "config": {"check_type": "format"}})),
        );

        assert_eq!(result.score, 75.0);
        assert_eq!(result.passed_count, 3);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].record_id, "record_3");
    }

    #[test]
    fn test_consistency_domain() {
        let data = records(vec![json!({"s": "on"}), json!({"s": "off"}), json!({"s": "maybe"}), json!({"s": null})]);
        let (result, _) = run(
            &data,
            &rule(json!({"id": "d", "dimension": "consistency", "target_fields": ["s"],
                         "config": {"check_type": "domain", "allowed_values": ["on", "off"]}})),
        );
        assert!((result.score - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_validity_and_uniqueness() {
        let data = records(vec![
            json!({"code": "AB", "k1": 1, "k2": "x"}),
            json!({"code": "ABCDEF", "k1": 1, "k2": "x"}),
            json!({"code": 7, "k1": 1, "k2": "y"}),
            json!({"k1": 1}),
        ]);

        let (validity, _) = run(
            &data,
            &rule(json!({"id": "v", "dimension": "validity", "target_fields": ["code"],
                         "config": {"type": "string", "max_length": 4}})),
        );
        assert!((validity.score - 100.0 / 3.0).abs() < 1e-9);

        let (uniqueness, issues) = run(
            &data,
            &rule(json!({"id": "u", "dimension": "uniqueness", "threshold": 100,
                         "target_fields": ["k1", "k2"]})),
        );
        assert_eq!(uniqueness.score, 50.0);
        assert_eq!(uniqueness.failed_count, 1);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].record_id, "record_1");
    }

    #[test]
    fn test_timeliness() {
        let fresh = (Utc::now() - Duration::hours(1)).format("%Y-%m-%d %H:%M:%S").to_string();
        let stale = (Utc::now() - Duration::hours(48)).format("%Y-%m-%d %H:%M:%S").to_string();
        let data = records(vec![
            json!({"seen": fresh}),
            json!({"seen": stale}),
            json!({"seen": "not a date"}),
        ]);

        let (result, _) = run(
            &data,
            &rule(json!({"id": "t", "dimension": "timeliness", "target_fields": ["seen"]})),
        );
        assert!((result.score - 100.0 / 3.0).abs() < 1e-9);

        let (result, _) = run(
            &data,
            &rule(json!({"id": "t", "dimension": "timeliness", "target_fields": ["seen"],
                         "config": {"max_age_hours": 72}})),
        );
        assert!((result.score - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_records_fail() {
        let (result, issues) = run(&[], &rule(json!({"id": "c", "dimension": "completeness"})));
        assert_eq!(result.score, 0.0);
        assert!(!result.passed);
        assert!(issues.is_empty());
    }
}
