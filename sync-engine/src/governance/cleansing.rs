//! Rule-driven record cleansing.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sync_common::record::{Record, Value};
use tracing::debug;

use super::validator::{FieldValidation, PatternCache};
use crate::error::ConfigError;
use crate::transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleansingRuleType {
    Validation,
    Normalization,
    Transformation,
    Enrichment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    Regex,
    IsNull,
    NotNull,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CleansingCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl CleansingCondition {
    fn holds(&self, record: &Record, patterns: &PatternCache) -> bool {
        let actual = record.value(&self.field);
        let compare = |accept: fn(f64, f64) -> bool| match (actual.as_f64(), self.value.as_f64()) {
            (Some(a), Some(b)) => accept(a, b),
            _ => false,
        };

        match self.operator {
            ConditionOperator::Eq => actual.to_string() == self.value.to_string(),
            ConditionOperator::Ne => actual.to_string() != self.value.to_string(),
            ConditionOperator::IsNull => actual.is_null(),
            ConditionOperator::NotNull => !actual.is_null(),
            ConditionOperator::Contains => {
                !actual.is_null() && actual.to_string().contains(&self.value.to_string())
            }
            ConditionOperator::Regex => {
                !actual.is_null() && patterns.is_match(&self.value.to_string(), &actual.to_string())
            }
            ConditionOperator::Gt => compare(|a, b| a > b),
            ConditionOperator::Lt => compare(|a, b| a < b),
            ConditionOperator::Gte => compare(|a, b| a >= b),
            ConditionOperator::Lte => compare(|a, b| a <= b),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum CleansingAction {
    Set {
        field: String,
        #[serde(default)]
        value: Value,
    },
    Remove {
        field: String,
    },
    Transform {
        field: String,
        transform: String,
        #[serde(default)]
        config: BTreeMap<String, Value>,
    },
    Validate {
        field: String,
        #[serde(default)]
        config: FieldValidation,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CleansingRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub rule_type: Option<CleansingRuleType>,
    #[serde(default)]
    pub target_fields: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<CleansingCondition>,
    #[serde(default)]
    pub actions: Vec<CleansingAction>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled")]
    pub is_enabled: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    fn weight(&self) -> usize {
        match self {
            Severity::Error => 2,
            Severity::Warning => 1,
            Severity::Info => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub value: Value,
    pub rule_id: String,
    pub error_type: &'static str,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleansingResult {
    pub record: Record,
    pub applied_rules: Vec<String>,
    pub validation_errors: Vec<ValidationError>,
    /// Record quality in [0, 100].
    pub quality_score: f64,
}

/// Applies enabled rules in descending priority. Equal priorities keep configuration order.
#[derive(Debug, Clone)]
pub struct CleansingEngine {
    rules: Vec<CleansingRule>,
    patterns: PatternCache,
}

impl CleansingEngine {
    pub fn new(rules: &[CleansingRule]) -> Result<Self, ConfigError> {
        let mut rules: Vec<CleansingRule> =
            rules.iter().filter(|r| r.is_enabled).cloned().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut patterns = PatternCache::default();
        for rule in &rules {
            for condition in &rule.conditions {
                if condition.operator == ConditionOperator::Regex {
                    patterns.compile(&rule.id, &condition.value.to_string())?;
                }
            }
            for action in &rule.actions {
                if let CleansingAction::Validate { config, .. } = action {
                    config.compile(&rule.id, &mut patterns)?;
                }
            }
        }

        Ok(Self { rules, patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn cleanse(&self, record: &Record) -> CleansingResult {
        let mut cleaned = record.clone();
        let mut applied_rules = Vec::new();
        let mut validation_errors = Vec::new();

        for rule in &self.rules {
            if !rule.conditions.iter().all(|c| c.holds(&cleaned, &self.patterns)) {
                continue;
            }
            for action in &rule.actions {
                if let Some(error) = self.apply_action(&mut cleaned, action, &rule.id) {
                    validation_errors.push(error);
                }
            }
            applied_rules.push(rule.id.clone());
        }

        if !applied_rules.is_empty() {
            debug!(rules = ?applied_rules, errors = validation_errors.len(), "cleansed record");
        }

        CleansingResult {
            quality_score: record_quality(&cleaned, &validation_errors),
            record: cleaned,
            applied_rules,
            validation_errors,
        }
    }

    fn apply_action(
        &self,
        record: &mut Record,
        action: &CleansingAction,
        rule_id: &str,
    ) -> Option<ValidationError> {
        match action {
            CleansingAction::Set { field, value } => {
                record.insert(field.clone(), value.clone());
                None
            }
            CleansingAction::Remove { field } => {
                record.remove(field);
                None
            }
            CleansingAction::Transform {
                field,
                transform,
                config,
            } => {
                let current = record.value(field).clone();
                match transform::apply(transform, &current, config) {
                    Ok(value) => {
                        if record.contains_key(field) {
                            record.insert(field.clone(), value);
                        }
                        None
                    }
                    Err(error) => Some(ValidationError {
                        field: field.clone(),
                        value: current,
                        rule_id: rule_id.to_owned(),
                        error_type: "transform_error",
                        message: error.to_string(),
                        severity: Severity::Warning,
                    }),
                }
            }
            CleansingAction::Validate { field, config } => {
                let current = record.value(field);
                config
                    .validate(current, &self.patterns)
                    .err()
                    .map(|message| ValidationError {
                        field: field.clone(),
                        value: current.clone(),
                        rule_id: rule_id.to_owned(),
                        error_type: "validation_error",
                        message,
                        severity: Severity::Error,
                    })
            }
        }
    }
}

/// `0.6 × completeness + 0.4 × accuracy`, scaled to [0, 100]. Errors weigh twice as much as
/// warnings in the accuracy term.
pub fn record_quality(record: &Record, errors: &[ValidationError]) -> f64 {
    if record.is_empty() {
        return 0.0;
    }

    let filled = record
        .iter()
        .filter(|(_, value)| !value.is_null() && !value.to_string().is_empty())
        .count();
    let completeness = filled as f64 / record.len() as f64;

    let weighted: usize = errors.iter().map(|e| e.severity.weight()).sum();
    let accuracy = 1.0 / (1.0 + weighted as f64 * 0.1);

    ((completeness * 0.6 + accuracy * 0.4) * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::from_json(value).unwrap()
    }

    fn rules(value: serde_json::Value) -> Vec<CleansingRule> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_rules_fire_by_priority_when_all_conditions_hold() {
        let engine = CleansingEngine::new(&rules(json!([
            {"id": "low", "priority": 1, "actions": [
                {"type": "set", "field": "tier", "value": "low"}
            ]},
            {"id": "high", "priority": 9, "conditions": [
                {"field": "age", "operator": "gte", "value": 18},
                {"field": "email", "operator": "not_null"}
            ], "actions": [
                {"type": "set", "field": "tier", "value": "adult"},
                {"type": "transform", "field": "email", "transform": "normalize_email"}
            ]},
            {"id": "off", "is_enabled": false, "actions": [{"type": "remove", "field": "age"}]}
        ])))
        .unwrap();

        let result = engine.cleanse(&record(json!({"age": "21", "email": " A@B.CO "})));
        assert_eq!(result.applied_rules, vec!["high", "low"]);
        assert_eq!(result.record.get_str("tier"), Ok("low"));
        assert_eq!(result.record.get_str("email"), Ok("a@b.co"));
        assert!(result.record.contains_key("age"));

        let result = engine.cleanse(&record(json!({"age": 12, "email": "x@y.cn"})));
        assert_eq!(result.applied_rules, vec!["low"]);
    }

    #[test]
    fn test_validation_and_transform_errors() {
        let engine = CleansingEngine::new(&rules(json!([
            {"id": "r1", "actions": [
                {"type": "validate", "field": "code", "config": {"required": true, "pattern": "^[A-Z]{3}$"}},
                {"type": "transform", "field": "code", "transform": "reverse"}
            ]}
        ])))
        .unwrap();

        let result = engine.cleanse(&record(json!({"code": "ab1", "name": "n"})));

        assert_eq!(result.validation_errors.len(), 2);
        assert_eq!(result.validation_errors[0].severity, Severity::Error);
        assert_eq!(result.validation_errors[1].severity, Severity::Warning);
        assert_eq!(result.validation_errors[1].error_type, "transform_error");
        // complete record, 3 weighted errors: 0.6 + 0.4 / 1.3
        let expected = (0.6 + 0.4 / 1.3) * 100.0;
        assert!((result.quality_score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_record_quality() {
        assert_eq!(record_quality(&Record::new(), &[]), 0.0);
        let half = record(json!({"a": 1, "b": ""}));
        assert!((record_quality(&half, &[]) - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_regex_condition_is_rejected() {
        let err = CleansingEngine::new(&rules(json!([
            {"id": "bad", "conditions": [{"field": "x", "operator": "regex", "value": "[a-"}]}
        ])))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }
}
