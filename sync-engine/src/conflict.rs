//! Field-level conflict resolution between two matched records.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sync_common::record::{Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    KeepSource,
    KeepTarget,
    #[default]
    KeepLatest,
    #[serde(alias = "merge")]
    MergeFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomAction {
    KeepSource,
    KeepTarget,
    Merge,
    Transform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictTransform {
    Concat,
    Max,
    Min,
}

/// Every set condition must hold for a custom rule to apply. Type names are the record
/// value type names (`string`, `int`, `float`, `bool`, `timestamp`, `map`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuleCondition {
    #[serde(default)]
    pub source_not_null: bool,
    #[serde(default)]
    pub target_not_null: bool,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
}

impl RuleCondition {
    fn holds(&self, source: &Value, target: &Value) -> bool {
        if self.source_not_null && source.is_null() {
            return false;
        }
        if self.target_not_null && target.is_null() {
            return false;
        }
        if let Some(expected) = &self.source_type {
            if !source.is_null() && source.type_name() != expected {
                return false;
            }
        }
        if let Some(expected) = &self.target_type {
            if !target.is_null() && target.type_name() != expected {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CustomRule {
    #[serde(alias = "field_name")]
    pub field: String,
    #[serde(default, alias = "condition")]
    pub conditions: RuleCondition,
    pub action: CustomAction,
    /// Used by the `transform` action. Without it the source value is kept.
    #[serde(default)]
    pub transform: Option<ConflictTransform>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ValueDiff,
    TypeDiff,
}

/// A field whose two non-null values disagreed, and how it was settled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictInfo {
    pub field: String,
    pub source_value: Value,
    pub target_value: Value,
    pub conflict_type: ConflictType,
    pub resolution: String,
    pub resolved_value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    default_policy: ConflictPolicy,
    field_policies: BTreeMap<String, ConflictPolicy>,
    custom_rules: Vec<CustomRule>,
}

impl ConflictResolver {
    pub fn new(default_policy: ConflictPolicy) -> Self {
        Self {
            default_policy,
            field_policies: BTreeMap::new(),
            custom_rules: Vec::new(),
        }
    }

    pub fn set_field_policy(&mut self, field: &str, policy: ConflictPolicy) {
        self.field_policies.insert(field.to_owned(), policy);
    }

    /// Rules are evaluated in the order they were added.
    pub fn add_custom_rule(&mut self, rule: CustomRule) {
        self.custom_rules.push(rule);
    }

    /// Merge two records. Every field of either record appears once in the output. Only fields
    /// with two different non-null values are conflicts; otherwise the non-null side is kept.
    pub fn resolve(&self, source: &Record, target: &Record) -> (Record, Vec<ConflictInfo>) {
        let fields: BTreeSet<&String> = source.keys().chain(target.keys()).collect();
        let mut merged = Record::new();
        let mut conflicts = Vec::new();

        for field in fields {
            let (s, t) = (source.value(field), target.value(field));

            if s.is_null() || t.is_null() || s == t {
                let kept = if s.is_null() { t } else { s };
                merged.insert(field.clone(), kept.clone());
                continue;
            }

            let (resolved, resolution) = self.resolve_field(field, s, t);
            conflicts.push(ConflictInfo {
                field: field.clone(),
                source_value: s.clone(),
                target_value: t.clone(),
                conflict_type: match s.type_name() == t.type_name() {
                    true => ConflictType::ValueDiff,
                    false => ConflictType::TypeDiff,
                },
                resolution: resolution.to_owned(),
                resolved_value: resolved.clone(),
            });
            merged.insert(field.clone(), resolved);
        }

        (merged, conflicts)
    }

    fn resolve_field(&self, field: &str, source: &Value, target: &Value) -> (Value, &'static str) {
        if let Some(rule) = self
            .custom_rules
            .iter()
            .find(|rule| rule.field == field && rule.conditions.holds(source, target))
        {
            return apply_custom(rule, source, target);
        }

        let policy = self
            .field_policies
            .get(field)
            .copied()
            .unwrap_or(self.default_policy);

        match policy {
            ConflictPolicy::KeepSource => (source.clone(), "keep_source"),
            ConflictPolicy::KeepTarget => (target.clone(), "keep_target"),
            ConflictPolicy::KeepLatest => keep_latest(source, target),
            ConflictPolicy::MergeFields => merge_values(source, target),
        }
    }
}

fn keep_latest(source: &Value, target: &Value) -> (Value, &'static str) {
    match (source.as_timestamp(), target.as_timestamp()) {
        (Some(s), Some(t)) if s > t => (source.clone(), "keep_latest_source"),
        (Some(_), Some(_)) => (target.clone(), "keep_latest_target"),
        _ => (source.clone(), "keep_latest_unparsed_source"),
    }
}

/// Strings are joined with `;`, numbers averaged, anything else keeps the source.
pub fn merge_values(source: &Value, target: &Value) -> (Value, &'static str) {
    if let (Value::String(s), Value::String(t)) = (source, target) {
        return match (s.is_empty(), t.is_empty()) {
            (false, false) if s != t => (Value::String(format!("{};{}", s, t)), "merge_concat"),
            (false, _) => (source.clone(), "merge_non_empty_source"),
            (true, _) => (target.clone(), "merge_non_empty_target"),
        };
    }

    match (source.as_f64(), target.as_f64()) {
        (Some(s), Some(t)) => (Value::Float((s + t) / 2.0), "merge_average"),
        _ => (source.clone(), "merge_fallback_source"),
    }
}

fn apply_custom(rule: &CustomRule, source: &Value, target: &Value) -> (Value, &'static str) {
    match rule.action {
        CustomAction::KeepSource => (source.clone(), "custom_keep_source"),
        CustomAction::KeepTarget => (target.clone(), "custom_keep_target"),
        CustomAction::Merge => merge_values(source, target),
        CustomAction::Transform => {
            let numbers = (source.as_f64(), target.as_f64());
            match (rule.transform, numbers) {
                (Some(ConflictTransform::Concat), _) => (
                    Value::String(format!("{}{}", source, target)),
                    "custom_concat",
                ),
                (Some(ConflictTransform::Max), (Some(s), Some(t))) => {
                    (Value::Float(s.max(t)), "custom_max")
                }
                (Some(ConflictTransform::Min), (Some(s), Some(t))) => {
                    (Value::Float(s.min(t)), "custom_min")
                }
                _ => (source.clone(), "custom_transform_fallback_source"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::from_json(value).unwrap()
    }

    #[test]
    fn test_every_field_appears_once_and_one_sided_nulls_are_not_conflicts() {
        let resolver = ConflictResolver::new(ConflictPolicy::KeepSource);
        let (merged, conflicts) = resolver.resolve(
            &record(json!({"id": 1, "name": "a", "email": null})),
            &record(json!({"id": 1, "name": "b", "email": "b@x.cn", "city": "Oslo"})),
        );

        assert_eq!(merged.len(), 4);
        assert_eq!(merged.get_str("name"), Ok("a"));
        assert_eq!(merged.get_str("email"), Ok("b@x.cn"));
        assert_eq!(merged.get_str("city"), Ok("Oslo"));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "name");
        assert_eq!(conflicts[0].conflict_type, ConflictType::ValueDiff);
    }

    #[test]
    fn test_keep_latest() {
        let resolver = ConflictResolver::new(ConflictPolicy::KeepLatest);
        let (merged, conflicts) = resolver.resolve(
            &record(json!({"seen": "2024-01-01 00:00:00", "note": "x"})),
            &record(json!({"seen": "2024-02-01T00:00:00Z", "note": "y"})),
        );

        assert_eq!(merged.get_str("seen"), Ok("2024-02-01T00:00:00Z"));
        // Unparseable values keep the source.
        assert_eq!(merged.get_str("note"), Ok("x"));
        assert_eq!(conflicts[0].resolution, "keep_latest_unparsed_source");
    }

    #[test]
    fn test_merge_fields() {
        assert_eq!(
            merge_values(&"a".into(), &"b".into()).0,
            Value::from("a;b")
        );
        assert_eq!(merge_values(&"".into(), &"b".into()).0, Value::from("b"));
        assert_eq!(
            merge_values(&Value::Int(2), &Value::Float(3.0)).0,
            Value::Float(2.5)
        );
        assert_eq!(
            merge_values(&Value::Bool(true), &Value::Int(1)).0,
            Value::Bool(true)
        );
    }

    #[test]
    fn test_field_policy_overrides_default_and_custom_rule_overrides_both() {
        let mut resolver = ConflictResolver::new(ConflictPolicy::KeepSource);
        resolver.set_field_policy("name", ConflictPolicy::KeepTarget);
        resolver.set_field_policy("score", ConflictPolicy::KeepTarget);
        resolver.add_custom_rule(
            serde_json::from_value(json!({
                "field": "score",
                "conditions": {"source_type": "int"},
                "action": "transform",
                "transform": "max"
            }))
            .unwrap(),
        );

        let (merged, conflicts) = resolver.resolve(
            &record(json!({"name": "a", "score": 9, "tag": "s"})),
            &record(json!({"name": "b", "score": 4.5, "tag": "t"})),
        );

        assert_eq!(merged.get_str("name"), Ok("b"));
        assert_eq!(merged.get_f64("score"), Ok(9.0));
        assert_eq!(merged.get_str("tag"), Ok("s"));
        let score = conflicts.iter().find(|c| c.field == "score").unwrap();
        assert_eq!(score.conflict_type, ConflictType::TypeDiff);
        assert_eq!(score.resolution, "custom_max");
    }

    #[test]
    fn test_custom_rule_condition_not_met_falls_through() {
        let mut resolver = ConflictResolver::new(ConflictPolicy::KeepTarget);
        resolver.add_custom_rule(CustomRule {
            field: "code".to_owned(),
            conditions: RuleCondition {
                source_type: Some("string".to_owned()),
                ..RuleCondition::default()
            },
            action: CustomAction::Transform,
            transform: Some(ConflictTransform::Concat),
        });

        let (merged, _) = resolver.resolve(&record(json!({"code": 1})), &record(json!({"code": 2})));
        assert_eq!(merged.get_i64("code"), Ok(2));

        let (merged, _) =
            resolver.resolve(&record(json!({"code": "A"})), &record(json!({"code": "B"})));
        assert_eq!(merged.get_str("code"), Ok("AB"));
    }
}
