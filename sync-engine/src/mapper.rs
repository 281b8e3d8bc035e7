//! Maps aggregated records onto the target interface's declared fields.
use std::collections::BTreeMap;

use chrono::Utc;
use sync_common::keys::KeyExtractor;
use sync_common::record::{Record, Value};
use tracing::warn;

use crate::catalog::{ColumnKind, InterfaceMeta, TargetField};
use crate::config::FieldMappingRules;
use crate::error::{ConfigError, MappingError};

/// Every mapping rule must point at a declared target field.
pub fn validate_mapping(
    rules: &FieldMappingRules,
    interface: &InterfaceMeta,
) -> Result<(), ConfigError> {
    match rules
        .mappings
        .iter()
        .find(|rule| interface.field(&rule.target_field).is_none())
    {
        Some(rule) => Err(ConfigError::UnknownMappingTarget(rule.target_field.clone())),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    /// Position of the record in the mapper's input.
    pub index: usize,
    pub record: Record,
}

#[derive(Debug, PartialEq)]
pub struct RejectedRecord {
    pub index: usize,
    pub error: MappingError,
}

#[derive(Debug, Default)]
pub struct MappingOutcome {
    pub records: Vec<MappedRecord>,
    pub rejected: Vec<RejectedRecord>,
}

pub struct FieldMapper<'a> {
    interface: &'a InterfaceMeta,
    rules: &'a FieldMappingRules,
}

impl<'a> FieldMapper<'a> {
    pub fn new(interface: &'a InterfaceMeta, rules: &'a FieldMappingRules) -> Self {
        Self { interface, rules }
    }

    /// Map every record, setting aside the ones that cannot be written.
    pub fn map_records<'r>(&self, records: impl IntoIterator<Item = &'r Record>) -> MappingOutcome {
        let mut outcome = MappingOutcome::default();

        for (index, record) in records.into_iter().enumerate() {
            match self.map(record) {
                Ok(record) => outcome.records.push(MappedRecord { index, record }),
                Err(error) => {
                    warn!(index, %error, "rejecting record");
                    outcome.rejected.push(RejectedRecord { index, error });
                }
            }
        }

        outcome
    }

    /// Only declared fields are kept. Optional fields without a value are left out.
    pub fn map(&self, record: &Record) -> Result<Record, MappingError> {
        let mut mapped = Record::new();

        for field in &self.interface.fields {
            let value = match self.resolve(record, field) {
                Some(value) => coerce(field, value)?,
                None => Value::Null,
            };

            if !value.is_null() {
                mapped.insert(field.name_en.clone(), value);
                continue;
            }
            if field.is_required() {
                match system_default(field) {
                    Some(value) => {
                        mapped.insert(field.name_en.clone(), coerce(field, value)?);
                    }
                    None => return Err(MappingError::MissingRequired(field.name_en.clone())),
                }
            }
        }

        Ok(mapped)
    }

    /// Target primary key a record maps to, even when its other fields cannot be mapped.
    pub fn primary_key(&self, record: &Record) -> Option<Vec<String>> {
        let key_columns = self.interface.primary_key();
        let mut key = Record::new();
        for column in &key_columns {
            let field = self.interface.field(column)?;
            let value = coerce(field, self.resolve(record, field)?).ok()?;
            key.insert(column.clone(), value);
        }

        KeyExtractor::new(&key_columns).complete_key(&key)
    }

    /// Mapping rule, then the english name, then the localized name, then the declared default.
    /// Null source values do not count.
    fn resolve(&self, record: &Record, field: &TargetField) -> Option<Value> {
        let present = |name: &str| record.get(name).filter(|value| !value.is_null()).cloned();

        self.rules
            .for_target(&field.name_en)
            .find_map(|rule| present(&rule.source_field))
            .or_else(|| present(&field.name_en))
            .or_else(|| field.name_zh.as_deref().and_then(present))
            .or_else(|| field.default_value.clone().filter(|value| !value.is_null()))
    }
}

/// Default for a required field nothing else filled, by conventional name and then by type.
pub fn system_default(field: &TargetField) -> Option<Value> {
    let name = field.name_en.to_lowercase();
    let by_name = match name.as_str() {
        "created_by" | "updated_by" => Some(Value::from("system")),
        "created_at" | "updated_at" | "created_time" | "updated_time" => {
            Some(Value::Timestamp(Utc::now()))
        }
        "status" => Some(Value::from("active")),
        "version" => Some(Value::Int(1)),
        "is_deleted" | "deleted" => Some(Value::Bool(false)),
        "is_active" | "active" => Some(Value::Bool(true)),
        "sort_order" | "order_num" => Some(Value::Int(0)),
        _ => None,
    };
    if by_name.is_some() {
        return by_name;
    }

    match field.kind() {
        ColumnKind::Text if name.contains("name") => Some(Value::from("Unnamed")),
        ColumnKind::Text if name.contains("code") => {
            Some(Value::String(format!("AUTO_{}", Utc::now().timestamp())))
        }
        ColumnKind::Text => Some(Value::from("")),
        ColumnKind::Integer | ColumnKind::BigInt => Some(Value::Int(0)),
        ColumnKind::Float => Some(Value::Float(0.0)),
        ColumnKind::Bool => Some(Value::Bool(false)),
        ColumnKind::Timestamp => Some(Value::Timestamp(Utc::now())),
        ColumnKind::Json => Some(Value::Map(BTreeMap::new())),
        ColumnKind::Other => None,
    }
}

/// Convert a value to the field's declared type. Conversions that would lose information fail.
pub fn coerce(field: &TargetField, value: Value) -> Result<Value, MappingError> {
    let failed = |value: &Value| MappingError::Conversion {
        field: field.name_en.clone(),
        data_type: field.data_type.clone(),
        value: value.to_string(),
    };

    if value.is_null() {
        return Ok(value);
    }

    match field.kind() {
        ColumnKind::Text => match value {
            Value::String(_) => Ok(value),
            other => Ok(Value::String(other.to_string())),
        },
        ColumnKind::Integer => {
            let int = integer(&value).ok_or_else(|| failed(&value))?;
            match i32::try_from(int) {
                Ok(_) => Ok(Value::Int(int)),
                Err(_) => Err(failed(&value)),
            }
        }
        ColumnKind::BigInt => integer(&value).map(Value::Int).ok_or_else(|| failed(&value)),
        ColumnKind::Float => match value {
            Value::Float(_) => Ok(value),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::String(ref s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::Float)
                .ok_or_else(|| failed(&value)),
            _ => Err(failed(&value)),
        },
        ColumnKind::Bool => boolean(&value).map(Value::Bool).ok_or_else(|| failed(&value)),
        ColumnKind::Timestamp => value
            .as_timestamp()
            .map(Value::Timestamp)
            .ok_or_else(|| failed(&value)),
        ColumnKind::Json | ColumnKind::Other => Ok(value),
    }
}

/// Integral value of ints, whole floats and integer strings.
fn integer(value: &Value) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_807.0;

    let whole = |f: f64| match f.fract() == 0.0 && f.abs() < LIMIT {
        true => Some(f as i64),
        false => None,
    };

    match value {
        Value::Int(i) => Some(*i),
        Value::Float(f) => whole(*f),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(whole))
        }
        _ => None,
    }
}

fn boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Int(0) => Some(false),
        Value::Int(1) => Some(true),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "t" | "y" => Some(true),
            "false" | "0" | "no" | "f" | "n" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldMappingRule;
    use serde_json::json;

    fn interface() -> InterfaceMeta {
        serde_json::from_value(json!({
            "library_id": "lib",
            "interface_id": "people",
            "schema": "thematic",
            "table": "people",
            "fields": [
                {"name_en": "id", "data_type": "bigint", "is_primary_key": true, "is_nullable": false},
                {"name_en": "full_name", "name_zh": "姓名", "is_nullable": false},
                {"name_en": "age", "data_type": "int"},
                {"name_en": "score", "data_type": "numeric"},
                {"name_en": "region", "default_value": "north"},
                {"name_en": "status", "is_nullable": false},
                {"name_en": "is_deleted", "data_type": "boolean", "is_nullable": false},
                {"name_en": "joined_at", "data_type": "timestamp"}
            ]
        }))
        .unwrap()
    }

    fn rules() -> FieldMappingRules {
        FieldMappingRules::new(vec![FieldMappingRule {
            source_field: "person_id".to_owned(),
            target_field: "id".to_owned(),
        }])
    }

    fn record(value: serde_json::Value) -> Record {
        Record::from_json(value).unwrap()
    }

    #[test]
    fn test_resolution_order() {
        let interface = interface();
        let rules = rules();
        let mapper = FieldMapper::new(&interface, &rules);

        let mapped = mapper
            .map(&record(json!({
                "person_id": "42",
                "id": 7,
                "姓名": "Ann",
                "age": 30.0,
                "score": "4.5",
                "joined_at": "2024-01-02 03:04:05",
                "extra": true
            })))
            .unwrap();

        assert_eq!(mapped.get_i64("id"), Ok(42));
        assert_eq!(mapped.get_str("full_name"), Ok("Ann"));
        assert_eq!(mapped.value("age"), &Value::Int(30));
        assert_eq!(mapped.value("score"), &Value::Float(4.5));
        assert_eq!(mapped.get_str("region"), Ok("north"));
        assert_eq!(mapped.get_str("status"), Ok("active"));
        assert_eq!(mapped.get_bool("is_deleted"), Ok(false));
        assert!(matches!(mapped.value("joined_at"), Value::Timestamp(_)));
        assert!(!mapped.contains_key("extra"));
    }

    #[test]
    fn test_optional_fields_are_left_out() {
        let interface = interface();
        let rules = FieldMappingRules::default();
        let mapper = FieldMapper::new(&interface, &rules);

        let mapped = mapper.map(&record(json!({"id": 1, "age": null}))).unwrap();

        assert!(!mapped.contains_key("age"));
        assert!(!mapped.contains_key("joined_at"));
        assert_eq!(mapped.get_str("full_name"), Ok("Unnamed"));
    }

    #[test]
    fn test_conversions_never_truncate() {
        let interface = interface();
        let rules = FieldMappingRules::default();
        let mapper = FieldMapper::new(&interface, &rules);

        let outcome = mapper.map_records(&[
            record(json!({"id": 1, "age": 30.5})),
            record(json!({"id": 2, "age": 3_000_000_000_i64})),
            record(json!({"id": 3, "age": "31"})),
            record(json!({"id": "x"})),
        ]);

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].index, 2);
        assert_eq!(
            outcome.rejected.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 1, 3]
        );
        assert!(matches!(
            &outcome.rejected[0].error,
            MappingError::Conversion { field, .. } if field == "age"
        ));
    }

    #[test]
    fn test_primary_key_of_unmappable_record() {
        let interface = interface();
        let rules = rules();
        let mapper = FieldMapper::new(&interface, &rules);

        let unmappable = record(json!({"person_id": "7", "age": "seven"}));
        assert!(mapper.map(&unmappable).is_err());
        assert_eq!(mapper.primary_key(&unmappable), Some(vec!["7".to_owned()]));

        assert_eq!(mapper.primary_key(&record(json!({"age": 3}))), None);
        assert_eq!(mapper.primary_key(&record(json!({"id": "x"}))), None);
    }

    #[test]
    fn test_required_field_without_default_rejects() {
        let interface: InterfaceMeta = serde_json::from_value(json!({
            "library_id": "lib", "interface_id": "i", "schema": "s", "table": "t",
            "fields": [{"name_en": "blob", "data_type": "bytea", "is_nullable": false}]
        }))
        .unwrap();
        let rules = FieldMappingRules::default();

        let err = FieldMapper::new(&interface, &rules)
            .map(&record(json!({"other": 1})))
            .unwrap_err();
        assert_eq!(err, MappingError::MissingRequired("blob".to_owned()));
    }

    #[test]
    fn test_validate_mapping() {
        let interface = interface();
        assert!(validate_mapping(&rules(), &interface).is_ok());

        let bad = FieldMappingRules::new(vec![FieldMappingRule {
            source_field: "a".to_owned(),
            target_field: "missing".to_owned(),
        }]);
        assert!(matches!(
            validate_mapping(&bad, &interface),
            Err(ConfigError::UnknownMappingTarget(field)) if field == "missing"
        ));
    }
}
