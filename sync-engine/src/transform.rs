//! Named value transforms shared by source transforms, aggregation mappings and cleansing.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sync_common::record::{Record, Value};
use thiserror::Error;

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";
const DEFAULT_PRECISION: i64 = 2;

#[derive(Error, Debug, PartialEq)]
pub enum TransformError {
    #[error("unknown transform {0}")]
    Unknown(String),
    #[error("{transform} cannot be applied to {value}")]
    Inapplicable { transform: String, value: String },
}

/// Copy `source_field` through a transform into `target_field`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    pub source_field: String,
    #[serde(default)]
    pub target_field: Option<String>,
    pub transform: String,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

impl TransformConfig {
    pub fn target(&self) -> &str {
        self.target_field.as_deref().unwrap_or(&self.source_field)
    }

    /// Apply to a record in place. Absent source fields are skipped.
    pub fn apply_to(&self, record: &mut Record) -> Result<(), TransformError> {
        let Some(value) = record.get(&self.source_field) else {
            return Ok(());
        };
        let transformed = apply(&self.transform, value, &self.config)?;
        record.insert(self.target(), transformed);
        Ok(())
    }
}

/// Apply a named transform. Null values pass through unchanged.
pub fn apply(
    name: &str,
    value: &Value,
    config: &BTreeMap<String, Value>,
) -> Result<Value, TransformError> {
    if value.is_null() {
        return match name {
            "trim" | "upper" | "lower" | "normalize_phone" | "normalize_email" | "format_date"
            | "round" => Ok(Value::Null),
            other => Err(TransformError::Unknown(other.to_owned())),
        };
    }

    let inapplicable = || TransformError::Inapplicable {
        transform: name.to_owned(),
        value: value.to_string(),
    };

    match name {
        "trim" => Ok(Value::String(value.to_string().trim().to_owned())),
        "upper" => Ok(Value::String(value.to_string().to_uppercase())),
        "lower" => Ok(Value::String(value.to_string().to_lowercase())),
        "normalize_phone" => Ok(Value::String(digits(&value.to_string()))),
        "normalize_email" => Ok(Value::String(value.to_string().trim().to_lowercase())),
        "format_date" => {
            let format = config
                .get("format")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_DATE_FORMAT);
            let ts = value.as_timestamp().ok_or_else(inapplicable)?;
            Ok(Value::String(ts.format(format).to_string()))
        }
        "round" => {
            let precision = config
                .get("precision")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_PRECISION)
                .clamp(0, 12);
            let number = value.as_f64().ok_or_else(inapplicable)?;
            let factor = 10f64.powi(precision as i32);
            Ok(Value::Float((number * factor).round() / factor))
        }
        other => Err(TransformError::Unknown(other.to_owned())),
    }
}

pub fn digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_config() -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    #[test]
    fn test_text_transforms() {
        assert_eq!(apply("trim", &"  a b ".into(), &no_config()), Ok("a b".into()));
        assert_eq!(apply("upper", &"abc".into(), &no_config()), Ok("ABC".into()));
        assert_eq!(apply("lower", &"AbC".into(), &no_config()), Ok("abc".into()));
        assert_eq!(
            apply("normalize_phone", &"+86 138-1234-5678".into(), &no_config()),
            Ok("8613812345678".into())
        );
        assert_eq!(
            apply("normalize_email", &" Alice@Example.COM ".into(), &no_config()),
            Ok("alice@example.com".into())
        );
    }

    #[test]
    fn test_format_date_and_round() {
        let mut config = BTreeMap::new();
        config.insert("format".to_owned(), Value::from("%d/%m/%Y"));
        assert_eq!(
            apply("format_date", &"2024-03-01 10:00:00".into(), &config),
            Ok("01/03/2024".into())
        );
        assert!(matches!(
            apply("format_date", &"soon".into(), &no_config()),
            Err(TransformError::Inapplicable { .. })
        ));

        assert_eq!(apply("round", &Value::Float(3.14159), &no_config()), Ok(Value::Float(3.14)));
        let mut config = BTreeMap::new();
        config.insert("precision".to_owned(), Value::Int(0));
        assert_eq!(apply("round", &"2.6".into(), &config), Ok(Value::Float(3.0)));
    }

    #[test]
    fn test_unknown_transform() {
        assert_eq!(
            apply("reverse", &"abc".into(), &no_config()),
            Err(TransformError::Unknown("reverse".to_owned()))
        );
        assert_eq!(apply("trim", &Value::Null, &no_config()), Ok(Value::Null));
    }

    #[test]
    fn test_transform_config_writes_target_field() {
        let mut record = Record::from_json(json!({"email": " A@B.CO "})).unwrap();
        let config = TransformConfig {
            source_field: "email".to_owned(),
            target_field: Some("email_normalized".to_owned()),
            transform: "normalize_email".to_owned(),
            config: BTreeMap::new(),
        };

        config.apply_to(&mut record).unwrap();

        assert_eq!(record.get_str("email_normalized"), Ok("a@b.co"));
        assert_eq!(record.get_str("email"), Ok(" A@B.CO "));
    }
}
