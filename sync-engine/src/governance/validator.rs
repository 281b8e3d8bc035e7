//! Field validation and value classification shared by cleansing and the quality checkers.
use std::collections::HashMap;

use chrono::NaiveDate;
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sync_common::record::Value;

use crate::error::ConfigError;
use crate::transform::digits;

// A pattern that fails to compile matches nothing.
static EMAIL: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").ok());
static MOBILE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^1[3-9]\d{9}$").ok());
static ID_CARD: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^[1-9]\d{5}(18|19|20)\d{2}((0[1-9])|(1[0-2]))(([0-2][1-9])|10|20|30|31)\d{3}[0-9Xx]$")
        .ok()
});

/// Value formats recognised by consistency checks, tried in this order.
static FORMATS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("date_yyyy_mm_dd", r"^\d{4}-\d{2}-\d{2}$"),
        ("date_yyyy_mm_dd_hms", r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}$"),
        ("phone_11_digits", r"^1\d{10}$"),
        ("email", r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$"),
        ("number_integer", r"^-?\d+$"),
        ("number_decimal", r"^-?\d+\.\d+$"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|regex| (name, regex)))
    .collect()
});

const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];
const DATETIME_LAYOUTS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S"];

/// Regexes compiled once per run, looked up by their source text.
#[derive(Debug, Clone, Default)]
pub struct PatternCache {
    compiled: HashMap<String, Regex>,
}

impl PatternCache {
    pub fn compile(&mut self, rule_id: &str, pattern: &str) -> Result<(), ConfigError> {
        if self.compiled.contains_key(pattern) {
            return Ok(());
        }
        let regex = Regex::new(pattern).map_err(|error| ConfigError::InvalidPattern {
            rule_id: rule_id.to_owned(),
            pattern: pattern.to_owned(),
            error,
        })?;
        self.compiled.insert(pattern.to_owned(), regex);
        Ok(())
    }

    /// Whether `text` matches a pattern. Patterns that were never compiled do not match.
    pub fn is_match(&self, pattern: &str, text: &str) -> bool {
        self.compiled
            .get(pattern)
            .map(|regex| regex.is_match(text))
            .unwrap_or(false)
    }
}

/// Checks applied by `validate` cleansing actions and validity rules.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FieldValidation {
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
}

impl FieldValidation {
    pub fn compile(&self, rule_id: &str, patterns: &mut PatternCache) -> Result<(), ConfigError> {
        match &self.pattern {
            Some(pattern) => patterns.compile(rule_id, pattern),
            None => Ok(()),
        }
    }

    /// The first failed check, described. Length and pattern only apply to strings.
    pub fn validate(&self, value: &Value, patterns: &PatternCache) -> Result<(), String> {
        if value.is_null() {
            return match self.required {
                true => Err("value is required".to_owned()),
                false => Ok(()),
            };
        }

        if let Some(expected) = &self.value_type {
            if !has_type(value, expected) {
                return Err(format!("expected type {}", expected));
            }
        }

        if let Value::String(text) = value {
            if let Some(max) = self.max_length {
                if text.chars().count() > max {
                    return Err(format!("longer than {} characters", max));
                }
            }
            if let Some(pattern) = &self.pattern {
                if !patterns.is_match(pattern, text) {
                    return Err(format!("does not match pattern {}", pattern));
                }
            }
        }

        Ok(())
    }
}

/// Unknown type names accept every value.
pub fn has_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => matches!(value, Value::String(_)),
        "int" | "integer" => matches!(value, Value::Int(_)),
        "float" | "number" => matches!(value, Value::Float(_) | Value::Int(_)),
        "bool" | "boolean" => matches!(value, Value::Bool(_)),
        _ => true,
    }
}

fn matches(pattern: &Lazy<Option<Regex>>, text: &str) -> bool {
    pattern.as_ref().is_some_and(|regex| regex.is_match(text))
}

pub fn is_email(text: &str) -> bool {
    matches(&EMAIL, text)
}

/// Mainland mobile numbers, after stripping everything but digits.
pub fn is_mobile(text: &str) -> bool {
    matches(&MOBILE, &digits(text))
}

pub fn is_id_card(text: &str) -> bool {
    matches(&ID_CARD, text)
}

pub fn is_date(text: &str) -> bool {
    let text = text.trim();
    DATE_LAYOUTS
        .iter()
        .any(|layout| NaiveDate::parse_from_str(text, layout).is_ok())
        || DATETIME_LAYOUTS
            .iter()
            .any(|layout| NaiveDateTime::parse_from_str(text, layout).is_ok())
}

pub fn is_number(text: &str) -> bool {
    text.trim().parse::<f64>().is_ok()
}

/// Format class of a value's text form, `text` when nothing more specific applies.
pub fn value_format(text: &str) -> &'static str {
    FORMATS
        .iter()
        .find(|(_, regex)| regex.is_match(text))
        .map(|(name, _)| *name)
        .unwrap_or("text")
}

/// Type class of a value. Strings holding numbers are told apart from other strings.
pub fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Int(_) => "integer",
        Value::Float(_) => "float",
        Value::Bool(_) => "boolean",
        Value::Timestamp(_) => "datetime",
        Value::String(s) if s.parse::<i64>().is_ok() => "string_integer",
        Value::String(s) if s.parse::<f64>().is_ok() => "string_float",
        Value::String(_) => "string",
        Value::Map(_) => "map",
        Value::List(_) => "list",
        Value::Null => "null",
    }
}
