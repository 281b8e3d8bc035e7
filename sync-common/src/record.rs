//! Schema-less records shared by every stage of a sync run.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Layout used when a timestamp is rendered as plain text.
pub const DISPLAY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// Enumeration of errors raised when reading typed values out of a `Record`.
#[derive(Error, Debug, PartialEq)]
pub enum RecordError {
    #[error("field {field} is missing")]
    Missing { field: String },
    #[error("field {field} expected {expected} but found {actual}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("expected a JSON object but found {0}")]
    NotAnObject(&'static str),
}

pub type RecordResult<T> = std::result::Result<T, RecordError>;

/// A dynamically typed field value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// A value is empty when it is null or its text form is blank or a null marker.
    pub fn is_empty_value(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => matches!(s.trim(), "" | "null" | "NULL" | "nil"),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of the value. Strings are parsed after trimming.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => {
                let i = *f as i64;
                (i as f64 == *f).then_some(i)
            }
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Timestamp view of the value. Strings are parsed with the accepted layouts and integers
    /// are read as unix seconds.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::String(s) => parse_timestamp(s),
            Value::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
            _ => None,
        }
    }

    /// Deterministic text form with sorted map keys, used for equality, hashing and content keys.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) if f.is_finite() => out.push_str(&f.to_string()),
            Value::Float(_) => out.push_str("null"),
            Value::String(s) => out.push_str(&serde_json::Value::String(s.clone()).to_string()),
            Value::Timestamp(ts) => {
                out.push_str(&serde_json::Value::String(ts.to_rfc3339()).to_string())
            }
            Value::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_canonical(out);
                }
                out.push(']');
            }
            Value::Map(map) => {
                out.push('{');
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String(key.clone()).to_string());
                    out.push(':');
                    value.write_canonical(out);
                }
                out.push('}');
            }
        }
    }
}

/// Compare two values numerically when both read as numbers, otherwise by their text form.
pub fn compare_loose(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Parse a timestamp from any of the layouts sources are known to produce.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|naive| Utc.from_utc_datetime(&naive));
        }
    }

    None
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => f.write_str(s),
            Value::Timestamp(ts) => write!(f, "{}", ts.format(DISPLAY_TIMESTAMP_FORMAT)),
            Value::List(_) | Value::Map(_) => f.write_str(&self.canonical()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

/// A mapping from field name to value. Field order is always sorted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build a record from a JSON object.
    pub fn from_json(value: serde_json::Value) -> RecordResult<Self> {
        match Value::from(value) {
            Value::Map(map) => Ok(Self(map)),
            other => Err(RecordError::NotAnObject(other.type_name())),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Value of a field, with absent fields read as `Value::Null`.
    pub fn value(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.0.get(field).unwrap_or(&NULL)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains_key(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }

    fn required(&self, field: &str) -> RecordResult<&Value> {
        match self.0.get(field) {
            None | Some(Value::Null) => Err(RecordError::Missing {
                field: field.to_owned(),
            }),
            Some(value) => Ok(value),
        }
    }

    fn mismatch(field: &str, expected: &'static str, actual: &Value) -> RecordError {
        RecordError::TypeMismatch {
            field: field.to_owned(),
            expected,
            actual: actual.type_name(),
        }
    }

    pub fn get_str(&self, field: &str) -> RecordResult<&str> {
        let value = self.required(field)?;
        value
            .as_str()
            .ok_or_else(|| Self::mismatch(field, "string", value))
    }

    pub fn get_i64(&self, field: &str) -> RecordResult<i64> {
        let value = self.required(field)?;
        value
            .as_i64()
            .ok_or_else(|| Self::mismatch(field, "int", value))
    }

    pub fn get_f64(&self, field: &str) -> RecordResult<f64> {
        let value = self.required(field)?;
        value
            .as_f64()
            .ok_or_else(|| Self::mismatch(field, "float", value))
    }

    pub fn get_bool(&self, field: &str) -> RecordResult<bool> {
        let value = self.required(field)?;
        value
            .as_bool()
            .ok_or_else(|| Self::mismatch(field, "bool", value))
    }

    pub fn get_timestamp(&self, field: &str) -> RecordResult<DateTime<Utc>> {
        let value = self.required(field)?;
        value
            .as_timestamp()
            .ok_or_else(|| Self::mismatch(field, "timestamp", value))
    }

    /// Share of fields holding a non-empty value, in [0, 1]. An empty record scores 0.
    pub fn completeness(&self) -> f64 {
        if self.0.is_empty() {
            return 0.0;
        }
        let filled = self.0.values().filter(|v| !v.is_empty_value()).count();
        filled as f64 / self.0.len() as f64
    }

    /// Sorted-key serialization of the whole record.
    pub fn canonical(&self) -> String {
        let mut out = String::from("{");
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&serde_json::Value::String(key.clone()).to_string());
            out.push(':');
            value.write_canonical(&mut out);
        }
        out.push('}');
        out
    }

    /// Hex encoded SHA-256 digest of the canonical serialization.
    pub fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        hex_encode(&digest)
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl From<BTreeMap<String, Value>> for Record {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A fetched record together with where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecordInfo {
    pub source_library_id: String,
    pub source_interface_id: String,
    pub record_id: String,
    pub data: Record,
    /// Quality estimate in [0, 1].
    pub quality: f64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl SourceRecordInfo {
    pub fn new(
        source_library_id: &str,
        source_interface_id: &str,
        record_id: String,
        data: Record,
        last_updated: DateTime<Utc>,
    ) -> Self {
        let quality = data.completeness();
        Self {
            source_library_id: source_library_id.to_owned(),
            source_interface_id: source_interface_id.to_owned(),
            record_id,
            data,
            quality,
            last_updated,
            metadata: BTreeMap::new(),
        }
    }

    /// Copy of this record's provenance carrying different data.
    pub fn with_data(&self, data: Record) -> Self {
        Self {
            source_library_id: self.source_library_id.clone(),
            source_interface_id: self.source_interface_id.clone(),
            record_id: self.record_id.clone(),
            quality: data.completeness(),
            data,
            last_updated: self.last_updated,
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_form_ignores_insertion_order() {
        let mut a = Record::new();
        a.insert("b", 2);
        a.insert("a", "x");
        let mut b = Record::new();
        b.insert("a", "x");
        b.insert("b", 2);

        assert_eq!(a, b);
        assert_eq!(a.canonical(), r#"{"a":"x","b":2}"#);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_canonical_form_keeps_types_apart() {
        let a = Record::from_json(json!({"id": 1})).unwrap();
        let b = Record::from_json(json!({"id": "1"})).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert_eq!(
            Record::from_json(json!([1, 2])),
            Err(RecordError::NotAnObject("list"))
        );
    }

    #[test]
    fn test_typed_getters_report_failures() {
        let record = Record::from_json(json!({
            "name": "alice",
            "age": "42",
            "score": 9.5,
            "active": true,
            "created_at": "2024-03-01 10:00:00",
            "empty": null,
        }))
        .unwrap();

        assert_eq!(record.get_str("name"), Ok("alice"));
        assert_eq!(record.get_i64("age"), Ok(42));
        assert_eq!(record.get_f64("score"), Ok(9.5));
        assert_eq!(record.get_bool("active"), Ok(true));
        assert_eq!(
            record.get_timestamp("created_at").unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );
        assert_eq!(
            record.get_i64("name"),
            Err(RecordError::TypeMismatch {
                field: "name".to_owned(),
                expected: "int",
                actual: "string"
            })
        );
        assert_eq!(
            record.get_str("empty"),
            Err(RecordError::Missing {
                field: "empty".to_owned()
            })
        );
        assert_eq!(
            record.get_str("nope"),
            Err(RecordError::Missing {
                field: "nope".to_owned()
            })
        );
    }

    #[test]
    fn test_json_numbers_keep_integer_precision() {
        assert_eq!(Value::from(json!(9007199254740993i64)), Value::Int(9007199254740993));
        assert_eq!(Value::from(json!(1.5)), Value::Float(1.5));
    }

    #[test]
    fn test_empty_values() {
        assert!(Value::Null.is_empty_value());
        assert!(Value::from("  ").is_empty_value());
        assert!(Value::from("NULL").is_empty_value());
        assert!(Value::from("nil").is_empty_value());
        assert!(!Value::from("0").is_empty_value());
        assert!(!Value::Int(0).is_empty_value());
    }

    #[test]
    fn test_display_formats_timestamps_as_plain_text() {
        let ts = parse_timestamp("2024-01-02T03:04:05Z").unwrap();
        assert_eq!(Value::Timestamp(ts).to_string(), "2024-01-02 03:04:05");
        assert_eq!(Value::Float(3.0).to_string(), "3");
        assert_eq!(Value::Null.to_string(), "");
    }

    #[test]
    fn test_parse_timestamp_layouts() {
        for raw in [
            "2024-01-02 03:04:05",
            "2024-01-02T03:04:05",
            "2024-01-02T03:04:05Z",
            "2024-01-02T03:04:05+00:00",
            "2024-01-02T03:04:05.000123",
        ] {
            let ts = parse_timestamp(raw).unwrap();
            assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-01-02 03:04:05");
        }
        assert!(parse_timestamp("2024-01-02").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_compare_loose_prefers_numbers() {
        assert_eq!(
            compare_loose(&Value::from("10"), &Value::from("9")),
            Ordering::Greater
        );
        assert_eq!(
            compare_loose(&Value::from("b"), &Value::from("a")),
            Ordering::Greater
        );
        assert_eq!(compare_loose(&Value::Int(2), &Value::Float(2.0)), Ordering::Equal);
    }

    #[test]
    fn test_completeness() {
        let record = Record::from_json(json!({"a": 1, "b": null, "c": "null", "d": "x"})).unwrap();
        assert_eq!(record.completeness(), 0.5);
        assert_eq!(Record::new().completeness(), 0.0);
    }
}
