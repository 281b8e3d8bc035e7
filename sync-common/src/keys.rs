//! Primary key extraction and content hashing shared by matching, merging and writing.
use std::fmt;

use crate::record::Record;

/// Field names tried, in order, when a record has no declared key.
pub const FALLBACK_KEY_FIELDS: &[&str] = &["id", "uuid", "primary_key", "pk"];

/// Identity of a record: either its key field values or, when any key field is absent,
/// a digest of its full content so that partial keys never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Fields(Vec<String>),
    ContentHash(String),
}

impl RecordKey {
    pub fn is_content_hash(&self) -> bool {
        matches!(self, RecordKey::ContentHash(_))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Fields(parts) => f.write_str(&parts.join("_")),
            RecordKey::ContentHash(hash) => write!(f, "hash_{}", hash),
        }
    }
}

/// Extracts `RecordKey`s for a fixed list of key fields.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyExtractor {
    fields: Vec<String>,
}

impl KeyExtractor {
    pub fn new<S: AsRef<str>>(fields: &[S]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.as_ref().to_owned()).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Key field values when every key field holds a non-null value.
    pub fn complete_key(&self, record: &Record) -> Option<Vec<String>> {
        if self.fields.is_empty() {
            return None;
        }

        self.try_key(record).ok()
    }

    /// Key field values, or the first key field that is absent or null.
    pub fn try_key(&self, record: &Record) -> Result<Vec<String>, &str> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            match record.get(field) {
                Some(value) if !value.is_null() => parts.push(value.to_string()),
                _ => return Err(field.as_str()),
            }
        }

        Ok(parts)
    }

    pub fn extract(&self, record: &Record) -> RecordKey {
        match self.complete_key(record) {
            Some(parts) => RecordKey::Fields(parts),
            None => RecordKey::ContentHash(record.content_hash()),
        }
    }
}

/// Value of the first conventional identifier field present on the record.
pub fn fallback_identifier(record: &Record) -> Option<String> {
    FALLBACK_KEY_FIELDS
        .iter()
        .filter_map(|field| record.get(field))
        .find(|value| !value.is_empty_value())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::from_json(value).unwrap()
    }

    #[test]
    fn test_composite_key_requires_every_field() {
        let extractor = KeyExtractor::new(&["tenant", "id"]);

        let full = record(json!({"tenant": "a", "id": 7, "name": "x"}));
        assert_eq!(
            extractor.extract(&full),
            RecordKey::Fields(vec!["a".to_owned(), "7".to_owned()])
        );
        assert_eq!(extractor.extract(&full).to_string(), "a_7");

        let partial_one = record(json!({"tenant": "a", "name": "x"}));
        let partial_two = record(json!({"tenant": "a", "name": "y"}));
        let key_one = extractor.extract(&partial_one);
        let key_two = extractor.extract(&partial_two);

        assert!(key_one.is_content_hash());
        assert_ne!(key_one, key_two);
    }

    #[test]
    fn test_try_key_names_the_missing_field() {
        let extractor = KeyExtractor::new(&["tenant", "id"]);

        assert_eq!(
            extractor.try_key(&record(json!({"tenant": "a", "id": 7}))),
            Ok(vec!["a".to_owned(), "7".to_owned()])
        );
        assert_eq!(extractor.try_key(&record(json!({"tenant": "a", "id": null}))), Err("id"));
        assert_eq!(extractor.try_key(&record(json!({"id": 7}))), Err("tenant"));
    }

    #[test]
    fn test_null_key_values_fall_back_to_content_hash() {
        let extractor = KeyExtractor::new(&["id"]);
        let key = extractor.extract(&record(json!({"id": null, "name": "x"})));

        assert!(key.to_string().starts_with("hash_"));
    }

    #[test]
    fn test_fallback_identifier_order() {
        assert_eq!(
            fallback_identifier(&record(json!({"pk": 3, "uuid": "u-1"}))),
            Some("u-1".to_owned())
        );
        assert_eq!(fallback_identifier(&record(json!({"name": "x"}))), None);
    }
}
