//! Field masking and the sensitive-data compliance check.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sync_common::record::{hex_encode, Record, Value};
use tracing::{debug, warn};

pub const SENSITIVE_FIELDS: &[&str] = &[
    "id_card",
    "identity_card",
    "passport",
    "phone",
    "mobile",
    "email",
    "address",
    "name",
    "birthday",
    "salary",
];

const MASK_MARKERS: &[&str] = &["*", "PSEUDO_", "anonymous", "Anonym"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskingStrategy {
    Full,
    Partial,
    Tokenize,
    Encrypt,
    Anonymize,
    Pseudonymize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityLevel {
    Public,
    #[default]
    Internal,
    Restricted,
    Confidential,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MaskingConfig {
    #[serde(default)]
    pub mask_char: Option<String>,
    #[serde(default)]
    pub prefix_length: Option<usize>,
    #[serde(default)]
    pub suffix_length: Option<usize>,
    #[serde(default)]
    pub data_type: Option<String>,
}

impl MaskingConfig {
    fn mask_char(&self) -> &str {
        match self.mask_char.as_deref() {
            Some(c) if !c.is_empty() => c,
            _ => "*",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PrivacyRule {
    pub id: String,
    /// Regex over field names. An invalid regex matches the field with exactly this name.
    pub field_pattern: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub sensitivity_level: SensitivityLevel,
    pub masking_strategy: MaskingStrategy,
    #[serde(default)]
    pub masking_config: MaskingConfig,
    #[serde(default = "enabled")]
    pub is_enabled: bool,
}

fn enabled() -> bool {
    true
}

impl PrivacyRule {
    fn data_type(&self) -> &str {
        self.masking_config
            .data_type
            .as_deref()
            .or(self.data_type.as_deref())
            .unwrap_or("string")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaskingLogEntry {
    pub field: String,
    pub strategy: MaskingStrategy,
    pub masked_value: String,
    pub rule_id: String,
    pub masked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MaskingResult {
    pub record: Record,
    pub applied_rules: Vec<String>,
    pub log: Vec<MaskingLogEntry>,
}

enum FieldMatcher {
    Pattern(Regex),
    Exact(String),
}

impl FieldMatcher {
    fn new(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => FieldMatcher::Pattern(regex),
            Err(error) => {
                warn!(pattern, %error, "invalid field pattern, matching the exact field name");
                FieldMatcher::Exact(pattern.to_owned())
            }
        }
    }

    fn matches(&self, field: &str) -> bool {
        match self {
            FieldMatcher::Pattern(regex) => regex.is_match(field),
            FieldMatcher::Exact(name) => name == field,
        }
    }
}

/// Applies privacy rules to records. Tokens are stable per plaintext for the engine's lifetime.
pub struct PrivacyEngine {
    rules: Vec<(PrivacyRule, FieldMatcher)>,
    tokens: HashMap<String, String>,
}

impl PrivacyEngine {
    pub fn new(rules: &[PrivacyRule]) -> Self {
        let rules = rules
            .iter()
            .filter(|rule| rule.is_enabled)
            .map(|rule| (rule.clone(), FieldMatcher::new(&rule.field_pattern)))
            .collect();
        Self {
            rules,
            tokens: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn mask_record(&mut self, record: &Record) -> MaskingResult {
        let mut masked = record.clone();
        let mut applied_rules = Vec::new();
        let mut log = Vec::new();

        for (rule, matcher) in &self.rules {
            let fields: Vec<String> = masked
                .keys()
                .filter(|field| matcher.matches(field))
                .cloned()
                .collect();
            if fields.is_empty() {
                continue;
            }

            for field in fields {
                let value = masked.value(&field);
                if value.is_null() {
                    continue;
                }
                let text = value.to_string();
                let replaced = match text.is_empty() {
                    true => String::new(),
                    false => mask_value(&mut self.tokens, rule, &text),
                };

                log.push(MaskingLogEntry {
                    field: field.clone(),
                    strategy: rule.masking_strategy,
                    masked_value: replaced.clone(),
                    rule_id: rule.id.clone(),
                    masked_at: Utc::now(),
                });
                masked.insert(field, replaced);
            }
            applied_rules.push(rule.id.clone());
        }

        if !log.is_empty() {
            debug!(fields = log.len(), rules = ?applied_rules, "masked record");
        }

        MaskingResult {
            record: masked,
            applied_rules,
            log,
        }
    }
}

fn mask_value(tokens: &mut HashMap<String, String>, rule: &PrivacyRule, text: &str) -> String {
    let config = &rule.masking_config;
    match rule.masking_strategy {
        MaskingStrategy::Full => full_mask(text, config.mask_char()),
        MaskingStrategy::Partial => partial_mask(
            text,
            config.prefix_length.unwrap_or(2),
            config.suffix_length.unwrap_or(2),
            config.mask_char(),
        ),
        MaskingStrategy::Tokenize => tokens
            .entry(text.to_owned())
            .or_insert_with(new_token)
            .clone(),
        MaskingStrategy::Encrypt => sha256_hex(text),
        MaskingStrategy::Anonymize => anonymize(text, rule.data_type()),
        MaskingStrategy::Pseudonymize => pseudonymize(text, rule.data_type()),
    }
}

pub fn full_mask(text: &str, mask_char: &str) -> String {
    mask_char.repeat(text.chars().count())
}

/// Keeps `prefix` leading and `suffix` trailing characters. Shorter values are fully masked.
pub fn partial_mask(text: &str, prefix: usize, suffix: usize, mask_char: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= prefix + suffix {
        return full_mask(text, mask_char);
    }

    let head: String = chars[..prefix].iter().collect();
    let tail: String = chars[chars.len() - suffix..].iter().collect();
    format!(
        "{}{}{}",
        head,
        mask_char.repeat(chars.len() - prefix - suffix),
        tail
    )
}

fn new_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn sha256_hex(text: &str) -> String {
    hex_encode(&Sha256::digest(text.as_bytes()))
}

pub fn anonymize(text: &str, data_type: &str) -> String {
    match data_type {
        "name" => "Anonymous".to_owned(),
        "email" => match text.split_once('@') {
            Some((_, domain)) if !domain.contains('@') => format!("anonymous@{}", domain),
            _ => "anonymous@example.com".to_owned(),
        },
        "phone" => {
            let chars: Vec<char> = text.chars().collect();
            match chars.len() >= 7 {
                true => format!(
                    "{}****{}",
                    chars[..3].iter().collect::<String>(),
                    chars[chars.len() - 4..].iter().collect::<String>()
                ),
                false => "****".to_owned(),
            }
        }
        "address" => "Anonymized address".to_owned(),
        _ => "***".to_owned(),
    }
}

/// Deterministic replacement derived from the value's SHA-256 digest.
pub fn pseudonymize(text: &str, data_type: &str) -> String {
    let digest = sha256_hex(text);
    let short = &digest[..8];
    match data_type {
        "name" => format!("User_{}", short),
        "email" => format!("user_{}@example.com", short),
        "phone" => format!("138{}", short),
        _ => format!("PSEUDO_{}", short),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceFramework {
    #[default]
    Gdpr,
    Ccpa,
    Pipl,
    Hipaa,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceViolation {
    pub record_index: usize,
    pub field: String,
    pub rule: &'static str,
    pub severity: &'static str,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceReport {
    pub framework: ComplianceFramework,
    pub is_compliant: bool,
    pub violations: Vec<ComplianceViolation>,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Flags well-known sensitive fields that still hold unmasked values.
pub fn check_compliance(records: &[Record], framework: ComplianceFramework) -> ComplianceReport {
    let mut violations = Vec::new();

    for (record_index, record) in records.iter().enumerate() {
        for field in SENSITIVE_FIELDS {
            let value = record.value(field);
            if value.is_null() || is_masked(value) {
                continue;
            }
            violations.push(ComplianceViolation {
                record_index,
                field: (*field).to_owned(),
                rule: "sensitive_data_protection",
                severity: "high",
                description: format!("sensitive field {} is not masked", field),
            });
        }
    }

    let is_compliant = violations.is_empty();
    let recommendations = match is_compliant {
        true => vec![],
        false => vec!["apply a masking strategy to the sensitive fields".to_owned()],
    };

    ComplianceReport {
        framework,
        is_compliant,
        violations,
        recommendations,
        checked_at: Utc::now(),
    }
}

fn is_masked(value: &Value) -> bool {
    let text = value.to_string();
    MASK_MARKERS.iter().any(|marker| text.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules(value: serde_json::Value) -> Vec<PrivacyRule> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_masking_helpers() {
        assert_eq!(partial_mask("13812345678", 3, 4, "*"), "138****5678");
        assert_eq!(partial_mask("abcd", 2, 2, "#"), "####");
        assert_eq!(partial_mask("张三丰先生", 1, 1, "*"), "张***生");
        assert_eq!(full_mask("x", "*"), "*");

        assert_eq!(anonymize("ann@corp.io", "email"), "anonymous@corp.io");
        assert_eq!(anonymize("13812345678", "phone"), "138****5678");
        assert_eq!(anonymize("Ann", "name"), "Anonymous");
        assert_eq!(anonymize("whatever", "other"), "***");
    }

    #[test]
    fn test_pseudonyms_are_stable() {
        let first = pseudonymize("Ann", "name");
        assert_eq!(first, pseudonymize("Ann", "name"));
        assert!(first.starts_with("User_"));
        assert_eq!(first.len(), "User_".len() + 8);
        assert_ne!(first, pseudonymize("Bob", "name"));
        assert!(pseudonymize("x", "ssn").starts_with("PSEUDO_"));
    }

    #[test]
    fn test_engine_masks_matching_fields() {
        let mut engine = PrivacyEngine::new(&rules(json!([
            {"id": "phone", "field_pattern": "^(phone|mobile)$", "masking_strategy": "partial",
             "masking_config": {"prefix_length": 3, "suffix_length": 4}},
            {"id": "card", "field_pattern": "card_no", "masking_strategy": "tokenize"},
            {"id": "broken", "field_pattern": "id_card(", "masking_strategy": "full"},
            {"id": "off", "field_pattern": "name", "masking_strategy": "full", "is_enabled": false}
        ])));

        let record = Record::from_json(json!({
            "phone": "13812345678",
            "mobile": null,
            "card_no": "6222",
            "id_card(": "secret",
            "name": "Ann"
        }))
        .unwrap();

        let first = engine.mask_record(&record);
        assert_eq!(first.record.get_str("phone"), Ok("138****5678"));
        assert!(first.record.value("mobile").is_null());
        assert_eq!(first.record.get_str("id_card("), Ok("******"));
        assert_eq!(first.record.get_str("name"), Ok("Ann"));
        assert_eq!(first.applied_rules, vec!["phone", "card", "broken"]);
        assert_eq!(first.log.len(), 3);

        let token = first.record.get_str("card_no").unwrap().to_owned();
        assert_eq!(token.len(), 32);
        let second = engine.mask_record(&record);
        assert_eq!(second.record.get_str("card_no"), Ok(token.as_str()));
    }

    #[test]
    fn test_compliance() {
        let records: Vec<Record> = [
            json!({"phone": "138****5678", "name": "Anonymous", "city": "x"}),
            json!({"email": "a@b.cn", "salary": null}),
        ]
        .into_iter()
        .map(|v| Record::from_json(v).unwrap())
        .collect();

        let report = check_compliance(&records, ComplianceFramework::Pipl);
        assert!(!report.is_compliant);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].field, "email");
        assert_eq!(report.violations[0].record_index, 1);

        let report = check_compliance(&records[..1], ComplianceFramework::default());
        assert!(report.is_compliant);
        assert_eq!(report.framework, ComplianceFramework::Gdpr);
    }
}
