//! Record matching: exact, fuzzy (edit distance) and rule-based field comparison.
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sync_common::record::{Record, Value};

use crate::transform::digits;

/// A fuzzy field counts as matched at or above this similarity.
pub const FUZZY_FIELD_THRESHOLD: f64 = 0.8;
pub const DEFAULT_RULE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Fuzzy,
    RuleBased,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MatchingRule {
    #[serde(default)]
    pub name: Option<String>,
    pub strategy: MatchStrategy,
    #[serde(alias = "fields")]
    pub match_fields: Vec<String>,
    #[serde(default, alias = "weights")]
    pub weight_config: BTreeMap<String, f64>,
    #[serde(default = "default_threshold", alias = "threshold")]
    pub threshold_score: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_RULE_THRESHOLD
}

impl MatchingRule {
    pub fn new(strategy: MatchStrategy, fields: &[&str]) -> Self {
        Self {
            name: None,
            strategy,
            match_fields: fields.iter().map(|f| f.to_string()).collect(),
            weight_config: BTreeMap::new(),
            threshold_score: DEFAULT_RULE_THRESHOLD,
        }
    }

    /// Configured weight of a field. Missing or zero weights count as 1.
    pub fn weight(&self, field: &str) -> f64 {
        match self.weight_config.get(field) {
            Some(weight) if *weight > 0.0 => *weight,
            _ => 1.0,
        }
    }

    fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{:?}:{}", self.strategy, self.match_fields.join(",")))
    }
}

/// Weighted outcome of comparing two records under one rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleScore {
    pub score: f64,
    pub matched_fields: Vec<String>,
    pub conflict_fields: Vec<String>,
}

/// One strategy's notion of field similarity.
pub trait Matcher: Send + Sync {
    /// Similarity of two non-null values of `field`, in [0, 1].
    fn field_similarity(&self, field: &str, a: &Value, b: &Value) -> f64;

    /// Weighted score over the rule's fields. Fields null or absent on both sides are skipped;
    /// a value on only one side costs its weight without counting as a conflict.
    fn score(&self, a: &Record, b: &Record, rule: &MatchingRule) -> RuleScore {
        let mut matched_fields = Vec::new();
        let mut conflict_fields = Vec::new();
        let mut total_weight = 0.0;
        let mut matched_weight = 0.0;

        for field in &rule.match_fields {
            let (x, y) = (a.value(field), b.value(field));
            if x.is_null() && y.is_null() {
                continue;
            }

            let weight = rule.weight(field);
            total_weight += weight;
            if x.is_null() || y.is_null() {
                continue;
            }

            let similarity = self.field_similarity(field, x, y);
            if similarity >= FUZZY_FIELD_THRESHOLD {
                matched_fields.push(field.clone());
                matched_weight += weight * similarity;
            } else {
                conflict_fields.push(field.clone());
            }
        }

        let score = if total_weight > 0.0 {
            (matched_weight / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        RuleScore {
            score,
            matched_fields,
            conflict_fields,
        }
    }
}

fn normalize(value: &Value) -> String {
    value.to_string().trim().to_lowercase()
}

pub struct ExactMatcher;

impl Matcher for ExactMatcher {
    fn field_similarity(&self, _field: &str, a: &Value, b: &Value) -> f64 {
        match normalize(a) == normalize(b) {
            true => 1.0,
            false => 0.0,
        }
    }
}

pub struct FuzzyMatcher;

impl Matcher for FuzzyMatcher {
    fn field_similarity(&self, _field: &str, a: &Value, b: &Value) -> f64 {
        similarity(&normalize(a), &normalize(b))
    }
}

pub struct RuleBasedMatcher;

impl RuleBasedMatcher {
    /// Canonical form of a field value: phones reduced to digits (landlines to their last 8),
    /// emails lower-cased, id numbers upper-cased.
    pub fn canonicalize(field: &str, value: &Value) -> String {
        let raw = value.to_string();
        match field {
            "phone" | "mobile" => normalize_phone(&raw),
            "email" => raw.trim().to_lowercase(),
            "id_card" | "identity_card" => raw.trim().to_uppercase(),
            _ => raw,
        }
    }
}

impl Matcher for RuleBasedMatcher {
    fn field_similarity(&self, field: &str, a: &Value, b: &Value) -> f64 {
        match Self::canonicalize(field, a) == Self::canonicalize(field, b) {
            true => 1.0,
            false => 0.0,
        }
    }
}

fn normalize_phone(raw: &str) -> String {
    let digits = digits(raw);
    if digits.len() == 11 && digits.starts_with('1') {
        return digits;
    }
    if digits.len() > 11 {
        return digits[digits.len() - 8..].to_owned();
    }
    digits
}

static EXACT: ExactMatcher = ExactMatcher;
static FUZZY: FuzzyMatcher = FuzzyMatcher;
static RULE_BASED: RuleBasedMatcher = RuleBasedMatcher;

/// The matcher registered for a strategy.
pub fn matcher_for(strategy: MatchStrategy) -> &'static dyn Matcher {
    match strategy {
        MatchStrategy::Exact => &EXACT,
        MatchStrategy::Fuzzy => &FUZZY,
        MatchStrategy::RuleBased => &RULE_BASED,
    }
}

/// Levenshtein distance over bytes.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, x) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let cost = usize::from(x != y);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// 1 - distance / longest length. Equal strings score 1; an empty side scores 0 otherwise.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let longest = a.len().max(b.len());
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub source_index: usize,
    pub target_index: usize,
    pub source_record_id: String,
    pub target_record_id: String,
    pub score: f64,
    pub matched_fields: Vec<String>,
    pub conflict_fields: Vec<String>,
    pub is_exact: bool,
    pub rule: String,
    pub rule_threshold: f64,
}

/// Applies matching rules, in order, to every pair of records.
#[derive(Debug, Clone)]
pub struct KeyMatcher {
    rules: Vec<MatchingRule>,
}

impl KeyMatcher {
    pub fn new(rules: Vec<MatchingRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[MatchingRule] {
        &self.rules
    }

    /// Every qualifying pair. For each pair the first rule reaching its threshold wins and no
    /// later rule is tried.
    pub fn match_records(&self, sources: &[Record], targets: &[Record]) -> Vec<MatchResult> {
        let target_ids: Vec<String> = targets.iter().map(Record::content_hash).collect();
        let mut results = Vec::new();

        for (source_index, source) in sources.iter().enumerate() {
            let source_id = source.content_hash();
            for (target_index, target) in targets.iter().enumerate() {
                for rule in &self.rules {
                    let scored = matcher_for(rule.strategy).score(source, target, rule);
                    if scored.score > 0.0 && scored.score >= rule.threshold_score {
                        results.push(MatchResult {
                            source_index,
                            target_index,
                            source_record_id: source_id.clone(),
                            target_record_id: target_ids[target_index].clone(),
                            is_exact: (scored.score - 1.0).abs() < f64::EPSILON,
                            score: scored.score,
                            matched_fields: scored.matched_fields,
                            conflict_fields: scored.conflict_fields,
                            rule: rule.label(),
                            rule_threshold: rule.threshold_score,
                        });
                        break;
                    }
                }
            }
        }

        results
    }
}

/// Pick at most one match per source and per target: highest score first, then the
/// higher rule threshold, then the earliest pair.
pub fn assign_best(mut results: Vec<MatchResult>) -> Vec<MatchResult> {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(
                b.rule_threshold
                    .partial_cmp(&a.rule_threshold)
                    .unwrap_or(Ordering::Equal),
            )
            .then(a.source_index.cmp(&b.source_index))
            .then(a.target_index.cmp(&b.target_index))
    });

    let mut used_sources = HashSet::new();
    let mut used_targets = HashSet::new();
    results
        .into_iter()
        .filter(|result| {
            if used_sources.contains(&result.source_index)
                || used_targets.contains(&result.target_index)
            {
                return false;
            }
            used_sources.insert(result.source_index);
            used_targets.insert(result.target_index);
            true
        })
        .collect()
}
