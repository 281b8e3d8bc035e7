//! Aggregation of records from several sources into one record set.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sync_common::keys::{KeyExtractor, RecordKey};
use sync_common::record::{Record, SourceRecordInfo, Value};
use tracing::debug;

use crate::conflict::{ConflictInfo, ConflictPolicy, ConflictResolver, CustomRule};
use crate::error::AggregationError;
use crate::lineage::{SourceRef, TransformationStep};
use crate::matcher::{assign_best, KeyMatcher, MatchResult, MatchStrategy, MatchingRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    #[default]
    Merge,
    Replace,
    Append,
    Union,
}

impl AggregationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationStrategy::Merge => "merge",
            AggregationStrategy::Replace => "replace",
            AggregationStrategy::Append => "append",
            AggregationStrategy::Union => "union",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationKind {
    Required,
    Type,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationRule {
    #[serde(rename = "type")]
    pub kind: ValidationKind,
    /// Expected type name for `type` rules: `string`, `int`, `float` or `bool`.
    #[serde(default)]
    pub parameter: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ValidationRule {
    fn label(&self) -> String {
        match (&self.message, self.kind) {
            (Some(message), _) => message.clone(),
            (None, ValidationKind::Required) => "required".to_owned(),
            (None, ValidationKind::Type) => {
                format!("type {}", self.parameter.as_deref().unwrap_or("any"))
            }
        }
    }

    fn holds(&self, value: &Value) -> bool {
        match self.kind {
            ValidationKind::Required => !value.is_null(),
            ValidationKind::Type if value.is_null() => true,
            ValidationKind::Type => match self.parameter.as_deref() {
                Some("string") => matches!(value, Value::String(_)),
                Some("int") => matches!(value, Value::Int(_)),
                Some("float") => matches!(value, Value::Float(_)),
                Some("bool") => matches!(value, Value::Bool(_)),
                _ => true,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationFieldMapping {
    pub source_field: String,
    pub target_field: String,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    First,
    #[default]
    Last,
    BestQuality,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DedupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key_fields: Vec<String>,
    #[serde(default)]
    pub strategy: DedupStrategy,
    #[serde(default)]
    pub quality_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationConfig {
    #[serde(default)]
    pub strategy: AggregationStrategy,
    #[serde(default, alias = "matching_rules")]
    pub key_matching_rules: Vec<MatchingRule>,
    #[serde(default)]
    pub field_mappings: Vec<AggregationFieldMapping>,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub field_policies: BTreeMap<String, ConflictPolicy>,
    #[serde(default)]
    pub custom_rules: Vec<CustomRule>,
    #[serde(default, alias = "deduplication_config")]
    pub deduplication: DedupConfig,
}

impl AggregationConfig {
    /// Merge on an exact primary key match, keep the latest value on conflict and collapse
    /// duplicate keys to the most complete record.
    pub fn default_for(primary_key: &[String]) -> Self {
        let fields: Vec<&str> = primary_key.iter().map(String::as_str).collect();
        Self {
            strategy: AggregationStrategy::Merge,
            key_matching_rules: vec![MatchingRule::new(MatchStrategy::Exact, &fields)],
            field_mappings: vec![],
            conflict_policy: ConflictPolicy::KeepLatest,
            field_policies: BTreeMap::new(),
            custom_rules: vec![],
            deduplication: DedupConfig {
                enabled: true,
                key_fields: primary_key.to_vec(),
                strategy: DedupStrategy::BestQuality,
                quality_fields: vec![],
            },
        }
    }
}

/// An output record, the sources that contributed to it and how it was produced.
#[derive(Debug, Clone)]
pub struct AggregatedRecord {
    pub info: SourceRecordInfo,
    pub sources: Vec<SourceRef>,
    pub steps: Vec<TransformationStep>,
}

impl AggregatedRecord {
    fn from_source(info: SourceRecordInfo) -> Self {
        Self {
            sources: vec![SourceRef::from(&info)],
            info,
            steps: vec![],
        }
    }

    pub fn data(&self) -> &Record {
        &self.info.data
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordConflicts {
    pub record_id: String,
    pub conflicts: Vec<ConflictInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationStatistics {
    pub total_source_records: usize,
    pub total_output_records: usize,
    pub matched_pairs: usize,
    pub conflicted_records: usize,
    pub deduplicated_records: usize,
    /// Mean completeness of the output records, in [0, 1].
    pub average_quality: f64,
}

#[derive(Debug)]
pub struct AggregationResult {
    pub records: Vec<AggregatedRecord>,
    pub matches: Vec<MatchResult>,
    pub conflicts: Vec<RecordConflicts>,
    pub statistics: AggregationStatistics,
}

pub struct AggregationEngine {
    config: AggregationConfig,
    matcher: KeyMatcher,
    resolver: ConflictResolver,
}

impl AggregationEngine {
    pub fn new(config: AggregationConfig) -> Self {
        let mut resolver = ConflictResolver::new(config.conflict_policy);
        for (field, policy) in &config.field_policies {
            resolver.set_field_policy(field, *policy);
        }
        for rule in &config.custom_rules {
            resolver.add_custom_rule(rule.clone());
        }

        Self {
            matcher: KeyMatcher::new(config.key_matching_rules.clone()),
            resolver,
            config,
        }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Map, match and merge per strategy, then deduplicate. Fails without a partial result.
    pub fn aggregate(
        &self,
        records: Vec<SourceRecordInfo>,
    ) -> Result<AggregationResult, AggregationError> {
        let total_source_records = records.len();
        let mapped = self.map_fields(records)?;

        let mut matches = Vec::new();
        let mut conflicts = Vec::new();
        let mut output = match self.config.strategy {
            AggregationStrategy::Merge => self.merge(mapped, &mut matches, &mut conflicts),
            AggregationStrategy::Replace => self.replace(mapped),
            AggregationStrategy::Append => mapped.into_iter().map(AggregatedRecord::from_source).collect(),
            AggregationStrategy::Union => self.union(mapped),
        };

        let deduplicated_records = match self.config.deduplication.enabled {
            true => self.deduplicate(&mut output),
            false => 0,
        };

        for record in &mut output {
            record.steps.insert(
                0,
                TransformationStep::new(
                    "aggregation",
                    format!(
                        "{} strategy over {} source record(s)",
                        self.config.strategy.as_str(),
                        record.sources.len()
                    ),
                ),
            );
        }

        let average_quality = match output.is_empty() {
            true => 0.0,
            false => {
                output.iter().map(|r| r.data().completeness()).sum::<f64>() / output.len() as f64
            }
        };

        let statistics = AggregationStatistics {
            total_source_records,
            total_output_records: output.len(),
            matched_pairs: matches.len(),
            conflicted_records: conflicts.len(),
            deduplicated_records,
            average_quality,
        };
        debug!(?statistics, "aggregated records");

        Ok(AggregationResult {
            records: output,
            matches,
            conflicts,
            statistics,
        })
    }

    fn map_fields(
        &self,
        records: Vec<SourceRecordInfo>,
    ) -> Result<Vec<SourceRecordInfo>, AggregationError> {
        if self.config.field_mappings.is_empty() {
            return Ok(records);
        }

        records
            .into_iter()
            .map(|info| {
                let mut mapped = Record::new();
                for mapping in &self.config.field_mappings {
                    let mut value = info.data.value(&mapping.source_field).clone();

                    if value.is_null() && mapping.is_required {
                        value = mapping.default_value.clone().ok_or_else(|| {
                            AggregationError::RequiredField {
                                record_id: info.record_id.clone(),
                                field: mapping.source_field.clone(),
                            }
                        })?;
                    }

                    if let Some(transform) = &mapping.transform {
                        value = map_transform(transform, value).map_err(|reason| {
                            AggregationError::Transform {
                                record_id: info.record_id.clone(),
                                transform: transform.clone(),
                                reason,
                            }
                        })?;
                    }

                    if let Some(rule) = mapping.validation_rules.iter().find(|r| !r.holds(&value)) {
                        return Err(AggregationError::Validation {
                            record_id: info.record_id.clone(),
                            field: mapping.source_field.clone(),
                            rule: rule.label(),
                        });
                    }

                    mapped.insert(mapping.target_field.clone(), value);
                }
                Ok(info.with_data(mapped))
            })
            .collect()
    }

    /// Match each further source against the records merged so far. The earlier record is the
    /// source side of conflict resolution.
    fn merge(
        &self,
        records: Vec<SourceRecordInfo>,
        matches: &mut Vec<MatchResult>,
        conflicts: &mut Vec<RecordConflicts>,
    ) -> Vec<AggregatedRecord> {
        let mut merged: Vec<AggregatedRecord> = Vec::new();

        for group in source_groups(records) {
            if merged.is_empty() {
                merged.extend(group.into_iter().map(AggregatedRecord::from_source));
                continue;
            }

            let existing: Vec<Record> = merged.iter().map(|r| r.data().clone()).collect();
            let incoming: Vec<Record> = group.iter().map(|r| r.data.clone()).collect();
            let assigned = assign_best(self.matcher.match_records(&existing, &incoming));

            let mut consumed = vec![false; group.len()];
            for result in &assigned {
                let candidate = &group[result.target_index];
                let entry = &mut merged[result.source_index];

                let (data, field_conflicts) = self.resolver.resolve(entry.data(), &candidate.data);
                if !field_conflicts.is_empty() {
                    conflicts.push(RecordConflicts {
                        record_id: entry.info.record_id.clone(),
                        conflicts: field_conflicts,
                    });
                }

                let last_updated = entry.info.last_updated.max(candidate.last_updated);
                entry.info = entry.info.with_data(data);
                entry.info.last_updated = last_updated;
                entry.sources.push(SourceRef::from(candidate));
                consumed[result.target_index] = true;
            }
            matches.extend(assigned);

            merged.extend(
                group
                    .into_iter()
                    .zip(consumed)
                    .filter(|(_, used)| !used)
                    .map(|(info, _)| AggregatedRecord::from_source(info)),
            );
        }

        merged
    }

    fn record_key(&self) -> KeyExtractor {
        KeyExtractor::new(&self.config.deduplication.key_fields)
    }

    /// Keep the most recently updated record per content key, at the key's first position.
    fn replace(&self, records: Vec<SourceRecordInfo>) -> Vec<AggregatedRecord> {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut output: Vec<AggregatedRecord> = Vec::new();

        for info in records {
            let key = info.data.content_hash();
            match positions.get(&key) {
                Some(&position) => {
                    if info.last_updated > output[position].info.last_updated {
                        output[position] = AggregatedRecord::from_source(info);
                    }
                }
                None => {
                    positions.insert(key, output.len());
                    output.push(AggregatedRecord::from_source(info));
                }
            }
        }

        output
    }

    /// Skip records whose content was already seen.
    fn union(&self, records: Vec<SourceRecordInfo>) -> Vec<AggregatedRecord> {
        let mut seen = std::collections::HashSet::new();
        records
            .into_iter()
            .filter(|info| seen.insert(info.data.content_hash()))
            .map(AggregatedRecord::from_source)
            .collect()
    }

    /// Collapse records sharing the dedup key. Returns how many were dropped.
    fn deduplicate(&self, records: &mut Vec<AggregatedRecord>) -> usize {
        let config = &self.config.deduplication;
        if config.key_fields.is_empty() {
            return 0;
        }

        let extractor = self.record_key();
        let mut positions: HashMap<RecordKey, usize> = HashMap::new();
        let mut kept: Vec<AggregatedRecord> = Vec::with_capacity(records.len());
        let mut dropped = 0;

        for record in records.drain(..) {
            let key = extractor.extract(record.data());
            let Some(&position) = positions.get(&key) else {
                positions.insert(key, kept.len());
                kept.push(record);
                continue;
            };

            dropped += 1;
            let replace = match config.strategy {
                DedupStrategy::First => false,
                DedupStrategy::Last => true,
                DedupStrategy::BestQuality => {
                    quality_of(record.data(), &config.quality_fields)
                        > quality_of(kept[position].data(), &config.quality_fields)
                }
            };
            if replace {
                kept[position] = record;
            }
        }

        *records = kept;
        dropped
    }
}

/// Records grouped by originating source, in order of first appearance.
fn source_groups(records: Vec<SourceRecordInfo>) -> Vec<Vec<SourceRecordInfo>> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<SourceRecordInfo>> = Vec::new();

    for info in records {
        let source = (info.source_library_id.clone(), info.source_interface_id.clone());
        let position = *index.entry(source).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[position].push(info);
    }

    groups
}

/// Share of `fields` that hold a value, or overall completeness without fields.
fn quality_of(record: &Record, fields: &[String]) -> f64 {
    if fields.is_empty() {
        return record.completeness();
    }
    let present = fields.iter().filter(|f| !record.value(f).is_null()).count();
    present as f64 / fields.len() as f64
}

fn map_transform(name: &str, value: Value) -> Result<Value, String> {
    let Value::String(text) = value else {
        return match name {
            "trim" | "upper" | "lower" => Ok(value),
            other => Err(format!("unknown mapping transform {}", other)),
        };
    };

    match name {
        "trim" => Ok(Value::String(text.trim().to_owned())),
        "upper" => Ok(Value::String(text.to_uppercase())),
        "lower" => Ok(Value::String(text.to_lowercase())),
        other => Err(format!("unknown mapping transform {}", other)),
    }
}
