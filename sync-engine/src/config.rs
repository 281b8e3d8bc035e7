//! Sync requests and the typed configuration parsed from their free-form `config` map.
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sync_common::record::Value;
use tracing::warn;

use crate::aggregation::AggregationConfig;
use crate::error::ConfigError;
use crate::governance::GovernanceConfig;
use crate::transform::TransformConfig;

const RECOGNIZED_KEYS: &[&str] = &[
    "source_libraries",
    "sql_queries",
    "data_source_sql",
    "field_mapping_rules",
    "governance_config",
    "aggregation",
    "sync_mode",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Manual,
    Scheduled,
    Retry,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Manual => "manual",
            ExecutionType::Scheduled => "scheduled",
            ExecutionType::Retry => "retry",
        }
    }
}

/// Input to the pipeline: what to read, where to write it and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub task_id: String,
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub source_libraries: Vec<String>,
    #[serde(default)]
    pub source_interfaces: Vec<String>,
    pub target_library_id: String,
    pub target_interface_id: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    /// Unknown modes fall back to a full sync.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "incremental" => SyncMode::Incremental,
            "full" | "" => SyncMode::Full,
            other => {
                warn!(sync_mode = other, "unknown sync mode, using full sync");
                SyncMode::Full
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum FilterOperator {
    #[serde(rename = "eq", alias = "=")]
    Eq,
    #[serde(rename = "ne", alias = "!=")]
    Ne,
    #[serde(rename = "gt", alias = ">")]
    Gt,
    #[serde(rename = "lt", alias = "<")]
    Lt,
    #[serde(rename = "gte", alias = ">=")]
    Gte,
    #[serde(rename = "lte", alias = "<=")]
    Lte,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "ends_with")]
    EndsWith,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
    /// Filters are always combined with AND; the field is accepted for compatibility.
    #[serde(default)]
    pub logic_op: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IncrementalFieldType {
    Timestamp,
    Number,
    #[default]
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum CompareOperator {
    #[default]
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CompareOperator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOperator::Gt => ">",
            CompareOperator::Gte => ">=",
            CompareOperator::Lt => "<",
            CompareOperator::Lte => "<=",
            CompareOperator::Eq => "=",
            CompareOperator::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IncrementalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub incremental_field: String,
    #[serde(default)]
    pub field_type: IncrementalFieldType,
    #[serde(default)]
    pub compare_operator: CompareOperator,
    #[serde(default)]
    pub last_sync_value: Option<String>,
    #[serde(default)]
    pub initial_value: Option<String>,
    #[serde(default)]
    pub max_lookback_hours: u32,
    #[serde(default)]
    pub check_deleted_field: Option<String>,
    #[serde(default)]
    pub deleted_value: Option<String>,
    #[serde(default = "default_incremental_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub sync_deleted_records: bool,
    /// Time zone naive timestamp columns are stored in. Used for the lookback window.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_incremental_batch_size() -> usize {
    1000
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_owned()
}

impl IncrementalConfig {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.incremental_field.is_empty()
    }
}

/// One source: a catalog interface, optionally read through its own query.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub library_id: String,
    pub interface_id: String,
    #[serde(default)]
    pub sql_query: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
    #[serde(default)]
    pub incremental_config: Option<IncrementalConfig>,
}

impl SourceConfig {
    pub fn interface(library_id: &str, interface_id: &str) -> Self {
        Self {
            library_id: library_id.to_owned(),
            interface_id: interface_id.to_owned(),
            sql_query: None,
            parameters: BTreeMap::new(),
            filters: vec![],
            transforms: vec![],
            incremental_config: None,
        }
    }
}

/// A raw parameterized query used as a source.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SqlQueryConfig {
    #[serde(default)]
    pub library_id: Option<String>,
    #[serde(default)]
    pub interface_id: Option<String>,
    pub sql_query: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub max_rows: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FieldMappingRule {
    pub source_field: String,
    pub target_field: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawFieldMappingRules {
    Wrapped { mappings: Vec<FieldMappingRule> },
    Bare(Vec<FieldMappingRule>),
}

/// Explicit source-to-target field mappings used when writing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMappingRules {
    pub mappings: Vec<FieldMappingRule>,
}

impl FieldMappingRules {
    pub fn new(mappings: Vec<FieldMappingRule>) -> Self {
        Self { mappings }
    }

    pub fn for_target(&self, target_field: &str) -> impl Iterator<Item = &FieldMappingRule> {
        let target_field = target_field.to_owned();
        self.mappings
            .iter()
            .filter(move |rule| rule.target_field == target_field)
    }

    /// Target column a source field is written to, or the field itself when unmapped.
    pub fn target_of<'a>(&'a self, source_field: &'a str) -> &'a str {
        self.mappings
            .iter()
            .find(|rule| rule.source_field == source_field)
            .map(|rule| rule.target_field.as_str())
            .unwrap_or(source_field)
    }
}

/// Where records come from. Raw queries take priority over interfaces.
#[derive(Debug, Clone)]
pub enum SourcePlan {
    Interfaces(Vec<SourceConfig>),
    RawQueries(Vec<SqlQueryConfig>),
}

impl SourcePlan {
    pub fn len(&self) -> usize {
        match self {
            SourcePlan::Interfaces(sources) => sources.len(),
            SourcePlan::RawQueries(queries) => queries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Typed view of a request's `config` map.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sources: SourcePlan,
    pub field_mapping: FieldMappingRules,
    pub governance: GovernanceConfig,
    pub aggregation: Option<AggregationConfig>,
    pub sync_mode: SyncMode,
}

fn parse_key<T: DeserializeOwned>(
    config: &serde_json::Map<String, serde_json::Value>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|error| ConfigError::InvalidKey { key, error }),
    }
}

impl SyncConfig {
    pub fn from_request(request: &SyncRequest) -> Result<Self, ConfigError> {
        let config = &request.config;

        for key in config.keys() {
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                warn!(key = key.as_str(), task_id = %request.task_id, "ignoring unknown config key");
            }
        }

        let raw_queries = match parse_key::<OneOrMany<SqlQueryConfig>>(config, "sql_queries")? {
            Some(queries) => Some(queries.into_vec()),
            None => parse_key::<OneOrMany<SqlQueryConfig>>(config, "data_source_sql")?
                .map(OneOrMany::into_vec),
        };

        let sources = match raw_queries {
            Some(queries) if !queries.is_empty() => SourcePlan::RawQueries(queries),
            _ => {
                let configured: Vec<SourceConfig> =
                    parse_key(config, "source_libraries")?.unwrap_or_default();
                if configured.is_empty() {
                    SourcePlan::Interfaces(
                        request
                            .source_interfaces
                            .iter()
                            .enumerate()
                            .map(|(i, interface_id)| {
                                let library_id = request
                                    .source_libraries
                                    .get(i)
                                    .map(String::as_str)
                                    .unwrap_or_default();
                                SourceConfig::interface(library_id, interface_id)
                            })
                            .collect(),
                    )
                } else {
                    SourcePlan::Interfaces(configured)
                }
            }
        };

        if sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let field_mapping = parse_key::<RawFieldMappingRules>(config, "field_mapping_rules")?
            .map(|raw| match raw {
                RawFieldMappingRules::Wrapped { mappings } => FieldMappingRules::new(mappings),
                RawFieldMappingRules::Bare(mappings) => FieldMappingRules::new(mappings),
            })
            .unwrap_or_default();

        let sync_mode = parse_key::<String>(config, "sync_mode")?
            .map(|raw| SyncMode::parse(&raw))
            .unwrap_or(SyncMode::Full);

        Ok(Self {
            sources,
            field_mapping,
            governance: parse_key(config, "governance_config")?.unwrap_or_default(),
            aggregation: parse_key(config, "aggregation")?,
            sync_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(config: serde_json::Value) -> SyncRequest {
        serde_json::from_value(json!({
            "task_id": "task-1",
            "execution_type": "manual",
            "source_libraries": ["lib-a", "lib-b"],
            "source_interfaces": ["if-a", "if-b"],
            "target_library_id": "thematic",
            "target_interface_id": "customers",
            "config": config,
        }))
        .unwrap()
    }

    #[test]
    fn test_sources_fall_back_to_request_lists() {
        let config = SyncConfig::from_request(&request(json!({}))).unwrap();

        match config.sources {
            SourcePlan::Interfaces(sources) => {
                assert_eq!(sources.len(), 2);
                assert_eq!(sources[1].library_id, "lib-b");
                assert_eq!(sources[1].interface_id, "if-b");
            }
            other => panic!("unexpected plan {:?}", other),
        }
        assert_eq!(config.sync_mode, SyncMode::Full);
        assert!(config.aggregation.is_none());
    }

    #[test]
    fn test_raw_queries_take_priority() {
        let config = SyncConfig::from_request(&request(json!({
            "source_libraries": [{"library_id": "lib-a", "interface_id": "if-a"}],
            "data_source_sql": {"sql_query": "SELECT * FROM t", "max_rows": 10},
        })))
        .unwrap();

        match config.sources {
            SourcePlan::RawQueries(queries) => {
                assert_eq!(queries.len(), 1);
                assert_eq!(queries[0].max_rows, Some(10));
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_incremental_defaults() {
        let config = SyncConfig::from_request(&request(json!({
            "source_libraries": [{
                "library_id": "lib-a",
                "interface_id": "if-a",
                "incremental_config": {"enabled": true, "incremental_field": "updated_at", "field_type": "timestamp"}
            }],
            "sync_mode": "incremental",
        })))
        .unwrap();

        let SourcePlan::Interfaces(sources) = config.sources else {
            panic!("expected interfaces");
        };
        let incremental = sources[0].incremental_config.as_ref().unwrap();
        assert!(incremental.is_active());
        assert_eq!(incremental.compare_operator, CompareOperator::Gt);
        assert_eq!(incremental.batch_size, 1000);
        assert_eq!(incremental.timezone, "Asia/Shanghai");
        assert_eq!(config.sync_mode, SyncMode::Incremental);
    }

    #[test]
    fn test_field_mapping_shapes() {
        let wrapped = SyncConfig::from_request(&request(json!({
            "field_mapping_rules": {"mappings": [{"source_field": "mobile", "target_field": "phone"}]}
        })))
        .unwrap();
        let bare = SyncConfig::from_request(&request(json!({
            "field_mapping_rules": [{"source_field": "mobile", "target_field": "phone"}]
        })))
        .unwrap();

        assert_eq!(wrapped.field_mapping, bare.field_mapping);
        assert_eq!(bare.field_mapping.target_of("mobile"), "phone");
        assert_eq!(bare.field_mapping.target_of("email"), "email");
    }

    #[test]
    fn test_malformed_config_is_rejected() {
        let err = SyncConfig::from_request(&request(json!({
            "source_libraries": [{"library_id": "lib-a", "interface_id": "if-a", "filters": [
                {"field": "x", "operator": "like", "value": 1}
            ]}]
        })))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { key: "source_libraries", .. }));

        let err = SyncConfig::from_request(&request(json!({
            "governance_config": {"enable_cleansing": true, "unexpected": 1}
        })))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { key: "governance_config", .. }));
    }

    #[test]
    fn test_unknown_sync_mode_falls_back_to_full() {
        assert_eq!(SyncMode::parse("realtime"), SyncMode::Full);
        assert_eq!(SyncMode::parse("incremental"), SyncMode::Incremental);
    }

    #[test]
    fn test_empty_sources_are_rejected() {
        let mut req = request(json!({}));
        req.source_interfaces.clear();
        assert!(matches!(
            SyncConfig::from_request(&req),
            Err(ConfigError::NoSources)
        ));
    }
}
