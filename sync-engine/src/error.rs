use std::time;

use sync_common::record::RecordError;
use thiserror::Error;

use crate::sql::IdentifierError;
use crate::transform::TransformError;

/// Enumeration of configuration errors. These are raised before any I/O happens.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("sync request has no source libraries or queries")]
    NoSources,
    #[error("target interface {library_id}/{interface_id} was not found")]
    UnknownTarget {
        library_id: String,
        interface_id: String,
    },
    #[error("source interface {library_id}/{interface_id} was not found")]
    UnknownSource {
        library_id: String,
        interface_id: String,
    },
    #[error("target interface {0} declares no fields")]
    NoTargetFields(String),
    #[error("invalid value for {key}: {error}")]
    InvalidKey {
        key: &'static str,
        error: serde_json::Error,
    },
    #[error("field mapping targets unknown field {0}")]
    UnknownMappingTarget(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),
    #[error("invalid pattern {pattern} in rule {rule_id}: {error}")]
    InvalidPattern {
        rule_id: String,
        pattern: String,
        error: regex::Error,
    },
}

/// Enumeration of errors raised by storage backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{command} was rejected: {reason}")]
    Rejected { command: String, reason: String },
    #[error("query timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("failed to decode row: {0}")]
    Decode(#[from] RecordError),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Enumeration of errors related to validating and running raw parameterized queries.
#[derive(Error, Debug)]
pub enum RawQueryError {
    #[error("only SELECT or WITH statements may be run")]
    NotReadOnly,
    #[error("query contains forbidden keyword {0}")]
    ForbiddenKeyword(String),
    #[error("query references parameter {0} which was not provided")]
    MissingParameter(String),
    #[error("raw query pattern failed to compile: {0}")]
    Pattern(regex::Error),
    #[error("raw query {index} failed: {error}")]
    Store { index: usize, error: StoreError },
}

/// Enumeration of errors raised while fetching source records.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("source {library_id}/{interface_id} was not found")]
    UnknownSource {
        library_id: String,
        interface_id: String,
    },
    #[error("fetching {library_id}/{interface_id} failed: {error}")]
    Store {
        library_id: String,
        interface_id: String,
        error: StoreError,
    },
    #[error(transparent)]
    RawQuery(#[from] RawQueryError),
    #[error("invalid source transform: {0}")]
    InvalidTransform(TransformError),
}

/// Enumeration of errors aborting aggregation.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("record {record_id} is missing required field {field}")]
    RequiredField { record_id: String, field: String },
    #[error("record {record_id} failed {rule} validation on field {field}")]
    Validation {
        record_id: String,
        field: String,
        rule: String,
    },
    #[error("transform {transform} failed for record {record_id}: {reason}")]
    Transform {
        record_id: String,
        transform: String,
        reason: String,
    },
}

/// Enumeration of errors aborting governance.
#[derive(Error, Debug)]
pub enum GovernanceError {
    #[error("quality score {score:.2} is below threshold {threshold:.2}")]
    QualityBelowThreshold { score: f64, threshold: f64 },
}

/// Enumeration of per-record mapping failures. These reject a record without aborting the run.
#[derive(Error, Debug, PartialEq)]
pub enum MappingError {
    #[error("required field {0} has no value and no default")]
    MissingRequired(String),
    #[error("primary key field {0} has no value")]
    MissingKey(String),
    #[error("cannot convert {value} to {data_type} for field {field}")]
    Conversion {
        field: String,
        data_type: String,
        value: String,
    },
}

/// Enumeration of errors aborting the write phase.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("writing batch {batch} failed: {error}")]
    Batch { batch: usize, error: StoreError },
    #[error("reading existing keys failed: {0}")]
    ExistingKeys(StoreError),
    #[error("deleting stale rows failed: {0}")]
    Delete(StoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum LineageError {
    #[error("recording lineage batch {batch} failed: {error}")]
    Store { batch: usize, error: StoreError },
}

/// Enumeration of pipeline failures, one per phase.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("initialize phase failed: {0}")]
    Initialize(#[from] ConfigError),
    #[error("initialize phase failed: {0}")]
    Bookkeeping(StoreError),
    #[error("data_fetch phase failed: {0}")]
    DataFetch(#[from] FetchError),
    #[error("aggregation phase failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("governance phase failed: {0}")]
    Governance(#[from] GovernanceError),
    #[error("data_write phase failed: {0}")]
    DataWrite(#[from] WriteError),
    #[error("lineage phase failed: {0}")]
    Lineage(#[from] LineageError),
    #[error("complete phase failed: {0}")]
    Complete(StoreError),
    #[error("sync was cancelled before the {0} phase")]
    Cancelled(&'static str),
}
