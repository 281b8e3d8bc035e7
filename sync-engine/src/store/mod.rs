//! Storage boundary. The pipeline only talks to sources, the target table and the execution log
//! through these traits.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_common::record::{Record, Value};
use uuid::Uuid;

use crate::catalog::ColumnKind;
use crate::error::StoreResult;
use crate::fetcher::incremental::IncrementalFilter;
use crate::lineage::LineageRecord;
use crate::sql::TableRef;

pub mod memory;
pub mod postgres;

/// One page of an ordered table scan.
#[derive(Debug, Clone)]
pub struct ScanRequest<'a> {
    pub table: &'a TableRef,
    pub filter: Option<&'a IncrementalFilter>,
    pub order_by: &'a [String],
    pub limit: usize,
    pub offset: usize,
}

/// A target column and how its values are bound.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetColumn {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn fetch_page(&self, scan: &ScanRequest<'_>) -> StoreResult<Vec<Record>>;

    /// Run a validated read-only query with positional parameters, reading at most `max_rows`.
    async fn run_query(&self, sql: &str, params: &[Value], max_rows: usize)
        -> StoreResult<Vec<Record>>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert or update `rows` keyed on `key_columns`. Every row is written with `columns`,
    /// missing values bound as NULL.
    async fn upsert(
        &self,
        table: &TableRef,
        columns: &[TargetColumn],
        key_columns: &[String],
        rows: &[Record],
    ) -> StoreResult<UpsertOutcome>;

    /// Text form of the key columns of every row with a complete key.
    async fn existing_keys(
        &self,
        table: &TableRef,
        key_columns: &[String],
    ) -> StoreResult<Vec<Vec<String>>>;

    async fn delete_keys(
        &self,
        table: &TableRef,
        key_columns: &[String],
        keys: &[Vec<String>],
    ) -> StoreResult<u64>;

    /// Text form of the largest value of `column`, if any row has one.
    async fn max_value(&self, table: &TableRef, column: &str) -> StoreResult<Option<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

/// Persisted bookkeeping for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub task_id: String,
    pub execution_type: String,
    pub status: ExecutionStatus,
    pub target_library_id: String,
    pub target_interface_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub failed_phase: Option<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn begin_execution(&self, execution: &ExecutionRecord) -> StoreResult<()>;

    async fn finish_execution(&self, execution: &ExecutionRecord) -> StoreResult<()>;

    async fn insert_lineage(&self, rows: &[LineageRecord]) -> StoreResult<()>;
}
