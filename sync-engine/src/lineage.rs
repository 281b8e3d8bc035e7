//! Provenance of written target rows.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_common::record::SourceRecordInfo;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LineageError;
use crate::store::ExecutionStore;

pub const DEFAULT_LINEAGE_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationStep {
    pub step: String,
    pub detail: String,
}

impl TransformationStep {
    pub fn new(step: &str, detail: impl Into<String>) -> Self {
        Self {
            step: step.to_owned(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub library_id: String,
    pub interface_id: String,
    pub record_id: String,
}

impl From<&SourceRecordInfo> for SourceRef {
    fn from(info: &SourceRecordInfo) -> Self {
        Self {
            library_id: info.source_library_id.clone(),
            interface_id: info.source_interface_id.clone(),
            record_id: info.record_id.clone(),
        }
    }
}

/// One row of `sync_lineage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub target_library_id: String,
    pub target_interface_id: String,
    pub target_record_id: String,
    pub source: SourceRef,
    pub transformation_steps: Vec<TransformationStep>,
    pub quality_score: f64,
    pub created_at: DateTime<Utc>,
}

/// What the writer reports about one written row.
#[derive(Debug, Clone)]
pub struct WrittenRecord {
    pub target_record_id: String,
    pub sources: Vec<SourceRef>,
    pub steps: Vec<TransformationStep>,
    pub quality_score: f64,
}

/// Builds and persists lineage rows for one execution.
pub struct LineageRecorder<'a> {
    store: &'a dyn ExecutionStore,
    execution_id: Uuid,
    target_library_id: String,
    target_interface_id: String,
    batch_size: usize,
}

impl<'a> LineageRecorder<'a> {
    pub fn new(
        store: &'a dyn ExecutionStore,
        execution_id: Uuid,
        target_library_id: &str,
        target_interface_id: &str,
    ) -> Self {
        Self {
            store,
            execution_id,
            target_library_id: target_library_id.to_owned(),
            target_interface_id: target_interface_id.to_owned(),
            batch_size: DEFAULT_LINEAGE_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// One lineage row per written record, linked to its first source.
    pub fn build(&self, written: &[WrittenRecord]) -> Vec<LineageRecord> {
        let created_at = Utc::now();
        written
            .iter()
            .filter_map(|record| {
                let source = record.sources.first()?.clone();
                Some(LineageRecord {
                    id: Uuid::now_v7(),
                    execution_id: self.execution_id,
                    target_library_id: self.target_library_id.clone(),
                    target_interface_id: self.target_interface_id.clone(),
                    target_record_id: record.target_record_id.clone(),
                    source,
                    transformation_steps: record.steps.clone(),
                    quality_score: record.quality_score,
                    created_at,
                })
            })
            .collect()
    }

    /// Persist lineage for every written record. The first failing batch aborts.
    pub async fn record(&self, written: &[WrittenRecord]) -> Result<usize, LineageError> {
        let rows = self.build(written);

        for (batch, chunk) in rows.chunks(self.batch_size).enumerate() {
            self.store
                .insert_lineage(chunk)
                .await
                .map_err(|error| LineageError::Store { batch, error })?;
            debug!(batch, rows = chunk.len(), "recorded lineage batch");
        }

        info!(
            execution_id = %self.execution_id,
            rows = rows.len(),
            "recorded lineage"
        );
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn written(id: usize) -> WrittenRecord {
        WrittenRecord {
            target_record_id: id.to_string(),
            sources: vec![
                SourceRef {
                    library_id: "lib".to_owned(),
                    interface_id: "a".to_owned(),
                    record_id: format!("lib_a_{}", id),
                },
                SourceRef {
                    library_id: "lib".to_owned(),
                    interface_id: "b".to_owned(),
                    record_id: format!("lib_b_{}", id),
                },
            ],
            steps: vec![TransformationStep::new("write", "upsert")],
            quality_score: 88.0,
        }
    }

    #[tokio::test]
    async fn test_records_one_row_per_written_record_in_batches() {
        let store = MemoryStore::new();
        let recorder = LineageRecorder::new(&store, Uuid::now_v7(), "thematic", "people")
            .with_batch_size(2);

        let count = recorder
            .record(&(0..5).map(written).collect::<Vec<_>>())
            .await
            .unwrap();

        assert_eq!(count, 5);
        let rows = store.lineage();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[3].target_record_id, "3");
        assert_eq!(rows[3].source.interface_id, "a");
        assert_eq!(rows[3].target_interface_id, "people");
    }

    #[tokio::test]
    async fn test_store_failure_aborts() {
        let store = MemoryStore::new();
        store.fail_lineage();
        let recorder = LineageRecorder::new(&store, Uuid::now_v7(), "thematic", "people");

        let err = recorder.record(&[written(1)]).await.unwrap_err();
        assert!(matches!(err, LineageError::Store { batch: 0, .. }));
    }
}
