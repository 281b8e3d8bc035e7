//! Full and incremental write strategies.
use async_trait::async_trait;
use serde::Serialize;

use crate::config::SyncMode;
use crate::error::WriteError;
use crate::writer::{DataWriter, PreparedRows};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl SyncOutcome {
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

#[async_trait]
pub trait SyncStrategy: Send + Sync {
    fn mode(&self) -> SyncMode;

    async fn sync(
        &self,
        writer: &DataWriter<'_>,
        rows: &PreparedRows,
    ) -> Result<SyncOutcome, WriteError>;
}

/// Makes the target mirror the incoming rows: rows whose key no longer arrives are deleted
/// before the upsert. Protected keys are kept.
pub struct FullSync;

#[async_trait]
impl SyncStrategy for FullSync {
    fn mode(&self) -> SyncMode {
        SyncMode::Full
    }

    async fn sync(
        &self,
        writer: &DataWriter<'_>,
        rows: &PreparedRows,
    ) -> Result<SyncOutcome, WriteError> {
        let stale = writer.stale_keys(&rows.retained_keys()).await?;
        let deleted = writer.delete(&stale).await?;
        let written = writer.upsert(rows).await?;

        Ok(SyncOutcome {
            inserted: written.inserted,
            updated: written.updated,
            deleted,
        })
    }
}

/// Upserts only. Nothing is ever deleted.
pub struct IncrementalSync;

#[async_trait]
impl SyncStrategy for IncrementalSync {
    fn mode(&self) -> SyncMode {
        SyncMode::Incremental
    }

    async fn sync(
        &self,
        writer: &DataWriter<'_>,
        rows: &PreparedRows,
    ) -> Result<SyncOutcome, WriteError> {
        let written = writer.upsert(rows).await?;

        Ok(SyncOutcome {
            inserted: written.inserted,
            updated: written.updated,
            deleted: 0,
        })
    }
}

pub fn strategy_for(mode: SyncMode) -> Box<dyn SyncStrategy> {
    match mode {
        SyncMode::Full => Box::new(FullSync),
        SyncMode::Incremental => Box::new(IncrementalSync),
    }
}
