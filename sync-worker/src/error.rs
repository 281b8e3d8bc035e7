use sync_common::pgqueue::PgQueueError;
use sync_engine::catalog::CatalogError;
use sync_engine::error::StoreError;
use thiserror::Error;

/// Enumeration of errors related to initialization and consumption of sync jobs.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a queue error occurred while handling a job: {0}")]
    QueueError(#[from] PgQueueError),
    #[error("failed to connect a store: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to load the interface catalog: {0}")]
    CatalogError(#[from] CatalogError),
}
