use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use sync_common::pgqueue::{Job, PgQueue};
use sync_engine::config::SyncRequest;
use sync_engine::pipeline::SyncPipeline;
use sync_engine::store::ExecutionStatus;
use tracing::{error, info, warn};

use crate::error::WorkerError;

const WORKER_JOBS: &str = "sync_worker_jobs_total";

/// A worker that polls `PgQueue` for sync jobs and runs each one through the pipeline.
/// Jobs are processed one at a time; a failed job is recorded and never retried.
pub struct SyncWorker {
    /// An identifier for this worker. Used to mark jobs we have consumed.
    name: String,
    /// The queue we will be dequeuing jobs from.
    queue: PgQueue,
    pipeline: SyncPipeline,
    /// How long to sleep when the queue is empty.
    poll_interval: time::Duration,
    shutdown: Arc<AtomicBool>,
}

impl SyncWorker {
    pub fn new(
        name: &str,
        queue: PgQueue,
        pipeline: SyncPipeline,
        poll_interval: time::Duration,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            shutdown: pipeline.cancel_flag(),
            pipeline,
            poll_interval,
        }
    }

    /// Setting the flag stops the worker. A run in flight is cancelled before its next phase.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run this worker to continuously process any jobs that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!(worker = %self.name, queue = self.queue.name(), "worker started");

        while !self.shutdown.load(Ordering::SeqCst) {
            if !self.process_next().await? {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        info!(worker = %self.name, "worker stopped");
        Ok(())
    }

    /// Dequeue and run one job. Returns whether a job was available.
    pub async fn process_next(&self) -> Result<bool, WorkerError> {
        let Some(job) = self.queue.dequeue::<serde_json::Value>(&self.name).await? else {
            return Ok(false);
        };

        self.process(job).await?;
        Ok(true)
    }

    async fn process(&self, job: Job<serde_json::Value>) -> Result<(), WorkerError> {
        let request: SyncRequest = match serde_json::from_value(job.parameters.0) {
            Ok(request) => request,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "discarding malformed sync job");
                metrics::counter!(WORKER_JOBS, &[("status", "malformed")]).increment(1);
                let reason = format!("malformed sync request: {}", e);
                self.queue
                    .fail(job.id, &reason, &serde_json::Value::Null)
                    .await?;
                return Ok(());
            }
        };

        info!(
            job_id = job.id,
            attempt = job.attempt,
            task_id = %request.task_id,
            "running sync job"
        );
        let response = self.pipeline.run(&request).await;
        metrics::counter!(WORKER_JOBS, &[("status", response.status.as_str())]).increment(1);

        match response.status {
            ExecutionStatus::Success => self.queue.complete(job.id, &response).await?,
            _ => {
                let reason = response.error.as_deref().unwrap_or("sync failed");
                error!(
                    job_id = job.id,
                    execution_id = %response.execution_id,
                    error = reason,
                    "sync job failed"
                );
                self.queue.fail(job.id, reason, &response).await?;
            }
        }

        Ok(())
    }
}
