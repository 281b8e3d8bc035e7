use std::str::FromStr;

use chrono::prelude::*;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

/// Enumeration of errors for operations with PgQueue.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum PgQueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

/// Enumeration of possible statuses for a Job.
/// Available: A job that is waiting in the queue to be picked up by a worker.
/// Completed: A job that was successfully completed by a worker.
/// Failed: A job that was unsuccessfully completed by a worker. Failed jobs are not retried.
/// Running: A job that was picked up by a worker and it's currently being run.
#[derive(Debug, PartialEq, Clone, Copy, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Available,
    Completed,
    Failed,
    Running,
}

/// Allow casting JobStatus from strings.
impl FromStr for JobStatus {
    type Err = PgQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobStatus::Available),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "running" => Ok(JobStatus::Running),
            invalid => Err(PgQueueError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// JobParameters are stored and read to and from a JSONB field, so we accept anything that fits `sqlx::types::Json`.
pub type JobParameters<J> = sqlx::types::Json<J>;

/// A Job to be executed by a worker dequeueing a PgQueue.
#[derive(sqlx::FromRow, Debug)]
pub struct Job<J> {
    pub id: i64,
    pub queue: String,
    pub attempt: i32,
    pub last_attempted_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub parameters: JobParameters<J>,
}

/// A NewJob to be enqueued into a PgQueue.
pub struct NewJob<J> {
    pub parameters: JobParameters<J>,
}

impl<J> NewJob<J> {
    pub fn new(parameters: J) -> Self {
        Self {
            parameters: sqlx::types::Json(parameters),
        }
    }
}

/// A queue implemented on top of the `sync_jobs` table in PostgreSQL.
/// Several named queues share the table, separated by the `queue` column.
#[derive(Clone)]
pub struct PgQueue {
    name: String,
    pool: PgPool,
}

pub type PgQueueResult<T> = std::result::Result<T, PgQueueError>;

impl PgQueue {
    /// Initialize a new PgQueue connecting to the database at `url`.
    pub async fn new(queue_name: &str, url: &str, max_connections: u32) -> PgQueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| PgQueueError::ConnectionError { error })?;

        Ok(Self::new_from_pool(queue_name, pool))
    }

    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dequeue the oldest available Job from this PgQueue, if any.
    pub async fn dequeue<J: DeserializeOwned + std::marker::Send + std::marker::Unpin + 'static>(
        &self,
        attempted_by: &str,
    ) -> PgQueueResult<Option<Job<J>>> {
        let base_query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        sync_jobs
    WHERE
        status = 'available'
        AND queue = $1
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    sync_jobs
SET
    started_at = NOW(),
    status = 'running'::job_status,
    attempt = sync_jobs.attempt + 1,
    last_attempted_by = $2
FROM
    available_in_queue
WHERE
    sync_jobs.id = available_in_queue.id
RETURNING
    sync_jobs.*
        "#;

        sqlx::query_as(base_query)
            .bind(&self.name)
            .bind(attempted_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })
    }

    /// Enqueue a Job into this PgQueue and return its id.
    /// We take ownership of NewJob to enforce a specific NewJob is only enqueued once.
    pub async fn enqueue<J: Serialize + std::marker::Sync>(
        &self,
        job: NewJob<J>,
    ) -> PgQueueResult<i64> {
        let base_query = r#"
INSERT INTO sync_jobs
    (queue, status, attempt, parameters, created_at)
VALUES
    ($1, 'available'::job_status, 0, $2, NOW())
RETURNING
    id
        "#;

        sqlx::query_scalar(base_query)
            .bind(&self.name)
            .bind(&job.parameters)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })
    }

    /// Mark a running Job as completed, storing its result.
    pub async fn complete<R: Serialize + std::marker::Sync>(
        &self,
        job_id: i64,
        result: &R,
    ) -> PgQueueResult<()> {
        self.finish(job_id, JobStatus::Completed, None, result).await
    }

    /// Mark a running Job as failed. Failed jobs stay in the table and are not retried.
    pub async fn fail<R: Serialize + std::marker::Sync>(
        &self,
        job_id: i64,
        error: &str,
        result: &R,
    ) -> PgQueueResult<()> {
        self.finish(job_id, JobStatus::Failed, Some(error), result)
            .await
    }

    async fn finish<R: Serialize + std::marker::Sync>(
        &self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
        result: &R,
    ) -> PgQueueResult<()> {
        let base_query = r#"
UPDATE
    sync_jobs
SET
    finished_at = NOW(),
    status = $2,
    error = $3,
    result = $4
WHERE
    id = $1
    AND status = 'running'::job_status
        "#;

        sqlx::query(base_query)
            .bind(job_id)
            .bind(status)
            .bind(error)
            .bind(sqlx::types::Json(result))
            .execute(&self.pool)
            .await
            .map_err(|error| PgQueueError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct JobParameters {
        task_id: String,
        target: String,
    }

    #[test]
    fn test_parse_job_status() {
        assert_eq!(JobStatus::from_str("running").unwrap(), JobStatus::Running);
        assert!(matches!(
            JobStatus::from_str("paused"),
            Err(PgQueueError::ParseJobStatusError(status)) if status == "paused"
        ));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_can_enqueue_and_dequeue_job(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_can_enqueue_and_dequeue_job", db);
        let parameters = JobParameters {
            task_id: "task-1".to_owned(),
            target: "customers".to_owned(),
        };

        queue.enqueue(NewJob::new(parameters)).await.unwrap();

        let job: Job<JobParameters> = queue
            .dequeue("worker-1")
            .await
            .unwrap()
            .expect("job should be available");

        assert_eq!(job.attempt, 1);
        assert_eq!(job.parameters.task_id, "task-1");
        assert_eq!(job.last_attempted_by.as_deref(), Some("worker-1"));
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.finished_at.is_none());

        let none: Option<Job<JobParameters>> = queue.dequeue("worker-1").await.unwrap();
        assert!(none.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_finished_jobs_are_not_dequeued_again(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_finished_jobs", db.clone());
        let parameters = JobParameters {
            task_id: "task-2".to_owned(),
            target: "orders".to_owned(),
        };
        queue.enqueue(NewJob::new(parameters)).await.unwrap();

        let job: Job<JobParameters> = queue.dequeue("worker-1").await.unwrap().unwrap();
        queue
            .fail(job.id, "data_fetch phase failed", &serde_json::json!({"status": "failed"}))
            .await
            .unwrap();

        let status: JobStatus = sqlx::query_scalar("SELECT status FROM sync_jobs WHERE id = $1")
            .bind(job.id)
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Failed);

        let next: Option<Job<JobParameters>> = queue.dequeue("worker-1").await.unwrap();
        assert!(next.is_none());
    }
}
