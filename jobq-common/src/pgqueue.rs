//! # PgQueue
//!
//! A durable, deduplicating job queue implementation backed by a PostgreSQL
//! table. Producers upsert work items keyed by `(type, key)`; workers claim
//! them with `FOR UPDATE SKIP LOCKED` queries, so any number of worker
//! processes can poll the same table without double-executing a job.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::timestamps::{epoch_ms, epoch_ms_opt};

/// Default attempt budget for newly enqueued jobs.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Upper bound producers may request for a job's attempt budget.
pub const MAX_ATTEMPTS_LIMIT: i32 = 50;

/// Caps on run bookkeeping strings. Anything longer is trimmed with an
/// ellipsis marker before it is written.
const MAX_SUMMARY_CHARS: usize = 2000;
const MAX_STACK_CHARS: usize = 8000;

const STALE_LEASE_ERROR: &str = "stale lease reclaimed";

/// Enumeration of errors for operations with PgQueue.
/// Errors that can originate from sqlx are wrapped to provide additional context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("database contention, the operation can be retried: {error}")]
    TransientError { error: sqlx::Error },
    #[error("{0} is not a valid job status")]
    ParseJobStatusError(String),
    #[error("queue returned a malformed row: {0}")]
    InternalError(String),
}

impl QueueError {
    /// True when the caller should retry on its next tick rather than fail:
    /// serialization and deadlock aborts, lock contention, pool exhaustion.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::TransientError { .. })
    }
}

/// Wrap an sqlx error, classifying contention separately so that callers can
/// retry claims instead of treating them as fatal.
fn query_error(command: &str, error: sqlx::Error) -> QueueError {
    let transient = match &error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_error) => matches!(
            db_error.code().as_deref(),
            Some("40001") | Some("40P01") | Some("55P03")
        ),
        _ => false,
    };

    if transient {
        QueueError::TransientError { error }
    } else {
        QueueError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}

pub type PgQueueResult<T> = std::result::Result<T, QueueError>;

/// Enumeration of possible statuses for a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// A job that is waiting in the queue to be picked up by a worker.
    Queued,
    /// A job that was picked up by a worker and is currently being run.
    Running,
    /// A job that failed at least once and is waiting out its backoff.
    Retrying,
    /// A job whose latest attempt completed successfully. Terminal.
    Succeeded,
    /// A job that exhausted its attempt budget. Terminal.
    Dead,
}

/// Allow casting JobStatus from strings, e.g. list filters from query params.
impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "succeeded" => Ok(JobStatus::Succeeded),
            "dead" => Ok(JobStatus::Dead),
            invalid => Err(QueueError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// Outcome recorded for one completed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text")]
#[sqlx(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Fail,
}

/// JobPayload is stored and read to and from a JSONB field; the queue never
/// inspects it, handlers own its meaning.
pub type JobPayload = sqlx::types::Json<serde_json::Value>;

/// The current state of one logical unit of work.
///
/// `(type, key)` is unique: enqueueing the same pair again coalesces into this
/// row rather than creating a second job.
#[derive(sqlx::FromRow, Debug, Clone, Serialize)]
pub struct Job {
    /// A unique id identifying a job.
    pub id: i64,
    /// Short name of the handler that executes this job, e.g. `"ping"`.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,
    /// Producer-chosen dedupe discriminator within `job_type`.
    pub key: String,
    /// Arbitrary job payload stored as JSON.
    pub payload: JobPayload,
    /// The current status of the job.
    pub status: JobStatus,
    /// Earliest instant the job may be claimed.
    #[serde(with = "epoch_ms")]
    pub run_after: DateTime<Utc>,
    /// Number of times the job has been claimed. Bumped at claim time, so a
    /// crashed worker still spends one attempt.
    pub attempts: i32,
    /// The job's attempt budget before it is dead-lettered.
    pub max_attempts: i32,
    /// Identifier of the worker currently holding the claim.
    pub locked_by: Option<String>,
    /// Instant the current claim began.
    #[serde(with = "epoch_ms_opt")]
    pub locked_at: Option<DateTime<Utc>>,
    /// Most recent failure summary, trimmed.
    pub last_error: Option<String>,
    #[serde(with = "epoch_ms_opt")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(with = "epoch_ms")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "epoch_ms")]
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of one completed attempt. Written on success and
/// failure only, never on a stale-lease reclaim.
#[derive(sqlx::FromRow, Debug, Clone, Serialize)]
pub struct JobRun {
    pub id: i64,
    pub job_id: i64,
    /// Copied from the job at attempt time for denormalized querying.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,
    pub key: String,
    /// The job's attempts value at claim time, 1-based.
    pub attempt: i32,
    pub status: RunStatus,
    #[serde(with = "epoch_ms")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "epoch_ms")]
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i32,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub result_summary: Option<String>,
}

/// This struct represents a new job being enqueued into a `PgQueue`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub key: String,
    pub payload: JobPayload,
    /// Earliest claim instant; enqueue defaults it to the database clock's now.
    pub run_after: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(job_type: &str, key: &str) -> Self {
        Self {
            job_type: job_type.to_owned(),
            key: key.to_owned(),
            payload: sqlx::types::Json(serde_json::json!({})),
            run_after: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = sqlx::types::Json(payload);
        self
    }

    pub fn with_run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// The failure report a worker hands back when an attempt did not succeed.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    /// Human summary of the failure.
    pub message: String,
    /// Optional stack or error chain rendering.
    pub stack: Option<String>,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            "Unknown error".to_owned()
        } else {
            message
        };

        Self {
            message,
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Truncate to `max_chars`, marking the cut with an ellipsis so readers know
/// the stored value is partial. The result never exceeds `max_chars` chars.
fn trim_to(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_owned();
    }

    let mut trimmed: String = value.chars().take(max_chars.saturating_sub(1)).collect();
    trimmed.push('…');
    trimmed
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(50).clamp(1, 200)
}

/// A queue implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgQueue {
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
    /// The policy used to push out `run_after` when enqueueing a retry.
    retry_policy: RetryPolicy,
}

impl PgQueue {
    /// Initialize a new PgQueue by initializing a lazy connection pool to the
    /// database in `url`.
    pub fn new(url: &str, max_connections: u32, app_name: &'static str) -> PgQueueResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| QueueError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Initialize a new PgQueue from a provided connection pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// A clone of the underlying pool, for callers that need direct database
    /// access (e.g. job handlers writing their own tables).
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Enqueue a job, coalescing with any existing job for the same
    /// `(type, key)`.
    ///
    /// The conflict branch has reset-unless-running semantics: a row that is
    /// not currently `running` is reset to `queued` with the new payload,
    /// schedule and a fresh attempt budget, while a `running` row keeps its
    /// payload, status, schedule and attempts so in-flight work is never
    /// stomped. `max_attempts` is refreshed and the last-error columns are
    /// cleared on both branches.
    pub async fn enqueue(&self, job: NewJob) -> PgQueueResult<Job> {
        if job.job_type.is_empty() {
            return Err(QueueError::InvalidInput("type must not be empty".to_owned()));
        }
        if job.key.is_empty() {
            return Err(QueueError::InvalidInput("key must not be empty".to_owned()));
        }
        if job.max_attempts < 1 || job.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(QueueError::InvalidInput(format!(
                "max_attempts must be between 1 and {}",
                MAX_ATTEMPTS_LIMIT
            )));
        }

        let base_query = r#"
INSERT INTO job_queue
    (type, key, payload, status, run_after, attempts, max_attempts)
VALUES
    ($1, $2, $3, 'queued'::job_status, COALESCE($4::timestamptz, NOW()), 0, $5)
ON CONFLICT (type, key) DO UPDATE
SET
    payload = CASE WHEN job_queue.status = 'running' THEN job_queue.payload ELSE EXCLUDED.payload END,
    status = CASE WHEN job_queue.status = 'running' THEN job_queue.status ELSE 'queued'::job_status END,
    run_after = CASE WHEN job_queue.status = 'running' THEN job_queue.run_after ELSE EXCLUDED.run_after END,
    attempts = CASE WHEN job_queue.status = 'running' THEN job_queue.attempts ELSE 0 END,
    max_attempts = EXCLUDED.max_attempts,
    last_error = NULL,
    last_error_at = NULL,
    updated_at = NOW()
RETURNING
    job_queue.*
        "#;

        sqlx::query_as::<_, Job>(base_query)
            .bind(&job.job_type)
            .bind(&job.key)
            .bind(&job.payload)
            .bind(job.run_after)
            .bind(job.max_attempts)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| query_error("INSERT", error))
    }

    /// Claim the next runnable job for `worker_id`, if any.
    ///
    /// One atomic statement: the earliest-due `queued`/`retrying` row whose
    /// `run_after` has passed is row-locked (skipping rows other claimers
    /// already hold) and transitioned to `running`. Claiming spends one
    /// attempt up front, so a worker crash between claim and completion still
    /// consumes retry budget.
    //
    // The query that follows uses a FOR UPDATE SKIP LOCKED clause.
    // For more details on this see: 2ndquadrant.com/en/blog/what-is-select-skip-locked-for-in-postgresql-9-5.
    pub async fn claim(&self, worker_id: &str) -> PgQueueResult<Option<Job>> {
        let base_query = r#"
WITH runnable AS (
    SELECT
        id
    FROM
        job_queue
    WHERE
        status IN ('queued', 'retrying')
        AND run_after <= NOW()
    ORDER BY
        run_after,
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    job_queue
SET
    status = 'running'::job_status,
    locked_by = $1,
    locked_at = NOW(),
    attempts = job_queue.attempts + 1,
    updated_at = NOW()
FROM
    runnable
WHERE
    job_queue.id = runnable.id
RETURNING
    job_queue.*
        "#;

        sqlx::query_as::<_, Job>(base_query)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| query_error("UPDATE", error))
    }

    /// Record a successful attempt for a claimed job.
    ///
    /// One transaction: append the success run, then mark the job
    /// `succeeded`, releasing the lock and clearing the last-error columns.
    pub async fn success(
        &self,
        claim: &Job,
        started_at: DateTime<Utc>,
        result_summary: Option<&str>,
    ) -> PgQueueResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let insert_run_query = r#"
INSERT INTO job_runs
    (job_id, type, key, attempt, status, started_at, finished_at, duration_ms, result_summary)
VALUES
    ($1, $2, $3, $4, 'success', $5, NOW(), GREATEST(0, EXTRACT(EPOCH FROM (NOW() - $5)) * 1000)::int, $6)
        "#;

        sqlx::query(insert_run_query)
            .bind(claim.id)
            .bind(&claim.job_type)
            .bind(&claim.key)
            .bind(claim.attempts)
            .bind(started_at)
            .bind(result_summary.map(|summary| trim_to(summary, MAX_SUMMARY_CHARS)))
            .execute(&mut *tx)
            .await
            .map_err(|error| query_error("INSERT", error))?;

        let update_job_query = r#"
UPDATE
    job_queue
SET
    status = 'succeeded'::job_status,
    locked_by = NULL,
    locked_at = NULL,
    last_error = NULL,
    last_error_at = NULL,
    updated_at = NOW()
WHERE
    id = $1
        "#;

        sqlx::query(update_job_query)
            .bind(claim.id)
            .execute(&mut *tx)
            .await
            .map_err(|error| query_error("UPDATE", error))?;

        tx.commit()
            .await
            .map_err(|error| QueueError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })
    }

    /// Record a failed attempt for a claimed job.
    ///
    /// One transaction: append the fail run, then either schedule a retry
    /// with exponential backoff or dead-letter the job once its attempt
    /// budget is spent. The lock is released either way; `run_after` is left
    /// untouched for dead jobs.
    pub async fn failure(
        &self,
        claim: &Job,
        started_at: DateTime<Utc>,
        failure: &HandlerFailure,
    ) -> PgQueueResult<()> {
        let message = trim_to(&failure.message, MAX_SUMMARY_CHARS);
        let stack = failure
            .stack
            .as_deref()
            .map(|stack| trim_to(stack, MAX_STACK_CHARS));
        let will_retry = claim.attempts < claim.max_attempts;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| QueueError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let insert_run_query = r#"
INSERT INTO job_runs
    (job_id, type, key, attempt, status, started_at, finished_at, duration_ms, error_message, error_stack)
VALUES
    ($1, $2, $3, $4, 'fail', $5, NOW(), GREATEST(0, EXTRACT(EPOCH FROM (NOW() - $5)) * 1000)::int, $6, $7)
        "#;

        sqlx::query(insert_run_query)
            .bind(claim.id)
            .bind(&claim.job_type)
            .bind(&claim.key)
            .bind(claim.attempts)
            .bind(started_at)
            .bind(&message)
            .bind(&stack)
            .execute(&mut *tx)
            .await
            .map_err(|error| query_error("INSERT", error))?;

        if will_retry {
            let backoff = self
                .retry_policy
                .time_until_next_retry(claim.attempts.max(1) as u32);

            let retry_query = r#"
UPDATE
    job_queue
SET
    status = 'retrying'::job_status,
    locked_by = NULL,
    locked_at = NULL,
    last_error = $2,
    last_error_at = NOW(),
    run_after = NOW() + ($3 || ' milliseconds')::interval,
    updated_at = NOW()
WHERE
    id = $1
            "#;

            sqlx::query(retry_query)
                .bind(claim.id)
                .bind(&message)
                .bind(backoff.as_millis().to_string())
                .execute(&mut *tx)
                .await
                .map_err(|error| query_error("UPDATE", error))?;
        } else {
            let dead_letter_query = r#"
UPDATE
    job_queue
SET
    status = 'dead'::job_status,
    locked_by = NULL,
    locked_at = NULL,
    last_error = $2,
    last_error_at = NOW(),
    updated_at = NOW()
WHERE
    id = $1
            "#;

            sqlx::query(dead_letter_query)
                .bind(claim.id)
                .bind(&message)
                .execute(&mut *tx)
                .await
                .map_err(|error| query_error("UPDATE", error))?;
        }

        tx.commit()
            .await
            .map_err(|error| QueueError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })
    }

    /// Release every lease older than `lease_seconds`, making the jobs
    /// immediately claimable again. Returns the number of reclaimed rows.
    ///
    /// No run row is written: runs record observed handler outcomes and a
    /// reclaim is evidence of absence. The reclaim is visible through
    /// `last_error` instead. Attempts are not refunded; a stuck job spends
    /// one attempt per lost lease.
    pub async fn reclaim_stale(&self, lease_seconds: u32) -> PgQueueResult<u64> {
        let base_query = r#"
UPDATE
    job_queue
SET
    status = 'retrying'::job_status,
    locked_by = NULL,
    locked_at = NULL,
    run_after = NOW(),
    last_error = COALESCE(last_error, $2),
    last_error_at = NOW(),
    updated_at = NOW()
WHERE
    status = 'running'
    AND locked_at < NOW() - ($1 || ' seconds')::interval
        "#;

        let result = sqlx::query(base_query)
            .bind(lease_seconds.to_string())
            .bind(STALE_LEASE_ERROR)
            .execute(&self.pool)
            .await
            .map_err(|error| query_error("UPDATE", error))?;

        Ok(result.rows_affected())
    }

    /// List jobs, newest activity first. `limit` is clamped to `[1, 200]`
    /// and defaults to 50.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<i64>,
    ) -> PgQueueResult<Vec<Job>> {
        let base_query = r#"
SELECT
    *
FROM
    job_queue
WHERE
    $1::job_status IS NULL
    OR status = $1
ORDER BY
    updated_at DESC
LIMIT $2
        "#;

        sqlx::query_as::<_, Job>(base_query)
            .bind(status)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| query_error("SELECT", error))
    }

    pub async fn get_job(&self, id: i64) -> PgQueueResult<Option<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM job_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| query_error("SELECT", error))
    }

    /// List the run history of a job, latest attempt first. Same limit
    /// bounds as [`PgQueue::list_jobs`].
    pub async fn list_runs(&self, job_id: i64, limit: Option<i64>) -> PgQueueResult<Vec<JobRun>> {
        let base_query = r#"
SELECT
    *
FROM
    job_runs
WHERE
    job_id = $1
ORDER BY
    attempt DESC,
    id DESC
LIMIT $2
        "#;

        sqlx::query_as::<_, JobRun>(base_query)
            .bind(job_id)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| query_error("SELECT", error))
    }

    /// Round-trip to the database, returning its clock. Backs the
    /// db-reachability health check.
    pub async fn healthcheck(&self) -> PgQueueResult<DateTime<Utc>> {
        let row: (DateTime<Utc>,) = sqlx::query_as("SELECT NOW()")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| query_error("SELECT", error))?;

        Ok(row.0)
    }
}
