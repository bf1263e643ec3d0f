//! The dispatch loop: claim jobs, run their handlers, report outcomes.

use std::sync::Arc;
use std::time;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use jobq_common::health::HealthHandle;
use jobq_common::pgqueue::{HandlerFailure, Job, PgQueue};

use crate::error::WorkerError;
use crate::registry::HandlerRegistry;

/// How often each worker sweeps expired leases back into the claimable pool.
const RECLAIM_INTERVAL: time::Duration = time::Duration::from_secs(30);

/// A worker that polls a `PgQueue` and dispatches claimed jobs to registered
/// handlers.
pub struct QueueWorker {
    /// An identifier for this worker. Used to mark jobs we have claimed.
    name: String,
    /// The queue we will be claiming jobs from.
    queue: PgQueue,
    /// Maps job types to the handlers that execute them.
    registry: Arc<HandlerRegistry>,
    /// Number of claim attempts launched in parallel per batch.
    concurrency: usize,
    /// How long to sleep when a full batch comes back empty.
    poll_interval: time::Duration,
    /// Seconds a claim may stay unreported before another worker may take it.
    lease_seconds: u32,
    /// The liveness check handle, reported on every poll tick.
    liveness: HealthHandle,
    /// Flipped to true when the process is asked to shut down.
    shutdown: watch::Receiver<bool>,
}

impl QueueWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: PgQueue,
        registry: Arc<HandlerRegistry>,
        concurrency: usize,
        poll_interval: time::Duration,
        lease_seconds: u32,
        liveness: HealthHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            registry,
            concurrency,
            poll_interval,
            lease_seconds,
            liveness,
            shutdown,
        }
    }

    /// Run until shutdown is signalled or the queue returns a fatal error.
    /// The in-flight batch always finishes before the loop exits.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let reclaimer = tokio::spawn(reclaim_loop(self.queue.clone(), self.lease_seconds));

        let result = self.poll_loop().await;

        reclaimer.abort();
        result
    }

    async fn poll_loop(&self) -> Result<(), WorkerError> {
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                info!("shutdown requested, stopping dispatch loop");
                return Ok(());
            }

            self.liveness.report_healthy().await;

            let batch = (0..self.concurrency).map(|_| self.claim_and_process());
            let outcomes = join_all(batch).await;

            let mut claimed = 0usize;
            for outcome in outcomes {
                if outcome? {
                    claimed += 1;
                }
            }
            metrics::gauge!("jobq_worker_saturation_percent")
                .set(claimed as f64 / self.concurrency as f64);

            if claimed == 0 {
                // Idle. Back off until the next poll tick, waking early on
                // shutdown so we do not hold the process open.
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// Claim and execute at most one job. Returns whether a job was claimed.
    async fn claim_and_process(&self) -> Result<bool, WorkerError> {
        let claim = match self.queue.claim(&self.name).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(false),
            Err(error) if error.is_transient() => {
                // Contention is not fatal; the next poll tick retries.
                warn!("transient error while claiming: {}", error);
                return Ok(false);
            }
            Err(error) => return Err(WorkerError::QueueError(error)),
        };

        self.process(claim).await?;

        Ok(true)
    }

    /// Execute one claimed job and report its outcome back to the queue.
    /// Handler errors are routed through the failure path; only queue errors
    /// propagate.
    async fn process(&self, claim: Job) -> Result<(), WorkerError> {
        let labels = [("type", claim.job_type.clone())];
        metrics::counter!("jobq_jobs_claimed", &labels).increment(1);

        let started_at = Utc::now();
        let start = tokio::time::Instant::now();

        // Handlers only ever see the payload and a database handle, never the
        // claim itself.
        let outcome = match self.registry.get(&claim.job_type) {
            Some(handler) => handler(self.queue.pool(), claim.payload.0.clone()).await,
            None => Err(anyhow::anyhow!(
                "No handler registered for job type {}",
                claim.job_type
            )),
        };

        let elapsed = start.elapsed().as_secs_f64();

        match outcome {
            Ok(result) => {
                let summary =
                    serde_json::to_string(&result).unwrap_or_else(|_| "null".to_owned());
                self.queue
                    .success(&claim, started_at, Some(&summary))
                    .await?;

                metrics::counter!("jobq_jobs_completed", &labels).increment(1);
                metrics::histogram!("jobq_jobs_processing_duration_seconds", &labels)
                    .record(elapsed);
            }
            Err(error) => {
                warn!(
                    job_id = claim.id,
                    job_type = %claim.job_type,
                    "job attempt {} failed: {:#}",
                    claim.attempts,
                    error
                );

                let will_retry = claim.attempts < claim.max_attempts;
                let failure =
                    HandlerFailure::new(error.to_string()).with_stack(format!("{:?}", error));
                self.queue.failure(&claim, started_at, &failure).await?;

                if will_retry {
                    metrics::counter!("jobq_jobs_retried", &labels).increment(1);
                } else {
                    metrics::counter!("jobq_jobs_dead_lettered", &labels).increment(1);
                }
            }
        }

        Ok(())
    }
}

/// Periodically sweep expired leases. Errors are logged and retried on the
/// next tick; a broken reclaimer must not take the dispatch loop down.
async fn reclaim_loop(queue: PgQueue, lease_seconds: u32) {
    let mut interval = tokio::time::interval(RECLAIM_INTERVAL);

    loop {
        interval.tick().await;

        match queue.reclaim_stale(lease_seconds).await {
            Ok(0) => {}
            Ok(reclaimed) => {
                info!("reclaimed {} stale jobs", reclaimed);
                metrics::counter!("jobq_jobs_reclaimed").increment(reclaimed);
            }
            Err(error) => warn!("failed to reclaim stale jobs: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use sqlx::PgPool;

    use jobq_common::health::HealthRegistry;
    use jobq_common::pgqueue::{JobStatus, NewJob, RunStatus};

    /// Use process id as a worker id for tests.
    fn worker_id() -> String {
        std::process::id().to_string()
    }

    async fn test_worker(db: PgPool, name: &str, registry: HandlerRegistry) -> QueueWorker {
        let health = HealthRegistry::new("liveness");
        let liveness = health
            .register("worker".to_string(), ::time::Duration::seconds(30))
            .await;
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the shutdown channel stays open for the test.
        std::mem::forget(tx);

        QueueWorker::new(
            name,
            PgQueue::new_from_pool(db),
            Arc::new(registry),
            1,
            time::Duration::from_millis(100),
            120,
            liveness,
            rx,
        )
    }

    async fn make_claimable(db: &PgPool, job_id: i64) {
        sqlx::query("UPDATE job_queue SET run_after = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(db)
            .await
            .expect("failed to reset run_after");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_worker_processes_ping_job(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());
        let worker = test_worker(
            db.clone(),
            &worker_id(),
            HandlerRegistry::with_builtin_handlers(),
        )
        .await;

        let job = queue
            .enqueue(NewJob::new("ping", "ping:test").with_payload(json!({"msg": "hi"})))
            .await
            .expect("failed to enqueue job");

        let claimed = worker
            .claim_and_process()
            .await
            .expect("dispatch failed");
        assert!(claimed);

        let done = queue
            .get_job(job.id)
            .await
            .expect("failed to get job")
            .expect("job disappeared");
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempts, 1);
        assert!(done.locked_by.is_none());

        let runs = queue
            .list_runs(job.id, None)
            .await
            .expect("failed to list runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].attempt, 1);
        assert!(runs[0].duration_ms >= 0);
        assert_eq!(
            runs[0].result_summary.as_deref(),
            Some(r#"{"ok":true,"payload":{"msg":"hi"}}"#)
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_worker_is_idle_on_empty_queue(db: PgPool) {
        let worker = test_worker(
            db,
            &worker_id(),
            HandlerRegistry::with_builtin_handlers(),
        )
        .await;

        let claimed = worker
            .claim_and_process()
            .await
            .expect("dispatch failed");
        assert!(!claimed);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_worker_fails_job_with_no_handler(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());
        let worker = test_worker(db, &worker_id(), HandlerRegistry::new()).await;

        let job = queue
            .enqueue(NewJob::new("ping", "ping:test"))
            .await
            .expect("failed to enqueue job");

        let claimed = worker
            .claim_and_process()
            .await
            .expect("dispatch failed");
        assert!(claimed);

        let failed = queue
            .get_job(job.id)
            .await
            .expect("failed to get job")
            .expect("job disappeared");
        assert_eq!(failed.status, JobStatus::Retrying);
        assert_eq!(
            failed.last_error.as_deref(),
            Some("No handler registered for job type ping")
        );

        let runs = queue
            .list_runs(job.id, None)
            .await
            .expect("failed to list runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Fail);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_worker_retries_then_succeeds(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());

        // Fails the first attempt, succeeds afterwards.
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        let handler_calls = calls.clone();
        registry.register("flaky", move |_db, _payload| {
            let calls = handler_calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow::anyhow!("first attempt fails"))
                } else {
                    Ok(json!({"recovered": true}))
                }
            }
        });
        let worker = test_worker(db.clone(), &worker_id(), registry).await;

        let job = queue
            .enqueue(NewJob::new("flaky", "flaky:test"))
            .await
            .expect("failed to enqueue job");

        assert!(worker.claim_and_process().await.expect("dispatch failed"));

        let retrying = queue
            .get_job(job.id)
            .await
            .expect("failed to get job")
            .expect("job disappeared");
        assert_eq!(retrying.status, JobStatus::Retrying);
        assert!(retrying.last_error.is_some());
        // Backoff pushed the retry at least 10s out.
        assert!(
            retrying.run_after - retrying.updated_at >= chrono::Duration::seconds(10)
        );

        make_claimable(&db, job.id).await;
        assert!(worker.claim_and_process().await.expect("dispatch failed"));

        let succeeded = queue
            .get_job(job.id)
            .await
            .expect("failed to get job")
            .expect("job disappeared");
        assert_eq!(succeeded.status, JobStatus::Succeeded);
        assert_eq!(succeeded.attempts, 2);
        assert!(succeeded.last_error.is_none());

        let runs = queue
            .list_runs(job.id, None)
            .await
            .expect("failed to list runs");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].attempt, 2);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[1].attempt, 1);
        assert_eq!(runs[1].status, RunStatus::Fail);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_worker_dead_letters_exhausted_job(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());

        let mut registry = HandlerRegistry::new();
        registry.register("doomed", |_db, _payload| async move {
            Err(anyhow::anyhow!("always fails"))
        });
        let worker = test_worker(db.clone(), &worker_id(), registry).await;

        let job = queue
            .enqueue(NewJob::new("doomed", "doomed:test").with_max_attempts(2))
            .await
            .expect("failed to enqueue job");

        assert!(worker.claim_and_process().await.expect("dispatch failed"));
        make_claimable(&db, job.id).await;
        assert!(worker.claim_and_process().await.expect("dispatch failed"));

        let dead = queue
            .get_job(job.id)
            .await
            .expect("failed to get job")
            .expect("job disappeared");
        assert_eq!(dead.status, JobStatus::Dead);
        assert_eq!(dead.attempts, 2);
        assert_eq!(dead.last_error.as_deref(), Some("always fails"));
        assert!(dead.locked_by.is_none());

        let runs = queue
            .list_runs(job.id, None)
            .await
            .expect("failed to list runs");
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|run| run.status == RunStatus::Fail));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_duplicate_location_jobs_coalesce_into_one_upsert(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());
        let worker = test_worker(
            db.clone(),
            &worker_id(),
            HandlerRegistry::with_builtin_handlers(),
        )
        .await;

        // Enqueued twice before any worker runs; the second call coalesces.
        for _attempt in 0..2 {
            queue
                .enqueue(
                    NewJob::new("location.upsert", "location:test")
                        .with_payload(json!({"lat": 43.25512, "lon": -79.87149})),
                )
                .await
                .expect("failed to enqueue job");
        }

        let (job_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_queue")
            .fetch_one(&db)
            .await
            .expect("failed to count jobs");
        assert_eq!(job_count, 1);

        assert!(worker.claim_and_process().await.expect("dispatch failed"));
        assert!(!worker.claim_and_process().await.expect("dispatch failed"));

        let (key, lat, lon): (String, f64, f64) =
            sqlx::query_as("SELECT key, lat, lon FROM locations")
                .fetch_one(&db)
                .await
                .expect("failed to read locations");
        assert_eq!(key, "43.255,-79.871");
        assert_eq!(lat, 43.255);
        assert_eq!(lon, -79.871);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_two_workers_claim_each_job_exactly_once(db: PgPool) {
        let queue = PgQueue::new_from_pool(db.clone());
        let worker_one = test_worker(
            db.clone(),
            "worker-1",
            HandlerRegistry::with_builtin_handlers(),
        )
        .await;
        let worker_two = test_worker(
            db.clone(),
            "worker-2",
            HandlerRegistry::with_builtin_handlers(),
        )
        .await;

        let mut job_ids = Vec::new();
        for i in 0..5 {
            let job = queue
                .enqueue(NewJob::new("ping", &format!("ping:{}", i)))
                .await
                .expect("failed to enqueue job");
            job_ids.push(job.id);
        }

        loop {
            let (one, two) = tokio::join!(
                worker_one.claim_and_process(),
                worker_two.claim_and_process()
            );
            if !one.expect("dispatch failed") && !two.expect("dispatch failed") {
                break;
            }
        }

        for job_id in job_ids {
            let job = queue
                .get_job(job_id)
                .await
                .expect("failed to get job")
                .expect("job disappeared");
            assert_eq!(job.status, JobStatus::Succeeded);
            assert_eq!(job.attempts, 1);

            // No job ever has two runs for the same attempt.
            let runs = queue
                .list_runs(job_id, None)
                .await
                .expect("failed to list runs");
            assert_eq!(runs.len(), 1);
            assert_eq!(runs[0].attempt, 1);
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_poll_loop_exits_on_shutdown(db: PgPool) {
        let health = HealthRegistry::new("liveness");
        let liveness = health
            .register("worker".to_string(), ::time::Duration::seconds(30))
            .await;
        let (tx, rx) = watch::channel(false);

        let worker = QueueWorker::new(
            &worker_id(),
            PgQueue::new_from_pool(db),
            Arc::new(HandlerRegistry::with_builtin_handlers()),
            1,
            time::Duration::from_millis(100),
            120,
            liveness,
            rx,
        );

        tx.send(true).expect("failed to signal shutdown");

        let result = tokio::time::timeout(time::Duration::from_secs(5), worker.run())
            .await
            .expect("worker did not stop on shutdown");
        assert!(result.is_ok());
    }
}
