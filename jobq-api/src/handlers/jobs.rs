use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_derive::Deserialize;
use tracing::error;

use jobq_common::pgqueue::{
    Job, JobRun, JobStatus, NewJob, PgQueue, QueueError, MAX_ATTEMPTS_LIMIT,
};

/// The body of a request made to enqueue a job.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct JobPostRequestBody {
    #[serde(rename = "type")]
    job_type: String,
    key: String,
    payload: Option<serde_json::Value>,
    /// Delay before the job becomes claimable, in milliseconds from now.
    run_after_ms: Option<i64>,
    max_attempts: Option<i32>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    ok: bool,
    error: &'static str,
}

#[derive(Serialize)]
pub struct JobPostResponse {
    ok: bool,
    job: Job,
}

#[derive(Serialize)]
pub struct JobGetResponse {
    ok: bool,
    job: Job,
}

#[derive(Serialize)]
pub struct JobListResponse {
    ok: bool,
    jobs: Vec<Job>,
}

#[derive(Serialize)]
pub struct RunListResponse {
    ok: bool,
    runs: Vec<JobRun>,
}

#[derive(Serialize)]
pub struct ServiceHealthResponse {
    ok: bool,
    service: &'static str,
    time: i64,
}

#[derive(Serialize)]
pub struct DbHealthResponse {
    ok: bool,
    #[serde(rename = "dbTime")]
    db_time: i64,
    time: i64,
}

type ErrorReply = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, code: &'static str) -> ErrorReply {
    (status, Json(ErrorResponse { ok: false, error: code }))
}

/// Map engine errors onto the response envelope. Validation problems are the
/// caller's fault, contention asks them to come back, anything else is ours
/// and only the logs get the detail.
fn queue_error(context: &'static str, error: QueueError) -> ErrorReply {
    match error {
        QueueError::InvalidInput(_) | QueueError::ParseJobStatusError(_) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_input")
        }
        error if error.is_transient() => {
            error!("{} hit database contention: {}", context, error);
            error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
        error => {
            error!("{} failed: {}", context, error);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

fn parse_job_id(raw: &str) -> Result<i64, ErrorReply> {
    raw.parse::<i64>()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid_input"))
}

pub async fn create(
    State(queue): State<PgQueue>,
    Json(body): Json<JobPostRequestBody>,
) -> Result<(StatusCode, Json<JobPostResponse>), ErrorReply> {
    if body.job_type.is_empty() || body.key.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "invalid_input"));
    }
    if let Some(max_attempts) = body.max_attempts {
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&max_attempts) {
            return Err(error_response(StatusCode::BAD_REQUEST, "invalid_input"));
        }
    }
    if body.run_after_ms.is_some_and(|ms| ms < 0) {
        return Err(error_response(StatusCode::BAD_REQUEST, "invalid_input"));
    }

    let mut new_job = NewJob::new(&body.job_type, &body.key);
    if let Some(payload) = body.payload {
        new_job = new_job.with_payload(payload);
    }
    if let Some(run_after_ms) = body.run_after_ms {
        new_job = new_job.with_run_after(Utc::now() + Duration::milliseconds(run_after_ms));
    }
    if let Some(max_attempts) = body.max_attempts {
        new_job = new_job.with_max_attempts(max_attempts);
    }

    let start_time = Instant::now();

    let job = queue
        .enqueue(new_job)
        .await
        .map_err(|error| queue_error("enqueue", error))?;

    metrics::histogram!("jobq_api_enqueue").record(start_time.elapsed().as_secs_f64());

    Ok((StatusCode::CREATED, Json(JobPostResponse { ok: true, job })))
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    status: Option<String>,
    limit: Option<i64>,
}

pub async fn list(
    State(queue): State<PgQueue>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ErrorReply> {
    let status = match query.status.as_deref() {
        Some(value) => Some(
            value
                .parse::<JobStatus>()
                .map_err(|error| queue_error("list_jobs", error))?,
        ),
        None => None,
    };

    let jobs = queue
        .list_jobs(status, query.limit)
        .await
        .map_err(|error| queue_error("list_jobs", error))?;

    Ok(Json(JobListResponse { ok: true, jobs }))
}

pub async fn get_one(
    State(queue): State<PgQueue>,
    Path(id): Path<String>,
) -> Result<Json<JobGetResponse>, ErrorReply> {
    let id = parse_job_id(&id)?;

    match queue
        .get_job(id)
        .await
        .map_err(|error| queue_error("get_job", error))?
    {
        Some(job) => Ok(Json(JobGetResponse { ok: true, job })),
        None => Err(error_response(StatusCode::NOT_FOUND, "not_found")),
    }
}

#[derive(Deserialize)]
pub struct ListRunsQuery {
    limit: Option<i64>,
}

pub async fn list_runs(
    State(queue): State<PgQueue>,
    Path(id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<RunListResponse>, ErrorReply> {
    let id = parse_job_id(&id)?;

    let runs = queue
        .list_runs(id, query.limit)
        .await
        .map_err(|error| queue_error("list_runs", error))?;

    Ok(Json(RunListResponse { ok: true, runs }))
}

pub async fn service_health() -> Json<ServiceHealthResponse> {
    Json(ServiceHealthResponse {
        ok: true,
        service: "jobq-api",
        time: Utc::now().timestamp_millis(),
    })
}

pub async fn db_health(
    State(queue): State<PgQueue>,
) -> Result<Json<DbHealthResponse>, ErrorReply> {
    match queue.healthcheck().await {
        Ok(db_time) => Ok(Json(DbHealthResponse {
            ok: true,
            db_time: db_time.timestamp_millis(),
            time: Utc::now().timestamp_millis(),
        })),
        Err(error) => {
            error!("database health check failed: {}", error);
            Err(error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable"))
        }
    }
}
