use axum::{routing, Router};

use jobq_common::pgqueue::PgQueue;

use super::jobs;

pub fn add_routes(router: Router, queue: PgQueue) -> Router {
    let api = Router::new()
        .route("/health", routing::get(jobs::service_health))
        .route("/db/health", routing::get(jobs::db_health))
        .route("/jobs", routing::post(jobs::create).get(jobs::list))
        .route("/jobs/:id", routing::get(jobs::get_one))
        .route("/jobs/:id/runs", routing::get(jobs::list_runs))
        .with_state(queue);

    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .merge(api)
}

pub async fn index() -> &'static str {
    "jobq api"
}
