//! Claim jobs from the queue and dispatch them to their handlers.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

use jobq_common::health::HealthRegistry;
use jobq_common::metrics::{serve, setup_metrics_routes};
use jobq_common::pgqueue::PgQueue;
use jobq_worker::config::Config;
use jobq_worker::registry::HandlerRegistry;
use jobq_worker::worker::QueueWorker;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration");
    let worker_id = config.worker_id();

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let queue = PgQueue::new(
        &config.database_url,
        config.max_pg_connections,
        "jobq-worker",
    )
    .expect("failed to initialize queue");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(listen_for_shutdown(shutdown_tx));

    let worker = QueueWorker::new(
        &worker_id,
        queue.clone(),
        Arc::new(HandlerRegistry::with_builtin_handlers()),
        config.concurrency.0,
        config.poll_interval.0,
        config.lease_seconds.0,
        worker_liveness,
        shutdown_rx,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    info!(worker_id = %worker_id, "starting dispatch loop");
    let result = worker.run().await;

    // Give the pool a short grace period to drain before the process exits.
    _ = tokio::time::timeout(std::time::Duration::from_millis(250), queue.pool().close()).await;

    if let Err(e) = result {
        error!("worker loop failed: {}", e);
        std::process::exit(1);
    }
}

async fn listen_for_shutdown(shutdown: watch::Sender<bool>) {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, finishing in-flight batch"),
        _ = sigint.recv() => info!("received SIGINT, finishing in-flight batch"),
    }

    _ = shutdown.send(true);
}

pub async fn index() -> &'static str {
    "jobq worker"
}
