use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use jobq_common::metrics::setup_metrics_routes;
use jobq_common::pgqueue::PgQueue;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let queue = PgQueue::new(
        &config.database_url,
        config.max_pg_connections,
        "jobq-api",
    )
    .expect("failed to initialize queue");

    let app = handlers::add_routes(Router::new(), queue);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start jobq-api http server, {}", e),
    }
}
