//! Operator API for failed-queue triage.
use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use pipeline_common::bus::kafka::KafkaEventBus;
use pipeline_common::metrics::setup_metrics_router;
use pipeline_common::store::pg::PgDocumentStore;

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

    let store = PgDocumentStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to the document store");
    store.migrate().await.expect("failed to apply migrations");

    let bus = KafkaEventBus::new(&config.kafka, None).expect("failed to connect to Kafka");

    let state = handlers::AppState {
        store: Arc::new(store),
        bus: Arc::new(bus),
    };
    let app = handlers::add_routes(Router::new(), state);
    let app = app.merge(setup_metrics_router());

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start pipeline-ops http server, {}", e),
    }
}
