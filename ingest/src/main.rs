//! Archive ingestion HTTP service.
use std::sync::Arc;

use envconfig::Envconfig;
use health::HealthRegistry;
use ingest::config::Config;
use ingest::router;
use pipeline_common::bus::kafka::KafkaEventBus;
use pipeline_common::schema::{FilesystemSchemaSource, SchemaRegistry};
use pipeline_common::store::pg::PgDocumentStore;
use tokio::signal;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");

    let store = PgDocumentStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to the document store");
    store.migrate().await.expect("failed to apply migrations");

    let registry = Arc::new(
        SchemaRegistry::from_source(&FilesystemSchemaSource::new(&config.schema_dir))
            .await
            .expect("failed to load event schemas"),
    );

    let producer_liveness = liveness
        .register("rdkafka-producer".to_string(), time::Duration::seconds(30))
        .await;
    let bus = KafkaEventBus::new(&config.kafka, Some(producer_liveness))
        .expect("failed to connect to Kafka");

    let state = router::AppState {
        store: Arc::new(store),
        bus: Arc::new(bus),
        registry,
        data_dir: config.data_dir.clone().into(),
    };
    let app = router::router(state, liveness, config.export_prometheus);

    tracing::info!("listening on {}", config.address);
    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .expect("failed to bind ingest address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await
        .expect("ingest server exited");
}
