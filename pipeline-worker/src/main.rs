//! Consume pipeline events and run a single stage's transformation.
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use pipeline_common::bus::kafka::{KafkaEventBus, KafkaEventConsumer};
use pipeline_common::events::Stage;
use pipeline_common::metrics::{serve, setup_metrics_router};
use pipeline_common::schema::{FilesystemSchemaSource, SchemaRegistry};
use pipeline_common::store::pg::PgDocumentStore;
use pipeline_common::store::DocumentStore;
use pipeline_worker::config::Config;
use pipeline_worker::llm::{LlmClient, OpenAiBackend};
use pipeline_worker::splitter::TokenCounter;
use pipeline_worker::stages::chunking::ChunkingStage;
use pipeline_worker::stages::embedding::EmbeddingStage;
use pipeline_worker::stages::parsing::ParsingStage;
use pipeline_worker::stages::reporting::ReportingStage;
use pipeline_worker::stages::summarization::SummarizationStage;
use pipeline_worker::stages::StageProcessor;
use pipeline_worker::stats::StageStats;
use pipeline_worker::worker::StageWorker;

#[derive(Clone)]
struct AppState {
    liveness: HealthRegistry,
    stats: Arc<StageStats>,
}

async fn index() -> &'static str {
    "pipeline-worker"
}

async fn liveness(State(state): State<AppState>) -> health::HealthStatus {
    state.liveness.get_status()
}

async fn readiness() -> &'static str {
    "ready"
}

async fn stats(State(state): State<AppState>) -> Json<pipeline_worker::stats::StatsSnapshot> {
    Json(state.stats.snapshot())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness))
        .route("/_stats", get(stats))
        .with_state(state)
        .merge(setup_metrics_router())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let stage = Stage::from_str(&config.stage).expect("STAGE must name a pipeline stage");

    let liveness = HealthRegistry::new("liveness");

    let store = PgDocumentStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to the document store");
    store.migrate().await.expect("failed to apply migrations");
    let store: Arc<dyn DocumentStore> = Arc::new(store);

    let schema_source = FilesystemSchemaSource::new(&config.schema_dir);
    let registry = Arc::new(
        SchemaRegistry::from_source(&schema_source)
            .await
            .expect("failed to load event schemas"),
    );

    let producer_liveness = liveness
        .register("rdkafka-producer".to_string(), time::Duration::seconds(30))
        .await;
    let bus = Arc::new(
        KafkaEventBus::new(&config.kafka, Some(producer_liveness))
            .expect("failed to connect to Kafka"),
    );

    // One consumer group per stage, so instances of the same stage compete
    // for deliveries and different stages each see every event
    let mut consumer_config = config.consumer.clone();
    consumer_config.kafka_consumer_group =
        format!("{}-{}", consumer_config.kafka_consumer_group, stage);
    let consumer = Arc::new(
        KafkaEventConsumer::new(
            &config.kafka,
            &consumer_config,
            stage.consumed_event_type().as_str(),
        )
        .expect("failed to subscribe to the stage's queue"),
    );

    let processor: Arc<dyn StageProcessor> = match stage {
        Stage::Parsing => Arc::new(ParsingStage::new(store.clone())),
        Stage::Chunking => Arc::new(
            ChunkingStage::new(
                store.clone(),
                config.chunking.chunk_config(),
                TokenCounter::cl100k().expect("embedded cl100k vocabulary loads"),
            )
            .expect("invalid chunking configuration"),
        ),
        Stage::Embedding | Stage::Summarization => {
            let client = LlmClient::new(&config.llm.base_url, &config.llm.api_key)
                .expect("invalid LLM backend configuration");
            let backend = Arc::new(OpenAiBackend::new(
                client,
                &config.llm.embedding_model,
                &config.llm.summary_model,
                config.llm.embedding_timeout.0,
                config.llm.summary_timeout.0,
            ));
            let processor: Arc<dyn StageProcessor> = match stage {
                Stage::Embedding => Arc::new(EmbeddingStage::new(
                    store.clone(),
                    backend,
                    config.llm.embedding_batch_size,
                )),
                _ => Arc::new(SummarizationStage::new(store.clone(), backend)),
            };
            processor
        }
        Stage::Reporting => Arc::new(ReportingStage::new(store.clone())),
    };

    let stats = Arc::new(StageStats::new());
    let loop_liveness = liveness
        .register("consumer-loop".to_string(), time::Duration::seconds(60))
        .await;

    let worker = StageWorker::new(
        processor,
        consumer,
        bus,
        store,
        registry,
        config.retry.policy(),
        stats.clone(),
        loop_liveness,
    );

    let state = AppState {
        liveness: liveness.clone(),
        stats,
    };
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(app(state), &bind)
            .await
            .expect("failed to start serving health and metrics");
    });

    tracing::info!(stage = %stage, "pipeline worker starting");
    if let Err(error) = worker.run().await {
        tracing::error!("pipeline worker exited: {}", error);
        std::process::exit(1);
    }
}
