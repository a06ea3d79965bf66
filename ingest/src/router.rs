use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use health::HealthRegistry;
use pipeline_common::bus::EventBus;
use pipeline_common::metrics::{setup_metrics_recorder, track_metrics};
use pipeline_common::schema::SchemaRegistry;
use pipeline_common::store::DocumentStore;
use tower_http::trace::TraceLayer;

use crate::archive;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub bus: Arc<dyn EventBus>,
    pub registry: Arc<SchemaRegistry>,
    pub data_dir: PathBuf,
}

async fn index() -> &'static str {
    "ingest"
}

async fn liveness(State(registry): State<HealthRegistry>) -> health::HealthStatus {
    registry.get_status()
}

async fn readiness() -> &'static str {
    "ready"
}

pub fn router(state: AppState, liveness_registry: HealthRegistry, metrics: bool) -> Router {
    let probes = Router::new()
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness))
        .with_state(liveness_registry);

    let router = Router::new()
        .route("/", get(index))
        .route("/archives/:source", post(archive::ingest))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
        .merge(probes);

    // Don't install metrics unless asked to: installing a global recorder
    // when ingest is used as a library (during tests etc) does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
    } else {
        router
    }
}
