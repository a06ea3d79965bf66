//! Failed-queue triage endpoints.
//!
//! The pipeline never retries a failed event on its own: once a stage
//! exhausts its retries, the failure sits in the `failed_events` collection
//! until a human inspects it here, fixes the root cause, and requeues the
//! original event — or purges it. Requeueing republishes the stored original
//! envelope on its original routing key, so the owning stage simply sees a
//! redelivery.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use metrics::counter;
use pipeline_common::bus::EventBus;
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::model::FailedEventRecord;
use pipeline_common::store::{collections, DocumentStore};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub bus: Arc<dyn EventBus>,
}

#[derive(Deserialize)]
pub struct FailedFilter {
    pub stage: Option<String>,
}

async fn list_failed(
    State(state): State<AppState>,
    Query(filter): Query<FailedFilter>,
) -> Result<Json<Vec<Value>>, StatusCode> {
    let filter = match filter.stage {
        Some(stage) => json!({"stage": stage}),
        None => json!({}),
    };
    let records = state
        .store
        .find(collections::FAILED_EVENTS, &filter)
        .await
        .map_err(|error| {
            tracing::error!("failed to list failure records: {}", error);
            StatusCode::SERVICE_UNAVAILABLE
        })?;
    Ok(Json(records))
}

async fn requeue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let Some(doc) = state
        .store
        .get(collections::FAILED_EVENTS, &id)
        .await
        .map_err(|error| {
            tracing::error!("failed to load failure record: {}", error);
            StatusCode::SERVICE_UNAVAILABLE
        })?
    else {
        return Err(StatusCode::NOT_FOUND);
    };

    let record: FailedEventRecord = serde_json::from_value(doc).map_err(|error| {
        tracing::error!("failure record {} does not decode: {}", id, error);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let envelope: EventEnvelope =
        serde_json::from_value(record.original_envelope.clone()).map_err(|error| {
            tracing::error!("original envelope in {} does not decode: {}", id, error);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    state
        .bus
        .publish(&record.original_routing_key, &envelope)
        .await
        .map_err(|error| {
            tracing::error!("failed to requeue {}: {}", id, error);
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    // The record only leaves the queue once the republish went through
    state
        .store
        .delete(collections::FAILED_EVENTS, &id)
        .await
        .map_err(|error| {
            tracing::error!("failed to clear requeued record {}: {}", id, error);
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    counter!("ops_failed_events_requeued_total", "stage" => record.stage.clone()).increment(1);
    tracing::info!(
        record = %id,
        routing_key = %record.original_routing_key,
        "failed event requeued"
    );

    Ok(Json(json!({
        "requeued": true,
        "routing_key": record.original_routing_key,
    })))
}

async fn purge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let removed = state
        .store
        .delete(collections::FAILED_EVENTS, &id)
        .await
        .map_err(|error| {
            tracing::error!("failed to purge record {}: {}", id, error);
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    match removed {
        true => {
            counter!("ops_failed_events_purged_total").increment(1);
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(StatusCode::NOT_FOUND),
    }
}

async fn index() -> &'static str {
    "pipeline-ops"
}

pub fn add_routes(router: Router, state: AppState) -> Router {
    router.merge(
        Router::new()
            .route("/", get(index))
            .route("/failed", get(list_failed))
            .route("/failed/:id/requeue", post(requeue))
            .route("/failed/:id", delete(purge))
            .with_state(state),
    )
}

#[cfg(test)]
mod tests {
    use pipeline_common::bus::MemoryBus;
    use pipeline_common::store::MemoryDocumentStore;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::*;

    async fn seed_failure(store: &MemoryDocumentStore, stage: &str) -> String {
        let original = EventEnvelope::new(
            "archive.ingested",
            json!({"archive_id": "ab12cd34ef56ab78"}),
        );
        let id = Uuid::now_v7().to_string();
        let record = FailedEventRecord {
            id: id.clone(),
            stage: stage.to_owned(),
            original_routing_key: original.event_type.clone(),
            original_envelope: serde_json::to_value(&original).unwrap(),
            error_message: "corrupt mbox".to_owned(),
            error_type: "Parse Error".to_owned(),
            retry_count: 0,
            failed_at: OffsetDateTime::now_utc(),
        };
        store
            .upsert(
                collections::FAILED_EVENTS,
                &id,
                serde_json::to_value(&record).unwrap(),
            )
            .await
            .unwrap();
        id
    }

    fn state(bus: &MemoryBus, store: Arc<MemoryDocumentStore>) -> AppState {
        AppState {
            store,
            bus: Arc::new(bus.clone()),
        }
    }

    #[tokio::test]
    async fn listing_filters_by_stage() {
        let bus = MemoryBus::new();
        let store = Arc::new(MemoryDocumentStore::new());
        seed_failure(&store, "parsing").await;
        seed_failure(&store, "chunking").await;
        let state = state(&bus, store);

        let all = list_failed(State(state.clone()), Query(FailedFilter { stage: None }))
            .await
            .unwrap();
        assert_eq!(all.0.len(), 2);

        let parsing = list_failed(
            State(state),
            Query(FailedFilter {
                stage: Some("parsing".to_owned()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(parsing.0.len(), 1);
        assert_eq!(parsing.0[0]["stage"], json!("parsing"));
    }

    #[tokio::test]
    async fn requeue_republishes_the_original_and_clears_the_record() {
        let bus = MemoryBus::new();
        let store = Arc::new(MemoryDocumentStore::new());
        let id = seed_failure(&store, "parsing").await;
        let state = state(&bus, store.clone());

        let response = requeue(State(state), Path(id.clone())).await.unwrap();
        assert_eq!(response.0["requeued"], json!(true));

        // The original envelope is back on its original routing key
        let republished = bus.published("archive.ingested");
        assert_eq!(republished.len(), 1);
        assert_eq!(
            republished[0]["data"]["archive_id"],
            json!("ab12cd34ef56ab78")
        );

        assert!(store.is_empty(collections::FAILED_EVENTS));
    }

    #[tokio::test]
    async fn requeue_of_unknown_record_is_not_found() {
        let bus = MemoryBus::new();
        let store = Arc::new(MemoryDocumentStore::new());
        let state = state(&bus, store);

        let result = requeue(State(state), Path("missing".to_owned())).await;
        assert!(matches!(result, Err(StatusCode::NOT_FOUND)));
    }

    #[tokio::test]
    async fn purge_removes_without_republishing() {
        let bus = MemoryBus::new();
        let store = Arc::new(MemoryDocumentStore::new());
        let id = seed_failure(&store, "parsing").await;
        let state = state(&bus, store.clone());

        let status = purge(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(store.is_empty(collections::FAILED_EVENTS));
        assert!(bus.published("archive.ingested").is_empty());

        let again = purge(State(state), Path("gone".to_owned())).await;
        assert!(matches!(again, Err(StatusCode::NOT_FOUND)));
    }
}
