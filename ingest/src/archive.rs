//! Archive upload handling.
//!
//! An archive's identity is its content: `archive_id` is derived from the
//! sha256 of the uploaded bytes, so re-uploading the same mbox resolves to
//! the existing record instead of creating a duplicate. The persist order is
//! file, then document, then event — the parsing stage only ever learns about
//! an archive whose bytes are already on disk.

use std::io::prelude::*;
use std::path::{Path, PathBuf};

use axum::extract::{Path as UrlPath, State};
use axum::http::HeaderMap;
use axum::Json;
use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use metrics::counter;
use pipeline_common::envelope::EventEnvelope;
use pipeline_common::events::{ArchiveIngested, EventPayload, EventType};
use pipeline_common::identity;
use pipeline_common::model::ArchiveDocument;
use pipeline_common::store::collections;
use time::OffsetDateTime;
use tracing::instrument;

use crate::api::{IngestError, IngestResponse};
use crate::router;

#[instrument(skip_all, fields(source, bytes, archive_id))]
pub async fn ingest(
    state: State<router::AppState>,
    UrlPath(source): UrlPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, IngestError> {
    tracing::Span::current().record("source", source.as_str());

    if !valid_source_name(&source) {
        return Err(IngestError::InvalidSourceName);
    }

    let content_encoding = headers
        .get("content-encoding")
        .map_or("", |v| v.to_str().unwrap_or(""));
    let bytes = decode_body(content_encoding, body)?;
    tracing::Span::current().record("bytes", bytes.len());

    if bytes.is_empty() {
        return Err(IngestError::EmptyArchive);
    }

    counter!("ingest_archives_received_total").increment(1);

    let outcome = store_archive(&state, &source, &bytes).await?;
    tracing::Span::current().record("archive_id", outcome.archive_id.as_str());

    if outcome.deduplicated {
        counter!("ingest_archives_deduplicated_total").increment(1);
    } else {
        counter!("ingest_archives_ingested_total").increment(1);
    }

    Ok(Json(outcome))
}

fn valid_source_name(source: &str) -> bool {
    !source.is_empty()
        && source
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn decode_body(content_encoding: &str, body: Bytes) -> Result<Vec<u8>, IngestError> {
    match content_encoding {
        "gzip" => {
            let mut decoder = GzDecoder::new(body.reader());
            let mut decoded = Vec::new();
            decoder.read_to_end(&mut decoded).map_err(|e| {
                tracing::error!("failed to decode gzip: {}", e);
                IngestError::RequestDecodingError(String::from("invalid gzip data"))
            })?;
            Ok(decoded)
        }
        "" | "identity" => Ok(body.to_vec()),
        other => Err(IngestError::RequestDecodingError(format!(
            "unsupported content encoding {}",
            other
        ))),
    }
}

fn archive_path(data_dir: &Path, source: &str, archive_id: &str) -> PathBuf {
    data_dir.join(format!("{}-{}.mbox", source, archive_id))
}

/// Dedup, persist, publish. Factored out of the axum handler so tests can
/// drive it without HTTP plumbing.
pub async fn store_archive(
    state: &router::AppState,
    source: &str,
    bytes: &[u8],
) -> Result<IngestResponse, IngestError> {
    let archive_id = identity::archive_id(bytes);
    let file_hash = identity::file_hash(bytes);

    // Identical bytes resolve to the record we already hold
    let existing = state
        .store
        .get(collections::ARCHIVES, &archive_id)
        .await
        .map_err(|e| {
            tracing::error!("archive lookup failed: {}", e);
            IngestError::RetryableStorageError
        })?;
    if existing.is_some() {
        tracing::info!(%archive_id, "archive already ingested, deduplicating");
        return Ok(IngestResponse {
            archive_id,
            deduplicated: true,
        });
    }

    let path = archive_path(&state.data_dir, source, &archive_id);
    tokio::fs::create_dir_all(&state.data_dir).await.map_err(|e| {
        tracing::error!("failed to create archive directory: {}", e);
        IngestError::RetryableStorageError
    })?;
    tokio::fs::write(&path, bytes).await.map_err(|e| {
        tracing::error!("failed to write archive file: {}", e);
        IngestError::RetryableStorageError
    })?;

    let document = ArchiveDocument {
        archive_id: archive_id.clone(),
        source_name: source.to_owned(),
        file_path: path.to_string_lossy().into_owned(),
        file_hash_sha256: file_hash.clone(),
        ingested_at: OffsetDateTime::now_utc(),
    };
    state
        .store
        .upsert(
            collections::ARCHIVES,
            &archive_id,
            serde_json::to_value(&document).map_err(|e| {
                tracing::error!("failed to encode archive document: {}", e);
                IngestError::RetryableStorageError
            })?,
        )
        .await
        .map_err(|e| {
            tracing::error!("failed to persist archive document: {}", e);
            IngestError::RetryableStorageError
        })?;

    let envelope = publishable_event(&document)?;
    state.registry.validate_outbound(&envelope).map_err(|e| {
        tracing::error!("archive.ingested event failed validation: {}", e);
        IngestError::EventValidationError
    })?;
    state
        .bus
        .publish(EventType::ArchiveIngested.as_str(), &envelope)
        .await
        .map_err(|e| {
            tracing::error!("failed to publish archive.ingested: {}", e);
            IngestError::RetryablePublishError
        })?;

    Ok(IngestResponse {
        archive_id,
        deduplicated: false,
    })
}

fn publishable_event(document: &ArchiveDocument) -> Result<EventEnvelope, IngestError> {
    let payload = EventPayload::ArchiveIngested(ArchiveIngested {
        archive_id: document.archive_id.clone(),
        source_name: document.source_name.clone(),
        file_path: document.file_path.clone(),
        file_hash_sha256: document.file_hash_sha256.clone(),
        ingested_at: document.ingested_at,
    });
    Ok(payload.into_envelope())
}
