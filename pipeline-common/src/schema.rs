//! Event schema registry.
//!
//! Every envelope is validated twice: by the producer before publish and by
//! the consumer before dispatch. A message that fails validation indicates a
//! malformed producer, so it is rejected outright — never retried, never
//! routed to the failed queue (that path is for processing failures, not
//! shape failures).
//!
//! The registry is an explicitly constructed instance handed to each service
//! at startup; there is no global registry. Schemas load from a pluggable
//! `SchemaSource` so filesystem-backed and store-backed deployments validate
//! identically.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::Value;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::store::{DocumentStore, StoreError};

/// One field-level problem found during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiagnostic {
    /// JSON pointer to the offending field ("" for the instance root).
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for FieldDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.path.is_empty() {
            true => write!(f, "{}", self.message),
            false => write!(f, "{}: {}", self.path, self.message),
        }
    }
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("no schema registered for event type {0}")]
    SchemaNotFound(String),
    #[error("envelope is malformed: {}", join_diagnostics(.0))]
    Envelope(Vec<FieldDiagnostic>),
    #[error("event {event_type} failed schema validation: {}", join_diagnostics(.diagnostics))]
    Payload {
        event_type: String,
        diagnostics: Vec<FieldDiagnostic>,
    },
    #[error("schema for {event_type} does not compile: {message}")]
    InvalidSchema {
        event_type: String,
        message: String,
    },
}

fn join_diagnostics(diagnostics: &[FieldDiagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum SchemaSourceError {
    #[error("failed to read schema source: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema store error: {0}")]
    Store(#[from] StoreError),
}

/// Where schemas come from. Both implementations must yield byte-identical
/// schema documents for the same event type.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn get_schema(&self, event_type: &str) -> Result<Option<Value>, SchemaSourceError>;
    async fn list(&self) -> Result<Vec<(String, Value)>, SchemaSourceError>;
}

/// Schemas as `<event_type>.json` files in one directory.
pub struct FilesystemSchemaSource {
    dir: PathBuf,
}

impl FilesystemSchemaSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SchemaSource for FilesystemSchemaSource {
    async fn get_schema(&self, event_type: &str) -> Result<Option<Value>, SchemaSourceError> {
        let path = self.dir.join(format!("{}.json", event_type));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> Result<Vec<(String, Value)>, SchemaSourceError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut schemas = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Some(event_type) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bytes = tokio::fs::read(&path).await?;
            schemas.push((event_type.to_owned(), serde_json::from_slice(&bytes)?));
        }
        // Directory iteration order is platform-dependent
        schemas.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(schemas)
    }
}

/// Schemas kept in the document store's `schemas` collection, one document
/// per event type: `{"event_type": ..., "schema": {...}}`.
pub struct StoreSchemaSource {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl StoreSchemaSource {
    pub fn new(store: Arc<dyn DocumentStore>, collection: &str) -> Self {
        Self {
            store,
            collection: collection.to_owned(),
        }
    }

    fn unwrap_schema(doc: Value) -> Option<(String, Value)> {
        let event_type = doc.get("event_type")?.as_str()?.to_owned();
        let schema = doc.get("schema")?.clone();
        Some((event_type, schema))
    }
}

#[async_trait]
impl SchemaSource for StoreSchemaSource {
    async fn get_schema(&self, event_type: &str) -> Result<Option<Value>, SchemaSourceError> {
        let doc = self.store.get(&self.collection, event_type).await?;
        Ok(doc.and_then(Self::unwrap_schema).map(|(_, schema)| schema))
    }

    async fn list(&self) -> Result<Vec<(String, Value)>, SchemaSourceError> {
        let docs = self
            .store
            .find(&self.collection, &Value::Object(Default::default()))
            .await?;
        let mut schemas: Vec<(String, Value)> = docs
            .into_iter()
            .filter_map(Self::unwrap_schema)
            .collect();
        schemas.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(schemas)
    }
}

/// Compiled schemas keyed by event type.
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<JSONSchema>>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Build a registry from everything the source knows about. Called once
    /// at process start; `register` supports explicit refresh afterwards.
    pub async fn from_source(
        source: &dyn SchemaSource,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let registry = Self::new();
        for (event_type, schema) in source.list().await? {
            registry.register(&event_type, &schema)?;
        }
        Ok(registry)
    }

    /// Idempotent upsert: re-registering an event type replaces its schema,
    /// which is how live schema updates roll out without a restart.
    pub fn register(&self, event_type: &str, schema: &Value) -> Result<(), ValidationError> {
        let compiled =
            JSONSchema::compile(schema).map_err(|err| ValidationError::InvalidSchema {
                event_type: event_type.to_owned(),
                message: err.to_string(),
            })?;
        self.schemas
            .write()
            .expect("poisoned schema registry lock")
            .insert(event_type.to_owned(), Arc::new(compiled));
        Ok(())
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .schemas
            .read()
            .expect("poisoned schema registry lock")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Validate a raw envelope as read off the wire: envelope shape first,
    /// then the payload against the schema named by `event_type`.
    pub fn validate(&self, envelope: &Value) -> Result<(), ValidationError> {
        let diagnostics = check_envelope_fields(envelope);
        if !diagnostics.is_empty() {
            return Err(ValidationError::Envelope(diagnostics));
        }

        // check_envelope_fields guarantees these are present and typed
        let event_type = envelope["event_type"].as_str().unwrap_or_default();
        let data = &envelope["data"];

        let schema = self
            .schemas
            .read()
            .expect("poisoned schema registry lock")
            .get(event_type)
            .cloned()
            .ok_or_else(|| ValidationError::SchemaNotFound(event_type.to_owned()))?;

        let diagnostics: Vec<FieldDiagnostic> = match schema.validate(data) {
            Ok(()) => return Ok(()),
            Err(errors) => errors
                .map(|err| FieldDiagnostic {
                    path: err.instance_path.to_string(),
                    message: err.to_string(),
                })
                .collect(),
        };

        Err(ValidationError::Payload {
            event_type: event_type.to_owned(),
            diagnostics,
        })
    }

    /// Validate a typed envelope before it is handed to the bus.
    pub fn validate_outbound(&self, envelope: &EventEnvelope) -> Result<(), ValidationError> {
        let raw = serde_json::to_value(envelope).map_err(|err| {
            ValidationError::Envelope(vec![FieldDiagnostic {
                path: String::new(),
                message: err.to_string(),
            }])
        })?;
        self.validate(&raw)
    }
}

/// Envelope-level required fields, checked before any schema lookup so the
/// caller gets every problem in one pass.
fn check_envelope_fields(envelope: &Value) -> Vec<FieldDiagnostic> {
    let mut diagnostics = Vec::new();

    let Some(object) = envelope.as_object() else {
        return vec![FieldDiagnostic {
            path: String::new(),
            message: "envelope is not a JSON object".to_owned(),
        }];
    };

    match object.get("event_id").and_then(Value::as_str) {
        Some(raw) if Uuid::parse_str(raw).is_ok() => {}
        Some(_) => diagnostics.push(FieldDiagnostic {
            path: "/event_id".to_owned(),
            message: "not a valid UUID".to_owned(),
        }),
        None => diagnostics.push(FieldDiagnostic {
            path: "/event_id".to_owned(),
            message: "required string field is missing".to_owned(),
        }),
    }

    match object.get("event_type").and_then(Value::as_str) {
        Some(raw) if !raw.is_empty() => {}
        Some(_) => diagnostics.push(FieldDiagnostic {
            path: "/event_type".to_owned(),
            message: "must not be empty".to_owned(),
        }),
        None => diagnostics.push(FieldDiagnostic {
            path: "/event_type".to_owned(),
            message: "required string field is missing".to_owned(),
        }),
    }

    match object.get("timestamp").and_then(Value::as_str) {
        Some(raw) if OffsetDateTime::parse(raw, &Rfc3339).is_ok() => {}
        Some(_) => diagnostics.push(FieldDiagnostic {
            path: "/timestamp".to_owned(),
            message: "not an RFC-3339 timestamp".to_owned(),
        }),
        None => diagnostics.push(FieldDiagnostic {
            path: "/timestamp".to_owned(),
            message: "required string field is missing".to_owned(),
        }),
    }

    match object.get("version").and_then(Value::as_str) {
        Some(raw) if !raw.is_empty() => {}
        _ => diagnostics.push(FieldDiagnostic {
            path: "/version".to_owned(),
            message: "required string field is missing or empty".to_owned(),
        }),
    }

    if !object.get("data").is_some_and(Value::is_object) {
        diagnostics.push(FieldDiagnostic {
            path: "/data".to_owned(),
            message: "required object field is missing".to_owned(),
        });
    }

    diagnostics
}
