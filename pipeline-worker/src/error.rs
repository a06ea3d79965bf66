use pipeline_common::bus::BusError;
use thiserror::Error;

/// Errors that end the worker process; per-event failures never surface
/// here, they go through the retry policy and the failed queue instead.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("consumer failed: {0}")]
    Consumer(#[from] BusError),
    #[error("invalid worker configuration: {0}")]
    Config(String),
}
