use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct IngestResponse {
    pub archive_id: String,
    /// True when the uploaded bytes matched an archive we already hold; no
    /// new record is created and no event is published.
    pub deduplicated: bool,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),

    #[error("request holds no archive content")]
    EmptyArchive,
    #[error("source name must be non-empty and filesystem-safe")]
    InvalidSourceName,

    #[error("failed to persist archive, please retry")]
    RetryableStorageError,
    #[error("failed to announce archive, please retry")]
    RetryablePublishError,
    #[error("produced event failed validation")]
    EventValidationError,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::RequestDecodingError(_)
            | IngestError::EmptyArchive
            | IngestError::InvalidSourceName => (StatusCode::BAD_REQUEST, self.to_string()),

            IngestError::RetryableStorageError | IngestError::RetryablePublishError => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }

            IngestError::EventValidationError => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use super::*;

    #[test]
    fn shape_errors_are_client_errors() {
        assert_eq!(
            IngestError::EmptyArchive.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            IngestError::InvalidSourceName.into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn transient_errors_ask_the_client_to_retry() {
        assert_eq!(
            IngestError::RetryableStorageError.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            IngestError::RetryablePublishError.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
