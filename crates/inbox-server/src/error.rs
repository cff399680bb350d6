use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use inbox_core::{AdapterError, ClassificationError};
use inbox_engine::AskError;
use inbox_store::StoreError;

/// Failure of an HTTP request, rendered as `{"error": message}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ask(#[from] AskError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("log persistence is disabled")]
    LogsDisabled,
    #[error("log query failed: {0}")]
    Logs(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Ask(AskError::EmptyQuestion) => StatusCode::BAD_REQUEST,
            Self::Store(StoreError::NotFound(_)) | Self::LogsDisabled => StatusCode::NOT_FOUND,
            Self::Logs(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(_) | Self::Ask(AskError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Ask(AskError::Classifier(e)) => match e {
                ClassificationError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                ClassificationError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                ClassificationError::MalformedResponse(_) | ClassificationError::Unavailable(_) => {
                    StatusCode::BAD_GATEWAY
                }
            },
            Self::Adapter(AdapterError::AuthRequired) => StatusCode::UNAUTHORIZED,
            Self::Adapter(AdapterError::Api { status, .. }) if *status == 400 => StatusCode::BAD_REQUEST,
            Self::Adapter(AdapterError::Decode(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Adapter(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
