use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::gateway::InferenceError;
use crate::schema::ValidationError;

pub const VALIDATION_ERROR: &str = "validation_error";
pub const INFERENCE_ERROR: &str = "inference_error";
pub const GATEWAY_BUSY: &str = "gateway_busy";

const INFERENCE_FAILURE_DETAIL: &str = "hallucination detection failed";
const GATEWAY_BUSY_DETAIL: &str = "hallucination detector is busy, retry later";

/// API-level errors, rendered as JSON error bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{source} (Error ID: {error_id})")]
    Inference {
        error_id: Uuid,
        #[source]
        source: InferenceError,
    },
}

/// Error body returned by both detection endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<Uuid>,
}

impl ApiError {
    /// Wrap an inference failure and log its full cause under a fresh error id.
    pub fn inference(source: InferenceError, endpoint: &str) -> Self {
        let error_id = Uuid::new_v4();
        if source.is_queue_timeout() {
            warn!(%error_id, endpoint, "Inference gate timeout: {}", source);
        } else {
            error!(%error_id, endpoint, "Inference failed: {}", source);
        }
        ApiError::Inference { error_id, source }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Inference { source, .. } if source.is_queue_timeout() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Inference { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body sent to the caller. Inference causes stay in the logs.
    pub fn body(&self) -> ErrorBody {
        match self {
            ApiError::Validation(err) => ErrorBody {
                error: VALIDATION_ERROR.to_string(),
                detail: err.to_string(),
                error_id: None,
            },
            ApiError::Inference { error_id, source } if source.is_queue_timeout() => ErrorBody {
                error: GATEWAY_BUSY.to_string(),
                detail: GATEWAY_BUSY_DETAIL.to_string(),
                error_id: Some(*error_id),
            },
            ApiError::Inference { error_id, .. } => ErrorBody {
                error: INFERENCE_ERROR.to_string(),
                detail: INFERENCE_FAILURE_DETAIL.to_string(),
                error_id: Some(*error_id),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::OutputFormat;
    use std::time::Duration;

    #[test]
    fn test_validation_error_is_unprocessable() {
        let err = ApiError::from(ValidationError::InvalidField {
            message: "missing field `question`".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = err.body();
        assert_eq!(body.error, VALIDATION_ERROR);
        assert!(body.detail.contains("question"));
        assert!(body.error_id.is_none());
    }

    #[test]
    fn test_inference_error_hides_cause() {
        let source = InferenceError::MalformedOutput {
            model: "transformer".to_string(),
            format: OutputFormat::Spans,
            message: "secret internal detail".to_string(),
        };
        let err = ApiError::inference(source, "spans");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = err.body();
        assert_eq!(body.error, INFERENCE_ERROR);
        assert!(!body.detail.contains("secret"));
        assert!(body.error_id.is_some());
        assert!(err.to_string().contains("secret internal detail"));
    }

    #[test]
    fn test_queue_timeout_is_service_unavailable() {
        let err = ApiError::inference(
            InferenceError::QueueTimeout { waited: Duration::from_secs(3) },
            "token",
        );
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.body().error, GATEWAY_BUSY);
    }
}
