//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use workflow::WorkflowError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client, caught before reaching the workflow.
    BadRequest(String),
    /// A bearer token was presented but not recognized.
    Unauthorized(String),
    /// Workflow or reconciler error.
    Workflow(WorkflowError),
    /// Webhook processing failed after verification. Always a 5xx so the
    /// provider retries.
    Webhook(WorkflowError),
}

impl ApiError {
    /// Maps a webhook failure. Only signature and payload problems are the
    /// sender's fault, and their details stay in our logs.
    pub fn webhook(err: WorkflowError) -> Self {
        match err {
            WorkflowError::InvalidSignature(_) => {
                ApiError::BadRequest("invalid webhook signature".to_string())
            }
            WorkflowError::Validation(_) => {
                ApiError::BadRequest("invalid webhook payload".to_string())
            }
            WorkflowError::NotFound(_) => ApiError::Workflow(err),
            other => ApiError::Webhook(other),
        }
    }

    fn status_and_message(self) -> (StatusCode, String) {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Workflow(err) => workflow_error_to_response(err),
            ApiError::Webhook(err) => {
                tracing::error!(error = %err, "webhook processing failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "webhook processing failed".to_string(),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn workflow_error_to_response(err: WorkflowError) -> (StatusCode, String) {
    let status = match &err {
        WorkflowError::Validation(_) | WorkflowError::InvalidSignature(_) => {
            StatusCode::BAD_REQUEST
        }
        WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::Forbidden(_) => StatusCode::FORBIDDEN,
        WorkflowError::Conflict(_)
        | WorkflowError::StockExhausted { .. }
        | WorkflowError::StockAtCapacity { .. } => StatusCode::CONFLICT,
        WorkflowError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        WorkflowError::PartialRestitution { .. }
        | WorkflowError::Internal(_)
        | WorkflowError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, status = status.as_u16(), "request failed");
    }
    (status, err.to_string())
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        ApiError::Workflow(err)
    }
}
