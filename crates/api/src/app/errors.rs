use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use locate_inference::ResidencyError;
use locate_infra::jobs::{JobStoreError, SubmitError};

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ SubmitError::TooManyItems { .. } => {
            json_error(StatusCode::BAD_REQUEST, "too_many_items", e.to_string())
        }
        e @ SubmitError::Busy(_) => json_error(StatusCode::CONFLICT, "job_busy", e.to_string()),
        SubmitError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        SubmitError::QueueClosed => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            "job queue is closed",
        ),
        SubmitError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        e @ JobStoreError::AlreadyExists(_) => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        e @ JobStoreError::NotPending { .. } => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        e @ JobStoreError::Busy(_) => json_error(StatusCode::CONFLICT, "job_busy", e.to_string()),
        e => {
            error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "internal storage error")
        }
    }
}

/// Model load problems are reported without backend detail.
pub fn residency_error_to_response(err: ResidencyError) -> axum::response::Response {
    error!(error = %err, "model unavailable");
    let message = match err {
        ResidencyError::ShutDown => "service is shutting down",
        ResidencyError::Load(_) => "model could not be loaded",
    };
    json_error(StatusCode::SERVICE_UNAVAILABLE, "model_unavailable", message)
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
