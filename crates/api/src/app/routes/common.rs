use std::sync::Arc;

use axum::http::StatusCode;
use tracing::error;

use locate_core::JobId;

use crate::app::errors;
use crate::app::services::AppServices;

/// Run blocking service work (store queries, model loads, inference) off the
/// async runtime.
pub async fn blocking<T, F>(services: &Arc<AppServices>, f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce(&AppServices) -> T + Send + 'static,
    T: Send + 'static,
{
    let services = services.clone();
    tokio::task::spawn_blocking(move || f(&services)).await.map_err(|e| {
        error!(error = %e, "blocking task failed");
        errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
    })
}

pub fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}
