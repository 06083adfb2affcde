use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, Json};

use crate::app::services::AppServices;

/// Residency status of the model, plus worker counters.
pub async fn status(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let model = services.models.status();
    Json(serde_json::json!({
        "loaded": model.loaded,
        "requested_device": model.requested_device,
        "device": model.device.map(|d| d.label()),
        "idle_timeout_secs": model.idle_timeout_secs,
        "idle_secs": model.idle_secs,
        "loads": model.loads,
        "evictions": model.evictions,
        "workers": services.executor_stats(),
    }))
    .into_response()
}
