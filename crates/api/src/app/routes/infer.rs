use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use tracing::info;

use locate_inference::{BatchOptions, InputRecord, ResidencyError, predict_records};
use locate_infra::jobs::{DEFAULT_TOP_K, SubmitError, validate_top_k};

use crate::app::routes::common::blocking;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Synchronous inference over files in the upload directory.
pub async fn infer(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::InferRequest>,
) -> axum::response::Response {
    let top_k = match validate_top_k(body.top_k.unwrap_or(DEFAULT_TOP_K)) {
        Ok(v) => v,
        Err(e) => return errors::submit_error_to_response(e),
    };
    let max_items = services.importer.max_items();
    if body.items.is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "items must not be empty");
    }
    if body.items.len() > max_items {
        return errors::submit_error_to_response(SubmitError::TooManyItems {
            max: max_items,
            got: body.items.len(),
        });
    }

    let options = BatchOptions::top_k(top_k as usize)
        .skip_missing(body.skip_missing)
        .fail_fast(body.fail_fast);
    let mut records = Vec::with_capacity(body.items.len());
    for (i, item) in body.items.into_iter().enumerate() {
        let path = match services.jobs.uploads().resolve(&item.path) {
            Ok(path) => path,
            Err(e) => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    format!("item {}: {e}", i + 1),
                );
            }
        };
        let record = InputRecord::new(i + 1, path);
        records.push(match item.md5 {
            Some(md5) => record.with_md5(md5),
            None => record,
        });
    }

    let result = blocking(&services, move |s| {
        let engine = s.models.acquire()?;
        let total = records.len();
        let outcomes = predict_records(&engine, s.resolver.as_ref(), records, options);
        info!(
            items = total,
            succeeded = outcomes.iter().filter(|o| o.is_success()).count(),
            device = %engine.device(),
            "inference request finished"
        );
        Ok::<_, ResidencyError>(dto::InferResponse {
            device: engine.device().label().to_string(),
            results: outcomes.into_iter().map(dto::InferItemResult::from).collect(),
        })
    })
    .await;

    match result {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(e)) => errors::residency_error_to_response(e),
        Err(resp) => resp,
    }
}
