use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use locate_infra::jobs::{JobFilter, JobStatus, JobView, SubmitJob};

use crate::app::routes::common::{blocking, parse_job_id};
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/batch", post(create_batch))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job).delete(delete_job))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let mut request = SubmitJob::new(body.file_path);
    if let Some(filename) = body.filename {
        request = request.with_filename(filename);
    }
    if let Some(top_k) = body.top_k {
        request = request.with_top_k(top_k);
    }

    match blocking(&services, move |s| s.jobs.submit(request)).await {
        Ok(Ok(job)) => (StatusCode::CREATED, Json(job.view())).into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn create_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::BatchJobsRequest>,
) -> axum::response::Response {
    let result = blocking(&services, move |s| s.importer.import(&s.jobs, body.paths, body.top_k)).await;
    match result {
        Ok(Ok(import)) => (StatusCode::CREATED, Json(dto::BatchJobsResponse::from(import))).into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let mut filter = JobFilter::default();
    if let Some(status) = query.status.as_deref() {
        match status.parse::<JobStatus>() {
            Ok(status) => filter = filter.with_status(status),
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string()),
        }
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }
    if let Some(offset) = query.offset {
        filter = filter.with_offset(offset);
    }

    match blocking(&services, move |s| s.jobs.list(&filter)).await {
        Ok(Ok(jobs)) => Json(jobs.iter().map(|j| j.view()).collect::<Vec<JobView>>()).into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match blocking(&services, |s| s.jobs.stats()).await {
        Ok(Ok(stats)) => Json(stats).into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match blocking(&services, move |s| s.jobs.get(job_id)).await {
        Ok(Ok(Some(job))) => Json(job.view()).into_response(),
        Ok(Ok(None)) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn delete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match blocking(&services, move |s| s.jobs.delete(job_id)).await {
        Ok(Ok(_)) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(resp) => resp,
    }
}
