use axum::{
    routing::{get, post},
    Router,
};

pub mod common;
pub mod infer;
pub mod jobs;
pub mod model;
pub mod system;

/// Router for all service endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .nest("/jobs", jobs::router())
        .route("/infer", post(infer::infer))
        .route("/model", get(model::status))
}
