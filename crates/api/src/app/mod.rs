//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, model residency, workers
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use locate_inference::EngineFactory;
use locate_infra::config::LocateConfig;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// The returned services must be shut down by the caller once the server stops.
pub async fn build_app(config: &LocateConfig) -> anyhow::Result<(Router, Arc<AppServices>)> {
    let services = services::build_services(config).await?;
    Ok((router(services.clone()), services))
}

/// Same as [`build_app`] with a specific engine backend.
pub async fn build_app_with(
    config: &LocateConfig,
    factory: Arc<dyn EngineFactory>,
) -> anyhow::Result<(Router, Arc<AppServices>)> {
    let services = services::build_services_with(config, factory).await?;
    Ok((router(services.clone()), services))
}

fn router(services: Arc<AppServices>) -> Router {
    routes::router().layer(ServiceBuilder::new().layer(Extension(services)))
}
