use anyhow::Context;
use tracing::info;

use locate_infra::config::LocateConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    locate_observability::init();

    let config = LocateConfig::from_env()?;
    let (app, services) = locate_api::app::build_app(&config).await?;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tokio::task::spawn_blocking(move || services.shutdown()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler; run until the process is killed.
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
