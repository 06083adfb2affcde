//! Service wiring: job store, model residency, workers.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use tracing::{info, warn};

use locate_inference::{
    DeterministicEngineFactory, EngineFactory, GazetteerResolver, ModelResidencyManager, NoPlaceResolver,
    PlaceResolver,
};
use locate_infra::audit::{AuditSink, NoopAuditSink, TracingAuditSink};
use locate_infra::config::LocateConfig;
use locate_infra::jobs::{
    BatchImporter, ExecutorStats, InMemoryJobStore, JobExecutor, JobExecutorConfig, JobExecutorHandle,
    JobProcessor, JobService, JobStore,
};
use locate_infra::uploads::UploadDir;

pub type DynJobStore = Arc<dyn JobStore>;

/// Everything request handlers need, shared behind an `Arc`.
pub struct AppServices {
    pub jobs: JobService<DynJobStore>,
    pub importer: BatchImporter,
    pub models: Arc<ModelResidencyManager>,
    pub resolver: Arc<dyn PlaceResolver>,
    executor: Mutex<Option<JobExecutorHandle>>,
}

impl AppServices {
    pub fn executor_stats(&self) -> Option<ExecutorStats> {
        self.executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|e| e.stats())
    }

    /// Stop workers, then unload the model. Blocking.
    pub fn shutdown(&self) {
        let executor = self.executor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(executor) = executor {
            executor.shutdown();
        }
        self.models.shutdown();
        info!("services stopped");
    }
}

/// Build services with the engine backend linked into this binary.
pub async fn build_services(config: &LocateConfig) -> anyhow::Result<Arc<AppServices>> {
    build_services_with(config, Arc::new(DeterministicEngineFactory::new())).await
}

/// Build services around a specific engine factory.
pub async fn build_services_with(
    config: &LocateConfig,
    factory: Arc<dyn EngineFactory>,
) -> anyhow::Result<Arc<AppServices>> {
    let uploads = UploadDir::open(&config.upload_dir)
        .with_context(|| format!("opening upload dir {}", config.upload_dir.display()))?;
    info!(path = %uploads.root().display(), "upload dir ready");

    let store = build_store(config).await?;

    let resolver: Arc<dyn PlaceResolver> = match &config.gazetteer {
        Some(path) => {
            let gazetteer = GazetteerResolver::from_path(path)?;
            info!(path = %path.display(), entries = gazetteer.len(), "gazetteer loaded");
            Arc::new(gazetteer)
        }
        None => Arc::new(NoPlaceResolver),
    };

    let audit: Arc<dyn AuditSink> = if config.audit {
        Arc::new(TracingAuditSink)
    } else {
        Arc::new(NoopAuditSink)
    };

    let models = ModelResidencyManager::spawn(factory, config.residency.clone());

    let processor = JobProcessor::new(store.clone(), models.clone(), resolver.clone(), audit.clone());
    let executor = JobExecutor::new(processor)
        .spawn(JobExecutorConfig::default().with_workers(config.workers))
        .context("spawning job workers")?;

    let services = Arc::new(AppServices {
        jobs: JobService::new(store, executor.queue(), uploads, audit),
        importer: BatchImporter::new(),
        models,
        resolver,
        executor: Mutex::new(Some(executor)),
    });

    // Store calls may block on the database, so keep them off the runtime.
    let recovery = services.clone();
    let report = tokio::task::spawn_blocking(move || recovery.jobs.recover_pending())
        .await
        .context("pending job recovery panicked")??;
    info!(
        requeued = report.requeued,
        stuck_processing = report.stuck_processing,
        "startup recovery finished"
    );

    Ok(services)
}

#[cfg(not(feature = "postgres"))]
async fn build_store(config: &LocateConfig) -> anyhow::Result<DynJobStore> {
    if config.database_url.is_some() {
        warn!("DATABASE_URL is set but postgres support is not compiled in; using in-memory store");
    }
    Ok(InMemoryJobStore::arc())
}

#[cfg(feature = "postgres")]
async fn build_store(config: &LocateConfig) -> anyhow::Result<DynJobStore> {
    match &config.database_url {
        Some(url) => {
            let store = locate_infra::jobs::PostgresJobStore::connect(url)
                .await
                .context("connecting to postgres")?;
            Ok(Arc::new(store))
        }
        None => Ok(InMemoryJobStore::arc()),
    }
}
