//! Runs one job through the model.

use std::sync::Arc;

use tracing::{debug, info, warn};

use locate_core::JobId;
use locate_inference::{
    BatchOptions, InputRecord, ModelResidencyManager, PlaceResolver, PredictionOutcome, RecordError,
    predict_records,
};

use crate::audit::{AuditAction, AuditEvent, AuditSink};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus};

/// Failure reason stored when the engine produced nothing.
pub const NO_PREDICTIONS: &str = "no predictions generated";
/// Failure reason stored when the engine raised; details stay in the log.
pub const PREDICTION_FAILED: &str = "prediction failed";

/// What `process` did with a job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No record for the id.
    Missing,
    /// Another worker owns (or finished) the job.
    NotPending(JobStatus),
    Completed,
    Failed,
}

/// Drives a job from `pending` to a terminal state.
///
/// The processor that wins [`JobStore::start`] is the only writer for that
/// job until it reaches a terminal state.
pub struct JobProcessor<S: JobStore> {
    store: S,
    models: Arc<ModelResidencyManager>,
    resolver: Arc<dyn PlaceResolver>,
    audit: Arc<dyn AuditSink>,
}

impl<S: JobStore> JobProcessor<S> {
    pub fn new(
        store: S,
        models: Arc<ModelResidencyManager>,
        resolver: Arc<dyn PlaceResolver>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            models,
            resolver,
            audit,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process one job. Blocking: may load the model and run inference.
    ///
    /// Only storage failures are returned as errors; everything that goes
    /// wrong with the job itself ends up in the job record.
    pub fn process(&self, job_id: JobId) -> Result<ProcessOutcome, JobStoreError> {
        let mut job = match self.store.start(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "job not found, nothing to process");
                return Ok(ProcessOutcome::Missing);
            }
            Err(JobStoreError::NotPending { status, .. }) => {
                debug!(job_id = %job_id, status = %status, "job already picked up");
                return Ok(ProcessOutcome::NotPending(status));
            }
            Err(e) => return Err(e),
        };
        info!(job_id = %job_id, filename = %job.filename, top_k = job.top_k, "processing job");

        let engine = match self.models.acquire() {
            Ok(engine) => engine,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "model unavailable");
                return self.fail(&mut job, e.to_string());
            }
        };

        let record = InputRecord::new(1, job.file_path.clone());
        let options = BatchOptions::top_k(job.top_k as usize);
        let outcome = predict_records(&engine, self.resolver.as_ref(), [record], options).pop();

        match outcome {
            Some(PredictionOutcome::Success { predictions, .. }) => {
                let count = predictions.len();
                job.mark_completed(predictions, engine.device())?;
                self.store.update(&job)?;
                info!(job_id = %job_id, predictions = count, device = %engine.device(), "job completed");
                self.audit.record(AuditEvent::new(AuditAction::JobCompleted, job_id));
                Ok(ProcessOutcome::Completed)
            }
            Some(PredictionOutcome::Failed { error, .. }) => {
                let message = self.failure_message(&job, &error);
                warn!(job_id = %job_id, error = %error, "job failed");
                self.fail(&mut job, message)
            }
            // Skipping is never requested for jobs.
            Some(PredictionOutcome::Skipped { warning, .. }) => self.fail(&mut job, warning),
            None => self.fail(&mut job, NO_PREDICTIONS.to_string()),
        }
    }

    fn failure_message(&self, job: &Job, error: &RecordError) -> String {
        match error {
            RecordError::MissingFile(_) => format!("file does not exist: {}", job.filename),
            RecordError::Prediction(_) => PREDICTION_FAILED.to_string(),
            RecordError::NoPredictions => NO_PREDICTIONS.to_string(),
        }
    }

    fn fail(&self, job: &mut Job, message: String) -> Result<ProcessOutcome, JobStoreError> {
        job.mark_failed(message.clone())?;
        self.store.update(job)?;
        self.audit
            .record(AuditEvent::new(AuditAction::JobFailed, job.id).with_detail(message));
        Ok(ProcessOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::jobs::store::InMemoryJobStore;
    use locate_inference::{
        Device, DeterministicEngineFactory, EngineError, EngineFactory, GpuBackend, InferenceEngine,
        NoPlaceResolver, Place, RawPrediction, ResidencyConfig,
    };
    use std::fs;
    use std::path::{Path, PathBuf};

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        audit: Arc<InMemoryAuditSink>,
        processor: JobProcessor<Arc<InMemoryJobStore>>,
    }

    fn fixture_with(factory: Arc<dyn EngineFactory>, resolver: Arc<dyn PlaceResolver>) -> Fixture {
        let store = InMemoryJobStore::arc();
        let audit = Arc::new(InMemoryAuditSink::new());
        let models = Arc::new(ModelResidencyManager::new(factory, ResidencyConfig::default()));
        let processor = JobProcessor::new(store.clone(), models, resolver, audit.clone());
        Fixture {
            store,
            audit,
            processor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(DeterministicEngineFactory::new()), Arc::new(NoPlaceResolver))
    }

    fn image(name: &str, bytes: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join("locate-processor-tests");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn submit(store: &InMemoryJobStore, path: PathBuf, top_k: u32) -> JobId {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        store.insert(Job::new(name, path, top_k).unwrap()).unwrap()
    }

    #[test]
    fn completes_with_ranked_predictions() {
        let fx = fixture();
        let id = submit(&fx.store, image("ok.jpg", b"some pixels"), 5);

        assert_eq!(fx.processor.process(id).unwrap(), ProcessOutcome::Completed);

        let job = fx.store.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.device.as_deref(), Some("cpu"));
        job.check_invariants().unwrap();

        let results = job.results.unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.windows(2).all(|w| w[0].probability >= w[1].probability));
        // Resolver knows nothing, so every summary is blank.
        assert!(results.iter().all(|p| p.location_summary.is_empty() && p.city.is_empty()));
        assert_eq!(fx.audit.actions_for(id), vec![AuditAction::JobCompleted]);
    }

    #[test]
    fn missing_file_fails_job() {
        let fx = fixture();
        let id = submit(&fx.store, PathBuf::from("/definitely/not/here.jpg"), 5);

        assert_eq!(fx.processor.process(id).unwrap(), ProcessOutcome::Failed);

        let job = fx.store.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("does not exist"));
        assert!(job.results.is_none());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn empty_prediction_list_fails_job() {
        let fx = fixture();
        let id = submit(&fx.store, image("empty.jpg", b""), 5);

        fx.processor.process(id).unwrap();

        let job = fx.store.get(id).unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some(NO_PREDICTIONS));
    }

    #[test]
    fn unknown_and_already_started_jobs_are_left_alone() {
        let fx = fixture();
        assert_eq!(fx.processor.process(JobId::new()).unwrap(), ProcessOutcome::Missing);

        let id = submit(&fx.store, image("twice.jpg", b"abc"), 2);
        fx.processor.process(id).unwrap();
        assert_eq!(
            fx.processor.process(id).unwrap(),
            ProcessOutcome::NotPending(JobStatus::Completed)
        );
    }

    struct BrokenEngine;

    impl InferenceEngine for BrokenEngine {
        fn predict(&self, _path: &Path, _top_k: usize) -> Result<Vec<RawPrediction>, EngineError> {
            Err(EngineError::InferenceFailed("CUDA error: secret detail".into()))
        }

        fn device(&self) -> Device {
            Device::Cpu
        }
    }

    struct BrokenFactory;

    impl EngineFactory for BrokenFactory {
        fn load(&self, _device: Device) -> Result<Arc<dyn InferenceEngine>, EngineError> {
            Ok(Arc::new(BrokenEngine))
        }
    }

    #[test]
    fn engine_error_is_sanitized() {
        let fx = fixture_with(Arc::new(BrokenFactory), Arc::new(NoPlaceResolver));
        let id = submit(&fx.store, image("broken.jpg", b"abc"), 3);

        fx.processor.process(id).unwrap();

        let job = fx.store.get(id).unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some(PREDICTION_FAILED));
    }

    struct PanickingEngine;

    impl InferenceEngine for PanickingEngine {
        fn predict(&self, _path: &Path, _top_k: usize) -> Result<Vec<RawPrediction>, EngineError> {
            panic!("kernel launch failed")
        }

        fn device(&self) -> Device {
            Device::Cpu
        }
    }

    struct PanickingFactory;

    impl EngineFactory for PanickingFactory {
        fn load(&self, _device: Device) -> Result<Arc<dyn InferenceEngine>, EngineError> {
            Ok(Arc::new(PanickingEngine))
        }
    }

    #[test]
    fn engine_panic_fails_job_instead_of_leaving_it_processing() {
        let fx = fixture_with(Arc::new(PanickingFactory), Arc::new(NoPlaceResolver));
        let id = submit(&fx.store, image("panicking-engine.jpg", b"abc"), 3);

        assert_eq!(fx.processor.process(id).unwrap(), ProcessOutcome::Failed);

        let job = fx.store.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(PREDICTION_FAILED));
        job.check_invariants().unwrap();
        assert_eq!(fx.store.stats().unwrap().processing, 0);
        assert_eq!(fx.audit.actions_for(id), vec![AuditAction::JobFailed]);
    }

    #[test]
    fn load_failure_fails_job_with_reason() {
        let factory = Arc::new(DeterministicEngineFactory::new());
        let store = InMemoryJobStore::arc();
        let models = Arc::new(ModelResidencyManager::new(
            factory,
            ResidencyConfig::default().with_device("cuda".parse().unwrap()),
        ));
        let processor = JobProcessor::new(
            store.clone(),
            models,
            Arc::new(NoPlaceResolver),
            Arc::new(crate::audit::NoopAuditSink),
        );
        let id = submit(&store, image("gpu.jpg", b"abc"), 3);

        assert_eq!(processor.process(id).unwrap(), ProcessOutcome::Failed);
        let job = store.get(id).unwrap().unwrap();
        assert!(job.error.unwrap().contains("device unavailable"));
    }

    struct PanickingResolver;

    impl PlaceResolver for PanickingResolver {
        fn resolve(&self, _latitude: f64, _longitude: f64) -> Place {
            panic!("geocoder exploded")
        }
    }

    #[test]
    fn resolver_panic_does_not_fail_job() {
        let fx = fixture_with(
            Arc::new(DeterministicEngineFactory::new().with_accelerator(GpuBackend::Cuda)),
            Arc::new(PanickingResolver),
        );
        let id = submit(&fx.store, image("panic.jpg", b"xyz"), 2);

        assert_eq!(fx.processor.process(id).unwrap(), ProcessOutcome::Completed);
        let job = fx.store.get(id).unwrap().unwrap();
        assert_eq!(job.device.as_deref(), Some("cuda"));
        assert!(job.results.unwrap().iter().all(|p| p.location_summary.is_empty()));
    }
}
