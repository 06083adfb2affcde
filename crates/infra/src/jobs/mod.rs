//! Geolocation jobs: persistence, processing and scheduling.
//!
//! ## Flow
//!
//! 1. [`JobService::submit`] stores a `pending` job and pushes its id onto the [`JobQueue`].
//! 2. A [`JobExecutor`] worker pops the id and hands it to [`JobProcessor::process`].
//! 3. The processor claims the job (`pending -> processing`), runs the model
//!    through the shared residency manager and writes the terminal state.
//!
//! Every transition is persisted before the next step begins.

pub mod executor;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod processor;
pub mod service;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobQueue};
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
pub use processor::{JobProcessor, ProcessOutcome};
pub use service::{
    BatchImport, BatchImporter, DEFAULT_TOP_K, JobService, RecoveryReport, RejectedPath, SubmitError, SubmitJob,
    validate_top_k,
};
pub use store::{InMemoryJobStore, JobFilter, JobStats, JobStore, JobStoreError, MAX_LIST_LIMIT};
pub use types::{Job, JobStatus, JobView, MAX_TOP_K};
