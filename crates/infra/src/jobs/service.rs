//! Submission surface: creates job records and schedules them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use locate_core::{DomainError, JobId};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::uploads::{UploadDir, UploadPathError};

use super::executor::JobQueue;
use super::store::{JobFilter, JobStats, JobStore, JobStoreError};
use super::types::{Job, MAX_TOP_K};

/// `top_k` used when a submission leaves it out.
pub const DEFAULT_TOP_K: u32 = 5;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("too many items: at most {max}, got {got}")]
    TooManyItems { max: usize, got: usize },

    #[error("job {0} is processing and cannot be deleted")]
    Busy(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl From<UploadPathError> for SubmitError {
    fn from(e: UploadPathError) -> Self {
        SubmitError::Validation(e.to_string())
    }
}

impl From<DomainError> for SubmitError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::Validation(msg) => SubmitError::Validation(msg),
            other => SubmitError::Store(JobStoreError::Domain(other)),
        }
    }
}

/// One image to submit as a job.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    pub file_path: PathBuf,
    /// Display name; defaults to the path's file name.
    pub filename: Option<String>,
    pub top_k: Option<u32>,
}

impl SubmitJob {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            filename: None,
            top_k: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

/// Validate a caller-supplied `top_k`.
pub fn validate_top_k(top_k: u32) -> Result<u32, SubmitError> {
    if (1..=MAX_TOP_K).contains(&top_k) {
        Ok(top_k)
    } else {
        Err(SubmitError::Validation(format!(
            "top_k must be between 1 and {MAX_TOP_K}, got {top_k}"
        )))
    }
}

/// Job lifecycle operations exposed to callers.
///
/// Job files must live under the upload directory; deleting a job removes
/// its file.
pub struct JobService<S: JobStore> {
    store: S,
    queue: JobQueue,
    uploads: UploadDir,
    audit: Arc<dyn AuditSink>,
}

impl<S: JobStore> JobService<S> {
    pub fn new(store: S, queue: JobQueue, uploads: UploadDir, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            queue,
            uploads,
            audit,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn uploads(&self) -> &UploadDir {
        &self.uploads
    }

    /// Create a pending job and schedule it.
    pub fn submit(&self, request: SubmitJob) -> Result<Job, SubmitError> {
        let top_k = validate_top_k(request.top_k.unwrap_or(DEFAULT_TOP_K))?;
        let file_path = self.uploads.resolve(&request.file_path)?;
        let filename = match request.filename {
            Some(name) if !name.trim().is_empty() => name,
            _ => display_name(&file_path),
        };

        let job = Job::new(filename, file_path, top_k)?;
        let id = self.store.insert(job.clone())?;
        self.audit
            .record(AuditEvent::new(AuditAction::JobSubmitted, id).with_detail(job.filename.clone()));
        if !self.queue.push(id) {
            // Stays pending; the next start re-queues it.
            warn!(job_id = %id, "job queue closed, job left pending");
            return Err(SubmitError::QueueClosed);
        }
        info!(job_id = %id, filename = %job.filename, top_k, "job submitted");
        Ok(job)
    }

    pub fn get(&self, job_id: JobId) -> Result<Option<Job>, SubmitError> {
        Ok(self.store.get(job_id)?)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, SubmitError> {
        Ok(self.store.list(filter)?)
    }

    pub fn stats(&self) -> Result<JobStats, SubmitError> {
        Ok(self.store.stats()?)
    }

    /// Delete a job and its stored file.
    ///
    /// A job that is processing is owned by its worker and cannot be deleted.
    pub fn delete(&self, job_id: JobId) -> Result<Job, SubmitError> {
        let job = match self.store.delete(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return Err(SubmitError::NotFound(job_id)),
            Err(JobStoreError::Busy(_)) => return Err(SubmitError::Busy(job_id)),
            Err(e) => return Err(e.into()),
        };

        match fs::remove_file(&job.file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job_id, path = %job.file_path.display(), error = %e, "failed to remove job file"),
        }
        self.audit.record(AuditEvent::new(AuditAction::JobDeleted, job_id));
        info!(job_id = %job_id, "job deleted");
        Ok(job)
    }

    /// Re-queue jobs left pending by a previous run, oldest first.
    ///
    /// Jobs stuck in `processing` are reported but not touched.
    pub fn recover_pending(&self) -> Result<RecoveryReport, SubmitError> {
        let pending = self.store.pending_ids()?;
        let mut requeued = 0;
        for id in &pending {
            if self.queue.push(*id) {
                requeued += 1;
            }
        }
        let stuck_processing = self.store.stats()?.processing;
        if stuck_processing > 0 {
            warn!(count = stuck_processing, "jobs left in processing by a previous run are not recovered");
        }
        if requeued > 0 {
            info!(count = requeued, "re-queued pending jobs");
        }
        Ok(RecoveryReport {
            requeued,
            stuck_processing,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub stuck_processing: usize,
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Extensions accepted by [`BatchImporter`] by default.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "gif", "heic", "webp"];

/// Submits many paths as individual jobs.
#[derive(Debug, Clone)]
pub struct BatchImporter {
    allowed_extensions: Vec<String>,
    max_items: usize,
    default_top_k: u32,
}

impl Default for BatchImporter {
    fn default() -> Self {
        Self {
            allowed_extensions: IMAGE_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            max_items: 100,
            default_top_k: DEFAULT_TOP_K,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedPath {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchImport {
    pub created: Vec<Job>,
    pub rejected: Vec<RejectedPath>,
}

impl BatchImporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(ext)))
    }

    /// Submit each accepted path as its own job.
    ///
    /// The whole request is rejected when it exceeds the item limit or
    /// `top_k` is out of range; otherwise bad paths are reported per item.
    pub fn import<S: JobStore>(
        &self,
        service: &JobService<S>,
        paths: Vec<PathBuf>,
        top_k: Option<u32>,
    ) -> Result<BatchImport, SubmitError> {
        if paths.len() > self.max_items {
            return Err(SubmitError::TooManyItems {
                max: self.max_items,
                got: paths.len(),
            });
        }
        let top_k = validate_top_k(top_k.unwrap_or(self.default_top_k))?;

        let mut import = BatchImport::default();
        for path in paths {
            if !self.accepts(&path) {
                import.rejected.push(RejectedPath {
                    reason: format!("unsupported file type: {}", display_name(&path)),
                    path,
                });
                continue;
            }
            match service.submit(SubmitJob::new(path.clone()).with_top_k(top_k)) {
                Ok(job) => import.created.push(job),
                Err(SubmitError::Validation(reason)) => import.rejected.push(RejectedPath { path, reason }),
                Err(e) => return Err(e),
            }
        }
        info!(created = import.created.len(), rejected = import.rejected.len(), "batch imported");
        Ok(import)
    }
}
