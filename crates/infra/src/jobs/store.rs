//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use locate_core::{DomainError, JobId};

use super::types::{Job, JobStatus};

/// Default page size for [`JobStore::list`].
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// Largest page size accepted by [`JobStore::list`].
pub const MAX_LIST_LIMIT: usize = 100;

/// Job store abstraction.
///
/// Implementations must make [`JobStore::start`] atomic: of several callers
/// racing on the same pending job, exactly one observes the transition.
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Move a pending job to processing and return it.
    ///
    /// Returns `Ok(None)` if no such job exists and `NotPending` if it is in
    /// any other state.
    fn start(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Replace a stored job. The stored status must be able to transition to
    /// (or equal) the new one, and the new record must satisfy its invariants.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// List jobs, newest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Remove a job unless it is processing. Returns the removed record, if any.
    ///
    /// The status check and the removal are one atomic step, so a job claimed
    /// by [`JobStore::start`] can never be deleted under its worker.
    fn delete(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// IDs of pending jobs, oldest first.
    fn pending_ids(&self) -> Result<Vec<JobId>, JobStoreError>;

    /// Count jobs per status.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn start(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).start(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(filter)
    }

    fn delete(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).delete(job_id)
    }

    fn pending_ids(&self) -> Result<Vec<JobId>, JobStoreError> {
        (**self).pending_ids()
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} is {status}, not pending")]
    NotPending { id: JobId, status: JobStatus },
    #[error("job {0} is processing")]
    Busy(JobId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Clamp into `1..=MAX_LIST_LIMIT`.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.clamp(1, MAX_LIST_LIMIT);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }
}

/// Job statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }

    pub(crate) fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Check that `next` may replace `current` in a store.
pub(crate) fn validate_update(current: &Job, next: &Job) -> Result<(), JobStoreError> {
    if current.status != next.status && !current.status.can_transition_to(next.status) {
        return Err(DomainError::invalid_transition(current.status.as_str(), next.status.as_str()).into());
    }
    next.check_invariants()?;
    Ok(())
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        job.check_invariants()?;
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(&job_id).cloned())
    }

    fn start(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Err(JobStoreError::NotPending {
                id: job_id,
                status: job.status,
            });
        }
        job.mark_processing()?;
        Ok(Some(job.clone()))
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let current = jobs.get(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        validate_update(current, job)?;
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<&Job> = jobs
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .collect();
        // UUIDv7 ids break ties between equal timestamps in creation order.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .cloned()
            .collect())
    }

    fn delete(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        match jobs.get(&job_id) {
            None => Ok(None),
            Some(job) if job.status == JobStatus::Processing => Err(JobStoreError::Busy(job_id)),
            Some(_) => Ok(jobs.remove(&job_id)),
        }
    }

    fn pending_ids(&self) -> Result<Vec<JobId>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut pending: Vec<&Job> = jobs.values().filter(|j| j.status == JobStatus::Pending).collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pending.into_iter().map(|j| j.id).collect())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(job.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use locate_inference::{Device, LocationPrediction, Place, RawPrediction};
    use std::thread;

    fn job(name: &str) -> Job {
        Job::new(name, format!("/uploads/{name}"), 3).unwrap()
    }

    fn one_prediction() -> Vec<LocationPrediction> {
        vec![LocationPrediction::new(1, RawPrediction::new(0.0, 0.0, 0.5), Place::default())]
    }

    #[test]
    fn insert_and_get() {
        let store = InMemoryJobStore::new();
        let j = job("a.jpg");
        let id = store.insert(j.clone()).unwrap();

        assert_eq!(store.get(id).unwrap(), Some(j.clone()));
        assert!(matches!(store.insert(j), Err(JobStoreError::AlreadyExists(_))));
        assert_eq!(store.get(JobId::new()).unwrap(), None);
    }

    #[test]
    fn start_is_exclusive() {
        let store = InMemoryJobStore::new();
        let id = store.insert(job("a.jpg")).unwrap();

        let started = store.start(id).unwrap().unwrap();
        assert_eq!(started.status, JobStatus::Processing);
        assert!(started.started_at.is_some());

        assert!(matches!(
            store.start(id),
            Err(JobStoreError::NotPending {
                status: JobStatus::Processing,
                ..
            })
        ));
        assert!(store.start(JobId::new()).unwrap().is_none());
    }

    #[test]
    fn concurrent_start_has_one_winner() {
        let store = InMemoryJobStore::arc();
        let id = store.insert(job("race.jpg")).unwrap();

        let winners: usize = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || store.start(id).map(|j| j.is_some()).unwrap_or(false))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();

        assert_eq!(winners, 1);
    }

    #[test]
    fn update_rejects_regression_and_broken_invariants() {
        let store = InMemoryJobStore::new();
        let id = store.insert(job("a.jpg")).unwrap();
        let mut started = store.start(id).unwrap().unwrap();

        let mut broken = started.clone();
        broken.status = JobStatus::Completed;
        assert!(matches!(store.update(&broken), Err(JobStoreError::Domain(_))));

        started.mark_completed(one_prediction(), Device::Cpu).unwrap();
        store.update(&started).unwrap();

        let mut regressed = started.clone();
        regressed.status = JobStatus::Pending;
        assert!(store.update(&regressed).is_err());
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn list_is_newest_first_with_filter_and_limit() {
        let store = InMemoryJobStore::new();
        let ids: Vec<JobId> = (0..5).map(|i| store.insert(job(&format!("{i}.jpg"))).unwrap()).collect();
        store.start(ids[0]).unwrap();

        let all = store.list(&JobFilter::default()).unwrap();
        let listed: Vec<JobId> = all.iter().map(|j| j.id).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(listed, expected);

        let pending = store.list(&JobFilter::default().with_status(JobStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 4);

        let page = store.list(&JobFilter::default().with_limit(2).with_offset(1)).unwrap();
        assert_eq!(page.iter().map(|j| j.id).collect::<Vec<_>>(), expected[1..3].to_vec());
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(JobFilter::default().with_limit(0).limit, 1);
        assert_eq!(JobFilter::default().with_limit(10_000).limit, MAX_LIST_LIMIT);
    }

    #[test]
    fn pending_ids_oldest_first_and_stats() {
        let store = InMemoryJobStore::new();
        let a = store.insert(job("a.jpg")).unwrap();
        let b = store.insert(job("b.jpg")).unwrap();
        let c = store.insert(job("c.jpg")).unwrap();

        let mut started = store.start(b).unwrap().unwrap();
        started.mark_failed("boom").unwrap();
        store.update(&started).unwrap();

        assert_eq!(store.pending_ids().unwrap(), vec![a, c]);
        assert_eq!(
            store.stats().unwrap(),
            JobStats {
                pending: 2,
                processing: 0,
                completed: 0,
                failed: 1,
            }
        );
    }

    #[test]
    fn delete_returns_removed_job() {
        let store = InMemoryJobStore::new();
        let id = store.insert(job("a.jpg")).unwrap();
        assert_eq!(store.delete(id).unwrap().map(|j| j.id), Some(id));
        assert!(store.delete(id).unwrap().is_none());
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn delete_refuses_processing_job() {
        let store = InMemoryJobStore::new();
        let id = store.insert(job("busy.jpg")).unwrap();
        store.start(id).unwrap();

        assert!(matches!(store.delete(id), Err(JobStoreError::Busy(busy)) if busy == id));
        assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn delete_racing_start_never_removes_a_claimed_job() {
        for _ in 0..64 {
            let store = InMemoryJobStore::arc();
            let id = store.insert(job("race.jpg")).unwrap();

            let starter = {
                let store = store.clone();
                thread::spawn(move || store.start(id).map(|j| j.is_some()).unwrap_or(false))
            };
            let deleter = {
                let store = store.clone();
                thread::spawn(move || store.delete(id))
            };
            let started = starter.join().unwrap();
            let deleted = deleter.join().unwrap();

            match deleted {
                // Deleted first: the worker found nothing to claim.
                Ok(Some(_)) => assert!(!started && store.get(id).unwrap().is_none()),
                // Claimed first: the record survives for its worker.
                Err(JobStoreError::Busy(_)) => {
                    assert!(started);
                    assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Processing);
                }
                other => panic!("unexpected delete result: {other:?}"),
            }
        }
    }
}
