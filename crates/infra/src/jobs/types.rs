//! Job record and its lifecycle.

use core::fmt;
use core::str::FromStr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use locate_core::{DomainError, DomainResult, JobId};
use locate_inference::{Device, LocationPrediction};

/// Largest `top_k` a job may request.
pub const MAX_TOP_K: u32 = 20;

/// Job execution status.
///
/// Lifecycle: `Pending -> Processing -> {Completed, Failed}`. Never regresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, waiting for a worker
    Pending,
    /// Picked up by a worker
    Processing,
    /// Finished with predictions
    Completed,
    /// Finished without predictions
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

/// A geolocation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Display name of the submitted image
    pub filename: String,
    /// Where the image is stored; owned by this job
    pub file_path: PathBuf,
    pub top_k: u32,
    pub status: JobStatus,
    /// Present only when failed
    pub error: Option<String>,
    /// Present only when completed, in engine rank order
    pub results: Option<Vec<LocationPrediction>>,
    /// Label of the device that produced the results
    pub device: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job.
    pub fn new(filename: impl Into<String>, file_path: impl Into<PathBuf>, top_k: u32) -> DomainResult<Self> {
        if top_k == 0 || top_k > MAX_TOP_K {
            return Err(DomainError::validation(format!(
                "top_k must be between 1 and {MAX_TOP_K}, got {top_k}"
            )));
        }
        Ok(Self {
            id: JobId::new(),
            filename: filename.into(),
            file_path: file_path.into(),
            top_k,
            status: JobStatus::Pending,
            error: None,
            results: None,
            device: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status.as_str(), next.as_str()));
        }
        self.status = next;
        Ok(())
    }

    /// Mark the job as picked up and stamp `started_at`.
    pub fn mark_processing(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Processing)?;
        self.started_at = Some(stamp_after(self.created_at));
        Ok(())
    }

    /// Attach predictions and finish. `results` must be non-empty.
    pub fn mark_completed(&mut self, results: Vec<LocationPrediction>, device: Device) -> DomainResult<()> {
        if results.is_empty() {
            return Err(DomainError::invariant("completed job requires at least one prediction"));
        }
        self.transition(JobStatus::Completed)?;
        self.results = Some(results);
        self.device = Some(device.label().to_string());
        self.error = None;
        self.completed_at = Some(self.finish_stamp());
        Ok(())
    }

    /// Finish with an error message.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error.into());
        self.results = None;
        self.completed_at = Some(self.finish_stamp());
        Ok(())
    }

    fn finish_stamp(&self) -> DateTime<Utc> {
        stamp_after(self.started_at.unwrap_or(self.created_at))
    }

    /// Check the field/status coupling rules.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let started = !matches!(self.status, JobStatus::Pending);
        let finished = self.status.is_terminal();

        if self.top_k == 0 {
            return Err(DomainError::invariant("top_k must be positive"));
        }
        if self.started_at.is_some() != started {
            return Err(DomainError::invariant(format!(
                "started_at must be set iff job has started (status {})",
                self.status
            )));
        }
        if self.completed_at.is_some() != finished {
            return Err(DomainError::invariant(format!(
                "completed_at must be set iff job is terminal (status {})",
                self.status
            )));
        }
        if self.error.is_some() != (self.status == JobStatus::Failed) {
            return Err(DomainError::invariant("error must be set iff job failed"));
        }
        if self.results.is_some() != (self.status == JobStatus::Completed) {
            return Err(DomainError::invariant("results must be set iff job completed"));
        }
        if let Some(results) = &self.results {
            if results.is_empty() {
                return Err(DomainError::invariant("completed job has no predictions"));
            }
            if results.iter().enumerate().any(|(i, p)| p.rank as usize != i + 1) {
                return Err(DomainError::invariant("result ranks must be contiguous from 1"));
            }
        }
        if let Some(started_at) = self.started_at {
            if started_at < self.created_at {
                return Err(DomainError::invariant("started_at precedes created_at"));
            }
            if self.completed_at.is_some_and(|c| c < started_at) {
                return Err(DomainError::invariant("completed_at precedes started_at"));
            }
        }
        Ok(())
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            filename: self.filename.clone(),
            status: self.status,
            error: self.error.clone(),
            results: self.results.clone(),
            top_k: self.top_k,
            device: self.device.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Timestamps never go backwards, even if the wall clock does.
fn stamp_after(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}

/// Public projection of a job (no server-side paths).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub filename: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub results: Option<Vec<LocationPrediction>>,
    pub top_k: u32,
    pub device: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
