//! Job audit trail.
//!
//! Auditing is an optional collaborator chosen at composition time: the
//! composition root wires either [`TracingAuditSink`] or [`NoopAuditSink`].

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use locate_core::JobId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    JobSubmitted,
    JobCompleted,
    JobFailed,
    JobDeleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::JobSubmitted => "job_submitted",
            AuditAction::JobCompleted => "job_completed",
            AuditAction::JobFailed => "job_failed",
            AuditAction::JobDeleted => "job_deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, job_id: JobId) -> Self {
        Self {
            action,
            job_id,
            at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receives audit events. Must not fail or block for long.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

/// Writes events to the `locate::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "locate::audit",
            action = event.action.as_str(),
            job_id = %event.job_id,
            at = %event.at.to_rfc3339(),
            detail = event.detail.as_deref().unwrap_or(""),
            "audit"
        );
    }
}

/// Collects events in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    inner: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AuditEvent> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn actions_for(&self, job_id: JobId) -> Vec<AuditAction> {
        self.all()
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.action)
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}
