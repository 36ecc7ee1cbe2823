#![forbid(unsafe_code)]

use crate::worker::JobContext;
use jobq_storage::{JobSnapshot, StoreError};

/// Why a handler gave up on an attempt. Drives `fail`, so the job is retried while attempts
/// remain.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct JobFailure {
    pub code: Option<String>,
    pub message: String,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<StoreError> for JobFailure {
    fn from(err: StoreError) -> Self {
        let code = if err.is_lock_conflict() {
            "lease_lost"
        } else {
            "store_error"
        };
        JobFailure::new(err.to_string()).with_code(code)
    }
}

/// Work performed for one claimed job.
///
/// `Ok(message)` completes the job (the message lands in the completion event). Long-running
/// handlers should call [`JobContext::heartbeat`] regularly and check
/// [`JobContext::is_canceled`] at safe points.
pub trait JobHandler {
    fn run(
        &mut self,
        job: &JobSnapshot,
        ctx: &mut JobContext<'_>,
    ) -> Result<Option<String>, JobFailure>;
}

/// Claims and completes immediately. Smoke test for a deployment.
#[derive(Clone, Copy, Debug, Default)]
pub struct DryRunHandler;

impl JobHandler for DryRunHandler {
    fn run(
        &mut self,
        job: &JobSnapshot,
        _ctx: &mut JobContext<'_>,
    ) -> Result<Option<String>, JobFailure> {
        tracing::info!(
            job_id = job.id,
            job_type = %job.job_type,
            "dry-run: completing immediately"
        );
        Ok(Some("dry-run".to_string()))
    }
}
