#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use jobq_core::JobStatus;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

pub const DEFAULT_PRIORITY: i64 = 100;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Immutable read view of a job row, payload decoded.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: i64,
    pub job_type: String,
    pub project_id: Option<i64>,
    pub payload: JsonValue,
    pub status: JobStatus,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub progress_done: u64,
    pub progress_total: u64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn is_locked_by(&self, worker_id: &str) -> bool {
        self.locked_by.as_deref() == Some(worker_id)
    }

    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

#[derive(Clone, Debug)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub payload: JsonValue,
    pub project_id: Option<i64>,
    pub priority: i64,
    pub max_attempts: u32,
    pub run_at: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            project_id: None,
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_at: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClaimNextRequest {
    pub worker_id: String,
    /// `None` or an empty list claims any job type.
    pub allowed_job_types: Option<Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct ClaimJobRequest {
    pub job_id: i64,
    pub worker_id: String,
}

#[derive(Clone, Debug)]
pub struct HeartbeatRequest {
    pub job_id: i64,
    pub worker_id: String,
    pub progress_done: Option<u64>,
    pub progress_total: Option<u64>,
    pub message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CompleteRequest {
    pub job_id: i64,
    pub worker_id: String,
    pub message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct FailRequest {
    pub job_id: i64,
    pub worker_id: String,
    pub error_message: String,
    pub error_code: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CancelRequest {
    pub job_id: i64,
    pub reason: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ListJobsRequest {
    pub statuses: Option<Vec<JobStatus>>,
    pub limit: usize,
}

#[derive(Clone, Debug)]
pub struct PurgeJobsRequest {
    pub statuses: Vec<JobStatus>,
    pub older_than_seconds: u64,
}

/// Per-status job counts; every status is present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobCounts(BTreeMap<JobStatus, u64>);

impl JobCounts {
    pub(crate) fn from_rows(rows: impl IntoIterator<Item = (JobStatus, u64)>) -> Self {
        let mut counts: BTreeMap<JobStatus, u64> =
            JobStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for (status, count) in rows {
            counts.insert(status, count);
        }
        Self(counts)
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// Jobs not yet in a terminal state.
    pub fn active(&self) -> u64 {
        self.0
            .iter()
            .filter(|(status, _)| !status.is_terminal())
            .map(|(_, count)| count)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobStatus, u64)> + '_ {
        self.0.iter().map(|(status, count)| (*status, *count))
    }
}
