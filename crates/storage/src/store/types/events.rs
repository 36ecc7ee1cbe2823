#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use jobq_core::EventLevel;
use serde::Serialize;

/// One immutable audit entry in a job's event trail.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: i64,
    pub level: EventLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ListJobEventsRequest {
    pub job_id: i64,
    pub limit: usize,
}
