#![forbid(unsafe_code)]

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("unknown job (job_id={job_id})")]
    UnknownJob { job_id: i64 },
    #[error(
        "job lock conflict (job_id={job_id}, locked_by={}, worker_id={worker_id})",
        locked_by.as_deref().unwrap_or("<none>")
    )]
    LockConflict {
        job_id: i64,
        locked_by: Option<String>,
        worker_id: String,
    },
    #[error("schema too new (found={found}, supported={supported})")]
    SchemaTooNew { found: i64, supported: i64 },
}

impl StoreError {
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }
}
