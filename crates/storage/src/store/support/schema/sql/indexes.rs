#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE INDEX IF NOT EXISTS idx_jobs_claim
          ON jobs(status, next_run_at_ms, priority, created_at_ms, id);

        CREATE INDEX IF NOT EXISTS idx_jobs_updated
          ON jobs(updated_at_ms);

        CREATE INDEX IF NOT EXISTS idx_job_events_job
          ON job_events(job_id, created_at_ms, id);
"#;
