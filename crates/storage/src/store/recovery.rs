#![forbid(unsafe_code)]

use super::events::insert_job_event_tx;
use super::jobs::{FailureOutcome, ReleaseArgs, release_failed_attempt_tx};
use super::*;
use jobq_core::EventLevel;
use rusqlite::params;

const STALE_RECOVERED_CODE: &str = "stale_recovered";
const STALE_EXHAUSTED_CODE: &str = "stale_exhausted";

struct StaleJob {
    id: i64,
    job_type: String,
    locked_by: String,
    attempts: u32,
    max_attempts: u32,
}

impl SqliteStore {
    /// Breaks the locks of running jobs whose owner stopped heartbeating.
    ///
    /// A job is stale when `heartbeat_at` is null or strictly older than `stale_after_seconds`.
    /// Each stale job takes the same branch as a failed attempt, based on its current attempt
    /// count. Returns how many jobs were recovered. Scheduling the sweep is up to the caller.
    pub fn recover_stale_running_jobs(
        &mut self,
        stale_after_seconds: u64,
    ) -> Result<usize, StoreError> {
        let backoff = self.config.backoff;

        let tx = self.write_tx()?;
        let now_ms = now_ms();
        let stale_before_ms = now_ms.saturating_sub(seconds_to_ms(stale_after_seconds));
        let stale = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, job_type, locked_by, attempts, max_attempts
                FROM jobs
                WHERE status='running'
                  AND (heartbeat_at_ms IS NULL OR heartbeat_at_ms < ?1)
                ORDER BY id ASC
                "#,
            )?;
            let mut rows = stmt.query(params![stale_before_ms])?;
            let mut out = Vec::<StaleJob>::new();
            while let Some(row) = rows.next()? {
                out.push(StaleJob {
                    id: row.get(0)?,
                    job_type: row.get(1)?,
                    locked_by: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    attempts: row.get(3)?,
                    max_attempts: row.get(4)?,
                });
            }
            out
        };

        let mut recovered = 0usize;
        for job in stale {
            let outcome = FailureOutcome::decide(&backoff, job.attempts, job.max_attempts);
            let (error_code, error_message) = match outcome {
                FailureOutcome::Retry { .. } => (
                    STALE_RECOVERED_CODE,
                    format!("recovered after {} stopped heartbeating", job.locked_by),
                ),
                FailureOutcome::Exhausted => (
                    STALE_EXHAUSTED_CODE,
                    format!(
                        "{} stopped heartbeating and no attempts remain",
                        job.locked_by
                    ),
                ),
            };

            let changed = release_failed_attempt_tx(
                &tx,
                ReleaseArgs {
                    job_id: job.id,
                    expected_locked_by: &job.locked_by,
                    outcome,
                    error_code,
                    error_message: &error_message,
                    heartbeat_at_ms: None,
                    now_ms,
                },
            )?;
            if changed != 1 {
                continue;
            }

            match outcome {
                FailureOutcome::Retry { delay_s } => {
                    insert_job_event_tx(
                        &tx,
                        job.id,
                        EventLevel::Warning,
                        &format!(
                            "stale job recovered ({}/{}): retry in {delay_s}s, previous owner {}",
                            job.attempts, job.max_attempts, job.locked_by
                        ),
                        now_ms,
                    )?;
                    tracing::warn!(
                        job_id = job.id,
                        job_type = %job.job_type,
                        previous_owner = %job.locked_by,
                        attempts = job.attempts,
                        delay_s,
                        "stale job recovered"
                    );
                }
                FailureOutcome::Exhausted => {
                    insert_job_event_tx(
                        &tx,
                        job.id,
                        EventLevel::Error,
                        &format!(
                            "stale job failed permanently ({}/{}), previous owner {}",
                            job.attempts, job.max_attempts, job.locked_by
                        ),
                        now_ms,
                    )?;
                    tracing::error!(
                        job_id = job.id,
                        job_type = %job.job_type,
                        previous_owner = %job.locked_by,
                        attempts = job.attempts,
                        "stale job exhausted"
                    );
                }
            }
            recovered += 1;
        }

        tx.commit()?;
        if recovered > 0 {
            tracing::info!(recovered, stale_after_seconds, "stale recovery sweep finished");
        }
        Ok(recovered)
    }
}
