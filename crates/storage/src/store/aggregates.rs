#![forbid(unsafe_code)]

use super::jobs::{JOB_COLUMNS, read_job_row};
use super::*;
use jobq_core::JobStatus;
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;

const MAX_LIST_LIMIT: usize = 500;

fn status_placeholders(statuses: &[JobStatus], first_index: usize) -> String {
    statuses
        .iter()
        .enumerate()
        .map(|(i, _)| format!("?{}", i + first_index))
        .collect::<Vec<_>>()
        .join(",")
}

fn dedup_statuses(statuses: &[JobStatus]) -> Vec<JobStatus> {
    let mut out = statuses.to_vec();
    out.sort();
    out.dedup();
    out
}

impl SqliteStore {
    /// Number of jobs per status, every status included.
    pub fn counts(&self) -> Result<JobCounts, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(1) FROM jobs GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::<(JobStatus, u64)>::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let status = status.parse::<JobStatus>().map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            out.push((status, u64::try_from(count).unwrap_or(0)));
        }
        Ok(JobCounts::from_rows(out))
    }

    /// Newest jobs first, optionally restricted to some statuses.
    pub fn list_jobs(&self, request: ListJobsRequest) -> Result<Vec<JobSnapshot>, StoreError> {
        let limit = request.limit.clamp(1, MAX_LIST_LIMIT);
        let statuses = request
            .statuses
            .as_deref()
            .map(dedup_statuses)
            .unwrap_or_default();

        let mut sql_params = vec![SqlValue::Integer(limit as i64)];
        let status_filter = if statuses.is_empty() {
            String::new()
        } else {
            sql_params.extend(
                statuses
                    .iter()
                    .map(|s| SqlValue::Text(s.as_str().to_string())),
            );
            format!("WHERE status IN ({})", status_placeholders(&statuses, 2))
        };
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            {status_filter}
            ORDER BY created_at_ms DESC, id DESC
            LIMIT ?1
            "#
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(sql_params))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(read_job_row(row)?);
        }
        Ok(jobs)
    }

    /// Deletes terminal jobs last updated at or before `now - older_than_seconds`, with their
    /// events. Non-terminal statuses are rejected; they are never purged.
    pub fn purge_jobs(&mut self, request: PurgeJobsRequest) -> Result<usize, StoreError> {
        if request.statuses.iter().any(|s| !s.is_terminal()) {
            return Err(StoreError::InvalidInput(
                "purge statuses must be terminal (completed|failed|canceled)",
            ));
        }
        let statuses = dedup_statuses(&request.statuses);
        if statuses.is_empty() {
            return Ok(0);
        }
        let selection = format!(
            "SELECT id FROM jobs WHERE updated_at_ms <= ?1 AND status IN ({})",
            status_placeholders(&statuses, 2)
        );

        let tx = self.write_tx()?;
        let cutoff_ms = now_ms().saturating_sub(seconds_to_ms(request.older_than_seconds));
        let mut sql_params = vec![SqlValue::Integer(cutoff_ms)];
        sql_params.extend(
            statuses
                .iter()
                .map(|s| SqlValue::Text(s.as_str().to_string())),
        );
        let events = tx.execute(
            &format!("DELETE FROM job_events WHERE job_id IN ({selection})"),
            params_from_iter(sql_params.iter()),
        )?;
        let purged = tx.execute(
            &format!("DELETE FROM jobs WHERE id IN ({selection})"),
            params_from_iter(sql_params.iter()),
        )?;
        tx.commit()?;

        if purged > 0 {
            tracing::info!(
                purged,
                events,
                statuses = ?statuses,
                older_than_seconds = request.older_than_seconds,
                "jobs purged"
            );
        }
        Ok(purged)
    }
}
