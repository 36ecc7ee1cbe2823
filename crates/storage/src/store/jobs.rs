#![forbid(unsafe_code)]

use super::events::insert_job_event_tx;
use super::*;
use jobq_core::ids::{JobType, WorkerId};
use jobq_core::{EventLevel, JobStatus};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{OptionalExtension, params, params_from_iter};
use serde_json::{Map as JsonMap, Value as JsonValue};

const MAX_ERROR_CODE_LEN: usize = 64;
const MAX_ERROR_MESSAGE_LEN: usize = 4_000;
const DEFAULT_ERROR_CODE: &str = "runtime_error";
const DEFAULT_ERROR_MESSAGE: &str = "job failed";
const DEFAULT_CANCEL_REASON: &str = "canceled by operator";
const CANCELED_ERROR_CODE: &str = "canceled";

pub(super) const JOB_COLUMNS: &str = "id, job_type, project_id, payload_json, status, priority, \
     attempts, max_attempts, next_run_at_ms, locked_by, locked_at_ms, heartbeat_at_ms, \
     progress_done, progress_total, error_code, error_message, created_at_ms, updated_at_ms";

fn conversion_error(
    idx: usize,
    ty: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn read_time(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> Result<chrono::DateTime<chrono::Utc>, rusqlite::Error> {
    let ms: i64 = row.get(idx)?;
    ms_to_dt(ms).map_err(|err| conversion_error(idx, Type::Integer, err))
}

fn read_opt_time(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, rusqlite::Error> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| ms_to_dt(ms).map_err(|err| conversion_error(idx, Type::Integer, err)))
        .transpose()
}

/// Maps a row selected with [`JOB_COLUMNS`].
pub(super) fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobSnapshot, rusqlite::Error> {
    let payload_json: String = row.get(3)?;
    let payload = serde_json::from_str::<JsonValue>(&payload_json)
        .map_err(|err| conversion_error(3, Type::Text, err))?;
    let status: String = row.get(4)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|err| conversion_error(4, Type::Text, err))?;
    let progress_done: i64 = row.get(12)?;
    let progress_total: i64 = row.get(13)?;

    Ok(JobSnapshot {
        id: row.get(0)?,
        job_type: row.get(1)?,
        project_id: row.get(2)?,
        payload,
        status,
        priority: row.get(5)?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        next_run_at: read_time(row, 8)?,
        locked_by: row.get(9)?,
        locked_at: read_opt_time(row, 10)?,
        heartbeat_at: read_opt_time(row, 11)?,
        progress_done: u64::try_from(progress_done).unwrap_or(0),
        progress_total: u64::try_from(progress_total).unwrap_or(0),
        error_code: row.get(14)?,
        error_message: row.get(15)?,
        created_at: read_time(row, 16)?,
        updated_at: read_time(row, 17)?,
    })
}

pub(super) fn load_job_tx(tx: &Transaction<'_>, job_id: i64) -> Result<JobSnapshot, StoreError> {
    tx.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
        params![job_id],
        read_job_row,
    )
    .optional()?
    .ok_or(StoreError::UnknownJob { job_id })
}

fn normalize_job_type(raw: &str) -> Result<JobType, StoreError> {
    JobType::try_new(raw).map_err(|err| StoreError::InvalidInput(err.message()))
}

fn normalize_worker_id(raw: &str) -> Result<WorkerId, StoreError> {
    WorkerId::try_new(raw).map_err(|err| StoreError::InvalidInput(err.message()))
}

fn normalize_payload(payload: JsonValue) -> Result<String, StoreError> {
    let payload = match payload {
        JsonValue::Null => JsonValue::Object(JsonMap::new()),
        JsonValue::Object(map) => JsonValue::Object(map),
        _ => return Err(StoreError::InvalidInput("payload must be a JSON object")),
    };
    Ok(serde_json::to_string(&payload)?)
}

fn normalize_text(raw: Option<&str>, max_len: usize) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.chars().take(max_len).collect())
}

fn ensure_lock_owner(job: &JobSnapshot, worker_id: &WorkerId) -> Result<(), StoreError> {
    if job.is_locked_by(worker_id.as_str()) {
        return Ok(());
    }
    Err(StoreError::LockConflict {
        job_id: job.id,
        locked_by: job.locked_by.clone(),
        worker_id: worker_id.as_str().to_string(),
    })
}

/// What a failed attempt turns into: another try after a delay, or a terminal failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum FailureOutcome {
    Retry { delay_s: u64 },
    Exhausted,
}

impl FailureOutcome {
    pub(super) fn decide(policy: &BackoffPolicy, attempts: u32, max_attempts: u32) -> Self {
        if attempts < max_attempts {
            FailureOutcome::Retry {
                delay_s: policy.delay_seconds(attempts),
            }
        } else {
            FailureOutcome::Exhausted
        }
    }
}

pub(super) struct ReleaseArgs<'a> {
    pub(super) job_id: i64,
    pub(super) expected_locked_by: &'a str,
    pub(super) outcome: FailureOutcome,
    pub(super) error_code: &'a str,
    pub(super) error_message: &'a str,
    pub(super) heartbeat_at_ms: Option<i64>,
    pub(super) now_ms: i64,
}

/// Clears the lock of a running job and moves it to `retry_waiting` or `failed`.
/// Returns the number of rows changed (0 when the row is no longer held by `expected_locked_by`).
pub(super) fn release_failed_attempt_tx(
    tx: &Transaction<'_>,
    args: ReleaseArgs<'_>,
) -> Result<usize, StoreError> {
    let (status, next_run_at_ms) = match args.outcome {
        FailureOutcome::Retry { delay_s } => (
            JobStatus::RetryWaiting,
            args.now_ms.saturating_add(seconds_to_ms(delay_s)),
        ),
        FailureOutcome::Exhausted => (JobStatus::Failed, args.now_ms),
    };
    let changed = tx.execute(
        r#"
        UPDATE jobs
        SET status=?3, next_run_at_ms=?4, locked_by=NULL, locked_at_ms=NULL, heartbeat_at_ms=?5,
            error_code=?6, error_message=?7, updated_at_ms=?8
        WHERE id=?1 AND status='running' AND locked_by=?2
        "#,
        params![
            args.job_id,
            args.expected_locked_by,
            status.as_str(),
            next_run_at_ms,
            args.heartbeat_at_ms,
            args.error_code,
            args.error_message,
            args.now_ms,
        ],
    )?;
    Ok(changed)
}

/// Compare-and-swap claim of one eligible row. `None` when another writer got there first or the
/// row is not eligible at `now_ms`.
fn claim_row_tx(
    tx: &Transaction<'_>,
    job_id: i64,
    worker_id: &WorkerId,
    now_ms: i64,
) -> Result<Option<JobSnapshot>, StoreError> {
    let changed = tx.execute(
        r#"
        UPDATE jobs
        SET status='running', attempts=attempts + 1, locked_by=?2, locked_at_ms=?3,
            heartbeat_at_ms=?3, updated_at_ms=?3
        WHERE id=?1 AND status IN ('queued','retry_waiting') AND next_run_at_ms <= ?3
        "#,
        params![job_id, worker_id.as_str(), now_ms],
    )?;
    if changed != 1 {
        return Ok(None);
    }

    let job = load_job_tx(tx, job_id)?;
    insert_job_event_tx(
        tx,
        job_id,
        EventLevel::Info,
        &format!(
            "claimed by {} (attempt {}/{})",
            worker_id.as_str(),
            job.attempts,
            job.max_attempts
        ),
        now_ms,
    )?;
    tracing::info!(
        job_id,
        job_type = %job.job_type,
        worker_id = worker_id.as_str(),
        attempts = job.attempts,
        max_attempts = job.max_attempts,
        "job claimed"
    );
    Ok(Some(job))
}

impl SqliteStore {
    pub fn enqueue(&mut self, request: EnqueueRequest) -> Result<JobSnapshot, StoreError> {
        let job_type = normalize_job_type(&request.job_type)?;
        if request.max_attempts < 1 {
            return Err(StoreError::InvalidInput("max_attempts must be >= 1"));
        }
        let payload_json = normalize_payload(request.payload)?;

        let tx = self.write_tx()?;
        let now_ms = now_ms();
        let next_run_at_ms = request.run_at.map(dt_to_ms).unwrap_or(now_ms);

        tx.execute(
            r#"
            INSERT INTO jobs(
              job_type, project_id, payload_json, status, priority, attempts, max_attempts,
              next_run_at_ms, progress_done, progress_total, created_at_ms, updated_at_ms
            )
            VALUES (?1, ?2, ?3, 'queued', ?4, 0, ?5, ?6, 0, 0, ?7, ?7)
            "#,
            params![
                job_type.as_str(),
                request.project_id,
                payload_json,
                request.priority,
                request.max_attempts,
                next_run_at_ms,
                now_ms,
            ],
        )?;
        let job_id = tx.last_insert_rowid();

        insert_job_event_tx(
            &tx,
            job_id,
            EventLevel::Info,
            &format!(
                "enqueued (type={}, priority={}, max_attempts={})",
                job_type.as_str(),
                request.priority,
                request.max_attempts
            ),
            now_ms,
        )?;
        let job = load_job_tx(&tx, job_id)?;
        tx.commit()?;

        tracing::info!(
            job_id,
            job_type = job_type.as_str(),
            priority = request.priority,
            max_attempts = request.max_attempts,
            "job enqueued"
        );
        Ok(job)
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<JobSnapshot>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id=?1"),
                params![job_id],
                read_job_row,
            )
            .optional()?)
    }

    /// Claims the first eligible job by `(priority, created_at, id)`. Never blocks waiting for
    /// work: `None` means nothing is claimable right now.
    pub fn claim_next(
        &mut self,
        request: ClaimNextRequest,
    ) -> Result<Option<JobSnapshot>, StoreError> {
        let worker_id = normalize_worker_id(&request.worker_id)?;
        let allowed = request
            .allowed_job_types
            .unwrap_or_default()
            .iter()
            .map(|raw| normalize_job_type(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let tx = self.write_tx()?;
        let now_ms = now_ms();
        let mut sql_params = vec![SqlValue::Integer(now_ms)];
        let type_filter = if allowed.is_empty() {
            String::new()
        } else {
            let placeholders = allowed
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(",");
            sql_params.extend(
                allowed
                    .iter()
                    .map(|t| SqlValue::Text(t.as_str().to_string())),
            );
            format!("AND job_type IN ({placeholders})")
        };
        let sql = format!(
            r#"
            SELECT id
            FROM jobs
            WHERE status IN ('queued','retry_waiting') AND next_run_at_ms <= ?1
              {type_filter}
            ORDER BY priority ASC, created_at_ms ASC, id ASC
            LIMIT 1
            "#
        );
        let candidate: Option<i64> = tx
            .query_row(&sql, params_from_iter(sql_params), |row| row.get(0))
            .optional()?;
        let Some(job_id) = candidate else {
            tracing::debug!(worker_id = worker_id.as_str(), "no claimable job");
            return Ok(None);
        };

        let job = claim_row_tx(&tx, job_id, &worker_id, now_ms)?;
        tx.commit()?;
        Ok(job)
    }

    /// Claims one specific job (operator action). `None` when the job exists but is not
    /// claimable: wrong status or `next_run_at` still in the future.
    pub fn claim_job(
        &mut self,
        request: ClaimJobRequest,
    ) -> Result<Option<JobSnapshot>, StoreError> {
        let worker_id = normalize_worker_id(&request.worker_id)?;

        let tx = self.write_tx()?;
        let now_ms = now_ms();
        let job = load_job_tx(&tx, request.job_id)?;
        if !job.status.is_claimable() || dt_to_ms(job.next_run_at) > now_ms {
            tracing::debug!(
                job_id = job.id,
                status = %job.status,
                worker_id = worker_id.as_str(),
                "job not claimable"
            );
            return Ok(None);
        }

        let claimed = claim_row_tx(&tx, job.id, &worker_id, now_ms)?;
        tx.commit()?;
        Ok(claimed)
    }

    /// Liveness signal from the lock holder, with optional progress and a debug event.
    pub fn heartbeat(&mut self, request: HeartbeatRequest) -> Result<JobSnapshot, StoreError> {
        let worker_id = normalize_worker_id(&request.worker_id)?;
        let message = normalize_text(request.message.as_deref(), MAX_ERROR_MESSAGE_LEN);
        let progress_done = request
            .progress_done
            .map(|v| i64::try_from(v).unwrap_or(i64::MAX));
        let progress_total = request
            .progress_total
            .map(|v| i64::try_from(v).unwrap_or(i64::MAX));

        let tx = self.write_tx()?;
        let now_ms = now_ms();
        let job = load_job_tx(&tx, request.job_id)?;
        ensure_lock_owner(&job, &worker_id)?;

        tx.execute(
            r#"
            UPDATE jobs
            SET heartbeat_at_ms=?3,
                progress_done=COALESCE(?4, progress_done),
                progress_total=COALESCE(?5, progress_total),
                updated_at_ms=?3
            WHERE id=?1 AND status='running' AND locked_by=?2
            "#,
            params![
                job.id,
                worker_id.as_str(),
                now_ms,
                progress_done,
                progress_total
            ],
        )?;
        if let Some(message) = message.as_deref() {
            insert_job_event_tx(&tx, job.id, EventLevel::Debug, message, now_ms)?;
        }
        let job = load_job_tx(&tx, job.id)?;
        tx.commit()?;

        tracing::debug!(
            job_id = job.id,
            worker_id = worker_id.as_str(),
            progress_done = job.progress_done,
            progress_total = job.progress_total,
            "job heartbeat"
        );
        Ok(job)
    }

    pub fn complete(&mut self, request: CompleteRequest) -> Result<JobSnapshot, StoreError> {
        let worker_id = normalize_worker_id(&request.worker_id)?;
        let message = normalize_text(request.message.as_deref(), MAX_ERROR_MESSAGE_LEN);

        let tx = self.write_tx()?;
        let now_ms = now_ms();
        let job = load_job_tx(&tx, request.job_id)?;
        ensure_lock_owner(&job, &worker_id)?;

        tx.execute(
            r#"
            UPDATE jobs
            SET status='completed', locked_by=NULL, locked_at_ms=NULL, heartbeat_at_ms=?3,
                next_run_at_ms=?3, error_code=NULL, error_message=NULL, updated_at_ms=?3
            WHERE id=?1 AND status='running' AND locked_by=?2
            "#,
            params![job.id, worker_id.as_str(), now_ms],
        )?;
        let event_message = match message.as_deref() {
            Some(message) => format!("completed: {message}"),
            None => "completed".to_string(),
        };
        insert_job_event_tx(&tx, job.id, EventLevel::Info, &event_message, now_ms)?;
        let job = load_job_tx(&tx, job.id)?;
        tx.commit()?;

        tracing::info!(
            job_id = job.id,
            job_type = %job.job_type,
            worker_id = worker_id.as_str(),
            attempts = job.attempts,
            "job completed"
        );
        Ok(job)
    }

    /// Records a failed attempt: retry after backoff while attempts remain, terminal otherwise.
    pub fn fail(&mut self, request: FailRequest) -> Result<JobSnapshot, StoreError> {
        let worker_id = normalize_worker_id(&request.worker_id)?;
        let error_code = normalize_text(request.error_code.as_deref(), MAX_ERROR_CODE_LEN)
            .unwrap_or_else(|| DEFAULT_ERROR_CODE.to_string());
        let error_message = normalize_text(Some(&request.error_message), MAX_ERROR_MESSAGE_LEN)
            .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string());
        let backoff = self.config.backoff;

        let tx = self.write_tx()?;
        let now_ms = now_ms();
        let job = load_job_tx(&tx, request.job_id)?;
        ensure_lock_owner(&job, &worker_id)?;

        let outcome = FailureOutcome::decide(&backoff, job.attempts, job.max_attempts);
        release_failed_attempt_tx(
            &tx,
            ReleaseArgs {
                job_id: job.id,
                expected_locked_by: worker_id.as_str(),
                outcome,
                error_code: &error_code,
                error_message: &error_message,
                heartbeat_at_ms: Some(now_ms),
                now_ms,
            },
        )?;

        match outcome {
            FailureOutcome::Retry { delay_s } => {
                insert_job_event_tx(
                    &tx,
                    job.id,
                    EventLevel::Warning,
                    &format!(
                        "retry scheduled ({}/{}) in {delay_s}s: [{error_code}] {error_message}",
                        job.attempts, job.max_attempts
                    ),
                    now_ms,
                )?;
                tracing::warn!(
                    job_id = job.id,
                    worker_id = worker_id.as_str(),
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    delay_s,
                    error_code = %error_code,
                    "job attempt failed; retry scheduled"
                );
            }
            FailureOutcome::Exhausted => {
                insert_job_event_tx(
                    &tx,
                    job.id,
                    EventLevel::Error,
                    &format!(
                        "failed permanently ({}/{}): [{error_code}] {error_message}",
                        job.attempts, job.max_attempts
                    ),
                    now_ms,
                )?;
                tracing::error!(
                    job_id = job.id,
                    worker_id = worker_id.as_str(),
                    attempts = job.attempts,
                    error_code = %error_code,
                    "job failed permanently"
                );
            }
        }

        let job = load_job_tx(&tx, job.id)?;
        tx.commit()?;
        Ok(job)
    }

    /// Marks a non-terminal job canceled. Idempotent: a terminal job is returned unchanged.
    ///
    /// Cancellation is cooperative: a worker still processing the job finds out through
    /// [`SqliteStore::get_job`] or a lock conflict on its next heartbeat.
    pub fn cancel(&mut self, request: CancelRequest) -> Result<JobSnapshot, StoreError> {
        let reason = normalize_text(request.reason.as_deref(), MAX_ERROR_MESSAGE_LEN)
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

        let tx = self.write_tx()?;
        let now_ms = now_ms();
        let job = load_job_tx(&tx, request.job_id)?;
        if job.status.is_terminal() {
            tracing::debug!(
                job_id = job.id,
                status = %job.status,
                "cancel on terminal job ignored"
            );
            return Ok(job);
        }

        tx.execute(
            r#"
            UPDATE jobs
            SET status='canceled', locked_by=NULL, locked_at_ms=NULL, heartbeat_at_ms=?3,
                error_code=?4, error_message=?5, updated_at_ms=?3
            WHERE id=?1 AND status=?2
            "#,
            params![
                job.id,
                job.status.as_str(),
                now_ms,
                CANCELED_ERROR_CODE,
                reason
            ],
        )?;
        let event_message = match job.locked_by.as_deref() {
            Some(worker) => format!("canceled while running on {worker}: {reason}"),
            None => format!("canceled: {reason}"),
        };
        insert_job_event_tx(&tx, job.id, EventLevel::Warning, &event_message, now_ms)?;
        let canceled = load_job_tx(&tx, job.id)?;
        tx.commit()?;

        tracing::warn!(
            job_id = canceled.id,
            previous_status = %job.status,
            locked_by = job.locked_by.as_deref().unwrap_or(""),
            "job canceled"
        );
        Ok(canceled)
    }
}
