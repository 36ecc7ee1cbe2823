#![forbid(unsafe_code)]

use crate::defaults::default_poll_interval;
use crate::handler::JobHandler;
use jobq_core::JobStatus;
use jobq_storage::{
    ClaimNextRequest, CompleteRequest, FailRequest, HeartbeatRequest, JobSnapshot, SqliteStore,
    StoreError,
};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Empty claims any job type.
    pub allowed_job_types: Vec<String>,
    pub poll_interval: Duration,
    /// When set, every idle poll also breaks the locks of jobs whose heartbeat is older than
    /// this.
    pub stale_after: Option<Duration>,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            allowed_job_types: Vec::new(),
            poll_interval: default_poll_interval(),
            stale_after: None,
        }
    }
}

/// Handle a [`JobHandler`] gets for the job it is running.
pub struct JobContext<'a> {
    store: &'a mut SqliteStore,
    job_id: i64,
    worker_id: &'a str,
    lease_lost: bool,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(store: &'a mut SqliteStore, job_id: i64, worker_id: &'a str) -> Self {
        Self {
            store,
            job_id,
            worker_id,
            lease_lost: false,
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub fn worker_id(&self) -> &str {
        self.worker_id
    }

    /// Refreshes the lease and optionally records progress. A `LockConflict` means the job was
    /// canceled or recovered by a sweep; the handler should stop, its outcome will be dropped.
    pub fn heartbeat(
        &mut self,
        progress_done: Option<u64>,
        progress_total: Option<u64>,
        message: Option<&str>,
    ) -> Result<JobSnapshot, StoreError> {
        let result = self.store.heartbeat(HeartbeatRequest {
            job_id: self.job_id,
            worker_id: self.worker_id.to_string(),
            progress_done,
            progress_total,
            message: message.map(str::to_string),
        });
        if let Err(err) = &result
            && err.is_lock_conflict()
        {
            self.lease_lost = true;
        }
        result
    }

    /// True once the job is no longer running under this worker (canceled, recovered, gone).
    pub fn is_canceled(&mut self) -> Result<bool, StoreError> {
        if self.lease_lost {
            return Ok(true);
        }
        let still_ours = match self.store.get_job(self.job_id)? {
            Some(job) => job.status == JobStatus::Running && job.is_locked_by(self.worker_id),
            None => false,
        };
        if !still_ours {
            self.lease_lost = true;
        }
        Ok(!still_ours)
    }

    pub fn lease_lost(&self) -> bool {
        self.lease_lost
    }
}

/// Claim, run, settle. One store connection per worker; several workers (threads or
/// processes) may share a storage directory.
pub struct Worker<H> {
    store: SqliteStore,
    config: WorkerConfig,
    handler: H,
}

impl<H: JobHandler> Worker<H> {
    pub fn new(store: SqliteStore, config: WorkerConfig, handler: H) -> Self {
        Self {
            store,
            config,
            handler,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Processes at most one job. Returns whether a job was claimed.
    pub fn run_once(&mut self) -> Result<bool, StoreError> {
        let allowed_job_types = (!self.config.allowed_job_types.is_empty())
            .then(|| self.config.allowed_job_types.clone());
        let Some(job) = self.store.claim_next(ClaimNextRequest {
            worker_id: self.config.worker_id.clone(),
            allowed_job_types,
        })?
        else {
            return Ok(false);
        };
        // The store normalizes ids; settle with exactly what it recorded.
        let worker_id = job
            .locked_by
            .clone()
            .unwrap_or_else(|| self.config.worker_id.clone());

        let started = Instant::now();
        let (outcome, lease_lost) = {
            let mut ctx = JobContext::new(&mut self.store, job.id, &worker_id);
            let outcome = self.handler.run(&job, &mut ctx);
            (outcome, ctx.lease_lost())
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if lease_lost {
            tracing::warn!(
                job_id = job.id,
                worker_id = %worker_id,
                elapsed_ms,
                "lease lost while running; outcome dropped"
            );
            return Ok(true);
        }

        let settled = match outcome {
            Ok(message) => self
                .store
                .complete(CompleteRequest {
                    job_id: job.id,
                    worker_id: worker_id.clone(),
                    message,
                })
                .map(|_| ()),
            Err(failure) => {
                tracing::debug!(
                    job_id = job.id,
                    error = %failure,
                    elapsed_ms,
                    "handler reported failure"
                );
                self.store
                    .fail(FailRequest {
                        job_id: job.id,
                        worker_id: worker_id.clone(),
                        error_message: failure.message,
                        error_code: failure.code,
                    })
                    .map(|_| ())
            }
        };

        match settled {
            Ok(()) => Ok(true),
            Err(err) if err.is_lock_conflict() => {
                tracing::warn!(
                    job_id = job.id,
                    worker_id = %worker_id,
                    error = %err,
                    "job changed hands before settling; outcome dropped"
                );
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// Polls until `max_iterations` polls have run (forever when `None`). Sleeps
    /// `poll_interval` after a poll that found nothing. Returns the number of jobs processed.
    pub fn run_loop(&mut self, max_iterations: Option<u64>) -> Result<u64, StoreError> {
        let mut processed = 0u64;
        let mut iterations = 0u64;
        loop {
            if let Some(max) = max_iterations
                && iterations >= max
            {
                break;
            }
            iterations += 1;

            if self.run_once()? {
                processed += 1;
                continue;
            }

            if let Some(stale_after) = self.config.stale_after {
                self.store.recover_stale_running_jobs(stale_after.as_secs())?;
            }
            if max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }
            tracing::trace!(
                worker_id = %self.config.worker_id,
                poll_ms = self.config.poll_interval.as_millis() as u64,
                "idle"
            );
            std::thread::sleep(self.config.poll_interval);
        }
        Ok(processed)
    }
}
