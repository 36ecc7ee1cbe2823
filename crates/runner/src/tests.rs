#![forbid(unsafe_code)]

use super::*;
use jobq_core::{EventLevel, JobStatus};
use jobq_storage::{
    CancelRequest, ClaimNextRequest, EnqueueRequest, JobSnapshot, ListJobEventsRequest,
    SqliteStore,
};
use serde_json::json;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

type Outcome = Result<Option<String>, JobFailure>;

/// Replays canned outcomes and remembers which jobs it saw.
#[derive(Default)]
struct ScriptedHandler {
    script: VecDeque<Outcome>,
    seen: Vec<i64>,
}

impl ScriptedHandler {
    fn new(script: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            script: script.into_iter().collect(),
            seen: Vec::new(),
        }
    }
}

impl JobHandler for ScriptedHandler {
    fn run(&mut self, job: &JobSnapshot, _ctx: &mut JobContext<'_>) -> Outcome {
        self.seen.push(job.id);
        self.script.pop_front().unwrap_or(Ok(None))
    }
}

/// Cancels its own job through a second connection, the way an operator would.
struct OperatorCancels {
    operator: SqliteStore,
    heartbeat_after_cancel: bool,
}

impl JobHandler for OperatorCancels {
    fn run(&mut self, job: &JobSnapshot, ctx: &mut JobContext<'_>) -> Outcome {
        assert!(!ctx.is_canceled()?);
        self.operator.cancel(CancelRequest {
            job_id: job.id,
            reason: Some("no longer needed".to_string()),
        })?;
        if self.heartbeat_after_cancel {
            let err = ctx
                .heartbeat(Some(1), None, None)
                .expect_err("lease is gone");
            assert!(err.is_lock_conflict());
            assert!(ctx.is_canceled()?);
        }
        Ok(Some("finished anyway".to_string()))
    }
}

struct ReportsProgress;

impl JobHandler for ReportsProgress {
    fn run(&mut self, _job: &JobSnapshot, ctx: &mut JobContext<'_>) -> Outcome {
        for done in 1..=3u64 {
            ctx.heartbeat(Some(done), Some(3), Some(format!("step {done}/3").as_str()))?;
        }
        Ok(None)
    }
}

fn open(dir: &Path) -> SqliteStore {
    SqliteStore::open(dir).expect("open store")
}

fn enqueue(store: &mut SqliteStore, job_type: &str, max_attempts: u32) -> JobSnapshot {
    store
        .enqueue(EnqueueRequest {
            max_attempts,
            ..EnqueueRequest::new(job_type, json!({}))
        })
        .expect("enqueue")
}

fn config(worker_id: &str) -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(1),
        ..WorkerConfig::new(worker_id)
    }
}

fn job(store: &SqliteStore, job_id: i64) -> JobSnapshot {
    store.get_job(job_id).expect("get").expect("job exists")
}

#[test]
fn run_once_reports_an_empty_queue() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut worker = Worker::new(open(dir.path()), config("w1"), DryRunHandler);
    assert!(!worker.run_once().expect("run_once"));
}

#[test]
fn dry_run_completes_everything() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let first = enqueue(&mut store, "export", 3);
    enqueue(&mut store, "index", 3);

    let mut worker = Worker::new(open(dir.path()), config("w1"), DryRunHandler);
    let processed = worker.run_loop(Some(3)).expect("run_loop");
    assert_eq!(processed, 2);

    let counts = store.counts().expect("counts");
    assert_eq!(counts.get(JobStatus::Completed), 2);
    let trail = store
        .list_job_events(ListJobEventsRequest {
            job_id: first.id,
            limit: 10,
        })
        .expect("events");
    assert_eq!(
        trail.last().map(|e| e.message.as_str()),
        Some("completed: dry-run")
    );
}

#[test]
fn handler_failure_schedules_a_retry() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let queued = enqueue(&mut store, "export", 3);

    let handler = ScriptedHandler::new([Err(JobFailure::new("disk full").with_code("io"))]);
    let mut worker = Worker::new(open(dir.path()), config("w1"), handler);
    assert!(worker.run_once().expect("run_once"));
    assert_eq!(worker.handler().seen, vec![queued.id]);

    let failed = job(&store, queued.id);
    assert_eq!(failed.status, JobStatus::RetryWaiting);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.error_code.as_deref(), Some("io"));
    assert_eq!(failed.error_message.as_deref(), Some("disk full"));

    // Backoff keeps the job out of reach for now.
    assert!(!worker.run_once().expect("run_once"));
}

#[test]
fn handler_failure_on_last_attempt_is_terminal() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let queued = enqueue(&mut store, "export", 1);

    let handler = ScriptedHandler::new([Err(JobFailure::new("bad input"))]);
    let mut worker = Worker::new(open(dir.path()), config("w1"), handler);
    assert!(worker.run_once().expect("run_once"));

    let failed = job(&store, queued.id);
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some("runtime_error"));
}

#[test]
fn cancel_during_run_wins_over_completion() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let queued = enqueue(&mut store, "export", 3);

    let handler = OperatorCancels {
        operator: open(dir.path()),
        heartbeat_after_cancel: false,
    };
    let mut worker = Worker::new(open(dir.path()), config("w1"), handler);
    assert!(worker.run_once().expect("lock conflict is swallowed"));

    let canceled = job(&store, queued.id);
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert_eq!(canceled.error_message.as_deref(), Some("no longer needed"));
    let trail = store
        .list_job_events(ListJobEventsRequest {
            job_id: queued.id,
            limit: 10,
        })
        .expect("events");
    assert!(trail.iter().all(|e| !e.message.starts_with("completed")));
}

#[test]
fn lost_lease_drops_the_outcome() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let queued = enqueue(&mut store, "export", 3);

    let handler = OperatorCancels {
        operator: open(dir.path()),
        heartbeat_after_cancel: true,
    };
    let mut worker = Worker::new(open(dir.path()), config("w1"), handler);
    assert!(worker.run_once().expect("run_once"));
    assert_eq!(job(&store, queued.id).status, JobStatus::Canceled);
}

#[test]
fn heartbeats_record_progress() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let queued = enqueue(&mut store, "export", 3);

    let mut worker = Worker::new(open(dir.path()), config("w1"), ReportsProgress);
    assert!(worker.run_once().expect("run_once"));

    let done = job(&store, queued.id);
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress_done, 3);
    assert_eq!(done.progress_total, 3);

    let trail = store
        .list_job_events(ListJobEventsRequest {
            job_id: queued.id,
            limit: 20,
        })
        .expect("events");
    let debug: Vec<&str> = trail
        .iter()
        .filter(|e| e.level == EventLevel::Debug)
        .map(|e| e.message.as_str())
        .collect();
    assert_eq!(debug, vec!["step 1/3", "step 2/3", "step 3/3"]);
}

#[test]
fn type_filter_limits_what_a_worker_claims() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let export = enqueue(&mut store, "export", 3);
    let index = enqueue(&mut store, "index", 3);

    let cfg = WorkerConfig {
        allowed_job_types: vec!["index".to_string()],
        ..config("w1")
    };
    let mut worker = Worker::new(open(dir.path()), cfg, ScriptedHandler::default());
    assert_eq!(worker.run_loop(Some(2)).expect("run_loop"), 1);
    assert_eq!(worker.handler().seen, vec![index.id]);
    assert_eq!(job(&store, export.id).status, JobStatus::Queued);
}

#[test]
fn idle_polls_sweep_stale_jobs() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let queued = enqueue(&mut store, "export", 3);
    store
        .claim_next(ClaimNextRequest {
            worker_id: "crashed".to_string(),
            allowed_job_types: None,
        })
        .expect("claim")
        .expect("claimable");
    std::thread::sleep(Duration::from_millis(20));

    let cfg = WorkerConfig {
        allowed_job_types: vec!["nothing-to-do".to_string()],
        stale_after: Some(Duration::ZERO),
        ..config("w2")
    };
    let mut worker = Worker::new(open(dir.path()), cfg, ScriptedHandler::default());
    assert_eq!(worker.run_loop(Some(1)).expect("run_loop"), 0);

    let recovered = job(&store, queued.id);
    assert_eq!(recovered.status, JobStatus::RetryWaiting);
    assert!(recovered.locked_by.is_none());
    assert_eq!(recovered.error_code.as_deref(), Some("stale_recovered"));
}

#[test]
fn store_errors_convert_into_failures() {
    let failure = JobFailure::from(jobq_storage::StoreError::UnknownJob { job_id: 9 });
    assert_eq!(failure.code.as_deref(), Some("store_error"));
    assert!(failure.message.contains("job_id=9"));
}

#[cfg(unix)]
fn shell(script: &str) -> CommandHandler {
    CommandHandler::new("sh", vec!["-c".to_string(), script.to_string()])
        .with_heartbeat_interval(Duration::from_millis(50))
}

#[cfg(unix)]
#[test]
fn command_sees_payload_and_completes_with_last_line() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let queued = store
        .enqueue(EnqueueRequest::new("export", json!({ "file": "a.csv" })))
        .expect("enqueue");

    let handler = shell(r#"cat; echo; echo "job $JOBQ_JOB_ID attempt $JOBQ_ATTEMPT""#);
    let mut worker = Worker::new(open(dir.path()), config("w1"), handler);
    assert!(worker.run_once().expect("run_once"));

    let done = job(&store, queued.id);
    assert_eq!(done.status, JobStatus::Completed);
    let trail = store
        .list_job_events(ListJobEventsRequest {
            job_id: queued.id,
            limit: 10,
        })
        .expect("events");
    let expected = format!("completed: job {} attempt 1", queued.id);
    assert_eq!(trail.last().map(|e| e.message.clone()), Some(expected));
}

#[cfg(unix)]
#[test]
fn command_exit_code_fails_the_attempt() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let queued = enqueue(&mut store, "export", 3);

    let mut worker = Worker::new(
        open(dir.path()),
        config("w1"),
        shell("echo 'no such file' >&2; exit 3"),
    );
    assert!(worker.run_once().expect("run_once"));

    let failed = job(&store, queued.id);
    assert_eq!(failed.status, JobStatus::RetryWaiting);
    assert_eq!(failed.error_code.as_deref(), Some("exit_status"));
    assert_eq!(
        failed.error_message.as_deref(),
        Some("exit code 3: no such file")
    );
}

#[cfg(unix)]
#[test]
fn command_timeout_kills_the_child() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let queued = enqueue(&mut store, "export", 3);

    let handler = shell("sleep 5").with_timeout(Some(Duration::from_millis(200)));
    let mut worker = Worker::new(open(dir.path()), config("w1"), handler);
    assert!(worker.run_once().expect("run_once"));

    let failed = job(&store, queued.id);
    assert_eq!(failed.status, JobStatus::RetryWaiting);
    assert_eq!(failed.error_code.as_deref(), Some("timeout"));
}

#[cfg(unix)]
#[test]
fn command_is_killed_soon_after_an_operator_cancel() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = open(dir.path());
    let queued = enqueue(&mut store, "export", 3);

    let mut operator = open(dir.path());
    let job_id = queued.id;
    let canceler = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        operator.cancel(CancelRequest {
            job_id,
            reason: Some("no longer needed".to_string()),
        })
    });

    // Heartbeats are far apart, so only the cancel check can stop the child.
    let handler = shell("sleep 5")
        .with_heartbeat_interval(Duration::from_secs(60))
        .with_cancel_check_interval(Duration::from_millis(50));
    let mut worker = Worker::new(open(dir.path()), config("w1"), handler);
    let started = std::time::Instant::now();
    assert!(worker.run_once().expect("run_once"));
    assert!(started.elapsed() < Duration::from_secs(3));
    canceler.join().expect("cancel thread").expect("cancel");

    let canceled = job(&store, queued.id);
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert_eq!(canceled.error_message.as_deref(), Some("no longer needed"));
    let trail = store
        .list_job_events(ListJobEventsRequest {
            job_id: queued.id,
            limit: 10,
        })
        .expect("events");
    assert_eq!(trail.last().map(|e| e.level), Some(EventLevel::Warning));
    assert!(trail.iter().all(|e| !e.message.starts_with("retry scheduled")));
}
