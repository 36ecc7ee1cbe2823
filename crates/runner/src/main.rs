#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use jobq_core::{BackoffPolicy, JobStatus};
use jobq_runner::defaults::{
    DEFAULT_POLL_MS, DEFAULT_STALE_AFTER_S, default_storage_dir, default_worker_id,
};
use jobq_runner::{CommandHandler, DryRunHandler, JobHandler, Worker, WorkerConfig};
use jobq_storage::{
    CancelRequest, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, EnqueueRequest, ListJobEventsRequest,
    ListJobsRequest, PurgeJobsRequest, SqliteStore, StoreConfig,
};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_PURGE_AGE_S: u64 = 7 * 24 * 3600;

/// Durable, lease-based job queue on a shared SQLite file.
#[derive(Debug, Parser)]
#[command(name = "jobq", version)]
struct Cli {
    /// Queue directory (defaults to `.jobq` at the git root, or in the current directory).
    #[arg(long, global = true, env = "JOBQ_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,
    #[arg(long, global = true, env = "JOBQ_BASE_BACKOFF_S", default_value_t = 5)]
    base_backoff_s: u64,
    #[arg(long, global = true, env = "JOBQ_MAX_BACKOFF_S", default_value_t = 300)]
    max_backoff_s: u64,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Add a job to the queue.
    Enqueue {
        #[arg(long = "type")]
        job_type: String,
        /// JSON object handed to the worker.
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        project_id: Option<i64>,
        /// Lower runs first.
        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: i64,
        #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,
        /// Do not run before this many seconds from now.
        #[arg(long)]
        delay_s: Option<u64>,
    },
    /// Newest jobs first.
    List {
        #[arg(long = "status")]
        statuses: Vec<JobStatus>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    Show {
        job_id: i64,
    },
    /// Audit trail of one job, oldest first.
    Events {
        job_id: i64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    Counts,
    Cancel {
        job_id: i64,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Break the locks of running jobs that stopped heartbeating.
    Sweep {
        #[arg(long, default_value_t = DEFAULT_STALE_AFTER_S)]
        stale_after_s: u64,
    },
    /// Delete old terminal jobs and their events.
    Purge {
        #[arg(long = "status", required = true)]
        statuses: Vec<JobStatus>,
        #[arg(long, default_value_t = DEFAULT_PURGE_AGE_S)]
        older_than_s: u64,
    },
    /// Claim and process jobs.
    Work(WorkArgs),
}

#[derive(Debug, Args)]
struct WorkArgs {
    #[arg(long, env = "JOBQ_WORKER_ID")]
    worker_id: Option<String>,
    #[arg(long, env = "JOBQ_POLL_MS", default_value_t = DEFAULT_POLL_MS)]
    poll_ms: u64,
    /// Only claim these job types (repeatable).
    #[arg(long = "type")]
    job_types: Vec<String>,
    /// Process at most one job, then exit.
    #[arg(long)]
    once: bool,
    /// Claim and complete immediately without running anything.
    #[arg(long)]
    dry_run: bool,
    /// Also recover stale running jobs while idle.
    #[arg(long)]
    stale_after_s: Option<u64>,
    #[arg(long, default_value_t = 15)]
    heartbeat_s: u64,
    /// Kill the command after this many seconds.
    #[arg(long)]
    timeout_s: Option<u64>,
    /// Program (and arguments) run for every job, after `--`.
    #[arg(last = true)]
    command: Vec<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_store(cli: &Cli) -> Result<SqliteStore> {
    let backoff = BackoffPolicy::new(cli.base_backoff_s, cli.max_backoff_s)
        .context("invalid backoff settings")?;
    let config = StoreConfig {
        backoff,
        ..StoreConfig::default()
    };
    let storage_dir = cli.storage_dir.clone().unwrap_or_else(default_storage_dir);
    SqliteStore::open_with_config(&storage_dir, config)
        .with_context(|| format!("open job store at {}", storage_dir.display()))
}

fn run_worker<H: JobHandler>(
    store: SqliteStore,
    config: WorkerConfig,
    handler: H,
    once: bool,
) -> Result<()> {
    tracing::info!(
        worker_id = %config.worker_id,
        job_types = ?config.allowed_job_types,
        poll_ms = config.poll_interval.as_millis() as u64,
        "worker started"
    );
    let mut worker = Worker::new(store, config, handler);
    if once {
        let processed = worker.run_once()?;
        tracing::info!(processed, "worker finished");
    } else {
        worker.run_loop(None)?;
    }
    Ok(())
}

fn work(store: SqliteStore, args: WorkArgs) -> Result<()> {
    let config = WorkerConfig {
        worker_id: args.worker_id.unwrap_or_else(default_worker_id),
        allowed_job_types: args.job_types,
        poll_interval: Duration::from_millis(args.poll_ms.max(1)),
        stale_after: args.stale_after_s.map(Duration::from_secs),
    };

    if args.dry_run {
        return run_worker(store, config, DryRunHandler, args.once);
    }
    let Some((program, rest)) = args.command.split_first() else {
        bail!("work needs --dry-run or a command after `--`");
    };
    let handler = CommandHandler::new(program.clone(), rest.to_vec())
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_s.max(1)))
        .with_timeout(args.timeout_s.map(Duration::from_secs));
    run_worker(store, config, handler, args.once)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let mut store = open_store(&cli)?;

    match cli.command {
        Cmd::Enqueue {
            job_type,
            payload,
            project_id,
            priority,
            max_attempts,
            delay_s,
        } => {
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw).context("--payload must be valid JSON")?,
                None => json!({}),
            };
            let run_at = match delay_s {
                Some(secs) => {
                    let delay = i64::try_from(secs)
                        .ok()
                        .and_then(chrono::Duration::try_seconds)
                        .context("--delay-s is out of range")?;
                    Some(
                        Utc::now()
                            .checked_add_signed(delay)
                            .context("--delay-s is out of range")?,
                    )
                }
                None => None,
            };
            let job = store.enqueue(EnqueueRequest {
                project_id,
                priority,
                max_attempts,
                run_at,
                ..EnqueueRequest::new(job_type, payload)
            })?;
            print_json(&job)
        }
        Cmd::List { statuses, limit } => {
            let jobs = store.list_jobs(ListJobsRequest {
                statuses: (!statuses.is_empty()).then_some(statuses),
                limit,
            })?;
            print_json(&jobs)
        }
        Cmd::Show { job_id } => match store.get_job(job_id)? {
            Some(job) => print_json(&job),
            None => bail!("unknown job {job_id}"),
        },
        Cmd::Events { job_id, limit } => {
            let events = store.list_job_events(ListJobEventsRequest { job_id, limit })?;
            print_json(&events)
        }
        Cmd::Counts => {
            let counts = store.counts()?;
            print_json(&json!({
                "counts": counts,
                "total": counts.total(),
                "active": counts.active(),
            }))
        }
        Cmd::Cancel { job_id, reason } => {
            let job = store.cancel(CancelRequest { job_id, reason })?;
            print_json(&job)
        }
        Cmd::Sweep { stale_after_s } => {
            let recovered = store.recover_stale_running_jobs(stale_after_s)?;
            print_json(&json!({ "recovered": recovered }))
        }
        Cmd::Purge {
            statuses,
            older_than_s,
        } => {
            let purged = store.purge_jobs(PurgeJobsRequest {
                statuses,
                older_than_seconds: older_than_s,
            })?;
            print_json(&json!({ "purged": purged }))
        }
        Cmd::Work(args) => work(store, args),
    }
}
