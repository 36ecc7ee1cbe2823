#![forbid(unsafe_code)]

use crate::handler::{JobFailure, JobHandler};
use crate::worker::JobContext;
use jobq_storage::JobSnapshot;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const CHILD_POLL: Duration = Duration::from_millis(100);
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);
const DEFAULT_CANCEL_CHECK: Duration = Duration::from_secs(1);
const MAX_SNIPPET_CHARS: usize = 400;

/// Runs one external program per job.
///
/// The payload JSON is fed on stdin (and its path exported as `JOBQ_PAYLOAD_PATH`), alongside
/// `JOBQ_JOB_ID`, `JOBQ_JOB_TYPE` and `JOBQ_ATTEMPT`. Exit 0 completes the job with the last
/// stdout line as message; anything else fails the attempt with the tail of stderr. The child is
/// killed when `timeout` elapses or the job stops being ours (canceled, recovered, or a heartbeat
/// lock conflict), which is checked every `cancel_check_interval`.
#[derive(Clone, Debug)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    heartbeat_interval: Duration,
    cancel_check_interval: Duration,
    timeout: Option<Duration>,
    scratch_dir: PathBuf,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            cancel_check_interval: DEFAULT_CANCEL_CHECK,
            timeout: None,
            scratch_dir: std::env::temp_dir().join(format!("jobq_{}", std::process::id())),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_cancel_check_interval(mut self, interval: Duration) -> Self {
        self.cancel_check_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn spawn(&self, job: &JobSnapshot, dir: &Path) -> Result<Child, JobFailure> {
        let io_failure = |what: &str, err: std::io::Error| {
            JobFailure::new(format!("{what}: {err}")).with_code("spawn_failed")
        };
        std::fs::create_dir_all(dir).map_err(|e| io_failure("create scratch dir failed", e))?;

        let payload_path = dir.join("payload.json");
        let payload = serde_json::to_vec(&job.payload)
            .map_err(|e| JobFailure::new(format!("encode payload failed: {e}")))?;
        std::fs::write(&payload_path, payload)
            .map_err(|e| io_failure("write payload failed", e))?;

        let stdin = File::open(&payload_path).map_err(|e| io_failure("open payload failed", e))?;
        let stdout =
            File::create(dir.join("stdout")).map_err(|e| io_failure("create stdout failed", e))?;
        let stderr =
            File::create(dir.join("stderr")).map_err(|e| io_failure("create stderr failed", e))?;

        Command::new(&self.program)
            .args(&self.args)
            .env("JOBQ_JOB_ID", job.id.to_string())
            .env("JOBQ_JOB_TYPE", &job.job_type)
            .env("JOBQ_ATTEMPT", job.attempts.to_string())
            .env("JOBQ_PAYLOAD_PATH", &payload_path)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| io_failure(&format!("failed to spawn {}", self.program), e))
    }

    fn supervise(
        &self,
        child: &mut Child,
        ctx: &mut JobContext<'_>,
    ) -> Result<ExitStatus, JobFailure> {
        let started = Instant::now();
        let mut last_beat = started;
        let mut last_check = started;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(err) => {
                    stop(child);
                    return Err(
                        JobFailure::new(format!("wait failed: {err}")).with_code("wait_failed")
                    );
                }
            }

            if let Some(limit) = self.timeout
                && started.elapsed() >= limit
            {
                stop(child);
                let message = format!("{} exceeded {limit:?}", self.program);
                return Err(JobFailure::new(message).with_code("timeout"));
            }

            if last_beat.elapsed() >= self.heartbeat_interval {
                last_beat = Instant::now();
                if let Err(err) = ctx.heartbeat(None, None, None) {
                    stop(child);
                    return Err(err.into());
                }
            }

            if last_check.elapsed() >= self.cancel_check_interval {
                last_check = Instant::now();
                match ctx.is_canceled() {
                    Ok(false) => {}
                    Ok(true) => {
                        stop(child);
                        return Err(JobFailure::new(format!(
                            "{} stopped: job canceled or lease lost",
                            self.program
                        ))
                        .with_code("canceled"));
                    }
                    Err(err) => {
                        stop(child);
                        return Err(err.into());
                    }
                }
            }
            sleep(CHILD_POLL);
        }
    }
}

fn stop(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn format_exit_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn tail_snippet(path: &Path, max_chars: usize) -> String {
    let text = std::fs::read_to_string(path).unwrap_or_default();
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}

fn last_line(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(MAX_SNIPPET_CHARS).collect())
}

impl JobHandler for CommandHandler {
    fn run(
        &mut self,
        job: &JobSnapshot,
        ctx: &mut JobContext<'_>,
    ) -> Result<Option<String>, JobFailure> {
        let dir = self
            .scratch_dir
            .join(format!("job_{}_{}", job.id, job.attempts));
        let outcome = self.spawn(job, &dir).and_then(|mut child| {
            tracing::info!(job_id = job.id, program = %self.program, "child started");
            let status = self.supervise(&mut child, ctx)?;
            if status.success() {
                Ok(last_line(&dir.join("stdout")))
            } else {
                let stderr = tail_snippet(&dir.join("stderr"), MAX_SNIPPET_CHARS);
                let exit = format_exit_status(&status);
                let message = if stderr.is_empty() {
                    exit
                } else {
                    format!("{exit}: {stderr}")
                };
                Err(JobFailure::new(message).with_code("exit_status"))
            }
        });
        let _ = std::fs::remove_dir_all(&dir);
        outcome
    }
}
