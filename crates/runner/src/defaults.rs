#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_STORE_DIRNAME: &str = ".jobq";
pub const DEFAULT_POLL_MS: u64 = 1_500;
pub const DEFAULT_STALE_AFTER_S: u64 = 90;

pub fn default_poll_interval() -> Duration {
    Duration::from_millis(DEFAULT_POLL_MS)
}

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".git").exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Store directory for a process started in `start`: the repo root's `.jobq` when inside a
/// git checkout, `start/.jobq` otherwise. Workers launched from a subdirectory still share
/// the same queue.
pub fn default_storage_dir_from_start(start: &Path) -> PathBuf {
    find_repo_root(start)
        .unwrap_or_else(|| start.to_path_buf())
        .join(DEFAULT_STORE_DIRNAME)
}

pub fn default_storage_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    default_storage_dir_from_start(&cwd)
}

fn sanitize_host(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('-');
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// `<host>-<pid>`, where host comes from `$HOSTNAME` and falls back to `worker`.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .and_then(|raw| sanitize_host(&raw))
        .unwrap_or_else(|| "worker".to_string());
    format!("{host}-{}", std::process::id())
}
