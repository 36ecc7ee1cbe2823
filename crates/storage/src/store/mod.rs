#![forbid(unsafe_code)]

mod aggregates;
mod error;
mod events;
mod jobs;
mod recovery;
mod support;
mod types;

pub use error::StoreError;
pub use types::*;

use jobq_core::BackoffPolicy;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use support::*;

const DB_FILE_NAME: &str = "jobq.db";
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    pub backoff: BackoffPolicy,
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Job queue backed by one SQLite file.
///
/// Every store owns its own connection. Several stores (threads or processes) may open the same
/// storage directory; they coordinate only through the database, never through shared memory.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
    config: StoreConfig,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_config(storage_dir, StoreConfig::default())
    }

    pub fn open_with_config(
        storage_dir: impl AsRef<Path>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILE_NAME);
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(config.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        preflight_gate(&conn)?;
        migrate_sqlite_schema(&conn)?;

        tracing::debug!(
            db_path = %db_path.display(),
            journal_mode = %journal_mode,
            schema_version = SCHEMA_VERSION,
            "job store opened"
        );

        Ok(Self {
            conn,
            storage_dir,
            config,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(DB_FILE_NAME)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Opens a write transaction up front (`BEGIN IMMEDIATE`), so a read-then-update inside it
    /// cannot interleave with another writer. Read the clock only after this returns, so
    /// stored times follow commit order even when the lock was contended.
    fn write_tx(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}
