#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS jobs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          job_type TEXT NOT NULL CHECK(length(job_type) > 0),
          project_id INTEGER,
          payload_json TEXT NOT NULL DEFAULT '{}',
          status TEXT NOT NULL CHECK(status IN ('queued','running','retry_waiting','completed','failed','canceled')),
          priority INTEGER NOT NULL DEFAULT 100,
          attempts INTEGER NOT NULL DEFAULT 0 CHECK(attempts >= 0),
          max_attempts INTEGER NOT NULL DEFAULT 3 CHECK(max_attempts >= 1),
          next_run_at_ms INTEGER NOT NULL,
          locked_by TEXT,
          locked_at_ms INTEGER,
          heartbeat_at_ms INTEGER,
          progress_done INTEGER NOT NULL DEFAULT 0,
          progress_total INTEGER NOT NULL DEFAULT 0,
          error_code TEXT,
          error_message TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          CHECK((locked_by IS NULL) = (status <> 'running'))
        );
"#;
