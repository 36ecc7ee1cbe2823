#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE TABLE IF NOT EXISTS job_events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
          level TEXT NOT NULL CHECK(level IN ('debug','info','warning','error')),
          message TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );
"#;
