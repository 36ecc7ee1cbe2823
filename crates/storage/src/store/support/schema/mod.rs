#![forbid(unsafe_code)]

mod sql;

use super::super::StoreError;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;

pub(in crate::store) const SCHEMA_VERSION: i64 = 1;

const KNOWN_TABLES: [&str; 3] = ["meta", "jobs", "job_events"];

/// Refuses databases written by a newer schema or holding foreign tables, before any DDL runs.
pub(in crate::store) fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let mut rows = stmt.query([])?;
    let mut tables = BTreeSet::new();
    while let Some(row) = rows.next()? {
        tables.insert(row.get::<_, String>(0)?);
    }

    if tables.is_empty() {
        return Ok(());
    }
    if tables
        .iter()
        .any(|table| !KNOWN_TABLES.contains(&table.as_str()))
    {
        return Err(StoreError::InvalidInput(
            "RESET_REQUIRED: unsupported tables detected",
        ));
    }
    if !tables.contains("meta") {
        return Ok(());
    }

    let found: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let Some(found) = found else {
        return Ok(());
    };
    let found = found
        .trim()
        .parse::<i64>()
        .map_err(|_| StoreError::InvalidInput("meta.schema_version is not an integer"))?;
    if found > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(())
}

pub(in crate::store) fn migrate_sqlite_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(&sql::full_schema_sql())?;

    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}
