#![forbid(unsafe_code)]

use super::*;
use jobq_core::EventLevel;
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, params};

const MAX_EVENT_MESSAGE_LEN: usize = 2_000;
const MAX_LIST_LIMIT: usize = 500;

fn normalize_event_message(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "-".to_string();
    }
    trimmed.chars().take(MAX_EVENT_MESSAGE_LEN).collect()
}

fn read_job_event_row(row: &rusqlite::Row<'_>) -> Result<JobEvent, rusqlite::Error> {
    let level: String = row.get(2)?;
    let level = level
        .parse::<EventLevel>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err)))?;
    let created_at_ms: i64 = row.get(4)?;
    let created_at = ms_to_dt(created_at_ms).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, Type::Integer, Box::new(err))
    })?;
    Ok(JobEvent {
        id: row.get(0)?,
        job_id: row.get(1)?,
        level,
        message: row.get(3)?,
        created_at,
    })
}

/// Appends one audit entry inside the caller's transaction. Events are never updated.
pub(super) fn insert_job_event_tx(
    tx: &Transaction<'_>,
    job_id: i64,
    level: EventLevel,
    message: &str,
    ts_ms: i64,
) -> Result<i64, StoreError> {
    let message = normalize_event_message(message);
    tx.execute(
        r#"
        INSERT INTO job_events(job_id, level, message, created_at_ms)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![job_id, level.as_str(), message, ts_ms],
    )?;
    Ok(tx.last_insert_rowid())
}

impl SqliteStore {
    /// Events of one job, oldest first by `(created_at, id)`.
    pub fn list_job_events(
        &self,
        request: ListJobEventsRequest,
    ) -> Result<Vec<JobEvent>, StoreError> {
        let limit = request.limit.clamp(1, MAX_LIST_LIMIT);

        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM jobs WHERE id=?1",
                params![request.job_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::UnknownJob {
                job_id: request.job_id,
            });
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, job_id, level, message, created_at_ms
            FROM job_events
            WHERE job_id=?1
            ORDER BY created_at_ms ASC, id ASC
            LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![request.job_id, limit as i64])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(read_job_event_row(row)?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_messages_are_replaced() {
        assert_eq!(normalize_event_message("   "), "-");
        assert_eq!(normalize_event_message(" claimed "), "claimed");
    }

    #[test]
    fn long_messages_are_truncated() {
        let long = "x".repeat(MAX_EVENT_MESSAGE_LEN + 10);
        assert_eq!(
            normalize_event_message(&long).chars().count(),
            MAX_EVENT_MESSAGE_LEN
        );
    }
}
