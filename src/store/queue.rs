use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};

use super::QueueStore;
use crate::update::{Update, UpdateKind};

/// A queued update plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    /// Store-assigned id, independent of `update.update_id`
    pub id: i64,
    pub update: Update,
    pub enqueued_at: DateTime<Utc>,
    pub failure_count: u32,
    pub abandoned: bool,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub failures: Vec<FailureNote>,
}

impl QueueRecord {
    pub fn last_failure(&self) -> Option<&FailureNote> {
        self.failures.last()
    }
}

/// One recorded dispatch failure (diagnostic only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNote {
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// What a recorded failure did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still pending; will be selected again.
    Retrying { failure_count: u32 },
    /// Retry budget exhausted; never selected again.
    Abandoned { failure_count: u32 },
}

const RECORD_COLUMNS: &str =
    "id, update_id, payload, enqueued_at, failure_count, abandoned, abandoned_at, failures";

impl QueueStore {
    /// Persist a newly fetched update as a pending record. Returns the record id.
    pub async fn enqueue(&self, update: &Update) -> Result<i64> {
        let payload =
            serde_json::to_string(&update.kind).context("Failed to serialize update payload")?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO update_queue (update_id, kind, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![update.update_id, update.kind.name(), payload, Utc::now()],
        )
        .with_context(|| format!("Failed to enqueue update {}", update.update_id))?;

        Ok(conn.last_insert_rowid())
    }

    /// The pending record with the smallest update_id (ties broken by record id).
    pub async fn next_pending(&self) -> Result<Option<QueueRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM update_queue
             WHERE abandoned = 0
             ORDER BY update_id ASC, id ASC
             LIMIT 1",
            RECORD_COLUMNS
        );
        conn.query_row(&sql, [], parse_record_row)
            .optional()
            .context("Failed to select next pending update")
    }

    #[cfg(test)]
    pub(crate) async fn get(&self, id: i64) -> Result<Option<QueueRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM update_queue WHERE id = ?1", RECORD_COLUMNS);
        conn.query_row(&sql, rusqlite::params![id], parse_record_row)
            .optional()
            .with_context(|| format!("Failed to load queue record {}", id))
    }

    /// Remove a record after successful dispatch.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute("DELETE FROM update_queue WHERE id = ?1", rusqlite::params![id])
            .with_context(|| format!("Failed to delete queue record {}", id))?;
        Ok(rows > 0)
    }

    /// Count a dispatch failure against a pending record.
    ///
    /// Increments the counter, appends a timestamped note and abandons the
    /// record once the counter reaches `retry_budget`, all in one statement.
    pub async fn record_failure(
        &self,
        id: i64,
        reason: &str,
        retry_budget: u32,
    ) -> Result<FailureOutcome> {
        let now = Utc::now();
        let note = serde_json::to_string(&FailureNote {
            at: now,
            reason: reason.to_string(),
        })?;

        let conn = self.conn.lock().await;
        let updated: Option<(u32, bool)> = conn
            .query_row(
                "UPDATE update_queue SET
                    failure_count = failure_count + 1,
                    failures = json_insert(failures, '$[#]', json(?2)),
                    abandoned = (failure_count + 1 >= ?3),
                    abandoned_at = CASE WHEN failure_count + 1 >= ?3 THEN ?4 ELSE NULL END
                 WHERE id = ?1 AND abandoned = 0
                 RETURNING failure_count, abandoned",
                rusqlite::params![id, note, retry_budget, now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("Failed to record failure for queue record {}", id))?;

        match updated {
            Some((failure_count, true)) => Ok(FailureOutcome::Abandoned { failure_count }),
            Some((failure_count, false)) => Ok(FailureOutcome::Retrying { failure_count }),
            None => anyhow::bail!("Queue record {} is missing or already abandoned", id),
        }
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.count_where("abandoned = 0").await
    }

    pub async fn abandoned_count(&self) -> Result<u64> {
        self.count_where("abandoned = 1").await
    }

    async fn count_where(&self, where_clause: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT count(*) FROM update_queue WHERE {}", where_clause);
        let count: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .context("Failed to count queue records")?;
        Ok(count as u64)
    }

    /// Most recently abandoned records first.
    pub async fn list_abandoned(&self, limit: usize) -> Result<Vec<QueueRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM update_queue
             WHERE abandoned = 1
             ORDER BY abandoned_at DESC, id DESC
             LIMIT ?1",
            RECORD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params![limit as i64], parse_record_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list abandoned records")?;
        Ok(records)
    }

    /// Delete abandoned records abandoned before `cutoff`. Pending records are never touched.
    pub async fn purge_abandoned(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM update_queue WHERE abandoned = 1 AND abandoned_at < ?1",
                rusqlite::params![cutoff],
            )
            .context("Failed to purge abandoned records")?;
        Ok(rows)
    }
}

fn json_column_error(column: usize, e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_record_row(row: &rusqlite::Row) -> rusqlite::Result<QueueRecord> {
    let payload: String = row.get(2)?;
    let kind: UpdateKind = serde_json::from_str(&payload).map_err(|e| json_column_error(2, e))?;
    let failures_json: String = row.get(7)?;
    let failures: Vec<FailureNote> =
        serde_json::from_str(&failures_json).map_err(|e| json_column_error(7, e))?;

    Ok(QueueRecord {
        id: row.get(0)?,
        update: Update {
            update_id: row.get(1)?,
            kind,
        },
        enqueued_at: row.get(3)?,
        failure_count: row.get(4)?,
        abandoned: row.get(5)?,
        abandoned_at: row.get(6)?,
        failures,
    })
}
