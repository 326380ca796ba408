use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::QueueStore;

/// Exclusive access to the acknowledged-offset record.
///
/// Held by the poller from reading the offset until the last `advance` of the
/// cycle, so two cycles can never compute the same offset concurrently.
pub struct OffsetLease {
    _guard: OwnedMutexGuard<()>,
    conn: Arc<Mutex<Connection>>,
}

impl QueueStore {
    pub async fn lock_offset(&self) -> OffsetLease {
        OffsetLease {
            _guard: Arc::clone(&self.offset_lock).lock_owned().await,
            conn: Arc::clone(&self.conn),
        }
    }

    /// Read the acknowledged offset without taking the lease or creating the row.
    /// For diagnostics only.
    pub async fn peek_acknowledged(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        let value: Option<Option<i64>> = conn
            .query_row(
                "SELECT last_update_id FROM poll_offset WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read poll offset")?;
        Ok(value.flatten())
    }
}

impl OffsetLease {
    /// Highest update_id fetched and queued so far, creating the row on first use.
    /// `None` means nothing has been acknowledged yet.
    pub async fn acknowledged(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO poll_offset (id, last_update_id, updated_at)
             VALUES (1, NULL, ?1)",
            rusqlite::params![Utc::now()],
        )
        .context("Failed to create poll offset record")?;

        let value: Option<i64> = conn
            .query_row(
                "SELECT last_update_id FROM poll_offset WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .context("Failed to read poll offset")?;
        Ok(value)
    }

    /// Move the acknowledged offset forward to `update_id`. Never moves it back.
    pub async fn advance(&self, update_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO poll_offset (id, last_update_id, updated_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                last_update_id = excluded.last_update_id,
                updated_at = excluded.updated_at
             WHERE poll_offset.last_update_id IS NULL
                OR poll_offset.last_update_id < excluded.last_update_id",
            rusqlite::params![update_id, Utc::now()],
        )
        .with_context(|| format!("Failed to acknowledge update {}", update_id))?;
        Ok(())
    }
}
