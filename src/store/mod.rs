pub mod offset;
pub mod queue;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

pub use queue::{FailureOutcome, QueueRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub abandoned: u64,
    pub acknowledged: Option<i64>,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let acknowledged = self
            .acknowledged
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".to_string());
        write!(
            f,
            "pending={} abandoned={} acknowledged={}",
            self.pending, self.abandoned, acknowledged
        )
    }
}

/// Durable update queue and acknowledged-offset record, backed by SQLite.
///
/// Every statement runs under the connection mutex, so each mutation is a
/// single atomic store operation. The offset record additionally has its own
/// lease (see [`offset::OffsetLease`]) covering the poller's read-fetch-advance cycle.
#[derive(Clone)]
pub struct QueueStore {
    conn: Arc<Mutex<Connection>>,
    offset_lock: Arc<Mutex<()>>,
}

impl QueueStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Self::run_migrations(&conn)?;

        info!("Queue store initialized at: {}", path.display());
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            offset_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Queue counters and the acknowledged offset, for heartbeat and status output.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.pending_count().await?,
            abandoned: self.abandoned_count().await?,
            acknowledged: self.peek_acknowledged().await?,
        })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS update_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                update_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                failure_count INTEGER NOT NULL DEFAULT 0,
                abandoned INTEGER NOT NULL DEFAULT 0,
                abandoned_at TEXT,
                failures TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_update_queue_pending
                ON update_queue(abandoned, update_id, id);

            -- Single row: the highest update_id fetched and queued
            CREATE TABLE IF NOT EXISTS poll_offset (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_update_id INTEGER,
                updated_at TEXT
            );
            ",
        )
        .context("Failed to run queue migrations")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::tests::text_message;

    #[tokio::test]
    async fn test_reopen_keeps_queue_and_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        {
            let store = QueueStore::open(&path).unwrap();
            store.enqueue(&text_message(20, "a")).await.unwrap();
            store.enqueue(&text_message(21, "b")).await.unwrap();
            let lease = store.lock_offset().await;
            lease.advance(21).await.unwrap();
        }

        let store = QueueStore::open(&path).unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 2);
        assert_eq!(store.peek_acknowledged().await.unwrap(), Some(21));

        let next = store.next_pending().await.unwrap().unwrap();
        assert_eq!(next.update.update_id, 20);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = QueueStore::open_in_memory().unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.to_string(), "pending=0 abandoned=0 acknowledged=none");

        let id = store.enqueue(&text_message(1, "a")).await.unwrap();
        store.enqueue(&text_message(2, "b")).await.unwrap();
        store.record_failure(id, "bad", 1).await.unwrap();
        store.lock_offset().await.advance(2).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 1,
                abandoned: 1,
                acknowledged: Some(2)
            }
        );
        assert_eq!(stats.to_string(), "pending=1 abandoned=1 acknowledged=2");
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = QueueStore::open_in_memory().unwrap();
        let conn = store.connection();
        let conn = conn.lock().await;
        QueueStore::run_migrations(&conn).unwrap();
    }
}
