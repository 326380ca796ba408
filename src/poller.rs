use std::sync::Arc;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PollerConfig;
use crate::source::{FetchError, UpdateSource};
use crate::store::QueueStore;
use crate::update::Fetched;

/// Result of one `fetch_and_enqueue` cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The fetch succeeded; `queued` records were created and the offset
    /// record now holds `acknowledged`. Skipped and malformed elements are
    /// acknowledged without a record.
    Batch {
        offset: i64,
        queued: usize,
        skipped: usize,
        malformed: usize,
        acknowledged: Option<i64>,
    },
    /// The fetch failed; nothing was queued and the offset was left alone.
    FetchFailed { offset: i64 },
    /// Shutdown was requested while the fetch was in flight.
    Interrupted,
}

/// Long-polls the update source and persists what it returns.
pub struct Poller {
    source: Arc<dyn UpdateSource>,
    store: QueueStore,
    config: PollerConfig,
    shutdown: CancellationToken,
}

impl Poller {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        store: QueueStore,
        config: PollerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            store,
            config,
            shutdown,
        }
    }

    /// Fetch the next batch and queue it.
    ///
    /// Records are persisted in ascending update_id order before the offset
    /// is advanced past them. `Err` means the store failed; whatever was
    /// queued before the failure stays queued and may be queued again next
    /// cycle.
    pub async fn fetch_and_enqueue(&self) -> Result<PollOutcome> {
        let lease = self.store.lock_offset().await;
        let acknowledged = lease.acknowledged().await?;
        let offset = match acknowledged {
            Some(last) => last + 1,
            None => self.source.initial_offset(),
        };

        let fetched = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(PollOutcome::Interrupted),
            result = self.source.fetch(offset, self.config.fetch_limit, self.config.fetch_timeout) => result,
        };

        let updates = match fetched {
            Ok(updates) => updates,
            Err(e) => {
                match &e {
                    FetchError::Transport(_) => warn!("Fetch at offset {} failed: {}", offset, e),
                    FetchError::Api { .. } | FetchError::Malformed(_) => {
                        error!("Fetch at offset {} rejected: {}", offset, e)
                    }
                }
                return Ok(PollOutcome::FetchFailed { offset });
            }
        };

        let mut queued = 0;
        let mut skipped = 0;
        let mut malformed = 0;
        let mut highest: Option<i64> = None;

        for item in &updates {
            let update_id = item.update_id();
            if acknowledged.is_some_and(|last| update_id <= last) {
                debug!("Ignoring already acknowledged update {}", update_id);
                continue;
            }

            match item {
                Fetched::Supported(update) => {
                    if let Err(e) = self.store.enqueue(update).await {
                        // Keep the progress made so far before giving up on the batch
                        if let Some(last) = highest {
                            lease.advance(last).await?;
                        }
                        return Err(e);
                    }
                    debug!("Queued update {} ({})", update_id, update.kind);
                    queued += 1;
                }
                Fetched::Unsupported { reason, .. } => {
                    warn!("Skipping update {}: {}", update_id, reason);
                    skipped += 1;
                }
                Fetched::Malformed { reason, .. } => {
                    error!("Dropping malformed update {}: {}", update_id, reason);
                    malformed += 1;
                }
            }
            highest = Some(update_id);
        }

        if let Some(last) = highest {
            lease.advance(last).await?;
        }

        Ok(PollOutcome::Batch {
            offset,
            queued,
            skipped,
            malformed,
            acknowledged: highest.or(acknowledged),
        })
    }

    /// Poll until the shutdown token is cancelled.
    pub async fn run(self) {
        info!(
            "Poller started (limit {}, wait {:?}, min interval {:?})",
            self.config.fetch_limit, self.config.fetch_timeout, self.config.min_interval
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let started = Instant::now();
            let delay = match self.fetch_and_enqueue().await {
                Ok(PollOutcome::Interrupted) => break,
                Ok(PollOutcome::Batch {
                    offset,
                    queued,
                    skipped,
                    malformed,
                    acknowledged,
                }) => {
                    if queued + skipped + malformed > 0 {
                        info!(
                            "Queued {} update(s), skipped {}, dropped {} malformed (offset {}, acknowledged {:?})",
                            queued, skipped, malformed, offset, acknowledged
                        );
                    }
                    self.config.min_interval.saturating_sub(started.elapsed())
                }
                Ok(PollOutcome::FetchFailed { .. }) => {
                    self.config.min_interval.saturating_sub(started.elapsed())
                }
                Err(e) => {
                    warn!(
                        "Poll cycle failed, retrying in {:?}: {:#}",
                        self.config.error_backoff, e
                    );
                    self.config.error_backoff
                }
            };

            if !delay.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!("Poller stopped");
    }
}
