use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::dispatch::Dispatcher;
use crate::store::{FailureOutcome, QueueStore};

/// Result of one `process_next` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing pending.
    Idle,
    Delivered {
        record_id: i64,
        update_id: i64,
    },
    Retrying {
        record_id: i64,
        update_id: i64,
        failure_count: u32,
    },
    Abandoned {
        record_id: i64,
        update_id: i64,
        failure_count: u32,
    },
}

impl ProcessOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ProcessOutcome::Retrying { .. } | ProcessOutcome::Abandoned { .. }
        )
    }
}

impl std::fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessOutcome::Idle => write!(f, "idle"),
            ProcessOutcome::Delivered {
                record_id,
                update_id,
            } => write!(f, "delivered update {} (record {})", update_id, record_id),
            ProcessOutcome::Retrying {
                record_id,
                update_id,
                failure_count,
            } => write!(
                f,
                "update {} (record {}) failed {} time(s), retrying",
                update_id, record_id, failure_count
            ),
            ProcessOutcome::Abandoned {
                record_id,
                update_id,
                failure_count,
            } => write!(
                f,
                "update {} (record {}) abandoned after {} failure(s)",
                update_id, record_id, failure_count
            ),
        }
    }
}

/// Drains the queue in update_id order, one record per cycle.
pub struct Processor {
    store: QueueStore,
    dispatcher: Arc<dyn Dispatcher>,
    config: ProcessorConfig,
    shutdown: CancellationToken,
}

impl Processor {
    pub fn new(
        store: QueueStore,
        dispatcher: Arc<dyn Dispatcher>,
        config: ProcessorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            shutdown,
        }
    }

    /// Dispatch the oldest pending record.
    ///
    /// Success deletes the record. Failure (an error or a panic in the
    /// dispatcher) is counted against it and abandons it once the retry
    /// budget is used up. `Err` is reserved for store failures.
    pub async fn process_next(&self) -> Result<ProcessOutcome> {
        let Some(record) = self.store.next_pending().await? else {
            return Ok(ProcessOutcome::Idle);
        };
        let record_id = record.id;
        let update_id = record.update.update_id;

        let result = AssertUnwindSafe(self.dispatcher.dispatch(&record.update))
            .catch_unwind()
            .await;

        let reason = match result {
            Ok(Ok(())) => {
                if !self.store.delete(record_id).await? {
                    warn!("Queue record {} vanished before it could be deleted", record_id);
                }
                debug!(
                    "Delivered update {} ({}), record {}",
                    update_id, record.update.kind, record_id
                );
                return Ok(ProcessOutcome::Delivered {
                    record_id,
                    update_id,
                });
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(panic.as_ref()),
        };

        let outcome = self
            .store
            .record_failure(record_id, &reason, self.config.retry_budget)
            .await?;

        match outcome {
            FailureOutcome::Retrying { failure_count } => {
                warn!(
                    "Dispatch of update {} failed (attempt {}/{}), will retry: {}",
                    update_id, failure_count, self.config.retry_budget, reason
                );
                Ok(ProcessOutcome::Retrying {
                    record_id,
                    update_id,
                    failure_count,
                })
            }
            FailureOutcome::Abandoned { failure_count } => {
                error!(
                    "Abandoning update {} ({}, record {}) after {} failed attempts: {}",
                    update_id, record.update.kind, record_id, failure_count, reason
                );
                Ok(ProcessOutcome::Abandoned {
                    record_id,
                    update_id,
                    failure_count,
                })
            }
        }
    }

    /// Process records until the shutdown token is cancelled.
    pub async fn run(self) {
        info!(
            "Processor started (retry budget {})",
            self.config.retry_budget
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let delay = match self.process_next().await {
                Ok(ProcessOutcome::Idle) => self.config.idle_delay,
                Ok(outcome) => {
                    let delay = if outcome.is_failure() {
                        self.config.idle_delay + self.config.failure_delay
                    } else {
                        self.config.idle_delay
                    };
                    debug!("Processor cycle: {}, next in {:?}", outcome, delay);
                    delay
                }
                Err(e) => {
                    warn!(
                        "Processor cycle failed, retrying in {:?}: {:#}",
                        self.config.error_backoff, e
                    );
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Processor stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
