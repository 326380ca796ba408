use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use tracing::{error, info};

use crate::config::Config;
use crate::scheduler::CronJob;
use crate::store::QueueStore;

/// Abandoned records older than the retention window are purged daily at 03:30
const PURGE_CRON: &str = "0 30 3 * * *";

/// Heartbeat with queue counters, plus the purge job when a retention window is set.
pub fn maintenance_jobs(store: &QueueStore, config: &Config) -> Vec<CronJob> {
    let heartbeat_store = store.clone();
    let mut jobs = vec![CronJob {
        name: "queue-heartbeat",
        schedule: config.maintenance.heartbeat_cron.clone(),
        run: Arc::new(move || {
            let store = heartbeat_store.clone();
            async move {
                match store.stats().await {
                    Ok(stats) => info!("Heartbeat: {}", stats),
                    Err(e) => error!("Heartbeat failed to read queue stats: {:#}", e),
                }
            }
            .boxed()
        }),
    }];

    let retention_days = config.store.abandoned_retention_days;
    if retention_days > 0 {
        let store = store.clone();
        jobs.push(CronJob {
            name: "purge-abandoned",
            schedule: PURGE_CRON.to_string(),
            run: Arc::new(move || {
                let store = store.clone();
                async move {
                    if let Err(e) = purge_expired(&store, retention_days).await {
                        error!("Failed to purge abandoned records: {:#}", e);
                    }
                }
                .boxed()
            }),
        });
    }

    jobs
}

/// Delete abandoned records older than `retention_days`.
pub async fn purge_expired(store: &QueueStore, retention_days: u32) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let purged = store.purge_abandoned(cutoff).await?;
    if purged > 0 {
        info!(
            "Purged {} abandoned record(s) older than {} day(s)",
            purged, retention_days
        );
    }
    Ok(purged)
}
