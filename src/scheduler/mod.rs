pub mod tasks;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

/// A named job fired on a six-field cron schedule (seconds first).
pub struct CronJob {
    pub name: &'static str,
    pub schedule: String,
    pub run: Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
}

/// Running tokio-cron-scheduler instance owning the maintenance jobs.
pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    /// Register every job and start ticking. A bad schedule fails the call
    /// before any job runs.
    pub async fn start(jobs: Vec<CronJob>) -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;

        for CronJob {
            name,
            schedule,
            run,
        } in jobs
        {
            let job = Job::new_async(schedule.as_str(), move |_id, _scheduler| {
                debug!("Running maintenance job: {}", name);
                run()
            })
            .with_context(|| format!("Invalid schedule '{}' for job {}", schedule, name))?;
            inner
                .add(job)
                .await
                .with_context(|| format!("Failed to add job {}", name))?;
            info!("Job '{}' scheduled: {}", name, schedule);
        }

        inner.start().await.context("Failed to start scheduler")?;
        Ok(Self { inner })
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to stop scheduler")
    }
}
