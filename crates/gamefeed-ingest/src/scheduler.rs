use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::controller::JobController;

/// Cron job that asks the controller for a run. A tick during a run is dropped, not queued.
pub async fn build_scheduler(controller: Arc<JobController>, cron: &str) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let controller = Arc::clone(&controller);
        Box::pin(async move {
            if controller.start() {
                info!("scheduled ingest run started");
            } else {
                warn!("scheduled ingest run skipped, a run is already in progress");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    controller: Arc<JobController>,
    config: &IngestConfig,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(controller, &config.cron).await.map(Some)
}
