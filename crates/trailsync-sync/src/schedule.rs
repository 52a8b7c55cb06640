//! Cron trigger with an overlap guard.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::SyncPipeline;

/// Shared flag saying a run is in progress. Owned by the scheduler, not the pipeline.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

/// Held for the duration of one run; dropping it frees the guard.
#[derive(Debug)]
pub struct RunToken {
    running: Arc<AtomicBool>,
}

impl Drop for RunToken {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<RunToken> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunToken {
                running: Arc::clone(&self.running),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Runs `run` unless another run holds the guard, in which case it is skipped.
pub async fn run_exclusive<F, Fut, T>(guard: &RunGuard, run: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let Some(_token) = guard.try_acquire() else {
        warn!("previous run still in progress; skipping trigger");
        return None;
    };
    Some(run().await)
}

pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, guard: RunGuard, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let guard = guard.clone();
        Box::pin(async move {
            info!("scheduled sync triggered");
            match run_exclusive(&guard, || pipeline.run_once()).await {
                Some(Ok(summary)) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                Some(Err(err)) => error!(error = %err, "scheduled sync failed"),
                None => {}
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
