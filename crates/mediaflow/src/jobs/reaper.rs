use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::Result;
use crate::jobs::{repo::JobsRepo, retry::is_zombie};

/// Finds running jobs that have outlived their threshold and flags them.
///
/// Detection only: a zombie's worker may still be alive, so zombies are never
/// retried automatically. [`ZombieReaper::force_kill_zombies`] is the one way out.
pub struct ZombieReaper {
    jobs: JobsRepo,
    threshold: Duration,
    lock: Mutex<()>,
}

impl ZombieReaper {
    pub fn new(jobs: JobsRepo, threshold: Duration) -> Self {
        Self {
            jobs,
            threshold,
            lock: Mutex::new(()),
        }
    }

    /// Mark every overdue running job as zombie. Returns the ids marked.
    pub async fn sweep(&self) -> Result<Vec<i64>> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();

        let mut marked = Vec::new();
        for job in self.jobs.list_running().await? {
            if !is_zombie(&job, now, self.threshold) {
                continue;
            }
            let secs = job.elapsed(now).map_or(0, |d| d.num_seconds());
            let msg = format!("zombie detected after {secs}s");
            if self.jobs.mark_zombie(job.id, &msg).await? {
                tracing::warn!(
                    job.id = job.id,
                    job.job_type = %job.job_type,
                    worker_id = job.worker_id.as_deref().unwrap_or("-"),
                    elapsed_secs = secs,
                    "job marked zombie"
                );
                marked.push(job.id);
            }
        }

        if !marked.is_empty() {
            tracing::info!(count = marked.len(), "zombie sweep finished");
        }
        Ok(marked)
    }

    /// zombie -> failed for all zombies. Operator action.
    pub async fn force_kill_zombies(&self) -> Result<Vec<i64>> {
        let _guard = self.lock.lock().await;
        let ids = self.jobs.force_kill_zombies().await?;
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), ?ids, "zombies force-killed");
        }
        Ok(ids)
    }

    /// Sweep every `interval` until `token` is cancelled. The first tick fires at once.
    pub fn spawn(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let span = tracing::info_span!("reaper", interval_secs = interval.as_secs());
        tokio::spawn(
            async move {
                let mut tick = tokio::time::interval(interval.max(Duration::from_millis(10)));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {
                            if let Err(err) = self.sweep().await {
                                tracing::error!(error = %err, "zombie sweep failed");
                            }
                        }
                    }
                }
                tracing::debug!("reaper stopped");
            }
            .instrument(span),
        )
    }
}
