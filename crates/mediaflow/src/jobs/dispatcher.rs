use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::jobs::{
    job_logging::LogCapture,
    model::Job,
    registry::{execute_with_supervision, WorkerRegistry},
    repo::JobsRepo,
    runner::{JobRunner, Outcome, Settled},
    state::{fire_callback, SharedState},
};

/// One polling unit. A service runs `workers` of these side by side.
pub struct Dispatcher {
    unit: String,
    jobs: JobsRepo,
    runner: JobRunner,
    registry: Arc<WorkerRegistry>,
    capture: Arc<dyn LogCapture>,
    state: Arc<SharedState>,
    poll_interval: Duration,
    poll_jitter: Duration,
    error_backoff: Duration,
    token: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        unit: String,
        jobs: JobsRepo,
        runner: JobRunner,
        registry: Arc<WorkerRegistry>,
        capture: Arc<dyn LogCapture>,
        state: Arc<SharedState>,
        cfg: &QueueConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            unit,
            jobs,
            runner,
            registry,
            capture,
            state,
            poll_interval: cfg.poll_interval,
            poll_jitter: cfg.poll_jitter,
            error_backoff: cfg.error_backoff,
            token,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let span = tracing::info_span!("dispatcher", unit = %self.unit);
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(self) {
        tracing::info!("dispatcher started");

        // Claims are never raced against cancellation: a dropped claim could
        // leave a row running with nobody executing it.
        while !self.token.is_cancelled() {
            match self.jobs.claim_next(&self.unit).await {
                Ok(Some(job)) => self.handle(job).await,
                Ok(None) => self.pause(self.idle_delay()).await,
                Err(err) => {
                    tracing::error!(error = %err, "claim failed");
                    self.pause(self.error_backoff).await;
                }
            }
        }

        tracing::info!("dispatcher stopped");
    }

    async fn handle(&self, job: Job) {
        let job_id = job.id;
        let span = tracing::info_span!(
            "job",
            job.id = job_id,
            job.job_type = %job.job_type,
            attempt = job.retry_count + 1
        );

        async {
            self.state.start_job(job_id, &self.unit, &job.job_type);

            let settled = match self.registry.worker_for(&job.job_type) {
                None => {
                    tracing::error!("no worker registered, dead-lettering");
                    self.runner.dead_letter_unregistered(job).await
                }
                Some(worker) => {
                    tracing::info!("job started");
                    let supervised =
                        execute_with_supervision(worker.as_ref(), &job, &self.capture, &self.unit)
                            .await;
                    tracing::debug!(elapsed_ms = supervised.elapsed.as_millis() as u64, "worker returned");
                    self.runner.record(job, supervised).await
                }
            };

            self.after(job_id, settled);
        }
        .instrument(span)
        .await
    }

    fn after(&self, job_id: i64, settled: Result<Settled>) {
        let settled = match settled {
            Ok(s) => s,
            Err(err) => {
                // The row stays running; the reaper picks it up once it is overdue.
                tracing::error!(error = %err, "could not persist job outcome");
                self.state.finish_job(job_id, None);
                return;
            }
        };

        if !settled.persisted {
            tracing::warn!(
                outcome = ?settled.outcome,
                "job left running while the worker was busy, outcome discarded"
            );
            self.state.finish_job(job_id, None);
            return;
        }

        match settled.outcome {
            Outcome::Completed => tracing::info!("job completed"),
            Outcome::Retrying { next_retry_at } => tracing::warn!(
                retry_count = settled.job.retry_count,
                %next_retry_at,
                error = settled.job.error_message.as_deref().unwrap_or(""),
                "job failed, retry scheduled"
            ),
            other => tracing::error!(
                outcome = ?other,
                failure_type = ?settled.job.failure_type,
                error = settled.job.error_message.as_deref().unwrap_or(""),
                "job failed"
            ),
        }

        if let Some(cb) = self.state.finish_job(job_id, Some(settled.outcome)) {
            fire_callback(
                cb,
                job_id,
                settled.outcome.succeeded(),
                settled.error_message(),
            );
        }
    }

    fn idle_delay(&self) -> Duration {
        let jitter_ms = self.poll_jitter.as_millis() as u64;
        let extra = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        self.poll_interval + Duration::from_millis(extra)
    }

    async fn pause(&self, d: Duration) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep(d) => {}
        }
    }
}
