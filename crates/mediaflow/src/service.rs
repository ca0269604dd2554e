use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::db::retry_transient;
use crate::error::{QueueError, Result};
use crate::jobs::{
    defaults::DefaultsTable,
    dispatcher::Dispatcher,
    job_logging::{LogCapture, NoCapture},
    model::{Job, JobStatus, NewJob, Payload},
    payload::JobPayload,
    reaper::ZombieReaper,
    registry::WorkerRegistry,
    repo::{insert_job, JobFilter, JobsRepo},
    retry::RetryConfig,
    runner::JobRunner,
    state::{fire_callback, JobCallback, SharedState, Totals},
};

const SHUTDOWN_REASON: &str = "cancelled: service shutdown";

/// Per-submission overrides. Anything left unset comes from the defaults table.
#[derive(Default)]
pub struct SubmitOptions {
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub timeout_seconds: Option<i64>,
    pub parent_job_id: Option<i64>,
    callback: Option<JobCallback>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn max_retries(mut self, n: i32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn timeout_seconds(mut self, secs: i64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }

    pub fn parent(mut self, job_id: i64) -> Self {
        self.parent_job_id = Some(job_id);
        self
    }

    /// Called once, after the first attempt settles (or on cancel), with
    /// `(job_id, success, error_message)`.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(i64, bool, Option<String>) + Send + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("parent_job_id", &self.parent_job_id)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub status_counts: BTreeMap<String, i64>,
    pub type_counts: BTreeMap<String, i64>,
    pub workers_busy: usize,
    pub workers_idle: usize,
    pub running_jobs: usize,
    pub uptime_secs: u64,
    pub totals: Totals,
}

impl QueueStats {
    pub fn count(&self, status: JobStatus) -> i64 {
        self.status_counts.get(status.as_str()).copied().unwrap_or(0)
    }
}

pub struct QueueServiceBuilder {
    pool: SqlitePool,
    cfg: QueueConfig,
    registry: WorkerRegistry,
    defaults: DefaultsTable,
    capture: Arc<dyn LogCapture>,
    retry_cfg: RetryConfig,
}

impl QueueServiceBuilder {
    pub fn config(mut self, cfg: QueueConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn registry(mut self, registry: WorkerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn defaults(mut self, defaults: DefaultsTable) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn log_capture(mut self, capture: impl LogCapture + 'static) -> Self {
        self.capture = Arc::new(capture);
        self
    }

    pub fn retry_config(mut self, retry_cfg: RetryConfig) -> Self {
        self.retry_cfg = retry_cfg;
        self
    }

    /// Spawn the dispatcher units and the reaper. Needs a running tokio runtime.
    pub fn start(self) -> QueueService {
        let jobs = JobsRepo::new(self.pool);
        let units = self.cfg.workers.max(1);
        let state = Arc::new(SharedState::new(units));
        let token = CancellationToken::new();
        let registry = Arc::new(self.registry);
        let runner = JobRunner::new(jobs.clone(), self.retry_cfg);

        if registry.is_empty() {
            tracing::warn!("starting queue with no registered workers");
        }

        let unit_ids: Vec<String> = (0..units)
            .map(|n| format!("{}-{n}", self.cfg.worker_id))
            .collect();
        for unit in &unit_ids {
            let handle = Dispatcher::new(
                unit.clone(),
                jobs.clone(),
                runner.clone(),
                registry.clone(),
                self.capture.clone(),
                state.clone(),
                &self.cfg,
                token.child_token(),
            )
            .spawn();
            state.add_task(handle);
        }

        let reaper = Arc::new(ZombieReaper::new(jobs.clone(), self.cfg.zombie_threshold));
        state.add_task(
            reaper
                .clone()
                .spawn(self.cfg.zombie_sweep_interval, token.child_token()),
        );

        tracing::info!(
            workers = units,
            worker_id = %self.cfg.worker_id,
            job_types = ?registry.job_types(),
            "queue service started"
        );

        QueueService {
            jobs,
            reaper,
            defaults: self.defaults,
            unit_ids,
            state,
            token,
            started: Instant::now(),
        }
    }
}

/// The queue facade. Construct once at startup and pass it around.
pub struct QueueService {
    jobs: JobsRepo,
    reaper: Arc<ZombieReaper>,
    defaults: DefaultsTable,
    unit_ids: Vec<String>,
    state: Arc<SharedState>,
    token: CancellationToken,
    started: Instant,
}

impl QueueService {
    pub fn builder(pool: SqlitePool) -> QueueServiceBuilder {
        QueueServiceBuilder {
            pool,
            cfg: QueueConfig::default(),
            registry: WorkerRegistry::new(),
            defaults: DefaultsTable::new(),
            capture: Arc::new(NoCapture),
            retry_cfg: RetryConfig::default(),
        }
    }

    pub fn start(pool: SqlitePool, cfg: QueueConfig, registry: WorkerRegistry) -> Self {
        Self::builder(pool).config(cfg).registry(registry).start()
    }

    pub fn repo(&self) -> &JobsRepo {
        &self.jobs
    }

    // ----------------------------
    // Submission
    // ----------------------------

    pub async fn submit(&self, job_type: &str, payload: Payload, opts: SubmitOptions) -> Result<i64> {
        if !self.state.is_accepting() {
            return Err(QueueError::ShuttingDown);
        }

        let d = self.defaults.get(job_type);
        let new = NewJob {
            job_type: job_type.to_string(),
            payload,
            priority: opts.priority.unwrap_or(d.priority),
            max_retries: opts.max_retries.unwrap_or(d.max_retries),
            timeout_seconds: opts.timeout_seconds.or(d.timeout_seconds),
            parent_job_id: opts.parent_job_id,
        };

        // The insert holds the write lock until commit, so no dispatcher can
        // claim the row before its callback is registered.
        let pool = self.jobs.pool();
        let new = &new;
        let (tx, id) = retry_transient("submit", move || async move {
            let mut tx = pool.begin().await?;
            let id = insert_job(&mut *tx, new, Utc::now()).await?;
            Ok((tx, id))
        })
        .await?;

        self.state.register_submission(id, opts.callback);
        if let Err(err) = tx.commit().await {
            self.state.forget_submission(id);
            return Err(err.into());
        }

        tracing::info!(
            job.id = id,
            job.job_type = job_type,
            priority = new.priority,
            max_retries = new.max_retries,
            "job submitted"
        );
        Ok(id)
    }

    pub async fn submit_payload<P: JobPayload>(&self, payload: &P, opts: SubmitOptions) -> Result<i64> {
        self.submit(P::JOB_TYPE, payload.to_payload()?, opts).await
    }

    // ----------------------------
    // Queries
    // ----------------------------

    pub async fn get(&self, job_id: i64) -> Result<Option<Job>> {
        self.jobs.get_job(job_id).await
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        job_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let filter = JobFilter {
            status,
            job_type: job_type.map(str::to_string),
        };
        self.jobs.list_jobs(&filter, limit, offset).await
    }

    pub async fn count(&self, status: Option<JobStatus>, job_type: Option<&str>) -> Result<i64> {
        let filter = JobFilter {
            status,
            job_type: job_type.map(str::to_string),
        };
        self.jobs.count_jobs(&filter).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let status_counts = self
            .jobs
            .status_counts()
            .await?
            .into_iter()
            .map(|(s, n)| (s.to_string(), n))
            .collect();
        let type_counts = self.jobs.type_counts().await?.into_iter().collect();
        let (workers_busy, workers_idle) = self.state.unit_load();

        Ok(QueueStats {
            status_counts,
            type_counts,
            workers_busy,
            workers_idle,
            running_jobs: self.state.running_ids().len(),
            uptime_secs: self.started.elapsed().as_secs(),
            totals: self.state.totals(),
        })
    }

    // ----------------------------
    // Control
    // ----------------------------

    /// Cancel a pending or retrying job. Never fails; the message says why not.
    pub async fn cancel(&self, job_id: i64) -> (bool, String) {
        let job = match self.jobs.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return (false, format!("job {job_id} not found")),
            Err(err) => return (false, format!("failed to cancel job {job_id}: {err}")),
        };
        if !job.status.is_cancellable() {
            return (
                false,
                format!("job {job_id} is {} and cannot be cancelled", job.status),
            );
        }

        match self.jobs.cancel(job_id).await {
            Ok(true) => {
                self.state.count_cancelled(1);
                if let Some(cb) = self.state.take_callback(job_id) {
                    fire_callback(cb, job_id, false, Some("cancelled by request".to_string()));
                }
                tracing::info!(job.id = job_id, "job cancelled");
                (true, format!("job {job_id} cancelled"))
            }
            // claimed between the read and the write
            Ok(false) => (
                false,
                format!("job {job_id} was picked up before it could be cancelled"),
            ),
            Err(err) => {
                tracing::error!(job.id = job_id, error = %err, "cancel failed");
                (false, format!("failed to cancel job {job_id}: {err}"))
            }
        }
    }

    pub async fn sweep_zombies(&self) -> Result<Vec<i64>> {
        self.reaper.sweep().await
    }

    /// zombie -> failed. Callbacks still registered for those jobs fire with a failure.
    pub async fn force_kill_zombies(&self) -> Result<Vec<i64>> {
        let ids = self.reaper.force_kill_zombies().await?;
        self.state.count_failed(ids.len() as u64);
        for &id in &ids {
            if let Some(cb) = self.state.take_callback(id) {
                fire_callback(cb, id, false, Some("zombie force-killed".to_string()));
            }
        }
        Ok(ids)
    }

    /// Resubmit a terminal job as a new pending job linked to it.
    pub async fn replay(&self, job_id: i64) -> Result<i64> {
        if !self.state.is_accepting() {
            return Err(QueueError::ShuttingDown);
        }
        let id = self.jobs.replay_job(job_id).await?;
        self.state.register_submission(id, None);
        tracing::info!(job.id = id, parent_job_id = job_id, "job replayed");
        Ok(id)
    }

    // ----------------------------
    // Shutdown
    // ----------------------------

    /// Stop claiming, wait up to `graceful_timeout` for in-flight jobs, cancel
    /// whatever is still running, run a last zombie sweep and join every task.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self, graceful_timeout: Duration) -> Result<()> {
        if !self.state.stop_accepting() {
            return Ok(());
        }
        tracing::info!(timeout_secs = graceful_timeout.as_secs_f64(), "queue shutting down");
        self.token.cancel();

        let deadline = tokio::time::Instant::now() + graceful_timeout;
        let mut aborted = 0usize;
        for mut task in self.state.take_tasks() {
            let res = match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(res) => res,
                Err(_) => {
                    task.abort();
                    aborted += 1;
                    task.await
                }
            };
            if let Err(err) = res {
                if err.is_panic() {
                    tracing::error!(error = %err, "queue task panicked");
                }
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "graceful timeout elapsed, in-flight work aborted");
        }

        // Every unit has stopped, so any row still running under one of our
        // unit ids is orphaned, including claims aborted before they were tracked.
        let mut first_err = None;
        let in_flight = self.state.running();
        match self
            .jobs
            .cancel_running_owned_by(&self.unit_ids, SHUTDOWN_REASON)
            .await
        {
            Ok(ids) => {
                self.state.count_cancelled(ids.len() as u64);
                for id in ids {
                    match in_flight.get(&id) {
                        Some(r) => tracing::warn!(
                            job.id = id,
                            job.job_type = %r.job_type,
                            unit = %r.unit,
                            "running job cancelled on shutdown"
                        ),
                        None => tracing::warn!(job.id = id, "untracked running job cancelled on shutdown"),
                    }
                    if let Some(cb) = self.state.finish_job(id, None) {
                        fire_callback(cb, id, false, Some(SHUTDOWN_REASON.to_string()));
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "could not cancel running jobs");
                first_err.get_or_insert(err);
            }
        }
        // rows that already left running (zombie, force-killed) keep their state
        for id in self.state.running_ids() {
            self.state.finish_job(id, None);
        }

        if let Err(err) = self.reaper.sweep().await {
            tracing::error!(error = %err, "final zombie sweep failed");
            first_err.get_or_insert(err);
        }

        tracing::info!("queue stopped");
        first_err.map_or(Ok(()), Err)
    }
}
