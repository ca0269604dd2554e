#![allow(dead_code)]

use async_trait::async_trait;
use mediaflow::config::QueueConfig;
use mediaflow::db::{make_pool, run_migrations};
use mediaflow::jobs::{
    Job, JobContext, JobError, JobStatus, JobsRepo, NewJob, Payload, RetryConfig, Worker,
};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A throwaway database file; deleted when dropped.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

impl TestDb {
    pub fn repo(&self) -> JobsRepo {
        JobsRepo::new(self.pool.clone())
    }

    pub fn dir(&self) -> &std::path::Path {
        self._dir.path()
    }
}

pub async fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("queue.db").display());

    let pool = make_pool(&url, 8).await.expect("failed to open test database");
    run_migrations(&pool).await.expect("migrations failed");

    TestDb { pool, _dir: dir }
}

pub async fn insert_job(repo: &JobsRepo, job_type: &str, priority: i32) -> i64 {
    repo.insert(&NewJob {
        priority,
        ..NewJob::new(job_type, Payload::new())
    })
    .await
    .expect("failed to insert job")
}

pub fn test_config(workers: usize) -> QueueConfig {
    QueueConfig {
        worker_id: "test".to_string(),
        workers,
        poll_interval: Duration::from_millis(20),
        poll_jitter: Duration::ZERO,
        zombie_sweep_interval: Duration::from_secs(3600),
        zombie_threshold: Duration::from_secs(3600),
        error_backoff: Duration::from_millis(50),
    }
}

pub fn fast_retries() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        jitter_ratio: 0.0,
    }
}

/// Poll until the job satisfies `pred`, or panic after `timeout`.
pub async fn wait_for(
    repo: &JobsRepo,
    job_id: i64,
    timeout: Duration,
    pred: impl Fn(&Job) -> bool,
) -> Job {
    let start = Instant::now();
    loop {
        let job = repo
            .get_job(job_id)
            .await
            .expect("get_job failed")
            .expect("job vanished");
        if pred(&job) {
            return job;
        }
        if start.elapsed() > timeout {
            panic!("job {job_id} stuck in {} after {timeout:?}", job.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_status(repo: &JobsRepo, job_id: i64, status: JobStatus) -> Job {
    wait_for(repo, job_id, Duration::from_secs(10), |j| j.status == status).await
}

type Script = dyn Fn(u32) -> Result<bool, JobError> + Send + Sync;

/// Answers attempt `n` (1-based) with `script(n)`.
pub struct ScriptedWorker {
    job_type: &'static str,
    script: Box<Script>,
    calls: Arc<AtomicU32>,
}

impl ScriptedWorker {
    pub fn new(
        job_type: &'static str,
        script: impl Fn(u32) -> Result<bool, JobError> + Send + Sync + 'static,
    ) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                job_type,
                script: Box::new(script),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn supported_job_types(&self) -> Vec<&'static str> {
        vec![self.job_type]
    }

    async fn execute(&self, _job: &Job, _ctx: &JobContext<'_>) -> Result<bool, JobError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.script)(n)
    }
}

/// Sleeps, then succeeds. Records the order in which jobs were started.
pub struct SleepWorker {
    job_type: &'static str,
    sleep: Duration,
    pub started: Arc<Mutex<Vec<i64>>>,
}

impl SleepWorker {
    pub fn new(job_type: &'static str, sleep: Duration) -> Self {
        Self {
            job_type,
            sleep,
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Worker for SleepWorker {
    fn supported_job_types(&self) -> Vec<&'static str> {
        vec![self.job_type]
    }

    async fn execute(&self, job: &Job, ctx: &JobContext<'_>) -> Result<bool, JobError> {
        self.started.lock().unwrap().push(job.id);
        ctx.log.line(format!("sleeping {:?}", self.sleep));
        tokio::time::sleep(self.sleep).await;
        Ok(true)
    }
}

pub type Calls = Arc<Mutex<Vec<(i64, bool, Option<String>)>>>;

/// A callback that appends its arguments to the returned list.
pub fn recorder() -> (Calls, impl FnOnce(i64, bool, Option<String>) + Send + 'static) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    (calls, move |id, ok, msg| sink.lock().unwrap().push((id, ok, msg)))
}
