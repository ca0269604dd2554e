use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::jobs::failure::{classify_failure, FailureType};
use crate::jobs::job_logging::{CaptureScope, LogCapture};
use crate::jobs::model::Job;

/// What a worker sees besides the job itself.
pub struct JobContext<'a> {
    pub worker_id: &'a str,
    pub log: &'a CaptureScope,
}

/// Executes jobs of one or more types. Supplied by the host application.
///
/// `Ok(false)` and `Err(_)` both count as a failed attempt; an `Err` carries
/// the category used for the retry decision.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn supported_job_types(&self) -> Vec<&'static str>;

    async fn execute(&self, job: &Job, ctx: &JobContext<'_>) -> Result<bool, JobError>;
}

/// A failed attempt as reported by a worker.
#[derive(Debug)]
pub struct JobError {
    kind: FailureType,
    message: String,
    detail: Option<String>,
}

impl JobError {
    pub fn new(kind: FailureType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureType::NetworkError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureType::TimeoutError, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(FailureType::ResourceError, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(FailureType::PermissionError, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(FailureType::ConfigurationError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureType::ValidationError, message)
    }

    /// Classify a heterogeneous third-party error by its chain and message.
    pub fn from_error(err: anyhow::Error) -> Self {
        Self {
            kind: classify_failure(&err),
            message: format!("{err:#}"),
            detail: Some(format!("{err:?}")),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn kind(&self) -> FailureType {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_error(err)
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        Self::from_error(err.into())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::from_error(err.into())
    }
}

/// job_type -> worker. Filled by the host at startup; the core never builds workers.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every type the worker supports to it. Later registrations win.
    pub fn register<W: Worker + 'static>(&mut self, worker: W) -> &mut Self {
        self.register_arc(Arc::new(worker))
    }

    pub fn register_arc(&mut self, worker: Arc<dyn Worker>) -> &mut Self {
        for job_type in worker.supported_job_types() {
            if self
                .workers
                .insert(job_type.to_string(), worker.clone())
                .is_some()
            {
                tracing::warn!(job_type, worker = worker.name(), "replacing registered worker");
            }
        }
        self
    }

    pub fn worker_for(&self, job_type: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Result of one supervised attempt.
#[derive(Debug)]
pub struct Supervised {
    pub error: Option<JobError>,
    pub elapsed: Duration,
    pub log_file_path: Option<String>,
}

impl Supervised {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Run `worker` on `job` inside a log capture scope.
///
/// This is the only place worker failures are caught: errors, `Ok(false)` and
/// panics all come back as a [`Supervised`] value.
pub async fn execute_with_supervision(
    worker: &dyn Worker,
    job: &Job,
    capture: &Arc<dyn LogCapture>,
    worker_id: &str,
) -> Supervised {
    let start = Instant::now();

    if let (Some(limit), Some(elapsed)) = (job.timeout_seconds, job.elapsed(Utc::now())) {
        if limit > 0 && elapsed.num_milliseconds() > limit.saturating_mul(1000) {
            return Supervised {
                error: Some(JobError::timeout(format!(
                    "timeout of {limit}s already exceeded before execution started"
                ))),
                elapsed: start.elapsed(),
                log_file_path: None,
            };
        }
    }

    let scope = open_scope(capture, job, worker_id).await;
    let log_file_path = scope.path().map(|p| p.display().to_string());

    let ctx = JobContext {
        worker_id,
        log: &scope,
    };

    let result = AssertUnwindSafe(worker.execute(job, &ctx))
        .catch_unwind()
        .await;

    let error = match result {
        Ok(Ok(true)) => None,
        Ok(Ok(false)) => Some(JobError::new(
            FailureType::WorkerError,
            "worker reported failure",
        )),
        Ok(Err(err)) => Some(err),
        Err(panic) => Some(JobError::new(
            FailureType::SystemError,
            format!("worker panicked: {}", panic_message(&*panic)),
        )),
    };

    match &error {
        None => scope.set_outcome("completed"),
        Some(err) => {
            scope.line(format!("error: {err}"));
            scope.set_outcome(format!("failed ({})", err.kind()));
        }
    }

    Supervised {
        error,
        elapsed: start.elapsed(),
        log_file_path,
    }
}

/// Opening a capture may create directories and files, so it runs on the
/// blocking pool instead of the dispatcher's runtime thread.
async fn open_scope(capture: &Arc<dyn LogCapture>, job: &Job, worker_id: &str) -> CaptureScope {
    let capture = Arc::clone(capture);
    let (owned, unit) = (job.clone(), worker_id.to_string());
    match tokio::task::spawn_blocking(move || capture.open_capture(&owned, &unit)).await {
        Ok(Ok(scope)) => scope,
        Ok(Err(err)) => {
            tracing::warn!(job.id = job.id, error = %err, "could not open job log, continuing without it");
            CaptureScope::disabled(job.id)
        }
        Err(err) => {
            tracing::warn!(job.id = job.id, error = %err, "job log open task failed, continuing without it");
            CaptureScope::disabled(job.id)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job_logging::{FileLogCapture, NoCapture};
    use crate::jobs::model::{JobStatus, Payload};
    use sqlx::types::Json;

    struct Scripted(fn() -> Result<bool, JobError>);

    #[async_trait]
    impl Worker for Scripted {
        fn supported_job_types(&self) -> Vec<&'static str> {
            vec!["metadata_extraction", "thumbnail_generation"]
        }

        async fn execute(&self, _job: &Job, ctx: &JobContext<'_>) -> Result<bool, JobError> {
            ctx.log.line("running scripted worker");
            (self.0)()
        }
    }

    fn running_job(timeout_seconds: Option<i64>, started_secs_ago: i64) -> Job {
        Job {
            id: 9,
            job_type: "metadata_extraction".into(),
            payload: Json(Payload::new()),
            status: JobStatus::Running,
            priority: 5,
            created_at: Utc::now(),
            started_at: Some(Utc::now() - chrono::Duration::seconds(started_secs_ago)),
            completed_at: None,
            error_message: None,
            last_error_traceback: None,
            failure_type: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            worker_id: Some("w".into()),
            timeout_seconds,
            parent_job_id: None,
            dead_letter_reason: None,
            moved_to_dead_letter_at: None,
            log_file_path: None,
        }
    }

    async fn run(f: fn() -> Result<bool, JobError>, job: &Job) -> Supervised {
        let capture: Arc<dyn LogCapture> = Arc::new(NoCapture);
        execute_with_supervision(&Scripted(f), job, &capture, "w").await
    }

    #[tokio::test]
    async fn true_is_success() {
        let out = run(|| Ok(true), &running_job(None, 0)).await;
        assert!(out.succeeded());
    }

    #[tokio::test]
    async fn false_is_worker_error() {
        let out = run(|| Ok(false), &running_job(None, 0)).await;
        assert_eq!(out.error.unwrap().kind(), FailureType::WorkerError);
    }

    #[tokio::test]
    async fn typed_errors_keep_their_kind() {
        let out = run(|| Err(JobError::configuration("ffmpeg missing")), &running_job(None, 0)).await;
        let err = out.error.unwrap();
        assert_eq!(err.kind(), FailureType::ConfigurationError);
        assert_eq!(err.message(), "ffmpeg missing");
    }

    #[tokio::test]
    async fn untyped_errors_are_classified() {
        let out = run(
            || Err(anyhow::anyhow!("Connection reset by peer").into()),
            &running_job(None, 0),
        )
        .await;
        assert_eq!(out.error.unwrap().kind(), FailureType::NetworkError);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let out = run(|| panic!("boom"), &running_job(None, 0)).await;
        let err = out.error.unwrap();
        assert_eq!(err.kind(), FailureType::SystemError);
        assert!(err.message().contains("boom"));
    }

    #[tokio::test]
    async fn expired_timeout_fails_fast_without_calling_worker() {
        let out = run(|| panic!("must not run"), &running_job(Some(1), 5)).await;
        assert_eq!(out.error.unwrap().kind(), FailureType::TimeoutError);
    }

    #[tokio::test]
    async fn file_capture_is_opened_off_the_runtime_thread() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs").join("jobs");
        let capture: Arc<dyn LogCapture> = Arc::new(FileLogCapture::new(&nested));

        let out = execute_with_supervision(&Scripted(|| Ok(true)), &running_job(None, 0), &capture, "w-0").await;
        assert!(out.succeeded());

        let path = out.log_file_path.expect("file capture records a path");
        assert_eq!(std::path::Path::new(&path), nested.join("job_9_metadata_extraction.log"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("by w-0"));
        assert!(text.contains("running scripted worker"));
        assert!(text.contains("=== finished: completed after"));
    }

    #[tokio::test]
    async fn unopenable_capture_falls_back_to_no_log() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let capture: Arc<dyn LogCapture> = Arc::new(FileLogCapture::new(&blocker));

        let out = execute_with_supervision(&Scripted(|| Ok(true)), &running_job(None, 0), &capture, "w-0").await;
        assert!(out.succeeded());
        assert!(out.log_file_path.is_none());
    }

    #[tokio::test]
    async fn huge_timeout_runs_the_worker() {
        let out = run(|| Ok(true), &running_job(Some(i64::MAX), 5)).await;
        assert!(out.succeeded());
    }

    #[test]
    fn registry_maps_every_supported_type() {
        let mut reg = WorkerRegistry::new();
        reg.register(Scripted(|| Ok(true)));
        assert_eq!(reg.job_types(), vec!["metadata_extraction", "thumbnail_generation"]);
        assert!(reg.worker_for("thumbnail_generation").is_some());
        assert!(reg.worker_for("channel_download").is_none());
    }
}
