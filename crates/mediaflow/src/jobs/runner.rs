use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::Result;
use crate::jobs::{
    failure::FailureType,
    model::{Job, JobStatus},
    registry::{JobError, Supervised},
    repo::JobsRepo,
    retry::RetryConfig,
};

/// Where an attempt left the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Retrying { next_retry_at: DateTime<Utc> },
    DeadLettered,
    /// Terminal `failed` or `timeout` with budget left but a non-retryable failure.
    Failed(JobStatus),
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

/// Outcome plus whether the store accepted the write.
///
/// `persisted == false` means the row left `running` while the worker was busy
/// (marked zombie, or cancelled on shutdown); the earlier transition stands.
#[derive(Debug, Clone)]
pub struct Settled {
    pub job: Job,
    pub outcome: Outcome,
    pub persisted: bool,
}

impl Settled {
    pub fn error_message(&self) -> Option<String> {
        self.job.error_message.clone()
    }
}

/// Decides and persists what happens to a job after an attempt.
#[derive(Clone)]
pub struct JobRunner {
    jobs: JobsRepo,
    retry_cfg: RetryConfig,
}

impl JobRunner {
    pub fn new(jobs: JobsRepo, retry_cfg: RetryConfig) -> Self {
        Self { jobs, retry_cfg }
    }

    pub async fn record(&self, mut job: Job, supervised: Supervised) -> Result<Settled> {
        if supervised.log_file_path.is_some() {
            job.log_file_path = supervised.log_file_path;
        }

        let mut rng = StdRng::from_entropy();
        let outcome = settle(
            &mut job,
            supervised.error.as_ref(),
            &self.retry_cfg,
            Utc::now(),
            &mut rng,
        );
        let persisted = self.jobs.update_terminal_or_retry(&job).await?;

        Ok(Settled {
            job,
            outcome,
            persisted,
        })
    }

    /// No worker can ever run this type: dead-letter it now instead of letting
    /// it cycle through retries.
    pub async fn dead_letter_unregistered(&self, mut job: Job) -> Result<Settled> {
        let now = Utc::now();
        let msg = format!("no worker registered for type {}", job.job_type);

        job.status = JobStatus::DeadLetter;
        job.failure_type = Some(FailureType::WorkerError);
        job.dead_letter_reason = Some(msg.clone());
        job.error_message = Some(msg);
        job.moved_to_dead_letter_at = Some(now);
        job.completed_at = Some(now);
        job.next_retry_at = None;

        let persisted = self.jobs.update_terminal_or_retry(&job).await?;
        Ok(Settled {
            job,
            outcome: Outcome::DeadLettered,
            persisted,
        })
    }
}

/// Apply one attempt's result to `job` in memory.
///
/// Success -> completed. Failure -> `timeout` for timeout errors, `failed`
/// otherwise; then retrying if budget and category allow, dead_letter once the
/// budget is spent, and terminal failed/timeout for non-retryable categories.
pub fn settle(
    job: &mut Job,
    error: Option<&JobError>,
    cfg: &RetryConfig,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> Outcome {
    job.next_retry_at = None;

    let Some(err) = error else {
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.error_message = None;
        job.last_error_traceback = None;
        job.failure_type = None;
        return Outcome::Completed;
    };

    job.failure_type = Some(err.kind());
    job.error_message = Some(err.message().to_string());
    job.last_error_traceback = err.detail().map(str::to_string);
    job.status = if err.kind() == FailureType::TimeoutError {
        JobStatus::Timeout
    } else {
        JobStatus::Failed
    };

    if job.can_retry() {
        job.retry_count += 1;
        let at = cfg.next_retry_at(now, job.retry_count, rng);
        job.status = JobStatus::Retrying;
        job.next_retry_at = Some(at);
        job.completed_at = None;
        return Outcome::Retrying { next_retry_at: at };
    }

    job.completed_at = Some(now);

    if job.retry_count >= job.max_retries {
        job.status = JobStatus::DeadLetter;
        job.dead_letter_reason = Some(format!(
            "max retries ({}) exceeded: {}",
            job.max_retries,
            err.message()
        ));
        job.moved_to_dead_letter_at = Some(now);
        return Outcome::DeadLettered;
    }

    Outcome::Failed(job.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::Payload;
    use sqlx::types::Json;

    fn running(retry_count: i32, max_retries: i32) -> Job {
        Job {
            id: 3,
            job_type: "channel_download".into(),
            payload: Json(Payload::new()),
            status: JobStatus::Running,
            priority: 5,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: None,
            last_error_traceback: None,
            failure_type: None,
            retry_count,
            max_retries,
            next_retry_at: None,
            worker_id: Some("w-0".into()),
            timeout_seconds: None,
            parent_job_id: None,
            dead_letter_reason: None,
            moved_to_dead_letter_at: None,
            log_file_path: None,
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    #[test]
    fn success_completes_and_clears_errors() {
        let mut job = running(1, 3);
        job.error_message = Some("old".into());
        let now = Utc::now();

        let out = settle(&mut job, None, &RetryConfig::default(), now, &mut rng());

        assert_eq!(out, Outcome::Completed);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_at, Some(now));
        assert!(job.error_message.is_none());
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn retryable_failure_schedules_retry() {
        let mut job = running(0, 3);
        let now = Utc::now();
        let err = JobError::network("connection reset");

        let out = settle(&mut job, Some(&err), &RetryConfig::default(), now, &mut rng());

        let Outcome::Retrying { next_retry_at } = out else {
            panic!("expected retry, got {out:?}");
        };
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_count, 1);
        assert!(next_retry_at > now);
        assert!(next_retry_at <= now + chrono::Duration::milliseconds(1_100));
        assert!(job.completed_at.is_none());
        assert_eq!(job.failure_type, Some(FailureType::NetworkError));
    }

    #[test]
    fn exhausted_budget_dead_letters() {
        let mut job = running(3, 3);
        let err = JobError::network("connection reset");

        let out = settle(&mut job, Some(&err), &RetryConfig::default(), Utc::now(), &mut rng());

        assert_eq!(out, Outcome::DeadLettered);
        assert_eq!(job.status, JobStatus::DeadLetter);
        assert!(job.moved_to_dead_letter_at.is_some());
        assert!(job.dead_letter_reason.as_deref().unwrap().contains("max retries (3)"));
    }

    #[test]
    fn non_retryable_with_budget_left_is_terminal_failed() {
        let mut job = running(0, 3);
        let err = JobError::validation("missing field channel_url");

        let out = settle(&mut job, Some(&err), &RetryConfig::default(), Utc::now(), &mut rng());

        assert_eq!(out, Outcome::Failed(JobStatus::Failed));
        assert_eq!(job.retry_count, 0);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn zero_retries_goes_straight_to_dead_letter() {
        let mut job = running(0, 0);
        let err = JobError::validation("bad");

        let out = settle(&mut job, Some(&err), &RetryConfig::default(), Utc::now(), &mut rng());
        assert_eq!(out, Outcome::DeadLettered);
    }

    #[test]
    fn timeouts_retry_until_budget_is_spent() {
        let mut job = running(0, 2);
        let err = JobError::timeout("took too long");
        let out = settle(&mut job, Some(&err), &RetryConfig::default(), Utc::now(), &mut rng());
        assert!(matches!(out, Outcome::Retrying { .. }));

        let mut job = running(2, 2);
        let out = settle(&mut job, Some(&err), &RetryConfig::default(), Utc::now(), &mut rng());
        assert_eq!(out, Outcome::DeadLettered);
        assert_eq!(job.failure_type, Some(FailureType::TimeoutError));
    }
}
