use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::Json;
use std::fmt;
use std::str::FromStr;

use crate::jobs::failure::FailureType;

/// Opaque job payload: an ordered JSON object only the matching worker interprets.
pub type Payload = Map<String, Value>;

pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = 20;
/// Longest per-job timeout accepted at submission: one year.
pub const MAX_TIMEOUT_SECONDS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Job {
    pub id: i64,
    pub job_type: String,
    #[sqlx(rename = "job_data")]
    pub payload: Json<Payload>,
    pub status: JobStatus,
    pub priority: i32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
    pub last_error_traceback: Option<String>,
    pub failure_type: Option<FailureType>,

    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,

    pub worker_id: Option<String>,
    pub timeout_seconds: Option<i64>,
    pub parent_job_id: Option<i64>,

    pub dead_letter_reason: Option<String>,
    pub moved_to_dead_letter_at: Option<DateTime<Utc>>,

    pub log_file_path: Option<String>,
}

impl Job {
    /// A failed (or timed out) job may be retried while budget remains and the
    /// failure is not one that resubmission can never fix.
    pub fn can_retry(&self) -> bool {
        matches!(self.status, JobStatus::Failed | JobStatus::Timeout)
            && self.retry_count < self.max_retries
            && self.failure_type.map_or(true, |f| f.is_retryable())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time spent since the job was claimed, if it has been.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at.map(|started| now - started)
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Payload,
    pub priority: i32,
    pub max_retries: i32,
    pub timeout_seconds: Option<i64>,
    pub parent_job_id: Option<i64>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: Priority::Normal.value(),
            max_retries: 3,
            timeout_seconds: None,
            parent_job_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Retrying,
    DeadLetter,
    Zombie,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Timeout,
        JobStatus::Retrying,
        JobStatus::DeadLetter,
        JobStatus::Zombie,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
            JobStatus::Retrying => "retrying",
            JobStatus::DeadLetter => "dead_letter",
            JobStatus::Zombie => "zombie",
        }
    }

    /// States the queue never moves a job out of on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Cancelled
                | JobStatus::Timeout
                | JobStatus::DeadLetter
        )
    }

    /// Only these can still be cancelled from the store layer.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Named priority bands on the 0..=20 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Priority {
    pub fn value(self) -> i32 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 5,
            Priority::High => 10,
            Priority::Urgent => 15,
            Priority::Critical => 20,
        }
    }
}

impl From<Priority> for i32 {
    fn from(p: Priority) -> i32 {
        p.value()
    }
}
