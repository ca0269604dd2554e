use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::str::FromStr;

/// Why a job attempt failed. Decides whether the job may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    NetworkError,
    TimeoutError,
    ResourceError,
    PermissionError,
    ConfigurationError,
    ValidationError,
    SystemError,
    WorkerError,
    Unknown,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "network_error",
            Self::TimeoutError => "timeout_error",
            Self::ResourceError => "resource_error",
            Self::PermissionError => "permission_error",
            Self::ConfigurationError => "configuration_error",
            Self::ValidationError => "validation_error",
            Self::SystemError => "system_error",
            Self::WorkerError => "worker_error",
            Self::Unknown => "unknown",
        }
    }

    /// Configuration, validation and permission failures mean the job as
    /// submitted can never succeed, whatever budget is left.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ConfigurationError | Self::ValidationError | Self::PermissionError
        )
    }

    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::NetworkError => {
                "Retry later. Check connectivity, upstream availability and rate limits."
            }
            Self::TimeoutError => {
                "Raise timeout_seconds or split the work. Check for hung external processes."
            }
            Self::ResourceError => "Free disk space or memory, then replay the job.",
            Self::PermissionError => {
                "Non-retryable. Fix file ownership or credentials, then replay the job."
            }
            Self::ConfigurationError => {
                "Non-retryable. Fix host configuration or register a worker for this job type."
            }
            Self::ValidationError => {
                "Non-retryable. Validate the payload at the producer and resubmit."
            }
            Self::SystemError => "Investigate the worker host; look at the job log and traceback.",
            Self::WorkerError => "Worker reported failure without detail. Read the job log.",
            Self::Unknown => "Inspect error_message and logs; add a classification once understood.",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FailureType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "network_error" => Ok(Self::NetworkError),
            "timeout_error" => Ok(Self::TimeoutError),
            "resource_error" => Ok(Self::ResourceError),
            "permission_error" => Ok(Self::PermissionError),
            "configuration_error" => Ok(Self::ConfigurationError),
            "validation_error" => Ok(Self::ValidationError),
            "system_error" => Ok(Self::SystemError),
            "worker_error" => Ok(Self::WorkerError),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown failure type: {other}")),
        }
    }
}

// Order matters: network and timeout win over the generic groups below them.
const KEYWORDS: &[(FailureType, &[&str])] = &[
    (
        FailureType::NetworkError,
        &[
            "network",
            "connection",
            "dns",
            "name resolution",
            "unreachable",
            "socket",
            "ssl",
            "tls",
            "http error",
            "reset by peer",
            "unable to download",
        ],
    ),
    (
        FailureType::TimeoutError,
        &["timeout", "timed out", "deadline exceeded"],
    ),
    (
        FailureType::ResourceError,
        &[
            "no space",
            "disk full",
            "out of memory",
            "memory",
            "quota",
            "too many open files",
        ],
    ),
    (
        FailureType::PermissionError,
        &[
            "permission denied",
            "access denied",
            "forbidden",
            "unauthorized",
            "not permitted",
        ],
    ),
    (
        FailureType::ConfigurationError,
        &[
            "configuration",
            "config",
            "not configured",
            "no worker registered",
            "missing setting",
        ],
    ),
    (
        FailureType::ValidationError,
        &[
            "validation",
            "invalid",
            "malformed",
            "missing field",
            "unknown variant",
            "parse",
        ],
    ),
    (
        FailureType::SystemError,
        &["os error", "system", "panicked", "broken pipe", "killed"],
    ),
];

/// Classify a free-form error message. Unmatched messages are `Unknown`.
pub fn classify_message(message: &str) -> FailureType {
    let msg = message.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| msg.contains(w)))
        .map(|(ft, _)| *ft)
        .unwrap_or(FailureType::Unknown)
}

/// Classify a caught error: typed causes in the chain first (I/O kinds,
/// elapsed timers, JSON decoding), then the rendered message.
pub fn classify_failure(err: &anyhow::Error) -> FailureType {
    for cause in err.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if let Some(ft) = classify_io_kind(io.kind()) {
                return ft;
            }
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return FailureType::TimeoutError;
        }
        if cause.is::<serde_json::Error>() {
            return FailureType::ValidationError;
        }
    }
    classify_message(&format!("{err:#}"))
}

fn classify_io_kind(kind: ErrorKind) -> Option<FailureType> {
    match kind {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable => Some(FailureType::NetworkError),
        ErrorKind::TimedOut => Some(FailureType::TimeoutError),
        ErrorKind::PermissionDenied => Some(FailureType::PermissionError),
        ErrorKind::OutOfMemory => Some(FailureType::ResourceError),
        ErrorKind::InvalidInput | ErrorKind::InvalidData => Some(FailureType::ValidationError),
        _ => None,
    }
}
