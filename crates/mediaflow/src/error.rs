//! Error types for the queue core.
//!
//! Worker-side failures are not represented here: they are captured as
//! [`crate::jobs::registry::JobError`] at the supervision boundary and only
//! ever surface through the persisted `error_message` / `failure_type` fields.

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("priority {0} is outside 0..=20")]
    InvalidPriority(i32),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("job {0} not found")]
    UnknownJob(i64),

    #[error("job {id} is {status} and cannot be {action}")]
    InvalidState {
        id: i64,
        status: String,
        action: &'static str,
    },

    #[error("queue service is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

impl QueueError {
    /// Lock/busy-type store failures that are worth retrying on the spot.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Database(err) => is_transient_sqlx(err),
            _ => false,
        }
    }
}

pub(crate) fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            // SQLite reports extended result codes; the primary code is the low byte.
            // 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED
            let primary = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            if matches!(primary, Some(5) | Some(6)) {
                return true;
            }
            let msg = db.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}
