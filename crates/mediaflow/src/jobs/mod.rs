pub mod defaults;
pub mod dispatcher;
pub mod failure;
pub mod job_logging;
pub mod model;
pub mod payload;
pub mod reaper;
pub mod registry;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod state;

pub use defaults::{job_types, DefaultsTable, JobDefaults};
pub use failure::{classify_failure, classify_message, FailureType};
pub use job_logging::{CaptureScope, FileLogCapture, LogCapture, NoCapture};
pub use model::{Job, JobStatus, NewJob, Payload, Priority};
pub use payload::JobPayload;
pub use reaper::ZombieReaper;
pub use registry::{JobContext, JobError, Worker, WorkerRegistry};
pub use repo::{JobFilter, JobsRepo};
pub use retry::RetryConfig;
pub use runner::{JobRunner, Outcome};
