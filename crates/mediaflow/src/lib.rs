pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod service;

pub use error::{QueueError, Result};
pub use service::{QueueService, QueueStats, SubmitOptions};
