use std::collections::HashMap;

use crate::jobs::model::Priority;

/// Job type names used by the media library.
pub mod job_types {
    pub const CHANNEL_DOWNLOAD: &str = "channel_download";
    pub const PLAYLIST_DOWNLOAD: &str = "playlist_download";
    pub const METADATA_EXTRACTION: &str = "metadata_extraction";
    pub const THUMBNAIL_GENERATION: &str = "thumbnail_generation";
    pub const DATABASE_BACKUP: &str = "database_backup";
    pub const LOG_CLEANUP: &str = "log_cleanup";
}

/// Submission defaults for one job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    pub priority: i32,
    pub max_retries: i32,
    pub timeout_seconds: Option<i64>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            priority: Priority::Normal.value(),
            max_retries: 3,
            timeout_seconds: None,
        }
    }
}

/// Host-supplied lookup table consulted by `submit` for options the caller left unset.
#[derive(Debug, Clone, Default)]
pub struct DefaultsTable {
    by_type: HashMap<String, JobDefaults>,
}

impl DefaultsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, job_type: &str, defaults: JobDefaults) -> Self {
        self.set(job_type, defaults);
        self
    }

    pub fn set(&mut self, job_type: &str, defaults: JobDefaults) {
        self.by_type.insert(job_type.to_string(), defaults);
    }

    pub fn get(&self, job_type: &str) -> JobDefaults {
        self.by_type.get(job_type).copied().unwrap_or_default()
    }

    /// Defaults for the media library job types.
    pub fn media_library() -> Self {
        use job_types::*;

        let download = JobDefaults {
            priority: Priority::Normal.value(),
            max_retries: 3,
            timeout_seconds: Some(60 * 60),
        };

        Self::new()
            .with(CHANNEL_DOWNLOAD, download)
            .with(PLAYLIST_DOWNLOAD, download)
            .with(
                METADATA_EXTRACTION,
                JobDefaults {
                    priority: Priority::Normal.value(),
                    max_retries: 3,
                    timeout_seconds: Some(10 * 60),
                },
            )
            .with(
                THUMBNAIL_GENERATION,
                JobDefaults {
                    priority: Priority::Low.value(),
                    max_retries: 2,
                    timeout_seconds: Some(5 * 60),
                },
            )
            .with(
                DATABASE_BACKUP,
                JobDefaults {
                    priority: Priority::Urgent.value(),
                    max_retries: 2,
                    timeout_seconds: Some(20 * 60),
                },
            )
            .with(
                LOG_CLEANUP,
                JobDefaults {
                    priority: Priority::Low.value(),
                    max_retries: 1,
                    timeout_seconds: Some(30 * 60),
                },
            )
    }
}
