use async_trait::async_trait;
use mediaflow::jobs::{
    job_types, FailureType, Job, JobContext, JobError, JobPayload, Worker, WorkerRegistry,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;

// ----------------------------
// Payloads
// ----------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelDownload {
    pub channel_url: String,
    #[serde(default)]
    pub max_items: Option<u32>,
}

impl JobPayload for ChannelDownload {
    const JOB_TYPE: &'static str = job_types::CHANNEL_DOWNLOAD;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlaylistDownload {
    pub playlist_url: String,
    #[serde(default)]
    pub max_items: Option<u32>,
}

impl JobPayload for PlaylistDownload {
    const JOB_TYPE: &'static str = job_types::PLAYLIST_DOWNLOAD;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetadataExtraction {
    pub media_path: String,
}

impl JobPayload for MetadataExtraction {
    const JOB_TYPE: &'static str = job_types::METADATA_EXTRACTION;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThumbnailGeneration {
    pub media_path: String,
    #[serde(default = "default_thumb_width")]
    pub width: u32,
}

fn default_thumb_width() -> u32 {
    320
}

impl JobPayload for ThumbnailGeneration {
    const JOB_TYPE: &'static str = job_types::THUMBNAIL_GENERATION;
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseBackup {
    #[serde(default)]
    pub label: Option<String>,
}

impl JobPayload for DatabaseBackup {
    const JOB_TYPE: &'static str = job_types::DATABASE_BACKUP;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogCleanup {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

fn default_max_age_days() -> u64 {
    14
}

impl JobPayload for LogCleanup {
    const JOB_TYPE: &'static str = job_types::LOG_CLEANUP;
}

// ----------------------------
// Downloads
// ----------------------------

/// Simulated channel/playlist download. At most `limit` run at once across
/// all dispatcher units, the way an external downloader would be throttled.
pub struct DownloadWorker {
    permits: Arc<Semaphore>,
    per_item: Duration,
}

impl DownloadWorker {
    pub fn new(limit: usize, per_item: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max(1))),
            per_item,
        }
    }

    async fn download(&self, url: &str, items: u32, ctx: &JobContext<'_>) -> Result<bool, JobError> {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(JobError::validation(format!("invalid url: {url}")));
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| JobError::new(FailureType::SystemError, "download slots closed"))?;

        ctx.log.line(format!("resolving {url}"));
        if url.contains("unreachable") {
            return Err(JobError::network(format!("unable to download {url}: host unreachable")));
        }

        for n in 1..=items {
            tokio::time::sleep(self.per_item).await;
            ctx.log.line(format!("fetched item {n}/{items}"));
        }
        Ok(true)
    }
}

#[async_trait]
impl Worker for DownloadWorker {
    fn name(&self) -> &str {
        "download"
    }

    fn supported_job_types(&self) -> Vec<&'static str> {
        vec![ChannelDownload::JOB_TYPE, PlaylistDownload::JOB_TYPE]
    }

    async fn execute(&self, job: &Job, ctx: &JobContext<'_>) -> Result<bool, JobError> {
        match job.job_type.as_str() {
            job_types::CHANNEL_DOWNLOAD => {
                let p: ChannelDownload = job.payload_as()?;
                self.download(&p.channel_url, p.max_items.unwrap_or(5), ctx).await
            }
            _ => {
                let p: PlaylistDownload = job.payload_as()?;
                self.download(&p.playlist_url, p.max_items.unwrap_or(5), ctx).await
            }
        }
    }
}

// ----------------------------
// Metadata
// ----------------------------

/// Reads file metadata for a library item and logs what a tagger would store.
pub struct MetadataWorker {
    library_dir: PathBuf,
}

impl MetadataWorker {
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: library_dir.into(),
        }
    }
}

#[async_trait]
impl Worker for MetadataWorker {
    fn name(&self) -> &str {
        "metadata"
    }

    fn supported_job_types(&self) -> Vec<&'static str> {
        vec![MetadataExtraction::JOB_TYPE]
    }

    async fn execute(&self, job: &Job, ctx: &JobContext<'_>) -> Result<bool, JobError> {
        let p: MetadataExtraction = job.payload_as()?;
        let path = self.library_dir.join(&p.media_path);

        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(JobError::validation(format!("{} is not a file", path.display())));
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        let info = serde_json::json!({
            "path": path.display().to_string(),
            "bytes": meta.len(),
            "container": ext,
        });
        ctx.log.line(format!("metadata: {info}"));
        Ok(true)
    }
}

// ----------------------------
// Thumbnails
// ----------------------------

/// Writes a thumbnail descriptor for a library item under `<library>/thumbnails`.
/// A real renderer would write the image next to it.
pub struct ThumbnailWorker {
    library_dir: PathBuf,
}

impl ThumbnailWorker {
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: library_dir.into(),
        }
    }

    async fn render(&self, p: &ThumbnailGeneration) -> Result<PathBuf, JobError> {
        if !(16..=1920).contains(&p.width) {
            return Err(JobError::validation(format!(
                "invalid thumbnail width {}, expected 16..=1920",
                p.width
            )));
        }

        let source = self.library_dir.join(&p.media_path);
        let meta = match tokio::fs::metadata(&source).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => {
                return Err(JobError::validation(format!("{} is not a file", source.display())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::validation(format!("{} does not exist", source.display())))
            }
            Err(e) => return Err(e.into()),
        };

        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("media");
        let out_dir = self.library_dir.join("thumbnails");
        tokio::fs::create_dir_all(&out_dir).await?;
        let target = out_dir.join(format!("{stem}_{}.json", p.width));

        let descriptor = serde_json::json!({
            "source": source.display().to_string(),
            "source_bytes": meta.len(),
            "width": p.width,
        });
        tokio::fs::write(&target, descriptor.to_string()).await?;
        Ok(target)
    }
}

#[async_trait]
impl Worker for ThumbnailWorker {
    fn name(&self) -> &str {
        "thumbnail"
    }

    fn supported_job_types(&self) -> Vec<&'static str> {
        vec![ThumbnailGeneration::JOB_TYPE]
    }

    async fn execute(&self, job: &Job, ctx: &JobContext<'_>) -> Result<bool, JobError> {
        let p: ThumbnailGeneration = job.payload_as()?;
        ctx.log.line(format!("thumbnail for {} at {}px", p.media_path, p.width));
        let target = self.render(&p).await?;
        ctx.log.line(format!("wrote {}", target.display()));
        Ok(true)
    }
}

// ----------------------------
// Backup
// ----------------------------

/// Snapshots the library database with `VACUUM INTO`.
pub struct BackupWorker {
    pool: SqlitePool,
    backup_dir: PathBuf,
}

impl BackupWorker {
    pub fn new(pool: SqlitePool, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            backup_dir: backup_dir.into(),
        }
    }
}

#[async_trait]
impl Worker for BackupWorker {
    fn name(&self) -> &str {
        "backup"
    }

    fn supported_job_types(&self) -> Vec<&'static str> {
        vec![DatabaseBackup::JOB_TYPE]
    }

    async fn execute(&self, job: &Job, ctx: &JobContext<'_>) -> Result<bool, JobError> {
        let p: DatabaseBackup = job.payload_as()?;
        tokio::fs::create_dir_all(&self.backup_dir).await?;

        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let name = match p.label.as_deref() {
            Some(label) => format!("mediaflow-{stamp}-{label}.db"),
            None => format!("mediaflow-{stamp}.db"),
        };
        let target = self.backup_dir.join(name);
        ctx.log.line(format!("writing backup to {}", target.display()));

        vacuum_into(&self.pool, &target).await?;

        let bytes = tokio::fs::metadata(&target).await?.len();
        ctx.log.line(format!("backup done, {bytes} bytes"));
        Ok(true)
    }
}

async fn vacuum_into(pool: &SqlitePool, target: &Path) -> Result<(), JobError> {
    sqlx::query("VACUUM INTO ?1")
        .bind(target.display().to_string())
        .execute(pool)
        .await
        .map_err(|e| {
            let detail = format!("VACUUM INTO {} failed: {e:?}", target.display());
            JobError::from_error(e.into()).with_detail(detail)
        })?;
    Ok(())
}

// ----------------------------
// Log cleanup
// ----------------------------

/// Deletes per-job log files older than `max_age_days`.
pub struct CleanupWorker {
    log_dir: Option<PathBuf>,
}

impl CleanupWorker {
    pub fn new(log_dir: Option<PathBuf>) -> Self {
        Self { log_dir }
    }
}

#[async_trait]
impl Worker for CleanupWorker {
    fn name(&self) -> &str {
        "cleanup"
    }

    fn supported_job_types(&self) -> Vec<&'static str> {
        vec![LogCleanup::JOB_TYPE]
    }

    async fn execute(&self, job: &Job, ctx: &JobContext<'_>) -> Result<bool, JobError> {
        let p: LogCleanup = job.payload_as()?;
        let Some(dir) = &self.log_dir else {
            return Err(JobError::configuration("log cleanup needs MEDIAFLOW_LOG_DIR"));
        };

        let max_age = Duration::from_secs(p.max_age_days * 24 * 60 * 60);
        let removed = remove_old_logs(dir, max_age).await?;
        ctx.log.line(format!("removed {removed} job log(s) older than {}d", p.max_age_days));
        Ok(true)
    }
}

async fn remove_old_logs(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with("job_") && name.ends_with(".log")) {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        if now.duration_since(modified).unwrap_or_default() > max_age {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn build_registry(pool: SqlitePool, backup_dir: PathBuf, log_dir: Option<PathBuf>) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();

    // Demo workers. Replace these with real media tooling.
    registry
        .register(DownloadWorker::new(2, Duration::from_millis(300)))
        .register(MetadataWorker::new("."))
        .register(ThumbnailWorker::new("."))
        .register(BackupWorker::new(pool, backup_dir))
        .register(CleanupWorker::new(log_dir));

    registry
}
