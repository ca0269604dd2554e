//! Per-job output capture.
//!
//! The dispatcher opens a [`CaptureScope`] right before a worker runs and drops
//! it right after, whatever way execution ends (success, error, panic, or the
//! task being aborted on shutdown). The footer is written from `Drop`.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use crate::jobs::model::Job;

/// Host-supplied hook that decides where a job's detailed log goes.
pub trait LogCapture: Send + Sync {
    fn open_capture(&self, job: &Job, worker_id: &str) -> std::io::Result<CaptureScope>;
}

/// Discards job output; lines still go to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCapture;

impl LogCapture for NoCapture {
    fn open_capture(&self, job: &Job, _worker_id: &str) -> std::io::Result<CaptureScope> {
        Ok(CaptureScope::disabled(job.id))
    }
}

/// Appends each attempt of job N to `<dir>/job_<N>_<type>.log`.
///
/// Opening happens on the blocking pool. Lines go through a `BufWriter` and
/// the footer flush runs in `Drop` on the dispatcher thread, so this is sized
/// for short per-job logs, not bulk output.
#[derive(Debug, Clone)]
pub struct FileLogCapture {
    dir: PathBuf,
}

impl FileLogCapture {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, job: &Job) -> PathBuf {
        self.dir
            .join(format!("job_{}_{}.log", job.id, sanitize(&job.job_type)))
    }
}

impl LogCapture for FileLogCapture {
    fn open_capture(&self, job: &Job, worker_id: &str) -> std::io::Result<CaptureScope> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(job);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let scope = CaptureScope {
            job_id: job.id,
            path: Some(path),
            sink: Some(Mutex::new(BufWriter::new(file))),
            started: Instant::now(),
            outcome: Mutex::new(None),
        };
        scope.write_raw(&format!(
            "=== job {} ({}) attempt {} started at {} by {} ===",
            job.id,
            job.job_type,
            job.retry_count + 1,
            Utc::now().to_rfc3339(),
            worker_id
        ));
        Ok(scope)
    }
}

/// Scoped handle to one attempt's log. Workers write through [`CaptureScope::line`].
pub struct CaptureScope {
    job_id: i64,
    path: Option<PathBuf>,
    sink: Option<Mutex<BufWriter<File>>>,
    started: Instant,
    outcome: Mutex<Option<String>>,
}

impl CaptureScope {
    pub fn disabled(job_id: i64) -> Self {
        Self {
            job_id,
            path: None,
            sink: None,
            started: Instant::now(),
            outcome: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn line(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::debug!(job.id = self.job_id, "{msg}");
        self.write_raw(&format!("[{}] {msg}", Utc::now().format("%H:%M:%S%.3f")));
    }

    pub(crate) fn set_outcome(&self, outcome: impl Into<String>) {
        if let Ok(mut slot) = self.outcome.lock() {
            *slot = Some(outcome.into());
        }
    }

    fn write_raw(&self, text: &str) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Ok(mut w) = sink.lock() {
            if let Err(err) = writeln!(w, "{text}") {
                tracing::warn!(job.id = self.job_id, error = %err, "job log write failed");
            }
        }
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .lock()
            .ok()
            .and_then(|mut o| o.take())
            .unwrap_or_else(|| "interrupted".to_string());
        let elapsed = self.started.elapsed();
        self.write_raw(&format!(
            "=== finished: {outcome} after {:.3}s ===",
            elapsed.as_secs_f64()
        ));
        if let Some(sink) = &self.sink {
            if let Ok(mut w) = sink.lock() {
                let _ = w.flush();
            }
        }
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
