use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

use crate::jobs::runner::Outcome;

/// One-shot completion callback: `(job_id, success, error_message)`.
pub type JobCallback = Box<dyn FnOnce(i64, bool, Option<String>) + Send + 'static>;

/// Counters since the service started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone)]
pub struct RunningJob {
    pub job_type: String,
    pub unit: String,
}

#[derive(Default)]
struct Inner {
    accepting: bool,
    callbacks: HashMap<i64, JobCallback>,
    running: HashMap<i64, RunningJob>,
    units: usize,
    totals: Totals,
    tasks: Vec<JoinHandle<()>>,
}

/// In-memory bookkeeping for one service instance, behind a single mutex.
///
/// The lock is never held across an `.await`, and callbacks are handed out
/// to be run by the caller after the guard is gone.
#[derive(Default)]
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    pub fn new(units: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                accepting: true,
                units,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Stop accepting work. Returns false if this was already done.
    pub fn stop_accepting(&self) -> bool {
        std::mem::replace(&mut self.lock().accepting, false)
    }

    pub fn register_submission(&self, job_id: i64, callback: Option<JobCallback>) {
        let mut inner = self.lock();
        inner.totals.submitted += 1;
        if let Some(cb) = callback {
            inner.callbacks.insert(job_id, cb);
        }
    }

    pub fn forget_submission(&self, job_id: i64) {
        let mut inner = self.lock();
        inner.totals.submitted = inner.totals.submitted.saturating_sub(1);
        inner.callbacks.remove(&job_id);
    }

    pub fn take_callback(&self, job_id: i64) -> Option<JobCallback> {
        self.lock().callbacks.remove(&job_id)
    }

    pub fn start_job(&self, job_id: i64, unit: &str, job_type: &str) {
        self.lock().running.insert(
            job_id,
            RunningJob {
                job_type: job_type.to_string(),
                unit: unit.to_string(),
            },
        );
    }

    /// Remove the job from the running map, count its outcome and hand back its callback.
    pub fn finish_job(&self, job_id: i64, outcome: Option<Outcome>) -> Option<JobCallback> {
        let mut inner = self.lock();
        inner.running.remove(&job_id);
        match outcome {
            Some(Outcome::Completed) => inner.totals.completed += 1,
            Some(Outcome::Retrying { .. }) => inner.totals.retried += 1,
            Some(Outcome::DeadLettered) => inner.totals.dead_lettered += 1,
            Some(Outcome::Failed(_)) => inner.totals.failed += 1,
            None => {}
        }
        inner.callbacks.remove(&job_id)
    }

    pub fn count_cancelled(&self, n: u64) {
        self.lock().totals.cancelled += n;
    }

    pub fn count_failed(&self, n: u64) {
        self.lock().totals.failed += n;
    }

    pub fn running_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock().running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn running(&self) -> HashMap<i64, RunningJob> {
        self.lock().running.clone()
    }

    /// (busy, idle) dispatcher units.
    pub fn unit_load(&self) -> (usize, usize) {
        let inner = self.lock();
        let busy = inner.running.len().min(inner.units);
        (busy, inner.units - busy)
    }

    pub fn totals(&self) -> Totals {
        self.lock().totals
    }

    pub fn add_task(&self, handle: JoinHandle<()>) {
        self.lock().tasks.push(handle);
    }

    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.lock().tasks)
    }
}

/// Run a completion callback, containing any panic it raises.
pub fn fire_callback(cb: JobCallback, job_id: i64, success: bool, error_message: Option<String>) {
    let res = std::panic::catch_unwind(AssertUnwindSafe(move || cb(job_id, success, error_message)));
    if res.is_err() {
        tracing::error!(job.id = job_id, "completion callback panicked");
    }
}
