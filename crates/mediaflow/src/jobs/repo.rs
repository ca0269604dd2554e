// crates/mediaflow/src/jobs/repo.rs

use crate::db::retry_transient;
use crate::error::{QueueError, Result};
use crate::jobs::model::{Job, JobStatus, NewJob, MAX_PRIORITY, MAX_TIMEOUT_SECONDS, MIN_PRIORITY};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqliteExecutor, SqlitePool};

/// Optional filters for list/count queries.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            job_type: None,
        }
    }

    pub fn job_type(job_type: impl Into<String>) -> Self {
        Self {
            status: None,
            job_type: Some(job_type.into()),
        }
    }
}

#[derive(Clone)]
pub struct JobsRepo {
    pool: SqlitePool,
}

impl JobsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ----------------------------
    // Insert
    // ----------------------------

    pub async fn insert(&self, job: &NewJob) -> Result<i64> {
        let pool = &self.pool;
        retry_transient("insert", move || insert_job(pool, job, Utc::now())).await
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM job_queue WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Newest first. `limit` is clamped to [1, 500].
    pub async fn list_jobs(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM job_queue");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit.clamp(1, 500))
            .push(" OFFSET ")
            .push_bind(offset.max(0));

        let rows = qb.build_query_as::<Job>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn count_jobs(&self, filter: &JobFilter) -> Result<i64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM job_queue");
        push_filter(&mut qb, filter);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    pub async fn list_running(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM job_queue
            WHERE status = 'running'
            ORDER BY started_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn status_counts(&self) -> Result<Vec<(JobStatus, i64)>> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM job_queue GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn type_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT job_type, COUNT(*) FROM job_queue GROUP BY job_type ORDER BY job_type",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ----------------------------
    // Claiming
    // ----------------------------

    /// Claim the next eligible job for `worker_id`.
    ///
    /// Eligible: pending, or retrying whose `next_retry_at` has passed (or is unset).
    /// Order: priority DESC, then FIFO. Selection and the flip to `running` happen
    /// in one statement, so two claimers can never get the same row.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        retry_transient("claim_next", move || self.claim_once(worker_id)).await
    }

    async fn claim_once(&self, worker_id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE job_queue
            SET status = 'running',
                started_at = ?1,
                worker_id = ?2,
                next_retry_at = NULL
            WHERE id = (
                SELECT id
                FROM job_queue
                WHERE status = 'pending'
                   OR (status = 'retrying'
                       AND (next_retry_at IS NULL OR next_retry_at <= ?1))
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(Utc::now())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    /// Persist the whole post-execution state of a claimed job in one write.
    ///
    /// Guarded by `status = 'running'` and the owning `worker_id`: returns false
    /// when the row has meanwhile become a zombie or was cancelled by shutdown.
    pub async fn update_terminal_or_retry(&self, job: &Job) -> Result<bool> {
        retry_transient("update_terminal_or_retry", move || async move {
            let res = sqlx::query(
                r#"
                UPDATE job_queue
                SET status = ?1,
                    completed_at = ?2,
                    error_message = ?3,
                    last_error_traceback = ?4,
                    failure_type = ?5,
                    retry_count = ?6,
                    next_retry_at = ?7,
                    dead_letter_reason = ?8,
                    moved_to_dead_letter_at = ?9,
                    log_file_path = ?10
                WHERE id = ?11
                  AND status = 'running'
                  AND worker_id IS ?12
                "#,
            )
            .bind(job.status)
            .bind(job.completed_at)
            .bind(&job.error_message)
            .bind(&job.last_error_traceback)
            .bind(job.failure_type)
            .bind(job.retry_count)
            .bind(job.next_retry_at)
            .bind(&job.dead_letter_reason)
            .bind(job.moved_to_dead_letter_at)
            .bind(&job.log_file_path)
            .bind(job.id)
            .bind(&job.worker_id)
            .execute(&self.pool)
            .await?;

            Ok(res.rows_affected() == 1)
        })
        .await
    }

    /// pending/retrying -> cancelled. Running and terminal jobs are left alone.
    pub async fn cancel(&self, job_id: i64) -> Result<bool> {
        retry_transient("cancel", move || async move {
            let res = sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'cancelled',
                    completed_at = ?2,
                    next_retry_at = NULL,
                    error_message = 'cancelled by request'
                WHERE id = ?1
                  AND status IN ('pending', 'retrying')
                "#,
            )
            .bind(job_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

            Ok(res.rows_affected() == 1)
        })
        .await
    }

    /// running -> cancelled for every row claimed by one of `worker_ids`.
    /// Used on shutdown once those workers have stopped. Returns the ids that moved.
    pub async fn cancel_running_owned_by(&self, worker_ids: &[String], reason: &str) -> Result<Vec<i64>> {
        if worker_ids.is_empty() {
            return Ok(Vec::new());
        }

        retry_transient("cancel_running_owned_by", move || async move {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE job_queue SET status = 'cancelled', completed_at = ");
            qb.push_bind(Utc::now())
                .push(", error_message = ")
                .push_bind(reason)
                .push(" WHERE status = 'running' AND worker_id IN (");
            let mut ids = qb.separated(", ");
            for w in worker_ids {
                ids.push_bind(w.as_str());
            }
            qb.push(") RETURNING id");

            let cancelled = qb.build_query_scalar::<i64>().fetch_all(&self.pool).await?;
            Ok(cancelled)
        })
        .await
    }

    pub async fn mark_zombie(&self, job_id: i64, error_message: &str) -> Result<bool> {
        retry_transient("mark_zombie", move || async move {
            let res = sqlx::query(
                r#"
                UPDATE job_queue
                SET status = 'zombie',
                    error_message = ?2,
                    failure_type = 'timeout_error'
                WHERE id = ?1
                  AND status = 'running'
                "#,
            )
            .bind(job_id)
            .bind(error_message)
            .execute(&self.pool)
            .await?;

            Ok(res.rows_affected() == 1)
        })
        .await
    }

    /// zombie -> failed for every zombie row. Returns the ids that moved.
    pub async fn force_kill_zombies(&self) -> Result<Vec<i64>> {
        retry_transient("force_kill_zombies", move || async move {
            let ids: Vec<i64> = sqlx::query_scalar(
                r#"
                UPDATE job_queue
                SET status = 'failed',
                    completed_at = ?1,
                    error_message = COALESCE(error_message, 'zombie') || ' (force-killed)'
                WHERE status = 'zombie'
                RETURNING id
                "#,
            )
            .bind(Utc::now())
            .fetch_all(&self.pool)
            .await?;

            Ok(ids)
        })
        .await
    }

    // ----------------------------
    // Replay
    // ----------------------------

    /// Submit a fresh copy of a finished job. The copy points at its source via
    /// `parent_job_id`; the source row is never touched.
    pub async fn replay_job(&self, job_id: i64) -> Result<i64> {
        let src = self
            .get_job(job_id)
            .await?
            .ok_or(QueueError::UnknownJob(job_id))?;

        if !src.is_terminal() {
            return Err(QueueError::InvalidState {
                id: job_id,
                status: src.status.to_string(),
                action: "replayed",
            });
        }

        let Json(payload) = src.payload;
        self.insert(&NewJob {
            job_type: src.job_type,
            payload,
            priority: src.priority,
            max_retries: src.max_retries,
            timeout_seconds: src.timeout_seconds,
            parent_job_id: Some(src.id),
        })
        .await
    }
}

/// Insert a pending job through any executor (pool, connection or open transaction).
pub async fn insert_job<'e, E>(exec: E, job: &NewJob, now: DateTime<Utc>) -> Result<i64>
where
    E: SqliteExecutor<'e>,
{
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&job.priority) {
        return Err(QueueError::InvalidPriority(job.priority));
    }
    if job.max_retries < 0 {
        return Err(QueueError::InvalidPayload(format!(
            "max_retries must be >= 0, got {}",
            job.max_retries
        )));
    }
    if let Some(t) = job.timeout_seconds {
        if !(1..=MAX_TIMEOUT_SECONDS).contains(&t) {
            return Err(QueueError::InvalidPayload(format!(
                "timeout_seconds must be in 1..={MAX_TIMEOUT_SECONDS}, got {t}"
            )));
        }
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO job_queue (
            job_type, job_data, status, priority, created_at,
            retry_count, max_retries, timeout_seconds, parent_job_id
        )
        VALUES (?1, ?2, 'pending', ?3, ?4, 0, ?5, ?6, ?7)
        RETURNING id
        "#,
    )
    .bind(&job.job_type)
    .bind(Json(&job.payload))
    .bind(job.priority)
    .bind(now)
    .bind(job.max_retries)
    .bind(job.timeout_seconds)
    .bind(job.parent_job_id)
    .fetch_one(exec)
    .await?;

    Ok(id)
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &JobFilter) {
    let mut sep = " WHERE ";
    if let Some(status) = filter.status {
        qb.push(sep).push("status = ").push_bind(status);
        sep = " AND ";
    }
    if let Some(job_type) = &filter.job_type {
        qb.push(sep).push("job_type = ").push_bind(job_type.clone());
    }
}
