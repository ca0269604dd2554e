mod common;

use common::{insert_job, setup_db, test_config, SleepWorker};

use chrono::{Duration as ChronoDuration, Utc};
use mediaflow::jobs::{JobStatus, WorkerRegistry};
use mediaflow::QueueService;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn claim_orders_by_priority_then_fifo() {
    let db = setup_db().await;
    let repo = db.repo();

    let low = insert_job(&repo, "t", 0).await;
    let high_a = insert_job(&repo, "t", 10).await;
    let normal = insert_job(&repo, "t", 5).await;
    let high_b = insert_job(&repo, "t", 10).await;

    let mut order = Vec::new();
    while let Some(job) = repo.claim_next("w").await.unwrap() {
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.worker_id.as_deref(), Some("w"));
        assert!(job.started_at.is_some());
        order.push(job.id);
    }

    assert_eq!(order, vec![high_a, high_b, normal, low]);
}

#[tokio::test]
async fn retrying_job_waits_for_next_retry_at() {
    let db = setup_db().await;
    let repo = db.repo();
    let id = insert_job(&repo, "t", 5).await;

    sqlx::query("UPDATE job_queue SET status = 'retrying', retry_count = 1, next_retry_at = ?2 WHERE id = ?1")
        .bind(id)
        .bind(Utc::now() + ChronoDuration::seconds(60))
        .execute(&db.pool)
        .await
        .unwrap();

    assert!(repo.claim_next("w").await.unwrap().is_none());

    sqlx::query("UPDATE job_queue SET next_retry_at = ?2 WHERE id = ?1")
        .bind(id)
        .bind(Utc::now() - ChronoDuration::seconds(1))
        .execute(&db.pool)
        .await
        .unwrap();

    let job = repo.claim_next("w").await.unwrap().expect("due retry should be claimable");
    assert_eq!(job.id, id);
    assert_eq!(job.retry_count, 1);
    assert!(job.next_retry_at.is_none());
}

#[tokio::test]
async fn terminal_and_running_jobs_are_never_claimed() {
    let db = setup_db().await;
    let repo = db.repo();
    let id = insert_job(&repo, "t", 5).await;

    for status in ["completed", "failed", "cancelled", "timeout", "dead_letter", "zombie", "running"] {
        sqlx::query("UPDATE job_queue SET status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status)
            .execute(&db.pool)
            .await
            .unwrap();
        assert!(repo.claim_next("w").await.unwrap().is_none(), "{status} was claimed");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_job() {
    let db = setup_db().await;
    let repo = db.repo();

    const JOBS: usize = 40;
    for i in 0..JOBS {
        insert_job(&repo, "t", (i % 3) as i32 * 5).await;
    }

    let mut tasks = Vec::new();
    for n in 0..4 {
        let repo = repo.clone();
        tasks.push(tokio::spawn(async move {
            let me = format!("claimer-{n}");
            let mut mine = Vec::new();
            while let Some(job) = repo.claim_next(&me).await.unwrap() {
                assert_eq!(job.worker_id.as_deref(), Some(me.as_str()));
                mine.push(job.id);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for t in tasks {
        all.extend(t.await.unwrap());
    }

    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), JOBS, "every job claimed exactly once");
    assert_eq!(unique.len(), JOBS);
}

#[tokio::test]
async fn single_dispatcher_runs_higher_priority_first() {
    let db = setup_db().await;
    let repo = db.repo();

    let p5 = insert_job(&repo, "media_scan", 5).await;
    let p10 = insert_job(&repo, "media_scan", 10).await;

    let worker = SleepWorker::new("media_scan", Duration::from_millis(10));
    let started = worker.started.clone();
    let mut registry = WorkerRegistry::new();
    registry.register(worker);

    let service = QueueService::start(db.pool.clone(), test_config(1), registry);
    common::wait_for_status(&repo, p5, JobStatus::Completed).await;
    service.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(*started.lock().unwrap(), vec![p10, p5]);
}
