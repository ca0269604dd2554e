mod common;

use common::{recorder, setup_db, test_config, wait_for_status, SleepWorker};

use mediaflow::jobs::{JobStatus, Payload, WorkerRegistry};
use mediaflow::{QueueError, QueueService, SubmitOptions};
use std::time::{Duration, Instant};

fn sleeping_service(pool: sqlx::SqlitePool, sleep: Duration) -> QueueService {
    let mut registry = WorkerRegistry::new();
    registry.register(SleepWorker::new("database_backup", sleep));
    QueueService::start(pool, test_config(2), registry)
}

#[tokio::test]
async fn shutdown_cancels_job_still_running_after_grace_period() {
    let db = setup_db().await;
    let repo = db.repo();
    let service = sleeping_service(db.pool.clone(), Duration::from_secs(5));

    let (cb_calls, cb) = recorder();
    let id = service
        .submit("database_backup", Payload::new(), SubmitOptions::new().on_complete(cb))
        .await
        .unwrap();
    wait_for_status(&repo, id, JobStatus::Running).await;

    let started = Instant::now();
    service.shutdown(Duration::from_secs(1)).await.unwrap();
    let took = started.elapsed();

    assert!(took >= Duration::from_secs(1), "returned before the grace period: {took:?}");
    assert!(took < Duration::from_secs(4), "waited for the worker: {took:?}");

    let job = repo.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_message.as_deref(), Some("cancelled: service shutdown"));
    assert!(job.completed_at.is_some());

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.running_jobs, 0);
    assert_eq!(stats.workers_busy, 0);
    assert_eq!(stats.totals.cancelled, 1);

    assert_eq!(
        *cb_calls.lock().unwrap(),
        vec![(id, false, Some("cancelled: service shutdown".to_string()))]
    );
}

#[tokio::test]
async fn shutdown_lets_short_jobs_finish() {
    let db = setup_db().await;
    let repo = db.repo();
    let service = sleeping_service(db.pool.clone(), Duration::from_millis(300));

    let id = service
        .submit("database_backup", Payload::new(), SubmitOptions::new())
        .await
        .unwrap();
    wait_for_status(&repo, id, JobStatus::Running).await;

    service.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(
        repo.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn no_submissions_or_claims_after_shutdown() {
    let db = setup_db().await;
    let repo = db.repo();
    let service = sleeping_service(db.pool.clone(), Duration::from_millis(10));

    service.shutdown(Duration::from_secs(1)).await.unwrap();
    // second call is a no-op
    service.shutdown(Duration::from_secs(1)).await.unwrap();

    let err = service
        .submit("database_backup", Payload::new(), SubmitOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::ShuttingDown));

    // rows written behind the service's back stay pending: nothing is polling
    let id = common::insert_job(&repo, "database_backup", 5).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(repo.get_job(id).await.unwrap().unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn shutdown_cancels_claims_the_service_never_tracked() {
    let db = setup_db().await;
    let repo = db.repo();

    // A claim committed under our unit id whose dispatcher died before tracking it,
    // and one belonging to another process.
    let orphan = common::insert_job(&repo, "database_backup", 5).await;
    let foreign = common::insert_job(&repo, "database_backup", 5).await;
    assert_eq!(repo.claim_next("test-0").await.unwrap().unwrap().id, orphan);
    assert_eq!(repo.claim_next("elsewhere-0").await.unwrap().unwrap().id, foreign);

    let service = sleeping_service(db.pool.clone(), Duration::from_millis(10));
    service.shutdown(Duration::from_secs(1)).await.unwrap();

    let job = repo.get_job(orphan).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.error_message.as_deref(), Some("cancelled: service shutdown"));
    assert_eq!(
        repo.get_job(foreign).await.unwrap().unwrap().status,
        JobStatus::Running
    );
    assert_eq!(service.stats().await.unwrap().totals.cancelled, 1);
}
