#![cfg(feature = "sqlite")]

//! SqliteStore against a real database

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use encore::config::WorkerConfig;
use encore::models::{Job, JobStatus, LogEntry, LogLevel, Priority, QueueDescriptor};
use encore::queue::{JobOptions, QueueManager};
use encore::store::{JobStore, LogSink, SqliteStore};
use serde_json::json;
use uuid::Uuid;

async fn fresh_store() -> SqliteStore {
    let store = SqliteStore::in_memory().await.unwrap();
    store.migrate().await.unwrap();
    store
}

#[tokio::test]
async fn test_job_roundtrip_preserves_fields() {
    let store = fresh_store().await;

    let job = Job::new("artist-import", "artist.import", json!({"artist_id": "a1", "deep": {"n": 3}}))
        .with_priority(Priority::High)
        .with_max_attempts(5)
        .with_subject("artist-a1")
        .with_schedule(Utc::now() + chrono::Duration::minutes(1));
    store.insert_job(&job).await.unwrap();

    let fetched = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.queue_name, "artist-import");
    assert_eq!(fetched.job_type, "artist.import");
    assert_eq!(fetched.priority, Priority::High);
    assert_eq!(fetched.payload["deep"]["n"], 3);
    assert_eq!(fetched.max_attempts, 5);
    assert_eq!(fetched.subject_id.as_deref(), Some("artist-a1"));
    assert!(fetched.scheduled_for.is_some());
    assert_eq!(fetched.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_claim_orders_and_leases() {
    let store = fresh_store().await;

    let low = Job::new("q", "t", json!({})).with_priority(Priority::Low);
    let normal = Job::new("q", "t", json!({}));
    let critical = Job::new("q", "t", json!({})).with_priority(Priority::Critical);
    for job in [&low, &normal, &critical] {
        store.insert_job(job).await.unwrap();
    }

    let claimed = store.claim_jobs("q", "w1", 2, 60).await.unwrap();
    let ids: Vec<Uuid> = claimed.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![critical.id, normal.id]);
    assert!(claimed.iter().all(|j| j.status == JobStatus::Active));
    assert!(claimed.iter().all(|j| j.attempts == 1));
    assert!(claimed.iter().all(|j| j.locked_by.as_deref() == Some("w1")));

    // a second worker only gets what is left
    let rest = store.claim_jobs("q", "w2", 10, 60).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, low.id);
}

#[tokio::test]
async fn test_scheduled_jobs_are_ineligible_until_due() {
    let store = fresh_store().await;

    let deferred = Job::new("q", "t", json!({}))
        .with_schedule(Utc::now() + chrono::Duration::minutes(10));
    store.insert_job(&deferred).await.unwrap();

    assert!(store.claim_jobs("q", "w1", 10, 60).await.unwrap().is_empty());

    let due = Job::new("q", "t", json!({}))
        .with_schedule(Utc::now() - chrono::Duration::seconds(1));
    store.insert_job(&due).await.unwrap();

    let claimed = store.claim_jobs("q", "w1", 10, 60).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, due.id);
}

#[tokio::test]
async fn test_retry_fail_and_reclaim() {
    let store = fresh_store().await;
    let job = Job::new("q", "t", json!({}));
    store.insert_job(&job).await.unwrap();

    store.claim_jobs("q", "w1", 1, 60).await.unwrap();
    store
        .retry_job(job.id, "503 from provider", Utc::now())
        .await
        .unwrap();

    let retried = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.last_error.as_deref(), Some("503 from provider"));
    assert!(retried.locked_by.is_none());

    // claim with an already-expired lease, then reclaim it
    store.claim_jobs("q", "w1", 1, -5).await.unwrap();
    assert_eq!(store.reclaim_stale_jobs(10).await.unwrap(), 1);
    let reclaimed = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, JobStatus::Pending);
    assert_eq!(reclaimed.attempts, 2);

    store.claim_jobs("q", "w1", 1, 60).await.unwrap();
    store.fail_job(job.id, "exhausted").await.unwrap();
    let failed = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 3);
}

#[tokio::test]
async fn test_counts_and_purge() {
    let store = fresh_store().await;

    for _ in 0..4 {
        store.insert_job(&Job::new("q", "t", json!({}))).await.unwrap();
    }
    let claimed = store.claim_jobs("q", "w1", 2, 60).await.unwrap();
    store.complete_job(claimed[0].id).await.unwrap();
    store.fail_job(claimed[1].id, "broken").await.unwrap();

    let counts = store.queue_counts("q").await.unwrap();
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.active, 0);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 1);

    let purged = store
        .purge_terminal_jobs(Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(purged, 2);
    assert!(store.get_job(claimed[0].id).await.unwrap().is_none());

    let counts = store.queue_counts("q").await.unwrap();
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.completed, 0);
}

#[tokio::test]
async fn test_log_batch_roundtrip() {
    let store = fresh_store().await;
    let job_id = Uuid::now_v7();

    let entries = vec![
        LogEntry::new(job_id, LogLevel::Info, "fetching-shows", "page 1")
            .with_progress(25, 100)
            .with_duration(140),
        LogEntry::new(job_id, LogLevel::Error, "fetching-shows", "page 2 failed")
            .with_error_code("E_RATE")
            .with_error(&encore::EncoreError::Transient("429 from provider".into()))
            .with_details(json!({"status": 429})),
    ];
    store.append_batch(&entries).await.unwrap();

    let read = store.get_job_logs(job_id, 10, 0).await.unwrap();
    assert_eq!(read.len(), 2);
    assert_eq!(read[0].items_processed, Some(25));
    assert_eq!(read[0].duration_ms, Some(140));
    assert_eq!(read[1].level, LogLevel::Error);
    assert_eq!(read[1].error_code.as_deref(), Some("E_RATE"));
    assert!(read[1]
        .error_stack
        .as_deref()
        .unwrap()
        .contains("429 from provider"));
    assert_eq!(read[1].details, Some(json!({"status": 429})));

    // unrelated jobs see nothing
    let other = store.get_job_logs(Uuid::now_v7(), 10, 0).await.unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn test_manager_runs_jobs_against_sqlite() {
    let store = fresh_store().await;
    let manager = Arc::new(QueueManager::new(
        store,
        WorkerConfig {
            poll_interval_ms: 20,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 40,
            ..WorkerConfig::default()
        },
    ));
    manager
        .register_queue(QueueDescriptor::new("artist-import", 2))
        .unwrap();
    manager
        .registry()
        .register_fn("artist.import", |_: serde_json::Value, _job, ctx| {
            Box::pin(async move {
                ctx.logger.info("fetching-artist", "hello sqlite").await;
                Ok(())
            })
        });
    manager.initialize().await.unwrap();

    let job = manager
        .add_job("artist-import", "artist.import", json!({}), JobOptions::new())
        .await
        .unwrap();

    let mut done = None;
    for _ in 0..300 {
        let current = manager.store().get_job(job.id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            done = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let done = done.expect("job never settled");
    assert_eq!(done.status, JobStatus::Completed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let logs = manager.store().get_job_logs(job.id, 10, 0).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "hello sqlite");

    manager.shutdown().await;
}
