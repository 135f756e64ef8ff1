//! Queue manager behavior through the public API

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use encore::config::WorkerConfig;
use encore::models::{JobStatus, QueueDescriptor};
use encore::queue::{JobOptions, QueueManager};
use encore::store::{JobStore, MemoryStore};
use encore::Priority;
use serde_json::json;
use uuid::Uuid;

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "itest-worker".to_string(),
        poll_interval_ms: 20,
        batch_size: 10,
        lock_duration_secs: 60,
        retention_hours: 72,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 40,
    }
}

async fn wait_for_terminal(
    manager: &QueueManager<MemoryStore>,
    id: Uuid,
) -> encore::models::Job {
    for _ in 0..300 {
        let job = manager.store().get_job(id).await.unwrap().unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never settled");
}

#[tokio::test]
async fn test_flaky_handler_succeeds_on_third_attempt() {
    let manager = Arc::new(QueueManager::new(MemoryStore::new(), fast_worker_config()));
    manager
        .register_queue(QueueDescriptor::new("artist-import", 2))
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let calls2 = calls.clone();
    manager
        .registry()
        .register_fn("artist.import", move |_: serde_json::Value, _job, _ctx| {
            let calls = calls2.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                    Err(encore::EncoreError::Transient("warming up".into()))
                } else {
                    Ok(())
                }
            })
        });
    manager.initialize().await.unwrap();

    let job = manager
        .add_job(
            "artist-import",
            "artist.import",
            json!({}),
            JobOptions::new().max_attempts(5),
        )
        .await
        .unwrap();

    let done = wait_for_terminal(&manager, job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // the error from the last failed attempt stays on the record
    assert!(done.last_error.as_deref().unwrap().contains("warming up"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_metrics_track_the_lifecycle() {
    let manager = Arc::new(QueueManager::new(MemoryStore::new(), fast_worker_config()));
    manager
        .register_queue(QueueDescriptor::new("artist-import", 2))
        .unwrap();
    manager
        .registry()
        .register_fn("artist.import", |payload: serde_json::Value, _job, _ctx| {
            Box::pin(async move {
                if payload["fail"].as_bool().unwrap_or(false) {
                    Err(encore::EncoreError::Transient("bad".into()))
                } else {
                    Ok(())
                }
            })
        });
    manager.initialize().await.unwrap();

    let ok = manager
        .add_job("artist-import", "artist.import", json!({}), JobOptions::new())
        .await
        .unwrap();
    let bad = manager
        .add_job(
            "artist-import",
            "artist.import",
            json!({"fail": true}),
            JobOptions::new().max_attempts(1),
        )
        .await
        .unwrap();

    wait_for_terminal(&manager, ok.id).await;
    wait_for_terminal(&manager, bad.id).await;

    let metrics = manager.get_queue_metrics("artist-import").await.unwrap();
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.pending, 0);
    assert_eq!(metrics.active, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_queues_run_independently() {
    let manager = Arc::new(QueueManager::new(MemoryStore::new(), fast_worker_config()));
    manager
        .register_queue(QueueDescriptor::new("artist-import", 1))
        .unwrap();
    manager
        .register_queue(QueueDescriptor::new("catalog-sync", 1))
        .unwrap();

    manager
        .registry()
        .register_fn("slow.job", |_: serde_json::Value, _job, _ctx| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            })
        });
    manager
        .registry()
        .register_fn("quick.job", |_: serde_json::Value, _job, _ctx| {
            Box::pin(async { Ok(()) })
        });
    manager.initialize().await.unwrap();

    // a slow job on one queue must not delay the other queue's pool
    manager
        .add_job("artist-import", "slow.job", json!({}), JobOptions::new())
        .await
        .unwrap();
    let quick = manager
        .add_job("catalog-sync", "quick.job", json!({}), JobOptions::new())
        .await
        .unwrap();

    let quick_done = wait_for_terminal(&manager, quick.id).await;
    assert_eq!(quick_done.status, JobStatus::Completed);

    let slow_jobs = manager
        .store()
        .get_jobs_by_queue("artist-import", 10, 0)
        .await
        .unwrap();
    assert!(slow_jobs[0].status == JobStatus::Active || slow_jobs[0].status == JobStatus::Pending);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_claiming() {
    let manager = Arc::new(QueueManager::new(MemoryStore::new(), fast_worker_config()));
    manager
        .register_queue(QueueDescriptor::new("artist-import", 2))
        .unwrap();
    manager
        .registry()
        .register_fn("artist.import", |_: serde_json::Value, _job, _ctx| {
            Box::pin(async { Ok(()) })
        });
    manager.initialize().await.unwrap();
    manager.shutdown().await;

    let job = manager
        .add_job("artist-import", "artist.import", json!({}), JobOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let unclaimed = manager.store().get_job(job.id).await.unwrap().unwrap();
    assert_eq!(unclaimed.status, JobStatus::Pending);
    assert_eq!(unclaimed.attempts, 0);
}

#[tokio::test]
async fn test_higher_priority_jobs_jump_the_backlog() {
    let manager = Arc::new(QueueManager::new(MemoryStore::new(), fast_worker_config()));
    manager
        .register_queue(QueueDescriptor::new("artist-import", 1))
        .unwrap();

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let order2 = order.clone();
    manager
        .registry()
        .register_fn("artist.import", move |payload: serde_json::Value, _job, _ctx| {
            let order = order2.clone();
            Box::pin(async move {
                order
                    .lock()
                    .push(payload["tag"].as_str().unwrap_or("?").to_string());
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            })
        });

    let mut last_to_run = None;
    for (tag, priority) in [
        ("a-normal", Priority::Normal),
        ("b-normal", Priority::Normal),
        ("critical", Priority::Critical),
        ("low", Priority::Low),
    ] {
        let job = manager
            .add_job(
                "artist-import",
                "artist.import",
                json!({"tag": tag}),
                JobOptions::new().priority(priority),
            )
            .await
            .unwrap();
        if tag == "low" {
            last_to_run = Some(job.id);
        }
    }

    manager.initialize().await.unwrap();
    wait_for_terminal(&manager, last_to_run.unwrap()).await;

    let seen = order.lock().clone();
    assert_eq!(seen, vec!["critical", "a-normal", "b-normal", "low"]);
    manager.shutdown().await;
}
