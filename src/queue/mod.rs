//! Priority queue manager - persistent multi-queue job dispatch
//!
//! The manager owns every Job mutation: submission, claim, completion,
//! retry scheduling and terminal failure all go through it (or through the
//! store operations it drives), so no other component can race a worker on
//! a job record. Each registered queue gets its own worker pool; a
//! maintenance loop reclaims stale claims, purges old terminal jobs and
//! sweeps expired progress records.

mod task;

pub use task::{TaskCleared, TaskHandle, TaskQueue, TaskQueueStatus};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn, Instrument};

use crate::concurrency::RetryPolicy;
use crate::config::WorkerConfig;
use crate::error::{EncoreError, Result};
use crate::joblog::{JobLogger, JobLoggerConfig};
use crate::models::{Job, Priority, QueueDescriptor};
use crate::progress::{ProgressBus, STAGE_FAILED};
use crate::registry::JobRegistry;
use crate::store::{JobStore, LogSink};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const RECLAIM_BATCH: i64 = 100;

/// Options for job submission
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: Option<Priority>,
    pub max_attempts: Option<i32>,
    pub scheduled_for: Option<chrono::DateTime<Utc>>,
    pub subject_id: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn scheduled_for(mut self, at: chrono::DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }
}

/// Everything a handler gets besides the job itself
#[derive(Clone)]
pub struct JobContext {
    pub progress: Arc<ProgressBus>,
    pub logger: JobLogger,
}

/// Health snapshot for one queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub name: String,
    pub pending: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Read-only handle to a registered queue
#[derive(Debug, Clone)]
pub struct QueueHandle {
    descriptor: QueueDescriptor,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }
}

/// Shared state each worker pool runs against
struct WorkerContext<S: JobStore> {
    store: Arc<S>,
    registry: Arc<JobRegistry>,
    progress: Arc<ProgressBus>,
    worker_config: WorkerConfig,
    logger_config: JobLoggerConfig,
    retry_policy: RetryPolicy,
}

/// The top-level dispatcher: named queues, persistent job records, worker
/// pools, and the maintenance loop.
pub struct QueueManager<S: JobStore> {
    store: Arc<S>,
    registry: Arc<JobRegistry>,
    progress: Arc<ProgressBus>,
    queues: DashMap<String, QueueDescriptor>,
    worker_config: WorkerConfig,
    logger_config: JobLoggerConfig,
    retry_policy: RetryPolicy,
    init: OnceCell<()>,
    shutdown_tx: broadcast::Sender<()>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<S: JobStore> QueueManager<S> {
    pub fn new(store: S, worker_config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let retry_policy = RetryPolicy {
            base_delay: Duration::from_millis(worker_config.retry_base_delay_ms),
            max_delay: Duration::from_millis(worker_config.retry_max_delay_ms),
            ..RetryPolicy::default()
        };

        Self {
            store: Arc::new(store),
            registry: Arc::new(JobRegistry::new()),
            progress: Arc::new(ProgressBus::new()),
            queues: DashMap::new(),
            worker_config,
            logger_config: JobLoggerConfig::default(),
            retry_policy,
            init: OnceCell::new(),
            shutdown_tx,
            workers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Override the backoff applied when rescheduling failed jobs
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Override the per-job logger batching
    pub fn with_logger_config(mut self, config: JobLoggerConfig) -> Self {
        self.logger_config = config;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn progress(&self) -> &Arc<ProgressBus> {
        &self.progress
    }

    /// Register a named queue. Descriptors are immutable once registered and
    /// queues cannot be added after `initialize()`.
    pub fn register_queue(&self, descriptor: QueueDescriptor) -> Result<()> {
        if self.init.initialized() {
            return Err(EncoreError::InvalidArgument(
                "Queues cannot be registered after initialization".to_string(),
            ));
        }
        if descriptor.concurrency_limit == 0 {
            return Err(EncoreError::InvalidArgument(format!(
                "Queue {} needs a concurrency limit of at least 1",
                descriptor.name
            )));
        }
        if descriptor.priority_levels.is_empty() {
            return Err(EncoreError::InvalidArgument(format!(
                "Queue {} needs at least one priority level",
                descriptor.name
            )));
        }
        if descriptor.default_max_attempts < 1 {
            return Err(EncoreError::InvalidArgument(format!(
                "Queue {} needs at least one attempt",
                descriptor.name
            )));
        }
        if self.queues.contains_key(&descriptor.name) {
            return Err(EncoreError::InvalidArgument(format!(
                "Queue {} is already registered",
                descriptor.name
            )));
        }

        info!(queue = %descriptor.name, concurrency = descriptor.concurrency_limit, "Registered queue");
        self.queues.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Submit a job. The queue must exist, the job type must have a handler,
    /// and the payload and priority are validated here rather than in the
    /// worker.
    pub async fn add_job(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        let descriptor = self
            .queues
            .get(queue_name)
            .map(|d| d.clone())
            .ok_or_else(|| EncoreError::QueueNotFound {
                name: queue_name.to_string(),
            })?;

        self.registry.validate(job_type, &payload)?;

        let priority = options.priority.unwrap_or_default();
        if !descriptor.accepts_priority(priority) {
            return Err(EncoreError::InvalidArgument(format!(
                "Queue {} does not accept priority {}",
                queue_name,
                priority.as_str()
            )));
        }

        let max_attempts = options.max_attempts.unwrap_or(descriptor.default_max_attempts);
        if max_attempts < 1 {
            return Err(EncoreError::InvalidArgument(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let mut job = Job::new(queue_name, job_type, payload)
            .with_priority(priority)
            .with_max_attempts(max_attempts);
        if let Some(subject) = options.subject_id {
            job = job.with_subject(subject);
        }
        if let Some(at) = options.scheduled_for {
            job = job.with_schedule(at);
        }

        self.store.insert_job(&job).await?;
        info!(
            job_id = %job.id,
            queue = %queue_name,
            job_type = %job_type,
            priority = priority.as_str(),
            "Job enqueued"
        );
        Ok(job)
    }

    /// Handle to a registered queue
    pub fn get_queue(&self, name: &str) -> Option<QueueHandle> {
        self.queues.get(name).map(|d| QueueHandle {
            descriptor: d.clone(),
        })
    }

    /// Health counts for one queue
    pub async fn get_queue_metrics(&self, name: &str) -> Result<QueueMetrics> {
        if !self.queues.contains_key(name) {
            return Err(EncoreError::QueueNotFound {
                name: name.to_string(),
            });
        }
        let counts = self.store.queue_counts(name).await?;
        Ok(QueueMetrics {
            name: name.to_string(),
            pending: counts.pending,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
        })
    }

    /// Health counts for every registered queue
    pub async fn get_all_queue_stats(&self) -> Result<HashMap<String, QueueMetrics>> {
        let names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        let mut stats = HashMap::with_capacity(names.len());
        for name in names {
            let metrics = self.get_queue_metrics(&name).await?;
            stats.insert(name, metrics);
        }
        Ok(stats)
    }

    /// Start one worker pool per registered queue plus the maintenance loop.
    ///
    /// Single-flight: concurrent callers share one initialization, and a
    /// completed initialization makes later calls no-ops. An unreachable
    /// store is fatal here.
    pub async fn initialize(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                self.store.ping().await?;
                self.store.migrate().await?;

                let ctx = Arc::new(WorkerContext {
                    store: self.store.clone(),
                    registry: self.registry.clone(),
                    progress: self.progress.clone(),
                    worker_config: self.worker_config.clone(),
                    logger_config: self.logger_config.clone(),
                    retry_policy: self.retry_policy.clone(),
                });

                let mut workers = self.workers.lock();
                for entry in self.queues.iter() {
                    let descriptor = entry.value().clone();
                    let pool_ctx = ctx.clone();
                    let shutdown = self.shutdown_tx.subscribe();
                    workers.push(tokio::spawn(run_worker_pool(pool_ctx, descriptor, shutdown)));
                }

                let maintenance_ctx = ctx.clone();
                let shutdown = self.shutdown_tx.subscribe();
                let retention = chrono::Duration::hours(self.worker_config.retention_hours);
                workers.push(tokio::spawn(run_maintenance(
                    maintenance_ctx,
                    retention,
                    shutdown,
                )));

                info!(
                    queues = self.queues.len(),
                    worker_id = %self.worker_config.worker_id,
                    "Queue manager initialized"
                );
                Ok::<(), EncoreError>(())
            })
            .await
            .map(|_| ())
    }

    /// Stop claiming new jobs, let in-flight jobs finish, stop maintenance
    pub async fn shutdown(&self) {
        info!("Queue manager shutting down");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Queue manager stopped");
    }

    #[cfg(test)]
    fn worker_task_count(&self) -> usize {
        self.workers.lock().len()
    }
}

/// Poll loop for one queue: claim eligible jobs up to the pool's free
/// capacity and execute each in its own task.
async fn run_worker_pool<S: JobStore>(
    ctx: Arc<WorkerContext<S>>,
    descriptor: QueueDescriptor,
    mut shutdown: broadcast::Receiver<()>,
) {
    let semaphore = Arc::new(Semaphore::new(descriptor.concurrency_limit));
    let mut poll = interval(ctx.worker_config.poll_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(queue = %descriptor.name, "Worker pool started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = poll.tick() => {
                // A transient store failure aborts this cycle only; the pool
                // keeps polling.
                if let Err(e) = poll_once(&ctx, &descriptor, &semaphore).await {
                    error!(queue = %descriptor.name, error = %e, "Error in poll cycle");
                }
            }
        }
    }

    // wait for in-flight jobs before reporting the pool stopped
    let _ = semaphore
        .acquire_many(descriptor.concurrency_limit as u32)
        .await;
    info!(queue = %descriptor.name, "Worker pool stopped");
}

async fn poll_once<S: JobStore>(
    ctx: &Arc<WorkerContext<S>>,
    descriptor: &QueueDescriptor,
    semaphore: &Arc<Semaphore>,
) -> Result<()> {
    let available = semaphore.available_permits();
    if available == 0 {
        debug!(queue = %descriptor.name, "Pool saturated, skipping poll");
        return Ok(());
    }

    let batch = std::cmp::min(available as i64, ctx.worker_config.batch_size);
    let jobs = ctx
        .store
        .claim_jobs(
            &descriptor.name,
            &ctx.worker_config.worker_id,
            batch,
            ctx.worker_config.lock_duration_secs,
        )
        .await?;

    if jobs.is_empty() {
        return Ok(());
    }
    debug!(queue = %descriptor.name, count = jobs.len(), "Claimed jobs");

    for job in jobs {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EncoreError::Internal(format!("Worker pool semaphore closed: {e}")))?;
        let ctx = ctx.clone();

        let span = tracing::info_span!(
            "execute_job",
            job_id = %job.id,
            queue = %job.queue_name,
            job_type = %job.job_type
        );
        tokio::spawn(
            async move {
                let _permit = permit;
                execute_job(ctx, job).await;
            }
            .instrument(span),
        );
    }

    Ok(())
}

/// Run one claimed job to a settled outcome. Store failures on the way out
/// are logged and swallowed: one poisoned job must never stop the pool.
async fn execute_job<S: JobStore>(ctx: Arc<WorkerContext<S>>, job: Job) {
    let job_id = job.id;
    info!(attempt = job.attempts, max_attempts = job.max_attempts, "Executing job");

    let sink: Arc<dyn LogSink> = ctx.store.clone();
    let logger = JobLogger::new(job_id, sink, ctx.logger_config.clone());
    let context = JobContext {
        progress: ctx.progress.clone(),
        logger: logger.clone(),
    };

    let result = match ctx.registry.get(&job.job_type) {
        Some(handler) => handler.execute(job.clone(), context).await,
        None => Err(EncoreError::UnknownJobType {
            job_type: job.job_type.clone(),
        }),
    };

    match result {
        Ok(()) => {
            info!("Job completed");
            if let Err(e) = ctx.store.complete_job(job_id).await {
                error!(error = %e, "Failed to record job completion");
            }
        }
        Err(e) => {
            logger
                .push(
                    crate::models::LogEntry::new(
                        job_id,
                        crate::models::LogLevel::Error,
                        "job",
                        format!("Attempt {} of {} failed", job.attempts, job.max_attempts),
                    )
                    .with_error(&e),
                )
                .await;

            // bad submissions and unknown types cannot succeed later
            let permanent = matches!(
                e,
                EncoreError::UnknownJobType { .. } | EncoreError::InvalidArgument(_)
            );
            let can_retry = !permanent && job.attempts < job.max_attempts;

            if can_retry {
                let delay = ctx.retry_policy.delay_for(job.attempts.max(1) as u32);
                let run_after = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                warn!(
                    error = %e,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    retry_at = %run_after,
                    "Job failed, rescheduling"
                );
                if let Err(se) = ctx.store.retry_job(job_id, &e.to_string(), run_after).await {
                    error!(error = %se, "Failed to reschedule job");
                }
            } else {
                let last_error = if permanent {
                    e.to_string()
                } else {
                    format!(
                        "{}: {}",
                        EncoreError::MaxAttemptsReached {
                            id: job_id,
                            attempts: job.attempts,
                        },
                        e
                    )
                };
                error!(
                    error = %e,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    "Job failed terminally"
                );
                if let Err(se) = ctx.store.fail_job(job_id, &last_error).await {
                    error!(error = %se, "Failed to record job failure");
                }
                // UI consumers must be able to tell "gave up" from "still
                // running"; the zero percentage defers to whatever the
                // handler already reported.
                if let Some(subject) = &job.subject_id {
                    ctx.progress.report_with(
                        subject.clone(),
                        STAGE_FAILED,
                        0,
                        last_error,
                        None,
                        Some(job_id),
                    );
                }
            }
        }
    }

    if let Err(e) = logger.complete().await {
        error!(error = %e, "Final log flush failed");
    }
}

/// Reclaim stale claims, purge old terminal jobs, sweep progress records
async fn run_maintenance<S: JobStore>(
    ctx: Arc<WorkerContext<S>>,
    retention: chrono::Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = interval(MAINTENANCE_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {
                match ctx.store.reclaim_stale_jobs(RECLAIM_BATCH).await {
                    Ok(0) => {}
                    Ok(n) => warn!(count = n, "Reclaimed jobs with expired claims"),
                    Err(e) => error!(error = %e, "Stale job reclaim failed"),
                }

                let cutoff = Utc::now() - retention;
                match ctx.store.purge_terminal_jobs(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => debug!(count = n, "Purged old terminal jobs"),
                    Err(e) => error!(error = %e, "Terminal job purge failed"),
                }

                let swept = ctx.progress.sweep_expired();
                if swept > 0 {
                    debug!(count = swept, "Swept expired progress records");
                }
            }
        }
    }
}
