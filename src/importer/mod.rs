//! Import orchestration over external music/ticketing data providers
//!
//! A [`ProviderClient`] composes the concurrency primitives around every
//! provider call: the circuit breaker sits outermost so an open circuit
//! surfaces immediately instead of being retried inline, the retry policy
//! runs inside it, and each attempt takes its own rate-limit slot. The
//! handlers registered here drive the full pipeline: provider fan-out
//! through the batch processor, live status on the progress bus, structured
//! entries through the per-job logger.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::batch::{process_batch, process_in_chunks, BatchOptions, ChunkOptions};
use crate::concurrency::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimiter, RetryPolicy};
use crate::error::{EncoreError, Result};
use crate::models::{LogEntry, LogLevel, Priority, QueueDescriptor};
use crate::progress::STAGE_COMPLETED;
use crate::queue::{JobContext, QueueManager};
use crate::registry::JobHandler;
use crate::store::JobStore;

/// Queue names used by the standard import pipeline
pub const ARTIST_QUEUE: &str = "artist-import";
pub const SHOW_QUEUE: &str = "show-import";
pub const CATALOG_QUEUE: &str = "catalog-sync";

/// Artist as returned by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistRecord {
    pub id: String,
    pub name: String,
}

/// Show as returned by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowRecord {
    pub id: String,
    pub venue: String,
    pub date: String,
    pub song_ids: Vec<String>,
}

/// Catalog entry as returned by a bulk lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub title: String,
}

/// An external data provider. The core only assumes each call is an async
/// operation that may fail, must respect a rate limit, and is safe to retry.
#[async_trait]
pub trait SetlistProvider: Send + Sync + 'static {
    async fn fetch_artist(&self, artist_id: &str) -> Result<ArtistRecord>;
    async fn list_show_ids(&self, artist_id: &str) -> Result<Vec<String>>;
    async fn fetch_show(&self, show_id: &str) -> Result<ShowRecord>;
    /// Bulk lookup; providers accept batched payloads here
    async fn fetch_catalog_entries(&self, song_ids: &[String]) -> Result<Vec<CatalogEntry>>;
}

/// Limits shared by every call against one provider
#[derive(Debug, Clone)]
pub struct ProviderLimits {
    pub max_calls: usize,
    pub window: Duration,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_calls: 10,
            window: Duration::from_secs(1),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Rate-limited, circuit-broken, retried access to one provider.
///
/// One instance per provider, shared by all call sites; the breaker and the
/// rate window are meaningless unless the call sites share them.
pub struct ProviderClient {
    name: String,
    rate: RateLimiter,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ProviderClient {
    pub fn new(name: impl Into<String>, limits: ProviderLimits) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            rate: RateLimiter::new(limits.max_calls, limits.window)?,
            breaker: CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: limits.failure_threshold,
                recovery_timeout: limits.recovery_timeout,
            }),
            retry: limits.retry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run one provider operation under the full wrapper stack.
    ///
    /// Retry exhaustion counts as a single failure against the breaker;
    /// every attempt waits for its own rate-limit slot.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker
            .call(|| async {
                self.retry
                    .run(|| self.rate.run(op()))
                    .await
                    .map_err(EncoreError::from)
            })
            .await
            .map_err(EncoreError::from)
    }
}

/// Payload for `artist.import` jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistImportPayload {
    pub artist_id: String,
}

/// Payload for `show.import` jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowImportPayload {
    pub show_id: String,
}

/// Payload for `catalog.sync` jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSyncPayload {
    pub song_ids: Vec<String>,
}

/// Full artist pipeline: detail fetch, show fan-out, catalog sync
pub struct ArtistImporter<P: SetlistProvider> {
    provider: Arc<P>,
    client: Arc<ProviderClient>,
    show_concurrency: usize,
    catalog_chunk_size: usize,
}

impl<P: SetlistProvider> ArtistImporter<P> {
    pub fn new(provider: Arc<P>, client: Arc<ProviderClient>) -> Self {
        Self {
            provider,
            client,
            show_concurrency: 4,
            catalog_chunk_size: 20,
        }
    }

    pub fn show_concurrency(mut self, concurrency: usize) -> Self {
        self.show_concurrency = concurrency;
        self
    }

    pub fn catalog_chunk_size(mut self, chunk_size: usize) -> Self {
        self.catalog_chunk_size = chunk_size;
        self
    }
}

#[async_trait]
impl<P: SetlistProvider> JobHandler for ArtistImporter<P> {
    fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        serde_json::from_value::<ArtistImportPayload>(payload.clone())
            .map(|_| ())
            .map_err(|e| EncoreError::InvalidArgument(format!("Payload mismatch: {e}")))
    }

    async fn execute(&self, job: crate::models::Job, ctx: JobContext) -> Result<()> {
        let payload: ArtistImportPayload = serde_json::from_value(job.payload.clone())?;
        let subject = job
            .subject_id
            .clone()
            .unwrap_or_else(|| format!("artist-{}", payload.artist_id));
        let job_id = job.id;

        let report = |stage: &str, pct: u8, msg: String| {
            ctx.progress
                .report_with(&subject, stage, pct, msg, None, Some(job_id));
        };

        report("fetching-artist", 5, format!("Fetching artist {}", payload.artist_id));
        ctx.logger.info("fetching-artist", "Fetching artist detail").await;

        let artist = self
            .client
            .call(|| self.provider.fetch_artist(&payload.artist_id))
            .await?;

        let show_ids = self
            .client
            .call(|| self.provider.list_show_ids(&artist.id))
            .await?;
        let show_total = show_ids.len();

        report(
            "fetching-shows",
            15,
            format!("Importing {} shows for {}", show_total, artist.name),
        );
        ctx.logger
            .push(
                LogEntry::new(job_id, LogLevel::Info, "fetching-shows", "Show fan-out started")
                    .with_progress(0, show_total as i64),
            )
            .await;

        // per-item fan-out: show detail endpoints take one id at a time
        let provider = self.provider.clone();
        let client = self.client.clone();
        let progress = ctx.progress.clone();
        let progress_subject = subject.clone();
        let shows = process_batch(
            show_ids,
            move |show_id: String| {
                let provider = provider.clone();
                let client = client.clone();
                async move { client.call(|| provider.fetch_show(&show_id)).await }
            },
            BatchOptions::new()
                .concurrency(self.show_concurrency)
                .on_progress(move |done, total| {
                    let pct = 15 + ((done * 60) / total.max(1)) as u8;
                    progress.report_with(
                        &progress_subject,
                        "fetching-shows",
                        pct,
                        format!("Imported {done} of {total} shows"),
                        None,
                        Some(job_id),
                    );
                }),
        )
        .await
        .map_err(EncoreError::from)?
        .into_values();

        ctx.logger
            .push(
                LogEntry::new(job_id, LogLevel::Success, "fetching-shows", "Show fan-out finished")
                    .with_progress(shows.len() as i64, show_total as i64),
            )
            .await;

        // bulk catalog lookups take batched payloads
        let mut song_ids: Vec<String> = shows.iter().flat_map(|s| s.song_ids.clone()).collect();
        song_ids.sort();
        song_ids.dedup();
        let song_total = song_ids.len();

        report(
            "syncing-catalog",
            80,
            format!("Syncing {} catalog entries", song_total),
        );

        let provider = self.provider.clone();
        let client = self.client.clone();
        let progress = ctx.progress.clone();
        let progress_subject = subject.clone();
        let entries = process_in_chunks(
            song_ids,
            move |chunk: Vec<String>| {
                let provider = provider.clone();
                let client = client.clone();
                async move {
                    client
                        .call(|| provider.fetch_catalog_entries(&chunk))
                        .await
                }
            },
            ChunkOptions::new(self.catalog_chunk_size)
                .concurrency(2)
                .on_progress(move |done, total| {
                    let pct = 80 + ((done * 15) / total.max(1)) as u8;
                    progress.report_with(
                        &progress_subject,
                        "syncing-catalog",
                        pct,
                        format!("Synced {done} of {total} catalog entries"),
                        None,
                        Some(job_id),
                    );
                }),
        )
        .await
        .map_err(EncoreError::from)?;

        ctx.logger
            .push(
                LogEntry::new(job_id, LogLevel::Success, "syncing-catalog", "Catalog synced")
                    .with_progress(entries.len() as i64, song_total as i64),
            )
            .await;

        report(
            STAGE_COMPLETED,
            100,
            format!(
                "Imported {} with {} shows and {} catalog entries",
                artist.name,
                shows.len(),
                entries.len()
            ),
        );
        Ok(())
    }
}

/// Single-show import: the small, per-record job type
pub struct ShowImporter<P: SetlistProvider> {
    provider: Arc<P>,
    client: Arc<ProviderClient>,
}

#[async_trait]
impl<P: SetlistProvider> JobHandler for ShowImporter<P> {
    fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        serde_json::from_value::<ShowImportPayload>(payload.clone())
            .map(|_| ())
            .map_err(|e| EncoreError::InvalidArgument(format!("Payload mismatch: {e}")))
    }

    async fn execute(&self, job: crate::models::Job, ctx: JobContext) -> Result<()> {
        let payload: ShowImportPayload = serde_json::from_value(job.payload.clone())?;

        ctx.logger.info("fetching-show", "Fetching show").await;
        let show = self
            .client
            .call(|| self.provider.fetch_show(&payload.show_id))
            .await?;
        ctx.logger
            .success("fetching-show", &format!("Imported show at {}", show.venue))
            .await;
        Ok(())
    }
}

/// Bulk catalog sync over an explicit id list
pub struct CatalogSyncer<P: SetlistProvider> {
    provider: Arc<P>,
    client: Arc<ProviderClient>,
    chunk_size: usize,
}

#[async_trait]
impl<P: SetlistProvider> JobHandler for CatalogSyncer<P> {
    fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        serde_json::from_value::<CatalogSyncPayload>(payload.clone())
            .map(|_| ())
            .map_err(|e| EncoreError::InvalidArgument(format!("Payload mismatch: {e}")))
    }

    async fn execute(&self, job: crate::models::Job, ctx: JobContext) -> Result<()> {
        let payload: CatalogSyncPayload = serde_json::from_value(job.payload.clone())?;
        let total = payload.song_ids.len();

        let provider = self.provider.clone();
        let client = self.client.clone();
        let entries = process_in_chunks(
            payload.song_ids,
            move |chunk: Vec<String>| {
                let provider = provider.clone();
                let client = client.clone();
                async move { client.call(|| provider.fetch_catalog_entries(&chunk)).await }
            },
            ChunkOptions::new(self.chunk_size),
        )
        .await
        .map_err(EncoreError::from)?;

        ctx.logger
            .push(
                LogEntry::new(job.id, LogLevel::Success, "syncing-catalog", "Catalog synced")
                    .with_progress(entries.len() as i64, total as i64),
            )
            .await;
        Ok(())
    }
}

/// Register the standard import queues and handlers on a manager.
///
/// Must run before `initialize()`. All three handlers share one
/// [`ProviderClient`], so the provider's rate window and circuit are
/// respected across queues.
pub fn register_import_pipeline<S, P>(
    manager: &QueueManager<S>,
    provider: Arc<P>,
    limits: ProviderLimits,
) -> Result<Arc<ProviderClient>>
where
    S: JobStore,
    P: SetlistProvider,
{
    let client = Arc::new(ProviderClient::new("setlist-provider", limits)?);

    manager.register_queue(QueueDescriptor::new(ARTIST_QUEUE, 2))?;
    manager.register_queue(QueueDescriptor::new(SHOW_QUEUE, 4))?;
    manager.register_queue(
        QueueDescriptor::new(CATALOG_QUEUE, 2).priorities(vec![Priority::Normal, Priority::Low]),
    )?;

    manager.registry().register(
        "artist.import",
        ArtistImporter::new(provider.clone(), client.clone()),
    );
    manager.registry().register(
        "show.import",
        ShowImporter {
            provider: provider.clone(),
            client: client.clone(),
        },
    );
    manager.registry().register(
        "catalog.sync",
        CatalogSyncer {
            provider,
            client: client.clone(),
            chunk_size: 20,
        },
    );

    Ok(client)
}
