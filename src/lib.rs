//! # Encore
//!
//! Import/orchestration core for a concert-setlist service.
//!
//! Encore is the concurrency backbone behind artist, show and catalog
//! imports:
//! - **Bounded Concurrency**: limiter and in-process task queue cap in-flight
//!   work
//! - **Failure Policy**: deterministic retry/backoff and circuit breaking
//!   around external providers
//! - **Rate Limiting**: sliding-window caps per provider
//! - **Priority Queues**: named queues with persistent job records and
//!   worker pools
//! - **Live Progress**: pub/sub status bus for import UIs
//! - **Durable Logs**: batched structured logging that never drops entries
//!
//! ## Quick Start
//!
//! ```ignore
//! use encore::{QueueManager, QueueDescriptor, JobOptions};
//! use encore::store::SqliteStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteStore::connect("sqlite://encore.db?mode=rwc").await?;
//!
//!     let manager = Arc::new(QueueManager::new(store, Default::default()));
//!     manager.register_queue(QueueDescriptor::new("artist-import", 2))?;
//!     manager.registry().register_fn(
//!         "artist.import",
//!         |payload: serde_json::Value, _job, ctx| Box::pin(async move {
//!             ctx.progress.report("artist-1", "importing", 10, "starting");
//!             ctx.logger.info("importing", "fetching artist").await;
//!             Ok(())
//!         }),
//!     );
//!
//!     manager.initialize().await?;
//!     manager.add_job(
//!         "artist-import",
//!         "artist.import",
//!         serde_json::json!({"artist_id": "a1"}),
//!         JobOptions::new().subject("artist-1"),
//!     ).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod batch;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod importer;
pub mod joblog;
pub mod models;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod store;

// Re-exports for convenience
pub use batch::{process_batch, process_in_chunks, BatchOptions, BatchOutcome, ChunkOptions};
pub use concurrency::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Limiter, RateLimiter, RetryPolicy,
};
pub use config::{Config, DatabaseConfig, ServerConfig, WorkerConfig};
pub use error::{EncoreError, Result};
pub use importer::{ProviderClient, ProviderLimits, SetlistProvider};
pub use joblog::{JobLogger, JobLoggerConfig};
pub use models::{Job, JobStatus, LogEntry, LogLevel, Priority, QueueDescriptor};
pub use progress::{ProgressBus, ProgressRecord};
pub use queue::{
    JobContext, JobOptions, QueueHandle, QueueManager, QueueMetrics, TaskHandle, TaskQueue,
    TaskQueueStatus,
};
pub use registry::{JobHandler, JobRegistry, TypedJobHandler};
pub use store::{JobStore, LogSink, MemoryStore};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        EncoreError, Job, JobContext, JobHandler, JobOptions, JobRegistry, JobStatus, JobStore,
        Priority, ProgressBus, QueueDescriptor, QueueManager, Result,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::SqliteStore;
}
