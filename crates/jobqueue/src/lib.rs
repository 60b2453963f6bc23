//! # Persistent Job Queue
//!
//! A store-coordinated job queue with per-resource execution exclusivity.
//!
//! ## Features
//!
//! - **Durable collections**: every job lives in exactly one of pending, active or failed
//! - **Resource exclusivity**: at most one active job per `resource_id`, enforced by the store's atomic claim
//! - **FIFO per resource**: jobs sharing a resource run in submission order
//! - **Child workers**: optional supervised worker processes with crash detection and restart
//! - **Explicit recovery**: jobs orphaned by a crash are failed by `force_flush_stale_jobs`, then retried or deleted
//! - **Run heartbeats**: any instance sharing the store can flush the jobs of a run that stopped heartbeating
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         JobQueue                             │
//! │  (submit, start/shutdown, retry/delete/flush, events)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Dispatcher slots (tokio)                    │
//! │  (claim → execute → complete/fail, poll backoff)            │
//! └─────────────────────────────────────────────────────────────┘
//!             │                                   │
//!             ▼                                   ▼
//! ┌──────────────────────────┐     ┌─────────────────────────────┐
//! │      TaskRegistry         │     │         ChildPool            │
//! │  (in-process handlers)   │     │  (NDJSON over stdin/stdout) │
//! └──────────────────────────┘     └─────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         JobStore                             │
//! │  (in-memory, PostgreSQL, Redis: atomic claim per resource)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use jobqueue::prelude::*;
//!
//! let queue = JobQueue::builder()
//!     .config(QueueConfig::from_env())
//!     .store(PostgresJobStore::connect(&database_url).await?)
//!     .register(ResizeImage)?
//!     .build()?;
//!
//! queue.start().await?;
//! queue.submit_job("resize_image", "image-42", json!({"width": 640})).await?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod queue;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::QueueConfig;
    pub use crate::error::QueueError;
    pub use crate::events::QueueEvent;
    pub use crate::job::{ClaimToken, Job, JobId, JobState, NewJob, QueueCounts};
    pub use crate::queue::{JobQueue, JobQueueBuilder, QueueStatus, ShutdownMode, ShutdownReport};
    pub use crate::registry::{Done, Task, TaskError, TaskRegistry, TaskResult};
    pub use crate::store::{InMemoryJobStore, JobStore, PostgresJobStore, StoreError};
    pub use crate::worker::PollerConfig;
}

pub use config::QueueConfig;
pub use error::QueueError;
pub use events::{EventBus, QueueEvent};
pub use job::{ClaimToken, Job, JobId, JobState, NewJob, QueueCounts};
pub use queue::{JobQueue, JobQueueBuilder, QueueStatus, ShutdownMode, ShutdownReport};
pub use registry::{Done, Task, TaskError, TaskRegistry, TaskResult};
#[cfg(feature = "redis")]
pub use store::RedisJobStore;
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore, StoreError};
