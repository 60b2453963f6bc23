//! Persistence layer for the job queue
//!
//! This module provides:
//! - [`JobStore`] trait: the atomic operations the queue relies on
//! - [`InMemoryJobStore`] for tests and single-process deployments
//! - [`PostgresJobStore`] for production
//! - `RedisJobStore` (feature `redis`) for Redis-compatible stores

mod memory;
mod postgres;
#[cfg(feature = "redis")]
mod redis_store;
mod store;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
pub use store::{JobStore, StoreError};
