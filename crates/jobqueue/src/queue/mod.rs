//! Job queue: state machine and facade
//!
//! This module provides:
//! - [`QueueStateMachine`]: validated, logged job transitions over a [`JobStore`](crate::store::JobStore)
//! - [`JobQueue`] / [`JobQueueBuilder`]: the entry point applications use

mod job_queue;
mod machine;

pub use job_queue::{JobQueue, JobQueueBuilder, QueueStatus, ShutdownMode, ShutdownReport};
pub use machine::{QueueStateMachine, STALE_REASON};
