//! Job dispatch
//!
//! This module provides:
//! - [`PollerConfig`] / [`ClaimPoller`]: backoff while nothing is claimable
//! - [`GenerationTable`]: per-slot generations and claim tokens
//! - the dispatcher running `worker_count` claim loops

mod dispatcher;
mod generation;
mod poller;

pub use dispatcher::dispatch_slot_name;
pub use generation::GenerationTable;
pub use poller::{ClaimPoller, PollerConfig};

pub(crate) use dispatcher::{DispatchContext, Dispatcher, Executor};
