//! Child worker process supervision
//!
//! A fixed number of child processes execute jobs on behalf of the queue. The
//! parent claims, completes and fails every job itself; children only run
//! handlers and report outcomes over a line-delimited JSON protocol on their
//! stdin/stdout. A child that dies is replaced under a new generation, which
//! turns any claim it held into a stale claim.

mod pool;
mod process;
mod protocol;
mod runner;

pub use pool::child_slot_name;
pub use protocol::{ChildRequest, ChildResponse, JobOutcome};
pub use runner::{child_slot_from_env, is_child_process, run_child, CHILD_SLOT_ENV};

pub(crate) use pool::{ChildExecution, ChildLease, ChildPool, ChildPoolConfig};

use std::path::PathBuf;

/// Error type for child process supervision
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The child executable could not be started
    #[error("failed to spawn child {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No executable to spawn was configured or discoverable
    #[error("no child program available: {0}")]
    NoProgram(String),

    /// The child never announced readiness
    #[error("child {slot} did not become ready")]
    NotReady { slot: usize },

    /// Malformed message on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Pipe I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SupervisorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
