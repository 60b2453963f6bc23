//! Demo tasks and wiring for the job queue
//!
//! The `jobqueue-demo` binary doubles as the child worker executable: started
//! with `JOBQUEUE_CHILD_SLOT` set it serves jobs over stdin/stdout instead of
//! running the demo.

pub mod tasks;
pub mod telemetry;

pub use tasks::{demo_registry, CrashTask, FailFirstTask, HitCountTask};
pub use telemetry::init_logging;
