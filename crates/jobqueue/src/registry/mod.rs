//! Task registry and handler definitions
//!
//! This module provides:
//! - [`Task`] trait for typed, value-returning handlers
//! - [`Done`] completion handle for callback-style handlers
//! - [`TaskRegistry`] mapping job types to type-erased handlers

mod registry;
mod task;

pub use registry::{HandlerStyle, RegistrationError, RegistryError, TaskHandler, TaskRegistry};
pub use task::{Done, Task, TaskError, TaskResult};
