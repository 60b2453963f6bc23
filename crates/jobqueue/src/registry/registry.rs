//! Task registry: job type name -> type-erased handler
//!
//! Every calling convention (value-returning, callback, blocking) is normalized
//! into one future yielding a [`TaskResult`], so the dispatcher and the child
//! runner consume a single completion signal.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::debug;

use super::task::{Done, Task, TaskError, TaskResult};

/// Type-erased handler
pub type TaskHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, TaskResult> + Send + Sync>;

/// How a registered handler signals completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStyle {
    /// Returns (or resolves to) its result
    Returning,
    /// Receives a [`Done`] handle and signals through it
    Callback,
    /// Synchronous function run on the blocking pool
    Blocking,
}

#[derive(Clone)]
struct Registration {
    handler: TaskHandler,
    style: HandlerStyle,
}

/// Errors from registering a handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// Job type name is empty
    #[error("task type name must not be empty")]
    EmptyTaskType,

    /// Job type already has a handler
    #[error("task type already registered: {0}")]
    DuplicateTaskType(String),
}

/// Errors from registry lookups
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Job type not registered
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
}

/// Registry of task handlers
///
/// Built before the queue starts and frozen afterwards: the queue takes the
/// registry by value, so late registration is not expressible.
///
/// # Example
///
/// ```
/// use jobqueue::TaskRegistry;
///
/// let mut registry = TaskRegistry::new();
/// registry
///     .register_fn("echo", |payload| async move { Ok(payload) })
///     .unwrap();
/// assert!(registry.contains("echo"));
/// ```
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Registration>,
}

impl TaskRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        task_type: &str,
        handler: TaskHandler,
        style: HandlerStyle,
    ) -> Result<&mut Self, RegistrationError> {
        if task_type.trim().is_empty() {
            return Err(RegistrationError::EmptyTaskType);
        }
        if self.handlers.contains_key(task_type) {
            return Err(RegistrationError::DuplicateTaskType(task_type.to_string()));
        }

        debug!(task_type, ?style, "registered task handler");
        self.handlers
            .insert(task_type.to_string(), Registration { handler, style });
        Ok(self)
    }

    /// Register a typed [`Task`]
    pub fn register<T: Task>(&mut self, task: T) -> Result<&mut Self, RegistrationError> {
        let task = Arc::new(task);
        let handler: TaskHandler =
            Arc::new(move |payload| run_typed(Arc::clone(&task), payload).boxed());
        self.insert(T::TYPE, handler, HandlerStyle::Returning)
    }

    /// Register an async closure returning its result
    pub fn register_fn<F, Fut>(
        &mut self,
        task_type: &str,
        handler: F,
    ) -> Result<&mut Self, RegistrationError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |payload| handler(payload).boxed());
        self.insert(task_type, handler, HandlerStyle::Returning)
    }

    /// Register a callback-style handler that signals through [`Done`]
    pub fn register_callback<F>(
        &mut self,
        task_type: &str,
        handler: F,
    ) -> Result<&mut Self, RegistrationError>
    where
        F: Fn(Value, Done) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: TaskHandler = Arc::new(move |payload| {
            let handler = Arc::clone(&handler);
            async move {
                let (done, rx) = Done::channel();
                handler(payload, done);
                rx.await.unwrap_or_else(|_| {
                    Err(TaskError::new("handler dropped its completion handle without signalling")
                        .with_type("no_completion"))
                })
            }
            .boxed()
        });
        self.insert(task_type, wrapped, HandlerStyle::Callback)
    }

    /// Register a synchronous fire-and-return handler (runs on the blocking pool)
    pub fn register_blocking<F>(
        &mut self,
        task_type: &str,
        handler: F,
    ) -> Result<&mut Self, RegistrationError>
    where
        F: Fn(Value) -> TaskResult + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: TaskHandler = Arc::new(move |payload| {
            let handler = Arc::clone(&handler);
            async move {
                match tokio::task::spawn_blocking(move || handler(payload)).await {
                    Ok(result) => result,
                    Err(e) => Err(join_error(e)),
                }
            }
            .boxed()
        });
        self.insert(task_type, wrapped, HandlerStyle::Blocking)
    }

    /// Check if a job type is registered
    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Calling convention of a registered job type
    pub fn style(&self, task_type: &str) -> Option<HandlerStyle> {
        self.handlers.get(task_type).map(|r| r.style)
    }

    /// Get the number of registered job types
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Get all registered job type names
    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }

    /// Run the handler for `task_type`
    ///
    /// The handler runs on its own tokio task, so a panic becomes a
    /// [`TaskError`] instead of taking the caller down. Dropping the returned
    /// future aborts that task: an aborted dispatch slot leaves no handler
    /// running behind its back. Blocking handlers already on the blocking pool
    /// cannot be interrupted and run to completion.
    pub async fn invoke(&self, task_type: &str, payload: Value) -> Result<TaskResult, RegistryError> {
        let registration = self
            .handlers
            .get(task_type)
            .ok_or_else(|| RegistryError::UnknownTaskType(task_type.to_string()))?;

        let handle = tokio::spawn((registration.handler)(payload));
        let _guard = AbortOnDrop(handle.abort_handle());
        Ok(match handle.await {
            Ok(result) => result,
            Err(e) => Err(join_error(e)),
        })
    }
}

/// Aborts the handler task when the invoking future goes away
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_typed<T: Task>(task: Arc<T>, payload: Value) -> TaskResult {
    let payload: T::Payload = serde_json::from_value(payload)?;
    let output = task.run(payload).await?;
    Ok(serde_json::to_value(output)?)
}

fn join_error(e: tokio::task::JoinError) -> TaskError {
    if e.is_panic() {
        let panic = e.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        TaskError::new(format!("handler panicked: {message}")).with_type("panic")
    } else {
        TaskError::new("handler was cancelled").with_type("cancelled")
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
