//! Task trait definition and the handler calling conventions

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::oneshot;

/// Error type for handler failures
///
/// Handler failures are data: they are recorded on the failed job and can be
/// retried. The type is serializable so it can cross the child-process boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Text stored as the job's failure reason
    pub fn reason(&self) -> String {
        match &self.error_type {
            Some(kind) => format!("{kind}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_type("invalid_payload")
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string()).with_type("io")
    }
}

/// Outcome of one handler invocation
pub type TaskResult = Result<serde_json::Value, TaskError>;

/// A typed job handler that completes by returning a value
///
/// # Example
///
/// ```ignore
/// use jobqueue::prelude::*;
///
/// struct ResizeImage;
///
/// #[async_trait]
/// impl Task for ResizeImage {
///     const TYPE: &'static str = "resize_image";
///     type Payload = ResizeRequest;
///     type Output = ResizeResult;
///
///     async fn run(&self, payload: Self::Payload) -> Result<Self::Output, TaskError> {
///         // Resize...
///         Ok(ResizeResult { bytes: 1024 })
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Job type this handler serves
    const TYPE: &'static str;

    /// Payload type, decoded from the job's JSON payload
    type Payload: DeserializeOwned + Send;

    /// Output type, encoded back to JSON
    type Output: Serialize + Send;

    /// Execute the job
    async fn run(&self, payload: Self::Payload) -> Result<Self::Output, TaskError>;
}

/// Completion handle for callback-style handlers
///
/// `success` and `fail` consume the handle, so a handler cannot signal twice.
/// Dropping it without signalling fails the job.
#[derive(Debug)]
pub struct Done {
    tx: oneshot::Sender<TaskResult>,
}

impl Done {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<TaskResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Signal success without an output value
    pub fn success(self) {
        self.success_with(serde_json::Value::Null);
    }

    /// Signal success with an output value
    pub fn success_with(self, output: serde_json::Value) {
        // The receiver only disappears when the queue is torn down mid-job
        let _ = self.tx.send(Ok(output));
    }

    /// Signal failure
    pub fn fail(self, error: impl Into<TaskError>) {
        let _ = self.tx.send(Err(error.into()));
    }

    /// Signal either outcome
    pub fn finish(self, result: TaskResult) {
        let _ = self.tx.send(result);
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_reason_includes_type() {
        let error = TaskError::new("disk full").with_type("io");
        assert_eq!(error.reason(), "io: disk full");
        assert_eq!(error.to_string(), "disk full");
        assert_eq!(TaskError::new("plain").reason(), "plain");
    }

    #[test]
    fn test_task_error_serialization() {
        let error = TaskError::new("test error")
            .with_type("TEST")
            .with_details(serde_json::json!({"key": "value"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: TaskError = serde_json::from_str(&json).unwrap();

        assert_eq!(error, parsed);
    }

    #[tokio::test]
    async fn test_done_delivers_exactly_one_result() {
        let (done, rx) = Done::channel();
        done.fail("nope");
        assert_eq!(rx.await.unwrap(), Err(TaskError::new("nope")));

        let (done, rx) = Done::channel();
        drop(done);
        assert!(rx.await.is_err());
    }
}
