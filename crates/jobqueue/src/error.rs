//! Queue error taxonomy

use crate::job::JobId;
use crate::registry::RegistrationError;
use crate::store::StoreError;
use crate::supervisor::SupervisorError;

/// Errors surfaced by the queue facade and state machine
///
/// Handler failures are not errors at this level: they are recorded on the
/// failed job and reported through `QueueEvent::JobFail`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Submission references a job type with no registered handler
    #[error("validation error: no task registered for job type '{0}'")]
    Validation(String),

    /// A handler could not be registered
    #[error("registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// A completion/failure report for a job not held by the caller's claim
    #[error("job {0} is not active under this claim")]
    NotFound(JobId),

    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),

    /// Child process supervision failed
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// An unregistered job type reached execution; dispatch was halted
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Draining shutdown gave up waiting for in-flight jobs
    #[error("graceful shutdown timed out with {0} job(s) still active")]
    ShutdownTimeout(usize),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(job_id) | StoreError::ClaimMismatch { job_id } => {
                Self::NotFound(job_id)
            }
            other => Self::Store(other),
        }
    }
}

impl QueueError {
    /// True for stale completion reports, which callers treat as no-ops
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_claim_errors_collapse_to_not_found() {
        let job_id = Uuid::now_v7();
        assert!(QueueError::from(StoreError::ClaimMismatch { job_id }).is_not_found());
        assert!(QueueError::from(StoreError::NotFound(job_id)).is_not_found());
        assert!(!QueueError::from(StoreError::Backend("down".into())).is_not_found());
    }
}
