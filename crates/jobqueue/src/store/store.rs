//! JobStore trait definition

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::job::{ClaimToken, Job, JobId, NewJob, QueueCounts};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job does not exist or is not in the state the operation requires
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Job is active but owned by a different claim
    #[error("job {job_id} is claimed by another worker")]
    ClaimMismatch { job_id: JobId },

    /// Backend (database / network) error
    #[error("store backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// True for the errors a stale completion report produces
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::ClaimMismatch { .. })
    }
}

/// Durable home of the pending, active and failed collections
///
/// Every method is a single atomic transition with respect to every other
/// reader of the same store, including readers in other processes. Resource
/// exclusivity is the store's responsibility: `claim_next` must never hand out
/// a job whose `resource_id` already has an active job.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Append a job to pending
    ///
    /// If the submission carries an id that already exists, the existing job is
    /// returned unchanged.
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Claim the oldest pending job whose resource has no active job
    ///
    /// Returns `None` when nothing is claimable. Jobs sharing a resource are
    /// handed out strictly in enqueue order.
    async fn claim_next(&self, claim: &ClaimToken) -> Result<Option<Job>, StoreError>;

    /// Remove an active job held by `claim`
    ///
    /// Returns the last stored snapshot of the removed job, taken while it was
    /// still active: `state` stays `Active` while `claimed_by` is cleared.
    async fn complete(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, StoreError>;

    /// Move an active job held by `claim` to failed, recording `reason`
    async fn fail(&self, job_id: JobId, claim: &ClaimToken, reason: &str)
        -> Result<Job, StoreError>;

    /// Put an active job held by `claim` back at the head of pending
    async fn release(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, StoreError>;

    /// Move every failed job back to pending, keeping failure order
    async fn retry_failed(&self) -> Result<usize, StoreError>;

    /// Drop every failed job
    async fn delete_failed(&self) -> Result<usize, StoreError>;

    /// Look up a single job in any collection
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Pending jobs in claim order
    async fn list_pending(&self) -> Result<Vec<Job>, StoreError>;

    /// Active jobs
    async fn list_active(&self) -> Result<Vec<Job>, StoreError>;

    /// Failed jobs in failure order
    async fn list_failed(&self) -> Result<Vec<Job>, StoreError>;

    /// Size of each collection
    async fn counts(&self) -> Result<QueueCounts, StoreError>;

    /// Record that the run `run_id` of queue instance `owner` is alive
    async fn heartbeat(&self, owner: &str, run_id: Uuid) -> Result<(), StoreError>;

    /// Forget a run that stopped cleanly; its claims are dead from now on
    async fn end_run(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Runs whose last heartbeat is no older than `within`
    async fn live_runs(&self, within: Duration) -> Result<HashSet<Uuid>, StoreError>;
}
