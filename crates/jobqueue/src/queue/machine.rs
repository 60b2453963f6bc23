//! Queue state machine: every durable job transition goes through here

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::QueueError;
use crate::job::{ClaimToken, Job, JobId, NewJob, QueueCounts};
use crate::registry::TaskRegistry;
use crate::store::JobStore;

/// Failure reason recorded by a stale flush
pub const STALE_REASON: &str = "stale";

/// Transitions of jobs between pending, active and failed
///
/// Atomicity and resource exclusivity are enforced by the store; this layer
/// adds submission validation, logging and the stale-flush sweep.
#[derive(Clone)]
pub struct QueueStateMachine {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
}

impl QueueStateMachine {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<TaskRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Validate and append a job to pending
    #[instrument(skip(self, job), fields(job_type = %job.job_type, resource_id = %job.resource_id))]
    pub async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        if !self.registry.contains(&job.job_type) {
            return Err(QueueError::Validation(job.job_type));
        }

        let job = self.store.enqueue(job).await?;
        info!(job_id = %job.id, "Job enqueued");
        Ok(job)
    }

    /// Claim the next claimable job under `claim`
    pub async fn claim_next(&self, claim: &ClaimToken) -> Result<Option<Job>, QueueError> {
        let job = self.store.claim_next(claim).await?;
        if let Some(job) = &job {
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                resource_id = %job.resource_id,
                claim = %claim,
                "Job claimed"
            );
        }
        Ok(job)
    }

    /// Remove a finished job
    ///
    /// Fails with [`QueueError::NotFound`] when `claim` no longer holds the job.
    pub async fn complete(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, QueueError> {
        let job = self.store.complete(job_id, claim).await?;
        info!(%job_id, job_type = %job.job_type, "Job completed");
        Ok(job)
    }

    /// Move a job to failed with `reason`
    pub async fn fail(
        &self,
        job_id: JobId,
        claim: &ClaimToken,
        reason: &str,
    ) -> Result<Job, QueueError> {
        let job = self.store.fail(job_id, claim, reason).await?;
        warn!(%job_id, job_type = %job.job_type, attempts = job.attempts, reason, "Job failed");
        Ok(job)
    }

    /// Put a job back at the head of pending without counting an attempt
    pub async fn release(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, QueueError> {
        let job = self.store.release(job_id, claim).await?;
        debug!(%job_id, "Job released");
        Ok(job)
    }

    #[instrument(skip(self))]
    pub async fn retry_failed_jobs(&self) -> Result<usize, QueueError> {
        let moved = self.store.retry_failed().await?;
        info!(moved, "Failed jobs moved back to pending");
        Ok(moved)
    }

    #[instrument(skip(self))]
    pub async fn delete_failed_jobs(&self) -> Result<usize, QueueError> {
        let deleted = self.store.delete_failed().await?;
        info!(deleted, "Failed jobs deleted");
        Ok(deleted)
    }

    /// Fail every active job whose claim `is_stale` judges dead
    ///
    /// Returns the jobs moved to failed. A job settled concurrently by its
    /// worker is skipped.
    #[instrument(skip(self, is_stale))]
    pub async fn force_flush_stale_jobs<F>(&self, is_stale: F) -> Result<Vec<Job>, QueueError>
    where
        F: Fn(&ClaimToken) -> bool,
    {
        let active = self.store.list_active().await?;
        let mut flushed = Vec::new();

        for job in active {
            let Some(claim) = job.claimed_by.as_ref() else {
                continue;
            };
            if !is_stale(claim) {
                continue;
            }

            match self.store.fail(job.id, claim, STALE_REASON).await {
                Ok(failed) => {
                    warn!(job_id = %failed.id, job_type = %failed.job_type, claim = %claim, "Flushed stale job");
                    flushed.push(failed);
                }
                Err(e) if e.is_not_found() => {
                    debug!(job_id = %job.id, "Stale job settled before flush");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !flushed.is_empty() {
            info!(count = flushed.len(), "Stale jobs flushed");
        }
        Ok(flushed)
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        Ok(self.store.counts().await?)
    }

    pub async fn failed_jobs(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list_failed().await?)
    }

    pub async fn active_jobs(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list_active().await?)
    }

    pub async fn pending_jobs(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list_pending().await?)
    }
}

impl std::fmt::Debug for QueueStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStateMachine")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::store::InMemoryJobStore;
    use serde_json::json;
    use uuid::Uuid;

    fn machine() -> QueueStateMachine {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("echo", |payload| async move { Ok(payload) })
            .unwrap();
        QueueStateMachine::new(Arc::new(InMemoryJobStore::new()), Arc::new(registry))
    }

    fn token(slot: &str, generation: u64) -> ClaimToken {
        ClaimToken::new("queue-a", Uuid::nil(), slot, generation)
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unregistered_type() {
        let machine = machine();
        let err = machine
            .enqueue(NewJob::new("missing", "r1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(t) if t == "missing"));
        assert_eq!(machine.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_stale_completion_is_not_found() {
        let machine = machine();
        let job = machine
            .enqueue(NewJob::new("echo", "r1", json!({})))
            .await
            .unwrap();
        let claim = token("slot-0", 0);
        machine.claim_next(&claim).await.unwrap().unwrap();

        let err = machine
            .complete(job.id, &token("slot-0", 1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        machine.complete(job.id, &claim).await.unwrap();
        assert!(machine.complete(job.id, &claim).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_force_flush_fails_only_stale_claims() {
        let machine = machine();
        machine
            .enqueue(NewJob::new("echo", "r1", json!({})))
            .await
            .unwrap();
        machine
            .enqueue(NewJob::new("echo", "r2", json!({})))
            .await
            .unwrap();

        let dead = token("child-0", 0);
        let live = token("child-1", 0);
        let dead_job = machine.claim_next(&dead).await.unwrap().unwrap();
        machine.claim_next(&live).await.unwrap().unwrap();

        let flushed = machine
            .force_flush_stale_jobs(|claim| claim.slot == "child-0")
            .await
            .unwrap();

        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].id, dead_job.id);
        assert_eq!(flushed[0].state, JobState::Failed);
        assert_eq!(flushed[0].last_error.as_deref(), Some(STALE_REASON));

        let counts = machine.counts().await.unwrap();
        assert_eq!((counts.pending, counts.active, counts.failed), (0, 1, 1));
    }
}
