//! In-memory implementation of JobStore

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::store::*;
use crate::job::{ClaimToken, Job, JobId, JobState, NewJob, QueueCounts};

/// The four collections, guarded together so every transition is atomic
#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    pending: VecDeque<JobId>,
    active: HashSet<JobId>,
    failed: Vec<JobId>,
    /// resource id -> active job holding it
    locks: HashMap<String, JobId>,
    /// run id -> (owner, last heartbeat)
    runs: HashMap<Uuid, (String, DateTime<Utc>)>,
}

impl MemoryState {
    /// Detach an active job from `active` and its resource lock
    fn take_active(&mut self, job_id: JobId, claim: &ClaimToken) -> Result<&mut Job, StoreError> {
        let job = self
            .jobs
            .get(&job_id)
            .filter(|j| j.state == JobState::Active)
            .ok_or(StoreError::NotFound(job_id))?;

        if job.claimed_by.as_ref() != Some(claim) {
            return Err(StoreError::ClaimMismatch { job_id });
        }

        self.active.remove(&job_id);
        if self.locks.get(&job.resource_id) == Some(&job_id) {
            self.locks.remove(&job.resource_id);
        }

        self.jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound(job_id))
    }

    fn collect(&self, ids: impl Iterator<Item = JobId>) -> Vec<Job> {
        ids.filter_map(|id| self.jobs.get(&id).cloned()).collect()
    }
}

/// In-memory implementation of JobStore
///
/// Keeps the same semantics as the PostgreSQL and Redis stores. Only useful when
/// every dispatcher lives in the same process (child workers never touch the
/// store directly, so the child-process supervisor works with it too).
///
/// # Example
///
/// ```
/// use jobqueue::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
}

impl InMemoryJobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.state.lock() = MemoryState::default();
    }

    /// Resources currently locked by an active job
    pub fn locked_resources(&self) -> Vec<String> {
        self.state.lock().locks.keys().cloned().collect()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut state = self.state.lock();

        if let Some(existing) = job.id.and_then(|id| state.jobs.get(&id)) {
            return Ok(existing.clone());
        }

        let job = job.into_job();
        state.pending.push_back(job.id);
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(&self, claim: &ClaimToken) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock();

        let position = state.pending.iter().position(|id| {
            state
                .jobs
                .get(id)
                .is_some_and(|job| !state.locks.contains_key(&job.resource_id))
        });

        // Jobs of a locked resource are all skipped, so the first eligible job
        // is also the oldest pending job of its own resource.
        let Some(position) = position else {
            return Ok(None);
        };
        let Some(job_id) = state.pending.remove(position) else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound(job_id))?;
        job.state = JobState::Active;
        job.claimed_by = Some(claim.clone());
        let job = job.clone();

        state.active.insert(job_id);
        state.locks.insert(job.resource_id.clone(), job_id);
        Ok(Some(job))
    }

    async fn complete(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, StoreError> {
        let mut state = self.state.lock();
        state.take_active(job_id, claim)?;

        let mut job = state
            .jobs
            .remove(&job_id)
            .ok_or(StoreError::NotFound(job_id))?;
        job.claimed_by = None;
        Ok(job)
    }

    async fn fail(
        &self,
        job_id: JobId,
        claim: &ClaimToken,
        reason: &str,
    ) -> Result<Job, StoreError> {
        let mut state = self.state.lock();

        let job = state.take_active(job_id, claim)?;
        job.state = JobState::Failed;
        job.claimed_by = None;
        job.attempts += 1;
        job.last_error = Some(reason.to_string());
        let job = job.clone();

        state.failed.push(job_id);
        Ok(job)
    }

    async fn release(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, StoreError> {
        let mut state = self.state.lock();

        let job = state.take_active(job_id, claim)?;
        job.state = JobState::Pending;
        job.claimed_by = None;
        let job = job.clone();

        state.pending.push_front(job_id);
        Ok(job)
    }

    async fn retry_failed(&self) -> Result<usize, StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let failed = std::mem::take(&mut state.failed);
        let count = failed.len();
        for job_id in failed {
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.state = JobState::Pending;
                job.claimed_by = None;
                state.pending.push_back(job_id);
            }
        }

        Ok(count)
    }

    async fn delete_failed(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock();

        let failed = std::mem::take(&mut state.failed);
        for job_id in &failed {
            state.jobs.remove(job_id);
        }

        Ok(failed.len())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn list_pending(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock();
        Ok(state.collect(state.pending.iter().copied()))
    }

    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock();
        let mut jobs = state.collect(state.active.iter().copied());
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn list_failed(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock();
        Ok(state.collect(state.failed.iter().copied()))
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock();
        Ok(QueueCounts {
            pending: state.pending.len(),
            active: state.active.len(),
            failed: state.failed.len(),
        })
    }

    async fn heartbeat(&self, owner: &str, run_id: Uuid) -> Result<(), StoreError> {
        self.state
            .lock()
            .runs
            .insert(run_id, (owner.to_string(), Utc::now()));
        Ok(())
    }

    async fn end_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.state.lock().runs.remove(&run_id);
        Ok(())
    }

    async fn live_runs(&self, within: Duration) -> Result<HashSet<Uuid>, StoreError> {
        let now = Utc::now();
        let state = self.state.lock();
        Ok(state
            .runs
            .iter()
            // A heartbeat from the future (clock step) counts as fresh
            .filter(|(_, (_, at))| (now - *at).to_std().map_or(true, |age| age <= within))
            .map(|(run_id, _)| *run_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn token(slot: &str) -> ClaimToken {
        ClaimToken::new("test-queue", Uuid::nil(), slot, 0)
    }

    async fn submit(store: &InMemoryJobStore, resource: &str) -> Job {
        store
            .enqueue(NewJob::new("test_task", resource, json!({"resource": resource})))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_with_existing_id_is_idempotent() {
        let store = InMemoryJobStore::new();
        let id = Uuid::now_v7();

        let first = store
            .enqueue(NewJob::new("test_task", "r1", json!(1)).with_id(id))
            .await
            .unwrap();
        let second = store
            .enqueue(NewJob::new("other_task", "r2", json!(2)).with_id(id))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_claim_skips_locked_resources() {
        let store = InMemoryJobStore::new();
        let a1 = submit(&store, "a").await;
        let a2 = submit(&store, "a").await;
        let b1 = submit(&store, "b").await;

        let first = store.claim_next(&token("slot-0")).await.unwrap().unwrap();
        assert_eq!(first.id, a1.id);
        assert_eq!(first.state, JobState::Active);

        // a2 is older than b1 but its resource is locked
        let second = store.claim_next(&token("slot-1")).await.unwrap().unwrap();
        assert_eq!(second.id, b1.id);

        assert!(store.claim_next(&token("slot-2")).await.unwrap().is_none());

        store.complete(a1.id, &token("slot-0")).await.unwrap();
        let third = store.claim_next(&token("slot-2")).await.unwrap().unwrap();
        assert_eq!(third.id, a2.id);
    }

    #[tokio::test]
    async fn test_complete_requires_matching_claim() {
        let store = InMemoryJobStore::new();
        let job = submit(&store, "a").await;
        store.claim_next(&token("slot-0")).await.unwrap();

        let stale = ClaimToken::new("test-queue", Uuid::nil(), "slot-0", 1);
        let result = store.complete(job.id, &stale).await;
        assert!(matches!(result, Err(StoreError::ClaimMismatch { .. })));

        store.complete(job.id, &token("slot-0")).await.unwrap();
        assert!(store.get(job.id).await.unwrap().is_none());

        let again = store.complete(job.id, &token("slot-0")).await;
        assert!(matches!(again, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fail_then_retry_preserves_failure_order() {
        let store = InMemoryJobStore::new();
        let first = submit(&store, "a").await;
        let second = submit(&store, "b").await;

        store.claim_next(&token("slot-0")).await.unwrap();
        store.claim_next(&token("slot-1")).await.unwrap();

        // Fail in reverse order of submission
        let failed = store
            .fail(second.id, &token("slot-1"), "boom")
            .await
            .unwrap();
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        store.fail(first.id, &token("slot-0"), "boom").await.unwrap();

        assert!(store.locked_resources().is_empty());
        assert_eq!(store.retry_failed().await.unwrap(), 2);

        let pending: Vec<JobId> = store
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(pending, vec![second.id, first.id]);
        assert_eq!(store.counts().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn test_delete_failed_only_touches_failed() {
        let store = InMemoryJobStore::new();
        let doomed = submit(&store, "a").await;
        submit(&store, "b").await;
        submit(&store, "c").await;

        store.claim_next(&token("slot-0")).await.unwrap();
        store.claim_next(&token("slot-1")).await.unwrap();
        store.fail(doomed.id, &token("slot-0"), "boom").await.unwrap();

        assert_eq!(store.delete_failed().await.unwrap(), 1);
        assert_eq!(store.retry_failed().await.unwrap(), 0);
        assert!(store.get(doomed.id).await.unwrap().is_none());

        let counts = store.counts().await.unwrap();
        assert_eq!(counts, QueueCounts { pending: 1, active: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_release_returns_job_to_head_of_pending() {
        let store = InMemoryJobStore::new();
        let first = submit(&store, "a").await;
        submit(&store, "b").await;

        store.claim_next(&token("slot-0")).await.unwrap();
        let released = store.release(first.id, &token("slot-0")).await.unwrap();
        assert_eq!(released.state, JobState::Pending);
        assert!(released.claimed_by.is_none());

        let next = store.claim_next(&token("slot-0")).await.unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }

    #[tokio::test]
    async fn test_run_without_recent_heartbeat_is_not_live() {
        let store = InMemoryJobStore::new();
        let run_id = Uuid::now_v7();
        store.heartbeat("test-queue", run_id).await.unwrap();
        assert!(store
            .live_runs(Duration::from_secs(60))
            .await
            .unwrap()
            .contains(&run_id));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store
            .live_runs(Duration::from_millis(5))
            .await
            .unwrap()
            .is_empty());
    }
}
