//! Store behaviour checks against InMemoryJobStore

mod common;

use std::sync::Arc;

use jobqueue::InMemoryJobStore;

#[tokio::test]
async fn test_claim_respects_resource_lock_and_fifo() {
    common::claim_respects_resource_lock_and_fifo(&InMemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_settling_requires_the_holding_claim() {
    common::settling_requires_the_holding_claim(&InMemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_retry_keeps_failure_order() {
    common::retry_keeps_failure_order(&InMemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_delete_failed_is_final() {
    common::delete_failed_is_final(&InMemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_release_returns_job_to_head() {
    common::release_returns_job_to_head(&InMemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_enqueue_with_id_is_idempotent() {
    common::enqueue_with_id_is_idempotent(&InMemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_runs_live_until_ended_or_silent() {
    common::runs_live_until_ended_or_silent(&InMemoryJobStore::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_resource() {
    common::concurrent_claims_never_share_a_resource(Arc::new(InMemoryJobStore::new())).await;
}
