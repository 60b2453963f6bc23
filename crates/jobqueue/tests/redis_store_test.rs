//! Integration tests for RedisJobStore
//!
//! Run with: cargo test -p jobqueue --features redis --test redis_store_test
//!
//! Requirements:
//! - Redis reachable through REDIS_URL (tests are skipped when unset)
//!
//! Every test uses its own key prefix, so tests may run in parallel.

#![cfg(feature = "redis")]

mod common;

use std::sync::Arc;

use jobqueue::RedisJobStore;
use uuid::Uuid;

async fn create_test_store() -> Option<RedisJobStore> {
    let Ok(redis_url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set, skipping Redis test");
        return None;
    };

    let prefix = format!("jobqueue-test-{}", Uuid::now_v7());
    let store = RedisJobStore::connect(&redis_url, Some(prefix))
        .await
        .expect("Failed to connect to Redis");
    Some(store)
}

macro_rules! redis_test {
    ($name:ident, $check:path) => {
        #[tokio::test]
        async fn $name() {
            let Some(store) = create_test_store().await else {
                return;
            };
            $check(&store).await;
        }
    };
}

redis_test!(test_claim_respects_resource_lock_and_fifo, common::claim_respects_resource_lock_and_fifo);
redis_test!(test_settling_requires_the_holding_claim, common::settling_requires_the_holding_claim);
redis_test!(test_retry_keeps_failure_order, common::retry_keeps_failure_order);
redis_test!(test_delete_failed_is_final, common::delete_failed_is_final);
redis_test!(test_release_returns_job_to_head, common::release_returns_job_to_head);
redis_test!(test_enqueue_with_id_is_idempotent, common::enqueue_with_id_is_idempotent);
redis_test!(test_runs_live_until_ended_or_silent, common::runs_live_until_ended_or_silent);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_resource() {
    let Some(store) = create_test_store().await else {
        return;
    };
    common::concurrent_claims_never_share_a_resource(Arc::new(store)).await;
}
