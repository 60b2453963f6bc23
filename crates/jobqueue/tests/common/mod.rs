//! Behaviour every JobStore backend must share
//!
//! Each check expects an empty store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jobqueue::{ClaimToken, JobState, JobStore, NewJob, StoreError};
use serde_json::json;
use uuid::Uuid;

pub fn token(owner: &str, slot: &str, generation: u64) -> ClaimToken {
    ClaimToken::new(owner, Uuid::nil(), slot, generation)
}

fn job(resource: &str, n: u64) -> NewJob {
    NewJob::new("echo", resource, json!({ "n": n }))
}

pub async fn claim_respects_resource_lock_and_fifo(store: &dyn JobStore) {
    let a1 = store.enqueue(job("a", 1)).await.unwrap();
    let a2 = store.enqueue(job("a", 2)).await.unwrap();
    let b1 = store.enqueue(job("b", 1)).await.unwrap();

    let t0 = token("q", "slot-0", 0);
    let t1 = token("q", "slot-1", 0);

    let first = store.claim_next(&t0).await.unwrap().unwrap();
    assert_eq!(first.id, a1.id);
    assert_eq!(first.state, JobState::Active);
    assert_eq!(first.claimed_by.as_ref(), Some(&t0));

    // a2 is older than b1 but its resource is locked
    let second = store.claim_next(&t1).await.unwrap().unwrap();
    assert_eq!(second.id, b1.id);
    assert!(store.claim_next(&t1).await.unwrap().is_none());

    store.complete(a1.id, &t0).await.unwrap();
    let third = store.claim_next(&t0).await.unwrap().unwrap();
    assert_eq!(third.id, a2.id);

    let counts = store.counts().await.unwrap();
    assert_eq!((counts.pending, counts.active, counts.failed), (0, 2, 0));
}

pub async fn settling_requires_the_holding_claim(store: &dyn JobStore) {
    let queued = store.enqueue(job("a", 1)).await.unwrap();
    let holder = token("q", "child-0", 0);
    store.claim_next(&holder).await.unwrap().unwrap();

    let restarted = token("q", "child-0", 1);
    let err = store.complete(queued.id, &restarted).await.unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    let err = store.fail(queued.id, &restarted, "late").await.unwrap_err();
    assert!(err.is_not_found(), "{err:?}");

    // The completed job is reported as last stored, still active but unclaimed
    let done = store.complete(queued.id, &holder).await.unwrap();
    assert_eq!(done.id, queued.id);
    assert_eq!(done.state, JobState::Active);
    assert!(done.claimed_by.is_none());
    assert!(store.get(queued.id).await.unwrap().is_none());

    let err = store.complete(queued.id, &holder).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(id) if id == queued.id));
}

pub async fn runs_live_until_ended_or_silent(store: &dyn JobStore) {
    let run_a = Uuid::now_v7();
    let run_b = Uuid::now_v7();
    store.heartbeat("q-a", run_a).await.unwrap();
    store.heartbeat("q-b", run_b).await.unwrap();
    // Heartbeating again only refreshes the run
    store.heartbeat("q-a", run_a).await.unwrap();

    let live = store.live_runs(Duration::from_secs(60)).await.unwrap();
    assert!(live.contains(&run_a) && live.contains(&run_b));

    store.end_run(run_a).await.unwrap();
    let live = store.live_runs(Duration::from_secs(60)).await.unwrap();
    assert!(!live.contains(&run_a));
    assert!(live.contains(&run_b));

    // Ending an unknown run is a no-op
    store.end_run(Uuid::now_v7()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let live = store.live_runs(Duration::from_millis(500)).await.unwrap();
    assert!(!live.contains(&run_b));
}

pub async fn retry_keeps_failure_order(store: &dyn JobStore) {
    let t = token("q", "slot-0", 0);
    let mut failed_order = Vec::new();
    for (resource, n) in [("c", 1), ("a", 2), ("b", 3)] {
        let queued = store.enqueue(job(resource, n)).await.unwrap();
        store.claim_next(&t).await.unwrap().unwrap();
        let failed = store.fail(queued.id, &t, "boom").await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        assert!(failed.claimed_by.is_none());
        failed_order.push(queued.id);
    }

    let listed: Vec<_> = store.list_failed().await.unwrap().iter().map(|j| j.id).collect();
    assert_eq!(listed, failed_order);

    assert_eq!(store.retry_failed().await.unwrap(), 3);
    let pending = store.list_pending().await.unwrap();
    assert_eq!(pending.iter().map(|j| j.id).collect::<Vec<_>>(), failed_order);
    assert!(pending.iter().all(|j| j.state == JobState::Pending && j.claimed_by.is_none()));
    assert!(pending.iter().all(|j| j.attempts == 1));

    assert_eq!(store.retry_failed().await.unwrap(), 0);
}

pub async fn delete_failed_is_final(store: &dyn JobStore) {
    let t = token("q", "slot-0", 0);
    let doomed = store.enqueue(job("a", 1)).await.unwrap();
    let waiting = store.enqueue(job("b", 2)).await.unwrap();
    store.claim_next(&t).await.unwrap().unwrap();
    store.fail(doomed.id, &t, "boom").await.unwrap();

    assert_eq!(store.delete_failed().await.unwrap(), 1);
    assert_eq!(store.retry_failed().await.unwrap(), 0);
    assert!(store.get(doomed.id).await.unwrap().is_none());

    let pending = store.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, waiting.id);
}

pub async fn release_returns_job_to_head(store: &dyn JobStore) {
    let t = token("q", "slot-0", 0);
    let first = store.enqueue(job("a", 1)).await.unwrap();
    let second = store.enqueue(job("b", 2)).await.unwrap();

    store.claim_next(&t).await.unwrap().unwrap();
    let released = store.release(first.id, &t).await.unwrap();
    assert_eq!(released.state, JobState::Pending);
    assert_eq!(released.attempts, 0);

    let pending = store.list_pending().await.unwrap();
    assert_eq!(
        pending.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );
}

pub async fn enqueue_with_id_is_idempotent(store: &dyn JobStore) {
    let id = Uuid::now_v7();
    let original = store.enqueue(job("a", 1).with_id(id)).await.unwrap();
    let again = store
        .enqueue(NewJob::new("echo", "other", json!({"n": 99})).with_id(id))
        .await
        .unwrap();

    assert_eq!(again.id, original.id);
    assert_eq!(again.resource_id, "a");
    assert_eq!(again.payload, json!({"n": 1}));
    assert_eq!(store.counts().await.unwrap().pending, 1);
}

pub async fn concurrent_claims_never_share_a_resource(store: Arc<dyn JobStore>) {
    for n in 0..4 {
        store.enqueue(job("hot", n)).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let t = token("q", &format!("slot-{i}"), 0);
            store.claim_next(&t).await.unwrap()
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);

    let counts = store.counts().await.unwrap();
    assert_eq!((counts.pending, counts.active), (3, 1));
}
