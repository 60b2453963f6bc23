//! Integration tests for PostgresJobStore
//!
//! Run with: cargo test -p jobqueue --test postgres_store_test
//!
//! Requirements:
//! - PostgreSQL reachable through DATABASE_URL (tests are skipped when unset)
//! - The store applies its own migrations
//!
//! Tests share the `jobqueue_jobs` and `jobqueue_runs` tables, so they run one at a time.

mod common;

use std::sync::Arc;

use jobqueue::PostgresJobStore;
use tokio::sync::Mutex;

static DB_LOCK: Mutex<()> = Mutex::const_new(());

/// Connect, migrate and empty the table; `None` when DATABASE_URL is unset
async fn create_test_store() -> Option<PostgresJobStore> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL test");
        return None;
    };

    let store = PostgresJobStore::connect(&database_url)
        .await
        .expect("Failed to connect to PostgreSQL");
    store.migrate().await.expect("Failed to run migrations");
    for table in ["jobqueue_jobs", "jobqueue_runs"] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(store.pool())
            .await
            .unwrap_or_else(|e| panic!("Failed to clean {table}: {e}"));
    }
    Some(store)
}

macro_rules! pg_test {
    ($name:ident, $check:path) => {
        #[tokio::test]
        async fn $name() {
            let _guard = DB_LOCK.lock().await;
            let Some(store) = create_test_store().await else {
                return;
            };
            $check(&store).await;
        }
    };
}

pg_test!(test_claim_respects_resource_lock_and_fifo, common::claim_respects_resource_lock_and_fifo);
pg_test!(test_settling_requires_the_holding_claim, common::settling_requires_the_holding_claim);
pg_test!(test_retry_keeps_failure_order, common::retry_keeps_failure_order);
pg_test!(test_delete_failed_is_final, common::delete_failed_is_final);
pg_test!(test_release_returns_job_to_head, common::release_returns_job_to_head);
pg_test!(test_enqueue_with_id_is_idempotent, common::enqueue_with_id_is_idempotent);
pg_test!(test_runs_live_until_ended_or_silent, common::runs_live_until_ended_or_silent);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_resource() {
    let _guard = DB_LOCK.lock().await;
    let Some(store) = create_test_store().await else {
        return;
    };
    common::concurrent_claims_never_share_a_resource(Arc::new(store)).await;
}
