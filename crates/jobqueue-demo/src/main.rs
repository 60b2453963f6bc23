use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobqueue::prelude::*;
use jobqueue::supervisor::{is_child_process, run_child};
use jobqueue_demo::{demo_registry, init_logging, HitCountTask};
use serde_json::json;

/// Jobs submitted by the demo run
const DEMO_JOBS: usize = 20;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let registry = demo_registry().context("Failed to build task registry")?;

    if is_child_process() {
        // Spawned by a parent queue: serve jobs over stdin/stdout
        return run_child(registry).await.context("Child worker failed");
    }

    let config = QueueConfig::from_env();
    let store = open_store().await?;

    tracing::info!(
        worker_id = %config.worker_id,
        worker_count = config.worker_count,
        child_process_count = config.child_process_count,
        "jobqueue-demo starting..."
    );

    let queue = JobQueue::builder()
        .config(config)
        .shared_store(store)
        .registry(registry)
        .build()?;

    let mut events = queue.subscribe();
    queue.start().await?;

    let counter = std::env::temp_dir().join(format!("jobqueue-demo-{}", uuid::Uuid::now_v7()));
    for _ in 0..DEMO_JOBS {
        queue
            .submit_job(
                HitCountTask::TYPE,
                "demo-counter",
                json!({ "path": counter, "delay_ms": 5 }),
            )
            .await?;
    }

    let mut settled = 0;
    let wait = async {
        while settled < DEMO_JOBS {
            match events.recv().await {
                Some(QueueEvent::JobSuccess { job }) => {
                    settled += 1;
                    tracing::info!(job_id = %job.id, settled, "Job succeeded");
                }
                Some(QueueEvent::JobFail { job }) => {
                    settled += 1;
                    tracing::warn!(job_id = %job.id, reason = ?job.last_error, "Job failed");
                }
                Some(QueueEvent::ChildRestart { slot, generation, .. }) => {
                    tracing::warn!(slot, generation, "Child worker restarted");
                }
                None => {
                    tracing::error!("Event stream closed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = wait => {}
        _ = tokio::time::sleep(Duration::from_secs(60)) => {
            tracing::warn!("Demo timed out waiting for jobs");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    let report = queue.shutdown().await?;
    let count = std::fs::read_to_string(&counter).unwrap_or_default();
    tracing::info!(
        counter = %count.trim(),
        left_active = report.left_active.len(),
        "Demo finished"
    );
    let _ = std::fs::remove_file(&counter);

    Ok(())
}

/// PostgreSQL when DATABASE_URL is set, Redis when REDIS_URL is set (feature
/// `redis`), otherwise in-memory
async fn open_store() -> Result<Arc<dyn JobStore>> {
    if let Some(store) = open_redis().await? {
        return Ok(store);
    }

    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let store = PostgresJobStore::connect(&url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Using PostgreSQL job store");
            Ok(Arc::new(store))
        }
        Err(_) => {
            tracing::info!("DATABASE_URL not set, using in-memory job store");
            Ok(Arc::new(InMemoryJobStore::new()))
        }
    }
}

#[cfg(feature = "redis")]
async fn open_redis() -> Result<Option<Arc<dyn JobStore>>> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        return Ok(None);
    };
    let store = jobqueue::RedisJobStore::connect(&url, None)
        .await
        .context("Failed to connect to Redis")?;
    tracing::info!("Using Redis job store");
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "redis"))]
async fn open_redis() -> Result<Option<Arc<dyn JobStore>>> {
    Ok(None)
}
