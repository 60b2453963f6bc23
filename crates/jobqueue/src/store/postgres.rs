//! PostgreSQL implementation of JobStore
//!
//! Production persistence using PostgreSQL with:
//! - A partial unique index as the resource lock (one active job per resource)
//! - Single-statement claiming with SKIP LOCKED
//! - Transactional bulk retry that keeps failure order
//! - Run heartbeats judged against the database clock

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::job::{ClaimToken, Job, JobId, JobState, NewJob, QueueCounts};

const JOB_COLUMNS: &str =
    "id, job_type, resource_id, payload, state, attempts, claim, last_error, enqueued_at";

/// SQLSTATE for unique_violation
const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL implementation of JobStore
///
/// # Example
///
/// ```ignore
/// use jobqueue::PostgresJobStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/jobs").await?;
/// let store = PostgresJobStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and build a store
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to PostgreSQL: {}", e);
            StoreError::Backend(e.to_string())
        })?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Resolve why a guarded update touched no row
    async fn missing_claim(&self, job_id: JobId) -> StoreError {
        let row = sqlx::query("SELECT state FROM jobqueue_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await;

        match row {
            Ok(Some(row)) => match row.try_get::<String, _>("state") {
                Ok(state) if state == JobState::Active.as_str() => {
                    StoreError::ClaimMismatch { job_id }
                }
                _ => StoreError::NotFound(job_id),
            },
            Ok(None) => StoreError::NotFound(job_id),
            Err(e) => backend(e),
        }
    }

    async fn list_in_state(&self, state: JobState) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobqueue_jobs WHERE state = $1 ORDER BY seq"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(row_to_job).collect()
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn row_to_job(row: &PgRow) -> Result<Job, StoreError> {
    let state: String = row.try_get("state").map_err(backend)?;
    let attempts: i32 = row.try_get("attempts").map_err(backend)?;
    let claim: Option<Json<ClaimToken>> = row.try_get("claim").map_err(backend)?;
    let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at").map_err(backend)?;

    Ok(Job {
        id: row.try_get("id").map_err(backend)?,
        job_type: row.try_get("job_type").map_err(backend)?,
        resource_id: row.try_get("resource_id").map_err(backend)?,
        payload: row.try_get("payload").map_err(backend)?,
        state: state.parse().map_err(StoreError::Serialization)?,
        attempts: attempts.max(0) as u32,
        claimed_by: claim.map(|c| c.0),
        last_error: row.try_get("last_error").map_err(backend)?,
        enqueued_at,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type, resource_id = %job.resource_id))]
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        let job = job.into_job();

        // ON CONFLICT keeps an existing job with the same id untouched
        sqlx::query(
            r#"
            INSERT INTO jobqueue_jobs (id, job_type, resource_id, payload, state, enqueued_at)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.resource_id)
        .bind(&job.payload)
        .bind(job.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue job: {}", e);
            backend(e)
        })?;

        self.get(job.id).await?.ok_or(StoreError::NotFound(job.id))
    }

    #[instrument(skip(self), fields(claim = %claim))]
    async fn claim_next(&self, claim: &ClaimToken) -> Result<Option<Job>, StoreError> {
        // The candidate must be the oldest pending job of its resource and its
        // resource must have no active job. Two claimers racing for the same
        // resource collide on the partial unique index; the loser sees
        // "nothing claimable" and polls again.
        let result = sqlx::query(&format!(
            r#"
            WITH candidate AS (
                SELECT j.id
                FROM jobqueue_jobs j
                WHERE j.state = 'pending'
                  AND NOT EXISTS (
                      SELECT 1 FROM jobqueue_jobs a
                      WHERE a.resource_id = j.resource_id AND a.state = 'active'
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM jobqueue_jobs p
                      WHERE p.resource_id = j.resource_id
                        AND p.state = 'pending'
                        AND p.seq < j.seq
                  )
                ORDER BY j.seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobqueue_jobs
            SET state = 'active',
                claim = $1,
                updated_at = NOW()
            FROM candidate
            WHERE jobqueue_jobs.id = candidate.id
            RETURNING {}
            "#,
            JOB_COLUMNS
                .split(", ")
                .map(|c| format!("jobqueue_jobs.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(Json(claim))
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => {
                let job = row_to_job(&row)?;
                debug!(job_id = %job.id, resource_id = %job.resource_id, "claimed job");
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                debug!("lost claim race on resource lock");
                Ok(None)
            }
            Err(e) => {
                error!("Failed to claim job: {}", e);
                Err(backend(e))
            }
        }
    }

    #[instrument(skip(self, claim))]
    async fn complete(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            DELETE FROM jobqueue_jobs
            WHERE id = $1 AND state = 'active' AND claim = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(Json(claim))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => {
                let mut job = row_to_job(&row)?;
                job.claimed_by = None;
                Ok(job)
            }
            None => Err(self.missing_claim(job_id).await),
        }
    }

    #[instrument(skip(self, claim, reason))]
    async fn fail(
        &self,
        job_id: JobId,
        claim: &ClaimToken,
        reason: &str,
    ) -> Result<Job, StoreError> {
        // Re-sequencing on failure orders the failed collection by failure time
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobqueue_jobs
            SET state = 'failed',
                claim = NULL,
                attempts = attempts + 1,
                last_error = $3,
                seq = nextval('jobqueue_job_seq'),
                updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND claim = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(Json(claim))
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(self.missing_claim(job_id).await),
        }
    }

    #[instrument(skip(self, claim))]
    async fn release(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, StoreError> {
        // Keeps its original seq, so it is again the oldest job of its resource
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobqueue_jobs
            SET state = 'pending',
                claim = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND claim = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(Json(claim))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(self.missing_claim(job_id).await),
        }
    }

    #[instrument(skip(self))]
    async fn retry_failed(&self) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let ids: Vec<JobId> = sqlx::query(
            "SELECT id FROM jobqueue_jobs WHERE state = 'failed' ORDER BY seq FOR UPDATE",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?
        .iter()
        .map(|row| row.try_get("id"))
        .collect::<Result<_, _>>()
        .map_err(backend)?;

        // One update per job so the new sequence numbers follow failure order
        for id in &ids {
            sqlx::query(
                r#"
                UPDATE jobqueue_jobs
                SET state = 'pending',
                    claim = NULL,
                    seq = nextval('jobqueue_job_seq'),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;

        if !ids.is_empty() {
            debug!(count = ids.len(), "requeued failed jobs");
        }
        Ok(ids.len())
    }

    #[instrument(skip(self))]
    async fn delete_failed(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM jobqueue_jobs WHERE state = 'failed'")
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(result.rows_affected() as usize)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobqueue_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_pending(&self) -> Result<Vec<Job>, StoreError> {
        self.list_in_state(JobState::Pending).await
    }

    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        self.list_in_state(JobState::Active).await
    }

    async fn list_failed(&self) -> Result<Vec<Job>, StoreError> {
        self.list_in_state(JobState::Failed).await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobqueue_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(backend)?;
            let n: i64 = row.try_get("n").map_err(backend)?;
            match state.parse() {
                Ok(JobState::Pending) => counts.pending = n as usize,
                Ok(JobState::Active) => counts.active = n as usize,
                Ok(JobState::Failed) => counts.failed = n as usize,
                Err(e) => return Err(StoreError::Serialization(e)),
            }
        }
        Ok(counts)
    }

    async fn heartbeat(&self, owner: &str, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobqueue_runs (run_id, owner, heartbeat_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (run_id) DO UPDATE SET heartbeat_at = NOW()
            "#,
        )
        .bind(run_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record run heartbeat: {}", e);
            backend(e)
        })?;
        Ok(())
    }

    async fn end_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobqueue_runs WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn live_runs(&self, within: Duration) -> Result<HashSet<Uuid>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id FROM jobqueue_runs WHERE heartbeat_at >= NOW() - make_interval(secs => $1)",
        )
        .bind(within.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("run_id").map_err(backend))
            .collect()
    }
}
