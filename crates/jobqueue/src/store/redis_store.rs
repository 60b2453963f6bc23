//! Redis implementation of JobStore
//!
//! Layout (all keys share a configurable prefix, default `jobqueue`):
//! - `{prefix}:pending` list of job ids, claim order
//! - `{prefix}:active` set of job ids
//! - `{prefix}:failed` list of job ids, failure order
//! - `{prefix}:locks` hash resource id -> active job id
//! - `{prefix}:job:{id}` hash with the job fields
//! - `{prefix}:runs` hash run id -> last heartbeat (unix millis)
//! - `{prefix}:run_owners` hash run id -> queue instance
//!
//! Every transition touching more than one key runs as a Lua script, so it is
//! atomic for all clients of the server. Scripts build job keys from the prefix
//! at run time, which requires a standalone (non-cluster) deployment.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::job::{ClaimToken, Job, JobId, JobState, NewJob, QueueCounts};

const DEFAULT_PREFIX: &str = "jobqueue";

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1],
  'id', ARGV[1], 'job_type', ARGV[2], 'resource_id', ARGV[3],
  'payload', ARGV[4], 'state', 'pending', 'attempts', '0', 'enqueued_at', ARGV[5])
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
"#;

// First pending job whose resource is unlocked. Once a resource is seen locked,
// every later job of that resource is skipped too, keeping per-resource FIFO.
const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
local blocked = {}
for _, id in ipairs(ids) do
  local key = ARGV[1] .. id
  local resource = redis.call('HGET', key, 'resource_id')
  if resource and not blocked[resource] then
    if redis.call('HSETNX', KEYS[3], resource, id) == 1 then
      redis.call('LREM', KEYS[1], 1, id)
      redis.call('SADD', KEYS[2], id)
      redis.call('HSET', key, 'state', 'active', 'claim', ARGV[2])
      return id
    end
    blocked[resource] = true
  end
end
return false
"#;

// ARGV[3] selects the transition: complete | fail | release
const SETTLE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then
  return {'missing'}
end
if redis.call('HGET', KEYS[1], 'claim') ~= ARGV[2] then
  return {'mismatch'}
end
local resource = redis.call('HGET', KEYS[1], 'resource_id')
redis.call('SREM', KEYS[2], ARGV[1])
if redis.call('HGET', KEYS[3], resource) == ARGV[1] then
  redis.call('HDEL', KEYS[3], resource)
end
redis.call('HDEL', KEYS[1], 'claim')
if ARGV[3] == 'complete' then
  local data = redis.call('HGETALL', KEYS[1])
  redis.call('DEL', KEYS[1])
  return data
elseif ARGV[3] == 'fail' then
  redis.call('HSET', KEYS[1], 'state', 'failed', 'last_error', ARGV[4])
  redis.call('HINCRBY', KEYS[1], 'attempts', 1)
  redis.call('RPUSH', KEYS[5], ARGV[1])
else
  redis.call('HSET', KEYS[1], 'state', 'pending')
  redis.call('LPUSH', KEYS[4], ARGV[1])
end
return redis.call('HGETALL', KEYS[1])
"#;

const RETRY_SCRIPT: &str = r#"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
for _, id in ipairs(ids) do
  local key = ARGV[1] .. id
  redis.call('HSET', key, 'state', 'pending')
  redis.call('HDEL', key, 'claim')
  redis.call('RPUSH', KEYS[2], id)
end
redis.call('DEL', KEYS[1])
return #ids
"#;

const DELETE_SCRIPT: &str = r#"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
for _, id in ipairs(ids) do
  redis.call('DEL', ARGV[1] .. id)
end
redis.call('DEL', KEYS[1])
return #ids
"#;

fn redis_err(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Redis implementation of JobStore
///
/// # Example
///
/// ```ignore
/// use jobqueue::RedisJobStore;
///
/// let store = RedisJobStore::connect("redis://localhost:6379", None).await?;
/// ```
#[derive(Clone)]
pub struct RedisJobStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisJobStore {
    /// Connect to `redis_url`; `prefix` namespaces every key (default `jobqueue`)
    pub async fn connect(redis_url: &str, prefix: Option<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            error!("Failed to open Redis client: {}", e);
            redis_err(e)
        })?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(redis_err)?;

        Ok(Self {
            conn,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, job_id: JobId) -> String {
        format!("{}{}", self.job_prefix(), job_id)
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(job_id))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        if fields.is_empty() {
            return Ok(None);
        }
        hash_to_job(fields).map(Some)
    }

    async fn load_all(&self, ids: Vec<String>) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for raw in ids {
            let job_id = Uuid::parse_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
            // A job settled between the listing and the load is simply skipped
            if let Some(job) = self.load(job_id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn settle(
        &self,
        job_id: JobId,
        claim: &ClaimToken,
        mode: &str,
        reason: &str,
    ) -> Result<Job, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = Script::new(SETTLE_SCRIPT)
            .key(self.job_key(job_id))
            .key(self.key("active"))
            .key(self.key("locks"))
            .key(self.key("pending"))
            .key(self.key("failed"))
            .arg(job_id.to_string())
            .arg(claim.to_json())
            .arg(mode)
            .arg(reason)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        match reply.as_slice() {
            [status] if status == "mismatch" => Err(StoreError::ClaimMismatch { job_id }),
            [_] => Err(StoreError::NotFound(job_id)),
            pairs => hash_to_job(flat_to_map(pairs)),
        }
    }
}

fn flat_to_map(pairs: &[String]) -> HashMap<String, String> {
    pairs
        .chunks(2)
        .filter_map(|kv| match kv {
            [k, v] => Some((k.clone(), v.clone())),
            _ => None,
        })
        .collect()
}

fn hash_to_job(mut fields: HashMap<String, String>) -> Result<Job, StoreError> {
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| StoreError::Serialization(format!("job hash missing field {name}")))
    };

    let id = Uuid::parse_str(&take("id")?).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let job_type = take("job_type")?;
    let resource_id = take("resource_id")?;
    let payload = serde_json::from_str(&take("payload")?)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let state: JobState = take("state")?.parse().map_err(StoreError::Serialization)?;
    let attempts = take("attempts")?
        .parse()
        .map_err(|e: std::num::ParseIntError| StoreError::Serialization(e.to_string()))?;
    let enqueued_at = DateTime::parse_from_rfc3339(&take("enqueued_at")?)
        .map_err(|e| StoreError::Serialization(e.to_string()))?
        .with_timezone(&Utc);

    Ok(Job {
        id,
        job_type,
        resource_id,
        payload,
        state,
        attempts,
        claimed_by: fields.get("claim").and_then(|raw| ClaimToken::from_json(raw)),
        last_error: fields.remove("last_error"),
        enqueued_at,
    })
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type, resource_id = %job.resource_id))]
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        let job = job.into_job();
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let inserted: i64 = Script::new(ENQUEUE_SCRIPT)
            .key(self.job_key(job.id))
            .key(self.key("pending"))
            .arg(job.id.to_string())
            .arg(&job.job_type)
            .arg(&job.resource_id)
            .arg(payload)
            .arg(job.enqueued_at.to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        if inserted == 0 {
            debug!(job_id = %job.id, "job already enqueued");
        }
        self.load(job.id).await?.ok_or(StoreError::NotFound(job.id))
    }

    #[instrument(skip(self), fields(claim = %claim))]
    async fn claim_next(&self, claim: &ClaimToken) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = Script::new(CLAIM_SCRIPT)
            .key(self.key("pending"))
            .key(self.key("active"))
            .key(self.key("locks"))
            .arg(self.job_prefix())
            .arg(claim.to_json())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let Some(raw) = claimed else {
            return Ok(None);
        };
        let job_id = Uuid::parse_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
        // The claim owns the job now; nobody else can change it under us
        self.load(job_id).await
    }

    async fn complete(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, StoreError> {
        self.settle(job_id, claim, "complete", "").await
    }

    async fn fail(
        &self,
        job_id: JobId,
        claim: &ClaimToken,
        reason: &str,
    ) -> Result<Job, StoreError> {
        self.settle(job_id, claim, "fail", reason).await
    }

    async fn release(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, StoreError> {
        self.settle(job_id, claim, "release", "").await
    }

    async fn retry_failed(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let count: usize = Script::new(RETRY_SCRIPT)
            .key(self.key("failed"))
            .key(self.key("pending"))
            .arg(self.job_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(count)
    }

    async fn delete_failed(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let count: usize = Script::new(DELETE_SCRIPT)
            .key(self.key("failed"))
            .arg(self.job_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(count)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.load(job_id).await
    }

    async fn list_pending(&self) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key("pending"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        self.load_all(ids).await
    }

    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key("active"))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        ids.sort();
        self.load_all(ids).await
    }

    async fn list_failed(&self) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key("failed"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        self.load_all(ids).await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let mut conn = self.conn.clone();
        let (pending, active, failed): (usize, usize, usize) = redis::pipe()
            .cmd("LLEN")
            .arg(self.key("pending"))
            .cmd("SCARD")
            .arg(self.key("active"))
            .cmd("LLEN")
            .arg(self.key("failed"))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(QueueCounts {
            pending,
            active,
            failed,
        })
    }

    async fn heartbeat(&self, owner: &str, run_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let run = run_id.to_string();
        redis::pipe()
            .atomic()
            .hset(self.key("runs"), &run, Utc::now().timestamp_millis())
            .ignore()
            .hset(self.key("run_owners"), &run, owner)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to record run heartbeat: {}", e);
                redis_err(e)
            })
    }

    async fn end_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let run = run_id.to_string();
        redis::pipe()
            .atomic()
            .hdel(self.key("runs"), &run)
            .ignore()
            .hdel(self.key("run_owners"), &run)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_err)
    }

    async fn live_runs(&self, within: Duration) -> Result<HashSet<Uuid>, StoreError> {
        let mut conn = self.conn.clone();
        let runs: HashMap<String, i64> = redis::cmd("HGETALL")
            .arg(self.key("runs"))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let window = i64::try_from(within.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(window);
        runs.into_iter()
            .filter(|(_, at)| *at >= cutoff)
            .map(|(raw, _)| Uuid::parse_str(&raw).map_err(|e| StoreError::Serialization(e.to_string())))
            .collect()
    }
}
