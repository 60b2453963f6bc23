//! Job model: the unit of work and the claim that binds it to a worker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque job identifier
pub type JobId = Uuid;

/// Durable collection a job currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed
    Pending,

    /// Claimed by a worker and executing
    Active,

    /// Handler failed or the owning worker died; waits for retry or delete
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Identity of the execution slot holding a job
///
/// A claim is only honoured for completion while it matches the token recorded
/// in the store. `generation` increments every time the slot's worker process is
/// replaced, so reports from a since-restarted worker no longer match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimToken {
    /// Queue instance that issued the claim
    pub owner: String,

    /// Identifies one `start()` of that instance
    pub run_id: Uuid,

    /// Execution slot name (`slot-N` or `child-N`)
    pub slot: String,

    /// Restart counter of the slot when the claim was made
    pub generation: u64,
}

impl ClaimToken {
    pub fn new(owner: impl Into<String>, run_id: Uuid, slot: impl Into<String>, generation: u64) -> Self {
        Self {
            owner: owner.into(),
            run_id,
            slot: slot.into(),
            generation,
        }
    }

    /// Stable string form used by stores that compare claims textually
    pub fn to_json(&self) -> String {
        // A struct of strings and integers always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

impl std::fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.slot, self.generation)
    }
}

/// A job as stored in the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Key into the task registry
    pub job_type: String,

    /// Resource this job touches; at most one active job per resource
    pub resource_id: String,

    /// Passed to the handler unchanged
    pub payload: serde_json::Value,

    pub state: JobState,

    /// Number of failed execution attempts
    pub attempts: u32,

    /// Present only while the job is active
    pub claimed_by: Option<ClaimToken>,

    /// Reason recorded by the most recent failure
    pub last_error: Option<String>,

    pub enqueued_at: DateTime<Utc>,
}

/// Submission of a new job
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Pre-assigned id; enqueueing an id that already exists is a no-op
    pub id: Option<JobId>,
    pub job_type: String,
    pub resource_id: String,
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn new(
        job_type: impl Into<String>,
        resource_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            resource_id: resource_id.into(),
            payload,
        }
    }

    /// Use a caller-chosen id (makes submission idempotent)
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    /// Materialize the pending job this submission creates
    pub(crate) fn into_job(self) -> Job {
        Job {
            id: self.id.unwrap_or_else(Uuid::now_v7),
            job_type: self.job_type,
            resource_id: self.resource_id,
            payload: self.payload,
            state: JobState::Pending,
            attempts: 0,
            claimed_by: None,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }
}

/// Size of each durable collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub active: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.active + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_round_trips_through_str() {
        for state in [JobState::Pending, JobState::Active, JobState::Failed] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("done".parse::<JobState>().is_err());
    }

    #[test]
    fn test_new_job_generates_id_unless_given() {
        let generated = NewJob::new("echo", "r1", serde_json::Value::Null).into_job();
        assert_eq!(generated.state, JobState::Pending);
        assert_eq!(generated.attempts, 0);
        assert!(generated.claimed_by.is_none());

        let id = Uuid::now_v7();
        let fixed = NewJob::new("echo", "r1", serde_json::Value::Null)
            .with_id(id)
            .into_job();
        assert_eq!(fixed.id, id);
    }

    #[test]
    fn test_claim_token_json_is_stable() {
        let token = ClaimToken::new("queue-a", Uuid::now_v7(), "child-2", 3);
        let raw = token.to_json();
        assert_eq!(raw, token.clone().to_json());
        assert_eq!(ClaimToken::from_json(&raw), Some(token.clone()));
        assert_eq!(token.to_string(), "queue-a/child-2#3");
    }
}
