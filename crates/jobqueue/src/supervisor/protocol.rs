//! Wire messages between the queue and its child workers
//!
//! One JSON object per line. The parent writes [`ChildRequest`]s to the child's
//! stdin and reads [`ChildResponse`]s from its stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobId;
use crate::registry::{TaskError, TaskResult};

/// Parent → child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildRequest {
    /// Execute one job
    Run {
        job_id: JobId,
        job_type: String,
        payload: Value,
    },

    /// Exit after the current job
    Shutdown,
}

/// Child → parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildResponse {
    /// Sent once after startup; the child accepts `Run` from now on
    Ready { pid: u32 },

    /// Result of a `Run`
    Done { job_id: JobId, outcome: JobOutcome },
}

/// How a job ended inside the child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Success { output: Value },
    Failure { error: TaskError },
    UnknownTask { job_type: String },
}

impl JobOutcome {
    pub fn from_result(result: TaskResult) -> Self {
        match result {
            Ok(output) => Self::Success { output },
            Err(error) => Self::Failure { error },
        }
    }
}

pub(crate) fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_messages_are_single_tagged_lines() {
        let job_id = Uuid::now_v7();
        let line = encode(&ChildRequest::Run {
            job_id,
            job_type: "hitCount".into(),
            payload: json!({"path": "/tmp/x"}),
        })
        .unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["type"], "run");
        assert_eq!(value["job_type"], "hitCount");
    }

    #[test]
    fn test_failure_outcome_carries_task_error() {
        let raw = json!({
            "type": "done",
            "job_id": Uuid::nil(),
            "outcome": {
                "status": "failure",
                "error": {"message": "boom", "error_type": "io", "details": null}
            }
        });

        let response: ChildResponse = serde_json::from_value(raw).unwrap();
        let ChildResponse::Done { outcome, .. } = response else {
            panic!("expected done");
        };
        let JobOutcome::Failure { error } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error.message, "boom");
        assert_eq!(error.error_type.as_deref(), Some("io"));
    }
}
