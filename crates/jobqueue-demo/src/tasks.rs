//! Sample job handlers
//!
//! Every handler keeps its state in files named by the payload, so it behaves
//! the same in-process and inside a child worker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use jobqueue::{Task, TaskError, TaskRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Payload of the counter-file tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterInput {
    pub path: PathBuf,

    /// Pause between read and write, widening the lost-update window
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterOutput {
    pub count: u64,
}

/// Read-modify-write increment of a counter file
///
/// Not atomic on purpose: concurrent runs against one file lose updates,
/// which resource exclusivity has to prevent.
pub struct HitCountTask;

#[async_trait]
impl Task for HitCountTask {
    const TYPE: &'static str = "hitCount";
    type Payload = CounterInput;
    type Output = CounterOutput;

    async fn run(&self, input: CounterInput) -> Result<CounterOutput, TaskError> {
        let count = increment(&input.path, input.delay_ms).await?;
        Ok(CounterOutput { count })
    }
}

/// Counts its invocations and fails the first one
pub struct FailFirstTask;

#[async_trait]
impl Task for FailFirstTask {
    const TYPE: &'static str = "failFirst";
    type Payload = CounterInput;
    type Output = CounterOutput;

    async fn run(&self, input: CounterInput) -> Result<CounterOutput, TaskError> {
        let count = increment(&input.path, input.delay_ms).await?;
        if count == 1 {
            return Err(TaskError::new("first invocation always fails").with_type("fail_first"));
        }
        Ok(CounterOutput { count })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrashInput {
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
}

fn default_exit_code() -> i32 {
    70
}

/// Terminates the hosting process
///
/// Only meaningful inside a child worker; run in-process it takes the queue down.
pub struct CrashTask;

#[async_trait]
impl Task for CrashTask {
    const TYPE: &'static str = "crashTask";
    type Payload = CrashInput;
    type Output = ();

    async fn run(&self, input: CrashInput) -> Result<(), TaskError> {
        tracing::warn!(exit_code = input.exit_code, "crashTask terminating worker process");
        std::process::exit(input.exit_code)
    }
}

async fn increment(path: &Path, delay_ms: u64) -> Result<u64, TaskError> {
    let current = match tokio::fs::read_to_string(path).await {
        Ok(text) => text.trim().parse::<u64>().map_err(|e| {
            TaskError::new(format!("counter file {} is corrupt: {e}", path.display()))
                .with_type("corrupt_counter")
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    let next = current + 1;
    tokio::fs::write(path, next.to_string()).await?;
    Ok(next)
}

/// Registry shared by the demo parent and its child workers
pub fn demo_registry() -> Result<TaskRegistry, jobqueue::registry::RegistrationError> {
    let mut registry = TaskRegistry::new();
    registry
        .register(HitCountTask)?
        .register(FailFirstTask)?
        .register(CrashTask)?
        .register_fn("echo", |payload| async move { Ok(payload) })?
        .register_callback("delayedEcho", |payload, done| {
            let delay = payload["delay_ms"].as_u64().unwrap_or(10);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                done.success_with(payload);
            });
        })?
        .register_blocking("wordCount", |payload: Value| {
            let text = payload["text"]
                .as_str()
                .ok_or_else(|| TaskError::new("missing text").with_type("invalid_payload"))?;
            Ok(json!({ "words": text.split_whitespace().count() }))
        })?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("jobqueue-demo-{name}-{}", uuid::Uuid::now_v7()))
    }

    #[tokio::test]
    async fn test_hit_count_increments_file() {
        let path = scratch_file("hits");
        let payload = json!({ "path": path });

        let registry = demo_registry().unwrap();
        for expected in 1..=3 {
            let output = registry.invoke("hitCount", payload.clone()).await.unwrap().unwrap();
            assert_eq!(output["count"], expected);
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "3");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_fail_first_fails_only_once() {
        let path = scratch_file("fail-first");
        let payload = json!({ "path": path });
        let registry = demo_registry().unwrap();

        let first = registry.invoke("failFirst", payload.clone()).await.unwrap();
        assert_eq!(first.unwrap_err().error_type.as_deref(), Some("fail_first"));
        let second = registry.invoke("failFirst", payload).await.unwrap();
        assert_eq!(second.unwrap()["count"], 2);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_other_conventions() {
        let registry = demo_registry().unwrap();

        let echoed = registry
            .invoke("delayedEcho", json!({ "delay_ms": 1, "x": 1 }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed["x"], 1);

        let counted = registry
            .invoke("wordCount", json!({ "text": "one two  three" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counted["words"], 3);

        let invalid = registry.invoke("wordCount", json!({})).await.unwrap();
        assert!(invalid.is_err());
    }
}
