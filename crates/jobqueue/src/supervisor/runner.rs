//! Child side of the worker protocol
//!
//! A program that embeds the queue doubles as its own child worker:
//!
//! ```ignore
//! if jobqueue::supervisor::is_child_process() {
//!     return jobqueue::supervisor::run_child(registry).await.map_err(Into::into);
//! }
//! ```
//!
//! Stdout belongs to the protocol while in child mode; log to stderr.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::protocol::{encode, ChildRequest, ChildResponse, JobOutcome};
use super::SupervisorError;
use crate::registry::{RegistryError, TaskRegistry};

/// Environment variable carrying the slot index of a spawned child
pub const CHILD_SLOT_ENV: &str = "JOBQUEUE_CHILD_SLOT";

/// True when this process was spawned as a child worker
pub fn is_child_process() -> bool {
    std::env::var_os(CHILD_SLOT_ENV).is_some()
}

pub fn child_slot_from_env() -> Option<usize> {
    std::env::var(CHILD_SLOT_ENV).ok()?.parse().ok()
}

/// Serve jobs from stdin until `Shutdown` or EOF
pub async fn run_child(registry: TaskRegistry) -> Result<(), SupervisorError> {
    let slot = child_slot_from_env();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    send(
        &mut stdout,
        &ChildResponse::Ready {
            pid: std::process::id(),
        },
    )
    .await?;
    info!(slot = ?slot, task_types = registry.len(), "Child worker serving");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: ChildRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping unparseable request");
                continue;
            }
        };

        match request {
            ChildRequest::Shutdown => {
                info!(slot = ?slot, "Child worker shutting down");
                break;
            }
            ChildRequest::Run {
                job_id,
                job_type,
                payload,
            } => {
                debug!(%job_id, %job_type, "Running job");
                let outcome = match registry.invoke(&job_type, payload).await {
                    Ok(result) => JobOutcome::from_result(result),
                    Err(RegistryError::UnknownTaskType(job_type)) => {
                        JobOutcome::UnknownTask { job_type }
                    }
                };
                send(&mut stdout, &ChildResponse::Done { job_id, outcome }).await?;
            }
        }
    }

    Ok(())
}

async fn send<W, T>(writer: &mut W, message: &T) -> Result<(), SupervisorError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode(message)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
