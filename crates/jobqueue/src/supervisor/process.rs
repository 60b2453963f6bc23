//! One supervised child worker process

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::pool::ChildPoolConfig;
use super::protocol::{encode, ChildRequest, ChildResponse, JobOutcome};
use super::runner::CHILD_SLOT_ENV;
use super::SupervisorError;
use crate::job::Job;
use crate::registry::TaskError;

pub(crate) struct ChildProcess {
    slot: usize,
    pid: Option<u32>,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ChildProcess {
    /// Spawn the child and wait for its `Ready` message
    pub(crate) async fn spawn(
        config: &ChildPoolConfig,
        slot: usize,
    ) -> Result<Self, SupervisorError> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .env(CHILD_SLOT_ENV, slot.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: config.program.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::Protocol("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Protocol("child stdout not captured".into()))?;

        let mut process = Self {
            slot,
            pid: child.id(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        match tokio::time::timeout(config.ready_timeout, process.await_ready()).await {
            Ok(Ok(())) => {
                debug!(slot, pid = ?process.pid, "Child worker ready");
                Ok(process)
            }
            Ok(Err(e)) => {
                process.kill().await;
                Err(e)
            }
            Err(_) => {
                process.kill().await;
                Err(SupervisorError::NotReady { slot })
            }
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn await_ready(&mut self) -> Result<(), SupervisorError> {
        while let Some(line) = self.stdout.next_line().await? {
            match serde_json::from_str::<ChildResponse>(&line) {
                Ok(ChildResponse::Ready { pid }) => {
                    self.pid = Some(pid);
                    return Ok(());
                }
                Ok(other) => debug!(slot = self.slot, ?other, "Ignoring message before ready"),
                Err(_) => warn!(slot = self.slot, line = %line, "Skipping unparseable child output"),
            }
        }
        Err(SupervisorError::NotReady { slot: self.slot })
    }

    /// Execute one job; `None` means the child was lost before reporting
    pub(crate) async fn run(&mut self, job: &Job) -> Option<JobOutcome> {
        let request = ChildRequest::Run {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
        };
        let line = match encode(&request) {
            Ok(line) => line,
            Err(e) => {
                let error = TaskError::new(e.to_string()).with_type("protocol");
                return Some(JobOutcome::Failure { error });
            }
        };

        if let Err(e) = self.write_line(&line).await {
            warn!(slot = self.slot, job_id = %job.id, error = %e, "Failed to send job to child");
            return None;
        }

        loop {
            match self.stdout.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<ChildResponse>(&line) {
                    Ok(ChildResponse::Done { job_id, outcome }) if job_id == job.id => {
                        return Some(outcome);
                    }
                    Ok(other) => {
                        debug!(slot = self.slot, ?other, "Ignoring unexpected child message")
                    }
                    Err(_) => {
                        warn!(slot = self.slot, line = %line, "Skipping unparseable child output")
                    }
                },
                Ok(None) => return None,
                Err(e) => {
                    warn!(slot = self.slot, error = %e, "Lost child stdout");
                    return None;
                }
            }
        }
    }

    /// Resolves when the process exits; yields its exit code
    pub(crate) async fn exited(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|status| status.code())
    }

    /// Collect the exit code of a dying child, killing it after `grace`
    pub(crate) async fn reap(&mut self, grace: Duration) -> Option<i32> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => {
                self.kill().await;
                None
            }
        }
    }

    /// Ask the child to exit, then reap it
    pub(crate) async fn shutdown(mut self, grace: Duration) {
        if let Ok(line) = encode(&ChildRequest::Shutdown) {
            let _ = self.write_line(&line).await;
        }
        let code = self.reap(grace).await;
        debug!(slot = self.slot, exit_code = ?code, "Child worker stopped");
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(slot = self.slot, error = %e, "Kill failed (child already gone?)");
        }
    }
}
