//! Fixed-size pool of supervised child workers
//!
//! Each child slot is driven by one task that owns the process. Idle slots
//! announce themselves on a shared channel; a dispatcher leases an idle slot,
//! claims a job with that slot's token and hands the job over. When a busy
//! child dies its slot's generation is bumped, a `ChildRestart` event is
//! published and a replacement is spawned. The job it held stays active until
//! a stale flush fails it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::process::ChildProcess;
use super::protocol::JobOutcome;
use super::SupervisorError;
use crate::config::QueueConfig;
use crate::events::{EventBus, QueueEvent};
use crate::job::{ClaimToken, Job};
use crate::worker::GenerationTable;

/// Name of a child slot as recorded in claim tokens
pub fn child_slot_name(index: usize) -> String {
    format!("child-{index}")
}

/// Child pool settings resolved from [`QueueConfig`]
#[derive(Debug, Clone)]
pub(crate) struct ChildPoolConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub size: usize,
    pub ready_timeout: Duration,
    pub shutdown_grace: Duration,
    pub restart_delay: Duration,
}

impl ChildPoolConfig {
    /// One `/bin/sh -c script` child
    #[cfg(all(test, unix))]
    pub(crate) fn shell(script: &str) -> Self {
        Self {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            size: 1,
            ready_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(200),
            restart_delay: Duration::from_millis(50),
        }
    }

    pub(crate) fn from_queue_config(config: &QueueConfig) -> Result<Self, SupervisorError> {
        let program = match &config.child_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| SupervisorError::NoProgram(e.to_string()))?,
        };

        Ok(Self {
            program,
            args: config.child_args.clone(),
            size: config.child_process_count,
            ready_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            restart_delay: Duration::from_millis(500),
        })
    }
}

/// What became of a job handed to a child
#[derive(Debug)]
pub(crate) enum ChildExecution {
    /// The child reported an outcome
    Finished(JobOutcome),

    /// The child died while holding the job
    Crashed,

    /// The slot was restarted after the claim was made; the job never ran
    Superseded,
}

struct Assignment {
    job: Job,
    token: ClaimToken,
    reply: oneshot::Sender<ChildExecution>,
}

pub(crate) struct ChildPool {
    senders: Vec<mpsc::Sender<Assignment>>,
    idle_tx: mpsc::UnboundedSender<usize>,
    idle_rx: Mutex<mpsc::UnboundedReceiver<usize>>,
    generations: Arc<GenerationTable>,
    close_tx: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ChildPool {
    /// Spawn one supervising task per child slot
    pub(crate) fn start(
        config: ChildPoolConfig,
        generations: Arc<GenerationTable>,
        events: EventBus,
    ) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let config = Arc::new(config);

        let mut senders = Vec::with_capacity(config.size);
        let mut handles = Vec::with_capacity(config.size);
        for index in 0..config.size {
            let (tx, rx) = mpsc::channel(1);
            senders.push(tx);

            let supervisor = SlotSupervisor {
                index,
                slot: child_slot_name(index),
                config: config.clone(),
                assignments: rx,
                idle_tx: idle_tx.clone(),
                generations: generations.clone(),
                events: events.clone(),
                close_rx: close_rx.clone(),
            };
            handles.push(tokio::spawn(supervisor.run()));
        }

        info!(
            children = config.size,
            program = %config.program.display(),
            "Child worker pool started"
        );

        Arc::new(Self {
            senders,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            generations,
            close_tx,
            handles: parking_lot::Mutex::new(handles),
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.senders.len()
    }

    /// Wait for an idle child; `None` once shutdown is signaled
    pub(crate) async fn lease(
        self: &Arc<Self>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<ChildLease> {
        if *shutdown_rx.borrow() {
            return None;
        }

        let mut idle = self.idle_rx.lock().await;
        let index = tokio::select! {
            index = idle.recv() => index?,
            _ = shutdown_rx.changed() => return None,
        };
        drop(idle);

        Some(ChildLease {
            pool: self.clone(),
            index,
            token: self.generations.token(&child_slot_name(index)),
            assigned: false,
        })
    }

    /// Stop every child once its current job is done
    pub(crate) fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Wait for every supervising task to exit
    pub(crate) async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Child supervisor panicked");
                }
            }
        }
    }

    /// Stop supervising immediately; children are killed with their handles
    pub(crate) fn abort(&self) {
        for handle in self.handles.lock().iter() {
            handle.abort();
        }
    }
}

/// Exclusive use of one idle child
///
/// Dropping an unused lease returns the child to the idle queue.
pub(crate) struct ChildLease {
    pool: Arc<ChildPool>,
    index: usize,
    token: ClaimToken,
    assigned: bool,
}

impl ChildLease {
    pub(crate) fn token(&self) -> &ClaimToken {
        &self.token
    }

    /// Hand a job claimed under this lease's token to the child
    pub(crate) async fn execute(mut self, job: Job) -> ChildExecution {
        self.assigned = true;

        let Some(sender) = self.pool.senders.get(self.index) else {
            return ChildExecution::Superseded;
        };

        let (reply, rx) = oneshot::channel();
        let assignment = Assignment {
            job,
            token: self.token.clone(),
            reply,
        };
        if sender.send(assignment).await.is_err() {
            return ChildExecution::Superseded;
        }

        rx.await.unwrap_or(ChildExecution::Crashed)
    }
}

impl Drop for ChildLease {
    fn drop(&mut self) {
        if !self.assigned {
            let _ = self.pool.idle_tx.send(self.index);
        }
    }
}

enum SlotEvent {
    Assigned(Option<Assignment>),
    Exited(Option<i32>),
    Close,
}

struct SlotSupervisor {
    index: usize,
    slot: String,
    config: Arc<ChildPoolConfig>,
    assignments: mpsc::Receiver<Assignment>,
    idle_tx: mpsc::UnboundedSender<usize>,
    generations: Arc<GenerationTable>,
    events: EventBus,
    close_rx: watch::Receiver<bool>,
}

impl SlotSupervisor {
    async fn run(mut self) {
        let mut process: Option<ChildProcess> = None;
        // The slot index is in the idle queue at most once: it is announced on
        // first start, after every finished job, and after a busy crash.
        let mut announce = true;

        loop {
            if *self.close_rx.borrow() {
                break;
            }

            if process.is_none() {
                match ChildProcess::spawn(&self.config, self.index).await {
                    Ok(child) => {
                        info!(slot = self.index, pid = ?child.pid(), "Child worker started");
                        process = Some(child);
                        if announce {
                            if self.idle_tx.send(self.index).is_err() {
                                break;
                            }
                            announce = false;
                        }
                    }
                    Err(e) => {
                        error!(slot = self.index, error = %e, "Failed to start child worker");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.restart_delay) => {}
                            _ = self.close_rx.changed() => break,
                        }
                        continue;
                    }
                }
            }
            let Some(child) = process.as_mut() else {
                continue;
            };

            let event = tokio::select! {
                assignment = self.assignments.recv() => SlotEvent::Assigned(assignment),
                code = child.exited() => SlotEvent::Exited(code),
                _ = self.close_rx.changed() => SlotEvent::Close,
            };

            match event {
                SlotEvent::Close | SlotEvent::Assigned(None) => break,
                SlotEvent::Exited(code) => {
                    warn!(slot = self.index, exit_code = ?code, "Child worker exited while idle");
                    process = None;
                    self.record_restart(code);
                }
                SlotEvent::Assigned(Some(assignment)) => {
                    if self.generations.is_superseded(&assignment.token) {
                        let _ = assignment.reply.send(ChildExecution::Superseded);
                        if self.idle_tx.send(self.index).is_err() {
                            break;
                        }
                        continue;
                    }

                    match child.run(&assignment.job).await {
                        Some(outcome) => {
                            let _ = assignment.reply.send(ChildExecution::Finished(outcome));
                            if self.idle_tx.send(self.index).is_err() {
                                break;
                            }
                        }
                        None => {
                            let code = child.reap(self.config.shutdown_grace).await;
                            warn!(
                                slot = self.index,
                                job_id = %assignment.job.id,
                                job_type = %assignment.job.job_type,
                                exit_code = ?code,
                                "Child worker died while running a job"
                            );
                            process = None;
                            self.record_restart(code);
                            let _ = assignment.reply.send(ChildExecution::Crashed);
                            announce = true;
                        }
                    }
                }
            }
        }

        if let Some(child) = process {
            child.shutdown(self.config.shutdown_grace).await;
        }
    }

    fn record_restart(&self, exit_code: Option<i32>) {
        let generation = self.generations.bump(&self.slot);
        info!(slot = self.index, generation, "Restarting child worker");
        self.events.publish(QueueEvent::ChildRestart {
            slot: self.index,
            generation,
            exit_code,
        });
    }
}
