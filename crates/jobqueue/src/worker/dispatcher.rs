//! Dispatch slots: claim → execute → complete/fail → loop
//!
//! Each slot is one tokio task. In-process slots invoke the registry directly
//! under their own claim token. With child workers configured, a slot first
//! leases an idle child, claims under that child's token and hands the job
//! over, so the number of slots bounds jobs in flight toward children.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::generation::GenerationTable;
use super::poller::{ClaimPoller, PollerConfig};
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::job::{ClaimToken, Job};
use crate::queue::QueueStateMachine;
use crate::registry::{RegistryError, TaskResult};
use crate::supervisor::{ChildExecution, ChildLease, ChildPool, JobOutcome};

/// Where claimed jobs run
#[derive(Clone)]
pub(crate) enum Executor {
    InProcess,
    Children(Arc<ChildPool>),
}

/// Name of an in-process slot as recorded in claim tokens
pub fn dispatch_slot_name(index: usize) -> String {
    format!("slot-{index}")
}

/// State shared by every dispatch slot
pub(crate) struct DispatchContext {
    pub machine: QueueStateMachine,
    pub generations: Arc<GenerationTable>,
    pub events: EventBus,
    pub executor: Executor,
    pub poller: PollerConfig,
    pub shutdown_tx: watch::Sender<bool>,
}

enum Lease {
    Slot(ClaimToken),
    Child(ChildLease),
}

impl Lease {
    fn token(&self) -> &ClaimToken {
        match self {
            Self::Slot(token) => token,
            Self::Child(lease) => lease.token(),
        }
    }
}

enum Outcome {
    Finished(TaskResult),
    UnknownTask(String),
    Crashed,
    Superseded,
}

/// Running dispatch slots
pub(crate) struct Dispatcher {
    slots: JoinSet<Result<(), QueueError>>,
}

impl Dispatcher {
    pub(crate) fn spawn(ctx: Arc<DispatchContext>, slot_count: usize) -> Self {
        let mut slots = JoinSet::new();
        for index in 0..slot_count {
            slots.spawn(run_slot(ctx.clone(), index));
        }
        info!(slots = slot_count, "Dispatcher started");
        Self { slots }
    }

    /// Wait for every slot to stop; yields the first slot error
    ///
    /// Cancel safe: slots already collected are not awaited again.
    pub(crate) async fn join(&mut self) -> Result<(), QueueError> {
        let mut result = Ok(());
        while let Some(joined) = self.slots.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "Dispatch slot panicked"),
            }
        }
        result
    }

    /// Cancel every slot at its next suspension point
    pub(crate) fn abort(&mut self) {
        self.slots.abort_all();
    }
}

async fn run_slot(ctx: Arc<DispatchContext>, index: usize) -> Result<(), QueueError> {
    let slot = dispatch_slot_name(index);
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();
    let mut poller = ClaimPoller::new(ctx.poller.clone(), ctx.shutdown_tx.subscribe());
    debug!(slot = %slot, "Dispatch slot started");

    loop {
        if poller.is_shutdown() {
            break;
        }

        let lease = match &ctx.executor {
            Executor::InProcess => Lease::Slot(ctx.generations.token(&slot)),
            Executor::Children(pool) => match pool.lease(&mut shutdown_rx).await {
                Some(lease) => Lease::Child(lease),
                None => break,
            },
        };

        match ctx.machine.claim_next(lease.token()).await {
            Ok(Some(job)) => {
                poller.record(true);
                execute(&ctx, job, lease).await?;
            }
            Ok(None) => {
                drop(lease);
                poller.record(false);
                if poller.wait().await {
                    break;
                }
            }
            Err(e) => {
                error!(slot = %slot, error = %e, "Claim failed");
                drop(lease);
                poller.record(false);
                if poller.wait().await {
                    break;
                }
            }
        }
    }

    debug!(slot = %slot, "Dispatch slot stopped");
    Ok(())
}

async fn execute(ctx: &DispatchContext, job: Job, lease: Lease) -> Result<(), QueueError> {
    let token = lease.token().clone();

    let outcome = match lease {
        Lease::Slot(_) => {
            match ctx
                .machine
                .registry()
                .invoke(&job.job_type, job.payload.clone())
                .await
            {
                Ok(result) => Outcome::Finished(result),
                Err(RegistryError::UnknownTaskType(job_type)) => Outcome::UnknownTask(job_type),
            }
        }
        Lease::Child(lease) => match lease.execute(job.clone()).await {
            ChildExecution::Finished(JobOutcome::Success { output }) => {
                Outcome::Finished(Ok(output))
            }
            ChildExecution::Finished(JobOutcome::Failure { error }) => {
                Outcome::Finished(Err(error))
            }
            ChildExecution::Finished(JobOutcome::UnknownTask { job_type }) => {
                Outcome::UnknownTask(job_type)
            }
            ChildExecution::Crashed => Outcome::Crashed,
            ChildExecution::Superseded => Outcome::Superseded,
        },
    };

    match outcome {
        Outcome::Finished(Ok(_)) => match ctx.machine.complete(job.id, &token).await {
            Ok(done) => ctx.events.publish(QueueEvent::JobSuccess { job: done }),
            Err(e) if e.is_not_found() => {
                warn!(job_id = %job.id, claim = %token, "Ignoring stale completion report")
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record completion"),
        },
        Outcome::Finished(Err(task_error)) => {
            match ctx.machine.fail(job.id, &token, &task_error.reason()).await {
                Ok(failed) => ctx.events.publish(QueueEvent::JobFail { job: failed }),
                Err(e) if e.is_not_found() => {
                    warn!(job_id = %job.id, claim = %token, "Ignoring stale failure report")
                }
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to record failure"),
            }
        }
        Outcome::Crashed => {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                claim = %token,
                "Worker lost mid-job; job stays active until a stale flush"
            );
        }
        Outcome::Superseded => {
            debug!(job_id = %job.id, claim = %token, "Child restarted before hand-over, requeueing");
            release(ctx, &job, &token).await;
        }
        Outcome::UnknownTask(job_type) => {
            release(ctx, &job, &token).await;
            error!(
                job_id = %job.id,
                job_type = %job_type,
                "No handler registered for job type at execution time, halting dispatch"
            );
            ctx.shutdown_tx.send_replace(true);
            return Err(QueueError::Configuration(format!(
                "no task registered for job type '{job_type}'"
            )));
        }
    }

    Ok(())
}

async fn release(ctx: &DispatchContext, job: &Job, token: &ClaimToken) {
    if let Err(e) = ctx.machine.release(job.id, token).await {
        error!(job_id = %job.id, error = %e, "Failed to release job");
    }
}
