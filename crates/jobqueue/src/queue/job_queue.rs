//! Job queue facade: configuration, lifecycle, submission and administration

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::machine::QueueStateMachine;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::job::{Job, JobId, NewJob, QueueCounts};
use crate::registry::{Done, RegistrationError, Task, TaskRegistry, TaskResult};
use crate::store::{InMemoryJobStore, JobStore};
use crate::supervisor::{ChildPool, ChildPoolConfig};
use crate::worker::{DispatchContext, Dispatcher, Executor, GenerationTable};

/// Lifecycle state of a [`JobQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Built, not yet started
    Configured,
    /// Dispatching jobs
    Running,
    /// Shutting down, waiting for in-flight jobs
    Draining,
    /// Stopped; may be started again
    Stopped,
}

/// What `shutdown_with` does with in-flight jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Wait up to `shutdown_timeout` for in-flight jobs to settle
    #[default]
    Drain,
    /// Stop immediately; in-flight jobs stay active until a stale flush
    Abandon,
}

/// Outcome of a shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub mode: ShutdownMode,
    /// Jobs this run left active (recoverable with `force_flush_stale_jobs`)
    pub left_active: Vec<JobId>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Dispatcher,
    pool: Option<Arc<ChildPool>>,
    flusher: Option<JoinHandle<()>>,
    heartbeat: JoinHandle<()>,
}

struct Inner {
    config: QueueConfig,
    machine: QueueStateMachine,
    generations: Arc<GenerationTable>,
    events: EventBus,
    status: RwLock<QueueStatus>,
    running: Mutex<Option<Running>>,
}

/// Durable job queue with per-resource exclusivity
///
/// Cheap to clone; clones share one queue.
///
/// ```ignore
/// let queue = JobQueue::builder()
///     .config(QueueConfig::new().with_worker_count(4))
///     .register_fn("echo", |payload| async move { Ok(payload) })?
///     .build()?;
///
/// let mut events = queue.subscribe();
/// queue.start().await?;
/// queue.submit_job("echo", "user-42", json!({"hello": "world"})).await?;
/// ```
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn builder() -> JobQueueBuilder {
        JobQueueBuilder::new()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        self.inner.machine.registry()
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.inner.machine.store()
    }

    pub fn status(&self) -> QueueStatus {
        *self.inner.status.read()
    }

    /// Receive every event published from now on
    ///
    /// The receiver buffers without bound; drop it to unsubscribe.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Submit a job; durable once this returns
    ///
    /// Jobs may be submitted before `start()`; they wait in pending.
    pub async fn submit_job(
        &self,
        job_type: &str,
        resource_id: &str,
        payload: Value,
    ) -> Result<Job, QueueError> {
        self.submit(NewJob::new(job_type, resource_id, payload))
            .await
    }

    /// Submit a prepared job (an explicit id makes submission idempotent)
    pub async fn submit(&self, job: NewJob) -> Result<Job, QueueError> {
        self.inner.machine.enqueue(job).await
    }

    /// Start dispatching; calling it while running is a no-op
    #[instrument(skip(self), fields(worker_id = %self.inner.config.worker_id))]
    pub async fn start(&self) -> Result<(), QueueError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            debug!("Queue already running");
            return Ok(());
        }

        let config = &self.inner.config;
        if self.registry().is_empty() {
            warn!("Starting queue with no registered tasks");
        }

        let run_id = self.inner.generations.begin_run();
        // Claims are only made once the run is known to be alive
        self.store()
            .heartbeat(self.inner.generations.owner(), run_id)
            .await?;
        let (shutdown_tx, _) = watch::channel(false);

        let pool = if config.uses_child_processes() {
            let pool_config = ChildPoolConfig::from_queue_config(config)?;
            Some(ChildPool::start(
                pool_config,
                self.inner.generations.clone(),
                self.inner.events.clone(),
            ))
        } else {
            None
        };

        let executor = match &pool {
            Some(pool) => Executor::Children(pool.clone()),
            None => Executor::InProcess,
        };

        let ctx = Arc::new(DispatchContext {
            machine: self.inner.machine.clone(),
            generations: self.inner.generations.clone(),
            events: self.inner.events.clone(),
            executor,
            poller: config.poller.clone(),
            shutdown_tx: shutdown_tx.clone(),
        });
        let dispatcher = Dispatcher::spawn(ctx, config.worker_count);

        let flusher = config
            .stale_flush_interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| self.spawn_stale_flush_loop(interval, shutdown_tx.subscribe()));
        let heartbeat = self.spawn_heartbeat_loop(run_id, shutdown_tx.subscribe());

        *running = Some(Running {
            shutdown_tx,
            dispatcher,
            pool,
            flusher,
            heartbeat,
        });
        *self.inner.status.write() = QueueStatus::Running;

        info!(
            %run_id,
            worker_count = config.worker_count,
            child_process_count = config.child_process_count,
            task_types = ?self.registry().task_types().collect::<Vec<_>>(),
            "Job queue started"
        );
        Ok(())
    }

    /// Drain in-flight jobs and stop
    pub async fn shutdown(&self) -> Result<ShutdownReport, QueueError> {
        self.shutdown_with(ShutdownMode::Drain).await
    }

    /// Stop dispatching and tear down child workers
    ///
    /// Returns [`QueueError::Configuration`] if dispatch halted on an
    /// unregistered job type, and [`QueueError::ShutdownTimeout`] if a drain
    /// gave up on in-flight jobs. The queue ends up `Stopped` and its run ended
    /// even when an error is returned.
    #[instrument(skip(self), fields(worker_id = %self.inner.config.worker_id))]
    pub async fn shutdown_with(&self, mode: ShutdownMode) -> Result<ShutdownReport, QueueError> {
        let mut guard = self.inner.running.lock().await;
        let Some(mut running) = guard.take() else {
            return Ok(ShutdownReport {
                mode,
                left_active: vec![],
            });
        };

        info!(?mode, "Initiating shutdown");
        *self.inner.status.write() = QueueStatus::Draining;
        running.shutdown_tx.send_replace(true);

        if let Some(flusher) = running.flusher.take() {
            flusher.abort();
        }
        running.heartbeat.abort();

        let mut timed_out = false;
        let dispatch_result = match mode {
            ShutdownMode::Drain => {
                let drained = tokio::time::timeout(
                    self.inner.config.shutdown_timeout,
                    running.dispatcher.join(),
                )
                .await;
                match drained {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Shutdown timeout reached, abandoning in-flight jobs");
                        timed_out = true;
                        running.dispatcher.abort();
                        running.dispatcher.join().await
                    }
                }
            }
            ShutdownMode::Abandon => {
                running.dispatcher.abort();
                running.dispatcher.join().await
            }
        };

        if let Some(pool) = running.pool.take() {
            if timed_out || mode == ShutdownMode::Abandon {
                pool.abort();
            } else {
                pool.close();
            }
            pool.join().await;
            debug!(children = pool.size(), "Child workers stopped");
        }

        let left_active = self.jobs_left_active().await;

        // Claims of the finished run are stale from here on
        let finished_run = self.inner.generations.run_id();
        let ended = self.store().end_run(finished_run).await;
        if let Err(e) = &ended {
            warn!(
                run_id = %finished_run,
                "Failed to end run, its claims go stale after the heartbeat timeout: {}", e
            );
        }
        self.inner.generations.begin_run();
        *self.inner.status.write() = QueueStatus::Stopped;
        drop(guard);

        dispatch_result?;
        let left_active = left_active?;
        ended?;
        info!(left_active = left_active.len(), "Job queue stopped");

        if timed_out {
            return Err(QueueError::ShutdownTimeout(left_active.len()));
        }
        Ok(ShutdownReport { mode, left_active })
    }

    /// Move every failed job back to pending; returns how many moved
    pub async fn retry_failed_jobs(&self) -> Result<usize, QueueError> {
        self.inner.machine.retry_failed_jobs().await
    }

    /// Drop every failed job; returns how many were dropped
    pub async fn delete_failed_jobs(&self) -> Result<usize, QueueError> {
        self.inner.machine.delete_failed_jobs().await
    }

    /// Fail every active job whose worker has died or been replaced
    ///
    /// Covers jobs of any queue instance sharing the store whose run has been
    /// silent for `heartbeat_timeout`. Publishes `JobFail` for each flushed
    /// job; returns how many were flushed.
    pub async fn force_flush_stale_jobs(&self) -> Result<usize, QueueError> {
        flush_stale(
            &self.inner.machine,
            &self.inner.generations,
            &self.inner.events,
            self.inner.config.heartbeat_timeout,
        )
        .await
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.inner.machine.counts().await
    }

    pub async fn failed_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.inner.machine.failed_jobs().await
    }

    pub async fn pending_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.inner.machine.pending_jobs().await
    }

    pub async fn active_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.inner.machine.active_jobs().await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store().get(job_id).await?)
    }

    async fn jobs_left_active(&self) -> Result<Vec<JobId>, QueueError> {
        let owner = self.inner.generations.owner();
        let run_id = self.inner.generations.run_id();
        Ok(self
            .inner
            .machine
            .active_jobs()
            .await?
            .into_iter()
            .filter(|job| {
                job.claimed_by
                    .as_ref()
                    .is_some_and(|claim| claim.owner == owner && claim.run_id == run_id)
            })
            .map(|job| job.id)
            .collect())
    }

    fn spawn_stale_flush_loop(
        &self,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let machine = self.inner.machine.clone();
        let generations = self.inner.generations.clone();
        let events = self.inner.events.clone();
        let heartbeat_timeout = self.inner.config.heartbeat_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = flush_stale(&machine, &generations, &events, heartbeat_timeout).await {
                            error!("Stale job flush failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Stale flush loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Stale flush loop exited");
        })
    }

    fn spawn_heartbeat_loop(
        &self,
        run_id: uuid::Uuid,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = self.store().clone();
        let owner = self.inner.generations.owner().to_string();
        let interval = self.inner.config.heartbeat_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.heartbeat(&owner, run_id).await {
                            error!(%run_id, "Run heartbeat failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            debug!(%run_id, "Heartbeat loop exited");
        })
    }
}

async fn flush_stale(
    machine: &QueueStateMachine,
    generations: &GenerationTable,
    events: &EventBus,
    heartbeat_timeout: Duration,
) -> Result<usize, QueueError> {
    let live_runs = machine.store().live_runs(heartbeat_timeout).await?;
    let flushed = machine
        .force_flush_stale_jobs(|claim| generations.is_stale(claim, &live_runs))
        .await?;
    let count = flushed.len();
    for job in flushed {
        events.publish(QueueEvent::JobFail { job });
    }
    Ok(count)
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("worker_id", &self.inner.config.worker_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Builder for [`JobQueue`]
///
/// Handlers can only be registered here, before the queue exists.
#[derive(Default)]
pub struct JobQueueBuilder {
    config: Option<QueueConfig>,
    store: Option<Arc<dyn JobStore>>,
    registry: TaskRegistry,
}

impl JobQueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue configuration (defaults to [`QueueConfig::default`])
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Backing store (defaults to a fresh [`InMemoryJobStore`])
    pub fn store(mut self, store: impl JobStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Share a store with other queues or callers
    pub fn shared_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the registry wholesale
    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn register<T: Task>(mut self, task: T) -> Result<Self, RegistrationError> {
        self.registry.register(task)?;
        Ok(self)
    }

    pub fn register_fn<F, Fut>(mut self, task_type: &str, handler: F) -> Result<Self, RegistrationError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResult> + Send + 'static,
    {
        self.registry.register_fn(task_type, handler)?;
        Ok(self)
    }

    pub fn register_callback<F>(mut self, task_type: &str, handler: F) -> Result<Self, RegistrationError>
    where
        F: Fn(Value, Done) + Send + Sync + 'static,
    {
        self.registry.register_callback(task_type, handler)?;
        Ok(self)
    }

    pub fn register_blocking<F>(mut self, task_type: &str, handler: F) -> Result<Self, RegistrationError>
    where
        F: Fn(Value) -> TaskResult + Send + Sync + 'static,
    {
        self.registry.register_blocking(task_type, handler)?;
        Ok(self)
    }

    pub fn build(self) -> Result<JobQueue, QueueError> {
        let config = self.config.unwrap_or_default();
        if config.worker_id.trim().is_empty() {
            return Err(QueueError::Configuration("worker_id must not be empty".into()));
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let machine = QueueStateMachine::new(store, Arc::new(self.registry));

        Ok(JobQueue {
            inner: Arc::new(Inner {
                generations: Arc::new(GenerationTable::new(config.worker_id.clone())),
                events: EventBus::new(),
                status: RwLock::new(QueueStatus::Configured),
                running: Mutex::new(None),
                machine,
                config,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::job::ClaimToken;
    use crate::store::StoreError;

    /// In-memory store whose listing of active jobs can be made to fail
    #[derive(Default)]
    struct BrokenListing {
        inner: InMemoryJobStore,
        broken: AtomicBool,
    }

    #[async_trait]
    impl JobStore for BrokenListing {
        async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
            self.inner.enqueue(job).await
        }
        async fn claim_next(&self, claim: &ClaimToken) -> Result<Option<Job>, StoreError> {
            self.inner.claim_next(claim).await
        }
        async fn complete(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, StoreError> {
            self.inner.complete(job_id, claim).await
        }
        async fn fail(&self, job_id: JobId, claim: &ClaimToken, reason: &str) -> Result<Job, StoreError> {
            self.inner.fail(job_id, claim, reason).await
        }
        async fn release(&self, job_id: JobId, claim: &ClaimToken) -> Result<Job, StoreError> {
            self.inner.release(job_id, claim).await
        }
        async fn retry_failed(&self) -> Result<usize, StoreError> {
            self.inner.retry_failed().await
        }
        async fn delete_failed(&self) -> Result<usize, StoreError> {
            self.inner.delete_failed().await
        }
        async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
            self.inner.get(job_id).await
        }
        async fn list_pending(&self) -> Result<Vec<Job>, StoreError> {
            self.inner.list_pending().await
        }
        async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.list_active().await
        }
        async fn list_failed(&self) -> Result<Vec<Job>, StoreError> {
            self.inner.list_failed().await
        }
        async fn counts(&self) -> Result<QueueCounts, StoreError> {
            self.inner.counts().await
        }
        async fn heartbeat(&self, owner: &str, run_id: Uuid) -> Result<(), StoreError> {
            self.inner.heartbeat(owner, run_id).await
        }
        async fn end_run(&self, run_id: Uuid) -> Result<(), StoreError> {
            self.inner.end_run(run_id).await
        }
        async fn live_runs(&self, within: Duration) -> Result<HashSet<Uuid>, StoreError> {
            self.inner.live_runs(within).await
        }
    }

    fn echo_queue() -> JobQueue {
        JobQueue::builder()
            .config(QueueConfig::new().with_worker_id("queue-test"))
            .register_fn("echo", |payload| async move { Ok(payload) })
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_validates_job_type() {
        let queue = echo_queue();
        let err = queue
            .submit_job("missing", "r1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let job = queue.submit_job("echo", "r1", json!({"n": 1})).await.unwrap();
        assert_eq!(queue.get_job(job.id).await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let queue = echo_queue();
        assert_eq!(queue.status(), QueueStatus::Configured);

        queue.start().await.unwrap();
        queue.start().await.unwrap();
        assert_eq!(queue.status(), QueueStatus::Running);

        let report = queue.shutdown().await.unwrap();
        assert_eq!(report.mode, ShutdownMode::Drain);
        assert!(report.left_active.is_empty());
        assert_eq!(queue.status(), QueueStatus::Stopped);

        // Second shutdown is a no-op
        queue.shutdown().await.unwrap();
    }

    #[test]
    fn test_builder_rejects_duplicate_registration() {
        let result = JobQueue::builder()
            .register_fn("echo", |payload| async move { Ok(payload) })
            .unwrap()
            .register_fn("echo", |payload| async move { Ok(payload) });
        assert!(matches!(
            result.err(),
            Some(RegistrationError::DuplicateTaskType(t)) if t == "echo"
        ));
    }

    #[test]
    fn test_builder_rejects_blank_worker_id() {
        let err = JobQueue::builder()
            .config(QueueConfig::new().with_worker_id(" "))
            .build()
            .unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_failed_shutdown_still_stops_the_queue() {
        let store = Arc::new(BrokenListing::default());
        let queue = JobQueue::builder()
            .config(QueueConfig::new().with_worker_id("queue-broken"))
            .shared_store(store.clone())
            .register_fn("echo", |payload| async move { Ok(payload) })
            .unwrap()
            .build()
            .unwrap();

        queue.start().await.unwrap();
        let run_id = queue.inner.generations.run_id();
        assert!(store
            .live_runs(Duration::from_secs(60))
            .await
            .unwrap()
            .contains(&run_id));

        store.broken.store(true, Ordering::SeqCst);
        let err = queue.shutdown().await.unwrap_err();
        assert!(matches!(err, QueueError::Store(_)), "{err:?}");

        assert_eq!(queue.status(), QueueStatus::Stopped);
        assert_ne!(queue.inner.generations.run_id(), run_id);
        assert!(store
            .live_runs(Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());

        // The queue can be started again
        store.broken.store(false, Ordering::SeqCst);
        queue.start().await.unwrap();
        assert_eq!(queue.status(), QueueStatus::Running);
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_heartbeats_and_shutdown_ends_the_run() {
        let queue = echo_queue();
        queue.start().await.unwrap();
        let run_id = queue.inner.generations.run_id();

        let live = queue.store().live_runs(Duration::from_secs(60)).await.unwrap();
        assert!(live.contains(&run_id));

        queue.shutdown().await.unwrap();
        let live = queue.store().live_runs(Duration::from_secs(60)).await.unwrap();
        assert!(live.is_empty());
    }
}
