//! Queue configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::PollerConfig;

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Identity of this queue instance, recorded in every claim it makes
    pub worker_id: String,

    /// Concurrent in-process dispatch slots
    pub worker_count: usize,

    /// Supervised child worker processes (0 = execute in-process)
    pub child_process_count: usize,

    /// Executable spawned for each child (defaults to the current executable)
    pub child_program: Option<PathBuf>,

    /// Extra arguments passed to each child
    pub child_args: Vec<String>,

    /// Poll backoff when nothing is claimable
    pub poller: PollerConfig,

    /// How long a draining shutdown waits for in-flight jobs
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Run `force_flush_stale_jobs` periodically (disabled when `None`)
    #[serde(with = "option_duration_millis")]
    pub stale_flush_interval: Option<Duration>,

    /// How often a started queue records that its run is alive
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Silence after which another run's claims count as stale
    ///
    /// Should be several `heartbeat_interval`s long.
    #[serde(with = "duration_millis")]
    pub heartbeat_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("queue-{}", Uuid::now_v7()),
            worker_count: 4,
            child_process_count: 0,
            child_program: None,
            child_args: vec![],
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            stale_flush_interval: None,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Create a new queue configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// - `JOBQUEUE_WORKER_ID`
    /// - `JOBQUEUE_WORKER_COUNT`
    /// - `JOBQUEUE_CHILD_PROCESS_COUNT`
    /// - `JOBQUEUE_CHILD_PROGRAM`
    /// - `JOBQUEUE_SHUTDOWN_TIMEOUT_MS`
    /// - `JOBQUEUE_STALE_FLUSH_INTERVAL_MS` (0 disables)
    /// - `JOBQUEUE_HEARTBEAT_INTERVAL_MS`
    /// - `JOBQUEUE_HEARTBEAT_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_id = std::env::var("JOBQUEUE_WORKER_ID").unwrap_or(defaults.worker_id);

        let worker_count = std::env::var("JOBQUEUE_WORKER_COUNT")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.worker_count)
            .max(1);

        let child_process_count = std::env::var("JOBQUEUE_CHILD_PROCESS_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.child_process_count);

        let child_program = std::env::var("JOBQUEUE_CHILD_PROGRAM")
            .ok()
            .map(PathBuf::from);

        let shutdown_timeout = std::env::var("JOBQUEUE_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_timeout);

        let stale_flush_interval = env_millis("JOBQUEUE_STALE_FLUSH_INTERVAL_MS");

        let heartbeat_interval =
            env_millis("JOBQUEUE_HEARTBEAT_INTERVAL_MS").unwrap_or(defaults.heartbeat_interval);

        let heartbeat_timeout =
            env_millis("JOBQUEUE_HEARTBEAT_TIMEOUT_MS").unwrap_or(defaults.heartbeat_timeout);

        Self {
            worker_id,
            worker_count,
            child_process_count,
            child_program,
            shutdown_timeout,
            stale_flush_interval,
            heartbeat_interval,
            heartbeat_timeout,
            ..defaults
        }
    }

    /// Set the instance identity
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the number of in-process dispatch slots
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the number of supervised child processes
    pub fn with_child_process_count(mut self, count: usize) -> Self {
        self.child_process_count = count;
        self
    }

    /// Set the child executable
    pub fn with_child_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.child_program = Some(program.into());
        self
    }

    /// Set extra child arguments
    pub fn with_child_args(mut self, args: Vec<String>) -> Self {
        self.child_args = args;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable the periodic stale flush (a zero interval disables it)
    pub fn with_stale_flush_interval(mut self, interval: Duration) -> Self {
        self.stale_flush_interval = Some(interval).filter(|i| !i.is_zero());
        self
    }

    /// Set how often the running queue heartbeats its run
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set how long another run may stay silent before its claims are stale
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    /// True when jobs execute in supervised child processes
    pub fn uses_child_processes(&self) -> bool {
        self.child_process_count > 0
    }
}

/// Positive millisecond duration from the environment
fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
