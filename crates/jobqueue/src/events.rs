//! Queue events and the bus that fans them out
//!
//! Events are notifications, not part of the durable state: publishing never
//! blocks and never fails from the queue's point of view. Every subscriber owns
//! an unbounded channel, so a slow subscriber delays nothing and misses
//! nothing; it only buffers. Dropping the receiver unsubscribes.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::job::Job;

/// Something observable happened in the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Handler succeeded; the job has been removed from the queue
    ///
    /// `job` is the last stored snapshot, taken while it was still active.
    JobSuccess { job: Job },

    /// Job moved to the failed collection (handler failure or stale flush)
    JobFail { job: Job },

    /// A child worker process died and was replaced
    ChildRestart {
        /// Supervisor slot index
        slot: usize,
        /// Generation of the replacement process
        generation: u64,
        /// Exit code of the dead process, if it exited normally
        exit_code: Option<i32>,
    },
}

impl QueueEvent {
    /// Job carried by the event, if any
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::JobSuccess { job } | Self::JobFail { job } => Some(job),
            Self::ChildRestart { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::JobSuccess { .. } => "job_success",
            Self::JobFail { .. } => "job_fail",
            Self::ChildRestart { .. } => "child_restart",
        }
    }
}

/// Fan-out of queue events to every live subscriber
///
/// Cheap to clone; every clone publishes to the same subscribers.
#[derive(Clone, Debug, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<QueueEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every current subscriber
    ///
    /// With no subscribers the event is dropped. Subscribers whose receiver is
    /// gone are pruned.
    pub fn publish(&self, event: QueueEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// New receiver observing every event published after this call
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restart(slot: usize) -> QueueEvent {
        QueueEvent::ChildRestart {
            slot,
            generation: 1,
            exit_code: None,
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(restart(0));

        let mut rx = bus.subscribe();
        bus.publish(restart(2));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "child_restart");
        assert!(event.job().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_misses_nothing() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for slot in 0..5000 {
            bus.publish(restart(slot));
            assert_eq!(fast.recv().await, Some(restart(slot)));
        }

        for slot in 0..5000 {
            assert_eq!(slow.try_recv().unwrap(), restart(slot));
        }
        assert!(slow.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(restart(0));
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
