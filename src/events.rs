//! Lifecycle event notifications.
//!
//! The client publishes typed events as tasks move through their lifecycle.
//! Delivery is fire-and-forget over a bounded broadcast channel: producers
//! never block, and a subscriber that falls behind loses the oldest events
//! rather than slowing the scheduler.

use std::time::Duration;

use tokio::sync::broadcast;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A lifecycle notification for a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A task record was persisted and its reference pushed onto a queue.
    TaskEnqueued {
        /// Id of the enqueued task.
        task_id: String,
        /// Queue the task was placed on.
        queue: String,
    },
    /// A worker began executing the task.
    TaskAttempt {
        /// Id of the task being attempted.
        task_id: String,
        /// Attempt counter after the increment for this attempt.
        tries: u32,
    },
    /// The handler succeeded and the result was committed.
    TaskCompleted {
        /// Id of the completed task.
        task_id: String,
        /// Total attempts the task took.
        tries: u32,
    },
    /// The attempt failed and the task was scheduled for redelivery.
    TaskRetried {
        /// Id of the retried task.
        task_id: String,
        /// Backoff delay before the next delivery.
        delay: Duration,
    },
    /// Attempts were exhausted; the task will not run again.
    TaskTerminated {
        /// Id of the terminated task.
        task_id: String,
    },
    /// The deadline passed before the task completed.
    TaskExpired {
        /// Id of the expired task.
        task_id: String,
    },
    /// The runtime could not process the task at all.
    QueueError {
        /// Id of the affected task.
        task_id: String,
    },
}

/// Bounded, non-blocking publisher of lifecycle events.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Opens a new subscription. Events published before this call are not
    /// delivered.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub(crate) fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }
}
