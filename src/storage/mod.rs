//! Storage adapter contract.
//!
//! The core talks to its backing store through one narrow trait combining
//! two logical datasets: a task record store keyed by task id with
//! optimistic concurrency, and per-queue message streams with per-message
//! acknowledgement, redelivery, and lease extension. Any substrate offering
//! those capabilities can implement [`StorageAdapter`]; the crate ships an
//! in-memory implementation for tests and single-process use.

mod memory;

pub use memory::MemoryStorage;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::Result;
use crate::queue::{Queue, QueueInfo};
use crate::task::Task;

/// Namespace prefix for task records. Deployments sharing a store must use
/// distinct prefixes so their records cannot mix.
pub const TASK_STORE_PREFIX: &str = "CHORIA_AJ_T";

/// Namespace prefix for per-queue message streams.
pub const QUEUE_PREFIX: &str = "CHORIA_AJ_Q_";

/// Wire form of a queue message. Messages reference tasks by id only; the
/// record store stays authoritative for task bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkEnvelope {
    /// Id of the referenced task.
    #[serde(rename = "task")]
    pub task_id: String,

    /// Fields written by newer producers, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkEnvelope {
    /// Creates an envelope referencing the given task.
    #[must_use]
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            extra: Map::new(),
        }
    }
}

/// One delivery of a queue message.
///
/// `handle` is the adapter's opaque lease token; exactly one consumer holds
/// a given handle at a time, and every acknowledgement variant consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Id of the referenced task.
    pub task_id: String,
    /// Queue the message was delivered from.
    pub queue: String,
    /// Opaque delivery handle.
    pub handle: u64,
}

/// Capability contract for the backing stream and record store.
///
/// Every operation may fail transiently (network, timeouts) or permanently;
/// callers distinguish the two through [`crate::Error::is_transient`].
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Registers a queue and its configuration with the adapter. The
    /// adapter uses `max_run_time` as the visibility timeout for leases on
    /// this queue. Calling this again for a known queue updates its
    /// configuration.
    async fn prepare_queue(&self, queue: &Queue) -> Result<()>;

    /// Atomically persists a new task record and pushes its reference onto
    /// the task's queue. Either both happen or neither is observable.
    /// The task's `storage_revision` is set on success.
    async fn enqueue_task(&self, queue: &Queue, task: &mut Task) -> Result<()>;

    /// Fetches the current record for a task, including its revision.
    async fn load_task(&self, id: &str) -> Result<Task>;

    /// Compare-and-swap update of a task record. Fails with
    /// [`crate::Error::SaveConflict`] when the stored revision no longer
    /// matches `task.storage_revision`; on success the revision advances
    /// both in the store and on `task`.
    async fn save_task_state(&self, task: &mut Task) -> Result<()>;

    /// Unconditionally deletes a task record. Deleting an absent record is
    /// not an error.
    async fn delete_task(&self, id: &str) -> Result<()>;

    /// Blocks up to `timeout` for the next message on a queue. Returns
    /// `None` when nothing arrives in time. The returned item's lease lasts
    /// the queue's `max_run_time` unless extended with [`Self::in_progress`].
    async fn poll_queue(&self, name: &str, timeout: Duration) -> Result<Option<WorkItem>>;

    /// Positive acknowledgement; the message will not be redelivered.
    async fn ack_item(&self, item: &WorkItem) -> Result<()>;

    /// Negative acknowledgement with a requested redelivery delay.
    async fn nak_item(&self, item: &WorkItem, delay: Duration) -> Result<()>;

    /// Extends the delivery lease by the queue's `max_run_time`. Safe to
    /// call repeatedly while the attempt runs.
    async fn in_progress(&self, item: &WorkItem) -> Result<()>;

    /// Drops the message without redelivery. Used for poison and
    /// unroutable messages.
    async fn terminate_item(&self, item: &WorkItem) -> Result<()>;

    /// Removes all pending messages from a queue, returning how many were
    /// dropped. Task records are untouched.
    async fn purge_queue(&self, name: &str) -> Result<u64>;

    /// Point-in-time statistics for a queue.
    async fn queue_info(&self, name: &str) -> Result<QueueInfo>;

    /// Streams all task records known to the adapter.
    async fn tasks(&self) -> Result<BoxStream<'static, Task>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_form() {
        let envelope = WorkEnvelope::new("abc123");
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(json, r#"{"task":"abc123"}"#);
    }

    #[test]
    fn test_envelope_preserves_unknown_fields() {
        let json = r#"{"task":"abc123","priority":7}"#;
        let envelope: WorkEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.task_id, "abc123");

        let round_tripped = serde_json::to_value(&envelope).unwrap();
        assert_eq!(round_tripped["priority"], 7);
    }

    #[test]
    fn test_namespace_prefixes_are_distinct() {
        assert!(!TASK_STORE_PREFIX.starts_with(QUEUE_PREFIX));
        assert!(!QUEUE_PREFIX.starts_with(TASK_STORE_PREFIX));
    }
}
