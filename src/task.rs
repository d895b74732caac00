//! Task records and the task lifecycle state machine.
//!
//! A [`Task`] is the unit of deferred work: an opaque payload, a type string
//! used for handler routing, and lifecycle metadata. Records are persisted
//! through a [`crate::storage::StorageAdapter`] with optimistic concurrency
//! on `storage_revision`; only the scheduler mutates a task while it holds
//! the delivery lease.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::queue::DEFAULT_QUEUE;

/// Lifecycle state of a task.
///
/// Tasks start in `New`, become `Active` while a handler runs, and settle in
/// one of the terminal states `Completed`, `Expired`, or `Terminated`.
/// `Retry` tasks are waiting out a backoff delay before redelivery.
/// `QueueError` marks tasks the runtime could not process at all, such as a
/// type with no registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created but not yet attempted.
    New,
    /// A worker holds the lease and is executing the handler.
    Active,
    /// Last attempt failed; waiting for the backoff delay to elapse.
    Retry,
    /// Deadline passed before the task could complete.
    Expired,
    /// Handler returned successfully; `result` is set.
    Completed,
    /// The runtime could not process the task (for example, no handler
    /// matched its type). The message is dropped, not redelivered.
    QueueError,
    /// Attempts were exhausted without success; `result` holds the last
    /// error payload if one was recorded.
    Terminated,
    /// State written by a newer writer this reader does not understand.
    #[serde(other)]
    Unknown,
}

impl TaskState {
    /// Returns true for states that end the lifecycle. Terminal records are
    /// never redelivered and their state is write-once.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Terminated)
    }

    /// Returns true if the state may appear in a client's discard list.
    /// Only terminal records may be discarded on transition.
    #[must_use]
    pub const fn can_be_discarded(&self) -> bool {
        self.is_terminal()
    }

    /// Lowercase name, matching the serialized form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Retry => "retry",
            Self::Expired => "expired",
            Self::Completed => "completed",
            Self::QueueError => "queue_error",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::New
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful or terminated task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Bytes returned by the handler (base64 in JSON).
    #[serde(
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub payload: Vec<u8>,

    /// When the terminal transition was committed.
    pub completed_at: DateTime<Utc>,
}

/// A task in the job processing system.
///
/// Identity fields (`id`, `task_type`, `queue`, `payload`, `created_at`) are
/// set at construction and never change. Lifecycle fields are updated only by
/// the scheduler under the storage adapter's compare-and-swap discipline.
/// Use [`Task::new`] for the common case or [`Task::builder`] for custom
/// deadlines and retry limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique identifier, assigned at creation.
    pub id: String,

    /// Type string used by the router to select a handler.
    #[serde(rename = "type")]
    pub task_type: String,

    /// Name of the queue the task belongs to.
    #[serde(default = "default_queue_name")]
    pub queue: String,

    /// Opaque work payload (base64 in JSON). The core never inspects it.
    #[serde(
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64",
        default
    )]
    pub payload: Vec<u8>,

    /// Absolute time after which the task is expired rather than executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    /// Maximum attempts for this task. Zero means inherit the queue default.
    #[serde(default)]
    pub max_tries: u32,

    /// Number of attempts made so far. Incremented when a worker begins
    /// executing the task; never decremented.
    #[serde(default)]
    pub tries: u32,

    /// Current lifecycle state.
    #[serde(default)]
    pub state: TaskState,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When a worker last began executing the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,

    /// Present once the task reaches `Completed` or `Terminated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,

    /// Revision token for optimistic saves. Maintained by the storage
    /// adapter; not part of the serialized record.
    #[serde(skip)]
    pub storage_revision: u64,

    /// Fields written by newer producers, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE.to_string()
}

impl Task {
    /// Creates a task of the given type on the default queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTask`] if `task_type` is empty.
    pub fn new(task_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Result<Self> {
        Self::builder(task_type, payload).build()
    }

    /// Creates a builder for a task with custom configuration.
    #[must_use]
    pub fn builder(task_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> TaskBuilder {
        TaskBuilder::new(task_type, payload)
    }

    /// Returns the attempt limit, falling back to the queue default when the
    /// task does not carry its own.
    #[must_use]
    pub const fn max_tries_or(&self, queue_default: u32) -> u32 {
        if self.max_tries == 0 {
            queue_default
        } else {
            self.max_tries
        }
    }

    /// Returns true if the deadline has passed at the given time. A task
    /// without a deadline never expires.
    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

fn serialize_base64<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    serializer.serialize_str(&encoded)
}

fn deserialize_base64<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
        .decode(&s)
        .map_err(serde::de::Error::custom)
}

/// Builder for [`Task`] instances.
pub struct TaskBuilder {
    task_type: String,
    payload: Vec<u8>,
    queue: String,
    deadline: Option<DateTime<Utc>>,
    max_tries: u32,
}

impl TaskBuilder {
    /// Creates a builder with the required fields.
    #[must_use]
    pub fn new(task_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
            queue: DEFAULT_QUEUE.to_string(),
            deadline: None,
            max_tries: 0,
        }
    }

    /// Sets the queue the task is enqueued on.
    #[must_use]
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = name.into();
        self
    }

    /// Sets an absolute deadline. A task still non-terminal when the
    /// deadline passes transitions to [`TaskState::Expired`] on its next
    /// delivery.
    #[must_use]
    pub const fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the attempt limit for this task, overriding the queue default.
    #[must_use]
    pub const fn max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Builds the task, assigning a fresh id and creation timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTask`] if the task type or queue name is
    /// empty.
    pub fn build(self) -> Result<Task> {
        if self.task_type.is_empty() {
            return Err(Error::InvalidTask("task type may not be empty".to_string()));
        }
        if self.queue.is_empty() {
            return Err(Error::InvalidTask("queue may not be empty".to_string()));
        }

        Ok(Task {
            id: Uuid::new_v4().simple().to_string(),
            task_type: self.task_type,
            queue: self.queue,
            payload: self.payload,
            deadline: self.deadline,
            max_tries: self.max_tries,
            tries: 0,
            state: TaskState::New,
            created_at: Utc::now(),
            last_triggered_at: None,
            result: None,
            storage_revision: 0,
            extra: Map::new(),
        })
    }
}
