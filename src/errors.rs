//! Error types for the job processing core.
//!
//! Errors fall into a few families the runtime treats differently:
//! configuration errors surface from [`crate::Client`] construction and are
//! fatal, storage errors may be transient and retried, and revision conflicts
//! signal a lost optimistic-concurrency race that callers resolve by
//! reloading the record.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the client, scheduler, router, and storage adapters.
#[derive(Debug, Error)]
pub enum Error {
    /// No task record exists for the requested id.
    #[error("task not found")]
    TaskNotFound,

    /// The requested queue has not been prepared on the storage adapter.
    #[error("queue not found")]
    QueueNotFound,

    /// A task record with this id already exists; enqueue expects a fresh id.
    #[error("task {id} already exists")]
    TaskAlreadyExists {
        /// The conflicting task id.
        id: String,
    },

    /// An optimistic save lost the race: the stored revision no longer
    /// matches the revision the caller loaded.
    #[error("task {id} was modified concurrently")]
    SaveConflict {
        /// The id of the task whose save was rejected.
        id: String,
    },

    /// A discard-state list referenced a state that is not terminal.
    #[error("only states completed, expired or terminated can be discarded")]
    InvalidDiscardState,

    /// The client was built without a storage adapter or memory mode.
    #[error("no storage adapter configured")]
    NoStorage,

    /// A queue configuration failed validation.
    #[error("invalid queue: {0}")]
    InvalidQueue(String),

    /// A task failed validation before enqueue.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// A retry policy failed validation.
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// A handler was already registered for this task type.
    #[error("handler already registered for task type {task_type}")]
    DuplicateHandler {
        /// The task type with the conflicting registration.
        task_type: String,
    },

    /// A message handle was acknowledged, terminated, or expired and can no
    /// longer be operated on.
    #[error("message handle {handle} is no longer held")]
    StaleHandle {
        /// The opaque delivery handle.
        handle: u64,
    },

    /// A storage operation failed. `transient` distinguishes failures worth
    /// retrying from permanent ones.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
        /// Whether retrying the operation may succeed.
        transient: bool,
    },

    /// A record or envelope could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Creates a transient storage error.
    pub fn transient_storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a permanent storage error.
    pub fn permanent_storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    ///
    /// Revision conflicts are retryable too, but only after reloading the
    /// record, so they are not reported as transient here.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { transient: true, .. })
    }
}
