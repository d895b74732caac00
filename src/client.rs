//! Client facade.
//!
//! A [`Client`] ties together a storage adapter, one work queue, a retry
//! policy, and the discard configuration. Producers use it to enqueue tasks;
//! consumers hand it a router and call [`Client::run`]. Multiple clients in
//! one process are independent: all state lives on the instance.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use tokio::sync::{broadcast, watch};

use crate::errors::{Error, Result};
use crate::events::{EventSink, LifecycleEvent, DEFAULT_EVENT_CAPACITY};
use crate::queue::{Queue, QueueInfo};
use crate::retry::RetryPolicy;
use crate::router::TaskRouter;
use crate::scheduler::Scheduler;
use crate::storage::{MemoryStorage, StorageAdapter};
use crate::task::{Task, TaskState};

/// Default grace period for draining in-flight work on shutdown.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Filter for operator-level task listings. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match only tasks in this state.
    pub state: Option<TaskState>,
    /// Match only tasks on this queue.
    pub queue: Option<String>,
}

impl TaskFilter {
    /// Returns true if the task passes the filter.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        if self.state.is_some_and(|state| task.state != state) {
            return false;
        }
        if self
            .queue
            .as_ref()
            .is_some_and(|queue| task.queue != *queue)
        {
            return false;
        }
        true
    }
}

/// Builder for [`Client`] instances.
///
/// A storage adapter is required; memory-only mode must be requested
/// explicitly with [`ClientBuilder::memory_storage`].
pub struct ClientBuilder {
    storage: Option<Arc<dyn StorageAdapter>>,
    queue: Queue,
    retry_policy: RetryPolicy,
    discard_states: Vec<TaskState>,
    event_capacity: usize,
    grace_period: Duration,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            storage: None,
            queue: Queue::default(),
            retry_policy: RetryPolicy::default(),
            discard_states: Vec::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl ClientBuilder {
    /// Uses the given storage adapter.
    #[must_use]
    pub fn storage(mut self, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(adapter);
        self
    }

    /// Uses a fresh in-memory store. Suited to tests and single-process
    /// pipelines; nothing survives the process.
    #[must_use]
    pub fn memory_storage(mut self) -> Self {
        self.storage = Some(Arc::new(MemoryStorage::new()));
        self
    }

    /// Sets the work queue this client produces to and consumes from.
    #[must_use]
    pub fn work_queue(mut self, queue: Queue) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the backoff policy applied to failed attempts.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Configures task states whose records are deleted right after the
    /// terminal transition. Only terminal states are accepted.
    #[must_use]
    pub fn discard_states(mut self, states: &[TaskState]) -> Self {
        self.discard_states = states.to_vec();
        self
    }

    /// Sets the lifecycle event channel capacity.
    #[must_use]
    pub const fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets how long shutdown waits for in-flight handlers.
    #[must_use]
    pub const fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Validates the configuration and creates the client.
    ///
    /// # Errors
    ///
    /// * [`Error::NoStorage`] if no adapter was configured.
    /// * [`Error::InvalidQueue`] for a bad queue configuration.
    /// * [`Error::InvalidDiscardState`] if any discard state is
    ///   non-terminal.
    pub fn build(self) -> Result<Client> {
        let storage = self.storage.ok_or(Error::NoStorage)?;
        self.queue.validate()?;

        if self
            .discard_states
            .iter()
            .any(|state| !state.can_be_discarded())
        {
            return Err(Error::InvalidDiscardState);
        }

        let (pause_tx, pause_rx) = watch::channel(false);

        Ok(Client {
            storage,
            queue: self.queue,
            retry_policy: self.retry_policy,
            discard_states: self.discard_states,
            events: EventSink::new(self.event_capacity),
            pause_tx,
            pause_rx,
            grace_period: self.grace_period,
        })
    }
}

/// Application-facing handle for enqueueing and processing tasks.
pub struct Client {
    storage: Arc<dyn StorageAdapter>,
    queue: Queue,
    retry_policy: RetryPolicy,
    discard_states: Vec<TaskState>,
    events: EventSink,
    pause_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,
    grace_period: Duration,
}

impl Client {
    /// Starts building a client.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// The queue this client is bound to.
    #[must_use]
    pub const fn work_queue(&self) -> &Queue {
        &self.queue
    }

    /// Persists a task and pushes its reference onto the client's queue.
    /// The task is placed on this client's queue regardless of how it was
    /// built; its `storage_revision` is set on success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskAlreadyExists`] for a reused id, or storage
    /// errors from the adapter.
    pub async fn enqueue_task(&self, task: &mut Task) -> Result<()> {
        task.queue = self.queue.name.clone();
        self.storage.enqueue_task(&self.queue, task).await?;

        tracing::debug!(task_id = %task.id, queue = %self.queue.name, "task enqueued");
        self.events.emit(LifecycleEvent::TaskEnqueued {
            task_id: task.id.clone(),
            queue: self.queue.name.clone(),
        });
        Ok(())
    }

    /// Fetches the current record for a task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if no record exists.
    pub async fn load_task_by_id(&self, id: &str) -> Result<Task> {
        self.storage.load_task(id).await
    }

    /// Consumes the queue with the given router until `shutdown` signals.
    ///
    /// Returns `Ok(())` after a clean drain; configuration and connection
    /// failures surface as errors. Handler failures never do — they feed
    /// the retry machinery instead.
    ///
    /// # Errors
    ///
    /// Returns adapter errors from queue preparation.
    pub async fn run(&self, router: TaskRouter, shutdown: watch::Receiver<bool>) -> Result<()> {
        let scheduler = Arc::new(Scheduler {
            storage: Arc::clone(&self.storage),
            queue: self.queue.clone(),
            retry_policy: self.retry_policy.clone(),
            discard_states: self.discard_states.clone(),
            events: self.events.clone(),
            paused: self.pause_rx.clone(),
            grace_period: self.grace_period,
        });
        scheduler.run(Arc::new(router), shutdown).await
    }

    /// Stops pulling new work. In-flight attempts drain; [`Client::resume`]
    /// picks back up.
    pub fn pause(&self) {
        tracing::info!(queue = %self.queue.name, "pausing work consumption");
        let _ = self.pause_tx.send(true);
    }

    /// Resumes a paused client.
    pub fn resume(&self) {
        tracing::info!(queue = %self.queue.name, "resuming work consumption");
        let _ = self.pause_tx.send(false);
    }

    /// Returns true while the client is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.pause_rx.borrow()
    }

    /// Stops consuming for good. Running schedulers drain their in-flight
    /// attempts; unfinished deliveries return to the broker when their
    /// leases lapse.
    pub fn close(&self) {
        tracing::info!(queue = %self.queue.name, "client closed");
        let _ = self.pause_tx.send(true);
    }

    /// Opens a lifecycle event subscription. Slow subscribers lose the
    /// oldest events instead of slowing processing down.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Returns true if the task's state is configured for discard.
    #[must_use]
    pub fn should_discard_task(&self, task: &Task) -> bool {
        self.discard_states.contains(&task.state)
    }

    /// Deletes the task record if its state is configured for discard.
    ///
    /// # Errors
    ///
    /// Returns adapter errors from the delete.
    pub async fn discard_task_if_desired(&self, task: &Task) -> Result<()> {
        if !self.should_discard_task(task) {
            return Ok(());
        }
        self.storage.delete_task(&task.id).await
    }

    // Operator-level helpers. These speak to the adapter directly and
    // bypass the lifecycle state machine.

    /// Streams task records known to the adapter, lazily filtered.
    ///
    /// # Errors
    ///
    /// Returns adapter errors from the listing.
    pub async fn tasks(&self, filter: TaskFilter) -> Result<BoxStream<'static, Task>> {
        use futures::StreamExt;

        let stream = self.storage.tasks().await?;
        Ok(Box::pin(stream.filter(move |task| {
            futures::future::ready(filter.matches(task))
        })))
    }

    /// Drops all pending messages from the client's queue, returning how
    /// many were removed. Task records stay behind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueNotFound`] if the queue was never prepared.
    pub async fn purge_queue(&self) -> Result<u64> {
        let purged = self.storage.purge_queue(&self.queue.name).await?;
        tracing::info!(queue = %self.queue.name, purged = purged, "queue purged");
        Ok(purged)
    }

    /// Point-in-time statistics for the client's queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueNotFound`] if the queue was never prepared.
    pub async fn queue_info(&self) -> Result<QueueInfo> {
        self.storage.queue_info(&self.queue.name).await
    }

    /// Unconditionally deletes a task record, terminal or not.
    ///
    /// # Errors
    ///
    /// Returns adapter errors from the delete.
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        self.storage.delete_task(id).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("queue", &self.queue.name)
            .field("discard_states", &self.discard_states)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_storage() {
        let err = Client::builder().build().unwrap_err();
        assert!(matches!(err, Error::NoStorage));
    }

    #[test]
    fn test_discard_state_validation() {
        for state in [
            TaskState::New,
            TaskState::Active,
            TaskState::Retry,
            TaskState::QueueError,
            TaskState::Unknown,
        ] {
            let err = Client::builder()
                .memory_storage()
                .discard_states(&[TaskState::Expired, state])
                .build()
                .unwrap_err();
            assert_eq!(
                err.to_string(),
                "only states completed, expired or terminated can be discarded"
            );
        }
    }

    #[test]
    fn test_terminal_discard_states_accepted() {
        let client = Client::builder()
            .memory_storage()
            .discard_states(&[
                TaskState::Completed,
                TaskState::Expired,
                TaskState::Terminated,
            ])
            .build()
            .unwrap();
        assert!(client.should_discard_task(&Task {
            state: TaskState::Expired,
            ..Task::new("x", b"".to_vec()).unwrap()
        }));
    }

    #[test]
    fn test_invalid_queue_rejected() {
        let err = Client::builder()
            .memory_storage()
            .work_queue(Queue::new(""))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQueue(_)));
    }

    #[test]
    fn test_should_discard_task() {
        let client = Client::builder()
            .memory_storage()
            .discard_states(&[TaskState::Expired, TaskState::Completed])
            .build()
            .unwrap();

        let mut task = Task::new("x", b"".to_vec()).unwrap();

        task.state = TaskState::Active;
        assert!(!client.should_discard_task(&task));

        task.state = TaskState::Expired;
        assert!(client.should_discard_task(&task));

        task.state = TaskState::Completed;
        assert!(client.should_discard_task(&task));
    }

    #[tokio::test]
    async fn test_discard_task_if_desired() {
        let client = Client::builder()
            .memory_storage()
            .discard_states(&[TaskState::Expired, TaskState::Completed])
            .build()
            .unwrap();

        let mut task = Task::new("x", b"".to_vec()).unwrap();
        client.enqueue_task(&mut task).await.unwrap();

        // New is not in the discard set: the record stays.
        client.discard_task_if_desired(&task).await.unwrap();
        assert!(client.load_task_by_id(&task.id).await.is_ok());

        task.state = TaskState::Expired;
        client.discard_task_if_desired(&task).await.unwrap();
        let err = client.load_task_by_id(&task.id).await.unwrap_err();
        assert_eq!(err.to_string(), "task not found");
    }

    #[tokio::test]
    async fn test_enqueue_assigns_queue_and_revision() {
        let client = Client::builder()
            .memory_storage()
            .work_queue(Queue::new("JOBS"))
            .build()
            .unwrap();
        let mut events = client.subscribe();

        let mut task = Task::new("x", b"data".to_vec()).unwrap();
        assert_eq!(task.queue, "DEFAULT");
        client.enqueue_task(&mut task).await.unwrap();

        assert_eq!(task.queue, "JOBS");
        assert_eq!(task.storage_revision, 1);

        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::TaskEnqueued {
                task_id: task.id.clone(),
                queue: "JOBS".to_string(),
            }
        );

        let loaded = client.load_task_by_id(&task.id).await.unwrap();
        assert_eq!(loaded.queue, "JOBS");
        assert_eq!(loaded.state, TaskState::New);
    }

    #[tokio::test]
    async fn test_pause_resume_close() {
        let client = Client::builder().memory_storage().build().unwrap();
        assert!(!client.is_paused());

        client.pause();
        assert!(client.is_paused());

        client.resume();
        assert!(!client.is_paused());

        client.close();
        assert!(client.is_paused());
    }

    #[tokio::test]
    async fn test_admin_ops_bypass_state_machine() {
        use futures::StreamExt;

        let client = Client::builder()
            .memory_storage()
            .work_queue(Queue::new("ADMIN"))
            .build()
            .unwrap();

        let mut t1 = Task::new("a", b"".to_vec()).unwrap();
        let mut t2 = Task::new("b", b"".to_vec()).unwrap();
        client.enqueue_task(&mut t1).await.unwrap();
        client.enqueue_task(&mut t2).await.unwrap();

        let info = client.queue_info().await.unwrap();
        assert_eq!(info.depth, 2);

        let listed: Vec<Task> = client
            .tasks(TaskFilter::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(listed.len(), 2);

        let only_a: Vec<Task> = client
            .tasks(TaskFilter {
                state: Some(TaskState::New),
                queue: Some("ADMIN".to_string()),
            })
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(only_a.len(), 2);

        let none: Vec<Task> = client
            .tasks(TaskFilter {
                state: Some(TaskState::Completed),
                queue: None,
            })
            .await
            .unwrap()
            .collect()
            .await;
        assert!(none.is_empty());

        // Delete works on a non-terminal record.
        client.delete_task(&t1.id).await.unwrap();
        assert!(client.load_task_by_id(&t1.id).await.is_err());

        let purged = client.purge_queue().await.unwrap();
        assert_eq!(purged, 2);
        assert_eq!(client.queue_info().await.unwrap().depth, 0);

        // The purge left t2's record alone.
        assert!(client.load_task_by_id(&t2.id).await.is_ok());
    }
}
