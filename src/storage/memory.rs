//! In-memory storage adapter.
//!
//! Backs the memory-only client mode and the test suite. All state lives
//! behind one async mutex, which makes the enqueue record+message pair
//! trivially atomic. Delivery semantics mirror a real broker: messages are
//! leased for the queue's `max_run_time`, negative acknowledgements schedule
//! redelivery after a delay, and expired leases are reclaimed so work is
//! redelivered at least once.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::errors::{Error, Result};
use crate::queue::{Queue, QueueInfo};
use crate::storage::{StorageAdapter, WorkEnvelope, WorkItem, QUEUE_PREFIX, TASK_STORE_PREFIX};
use crate::task::Task;

/// A serialized task record with its revision counter.
struct StoredRecord {
    record: Vec<u8>,
    revision: u64,
}

/// A queue message: the serialized wire envelope.
struct Message {
    envelope: Vec<u8>,
}

/// A message leased to a consumer, reclaimed when `deadline` passes.
struct Leased {
    message: Message,
    deadline: Instant,
}

/// A message waiting out a redelivery delay.
struct Scheduled {
    due: Instant,
    message: Message,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering so the heap yields the earliest due time first.
        Reverse(self.due).cmp(&Reverse(other.due))
    }
}

struct QueueState {
    config: Queue,
    ready: VecDeque<Message>,
    scheduled: BinaryHeap<Scheduled>,
    in_flight: HashMap<u64, Leased>,
    next_handle: u64,
}

impl QueueState {
    fn new(config: Queue) -> Self {
        Self {
            config,
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            in_flight: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Moves due scheduled messages and expired leases back to ready.
    fn promote(&mut self, now: Instant) {
        while self.scheduled.peek().is_some_and(|entry| entry.due <= now) {
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.message);
            }
        }

        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.deadline <= now)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in expired {
            if let Some(leased) = self.in_flight.remove(&handle) {
                self.ready.push_back(leased.message);
            }
        }
    }

    /// The next instant at which promotion could produce a ready message.
    fn next_event_at(&self) -> Option<Instant> {
        let scheduled = self.scheduled.peek().map(|entry| entry.due);
        let lease = self.in_flight.values().map(|leased| leased.deadline).min();
        match (scheduled, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

struct State {
    tasks: HashMap<String, StoredRecord>,
    queues: HashMap<String, QueueState>,
}

/// In-process [`StorageAdapter`] with broker-like delivery semantics.
///
/// Clones share the same state, so a producer and a consumer client can be
/// wired to one instance.
#[derive(Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                tasks: HashMap::new(),
                queues: HashMap::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn task_key(id: &str) -> String {
        format!("{TASK_STORE_PREFIX}.{id}")
    }

    fn queue_key(name: &str) -> String {
        format!("{QUEUE_PREFIX}{name}")
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage").finish_non_exhaustive()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn prepare_queue(&self, queue: &Queue) -> Result<()> {
        queue.validate()?;
        let mut state = self.state.lock().await;
        let key = Self::queue_key(&queue.name);
        match state.queues.get_mut(&key) {
            Some(existing) => existing.config = queue.clone(),
            None => {
                state.queues.insert(key, QueueState::new(queue.clone()));
            }
        }
        Ok(())
    }

    async fn enqueue_task(&self, queue: &Queue, task: &mut Task) -> Result<()> {
        let record = serde_json::to_vec(&task)?;
        let envelope = serde_json::to_vec(&WorkEnvelope::new(&task.id))?;

        let mut state = self.state.lock().await;
        let task_key = Self::task_key(&task.id);
        if state.tasks.contains_key(&task_key) {
            return Err(Error::TaskAlreadyExists {
                id: task.id.clone(),
            });
        }

        let queue_key = Self::queue_key(&queue.name);
        let queue_state = state
            .queues
            .entry(queue_key)
            .or_insert_with(|| QueueState::new(queue.clone()));
        queue_state.ready.push_back(Message { envelope });

        state.tasks.insert(
            task_key,
            StoredRecord {
                record,
                revision: 1,
            },
        );
        task.storage_revision = 1;

        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn load_task(&self, id: &str) -> Result<Task> {
        let state = self.state.lock().await;
        let stored = state
            .tasks
            .get(&Self::task_key(id))
            .ok_or(Error::TaskNotFound)?;
        let mut task: Task = serde_json::from_slice(&stored.record)?;
        task.storage_revision = stored.revision;
        Ok(task)
    }

    async fn save_task_state(&self, task: &mut Task) -> Result<()> {
        let record = serde_json::to_vec(&task)?;

        let mut state = self.state.lock().await;
        let stored = state
            .tasks
            .get_mut(&Self::task_key(&task.id))
            .ok_or(Error::TaskNotFound)?;
        if stored.revision != task.storage_revision {
            return Err(Error::SaveConflict {
                id: task.id.clone(),
            });
        }

        stored.revision += 1;
        stored.record = record;
        task.storage_revision = stored.revision;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.tasks.remove(&Self::task_key(id));
        Ok(())
    }

    async fn poll_queue(&self, name: &str, timeout: Duration) -> Result<Option<WorkItem>> {
        let queue_key = Self::queue_key(name);
        let deadline = Instant::now() + timeout;

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let queue_state = state
                    .queues
                    .get_mut(&queue_key)
                    .ok_or(Error::QueueNotFound)?;

                let now = Instant::now();
                queue_state.promote(now);

                if let Some(message) = queue_state.ready.pop_front() {
                    let envelope: WorkEnvelope = serde_json::from_slice(&message.envelope)?;
                    let handle = queue_state.next_handle;
                    queue_state.next_handle += 1;
                    let lease_deadline = now + queue_state.config.max_run_time;
                    queue_state
                        .in_flight
                        .insert(handle, Leased { message, deadline: lease_deadline });

                    return Ok(Some(WorkItem {
                        task_id: envelope.task_id,
                        queue: name.to_string(),
                        handle,
                    }));
                }

                if now >= deadline {
                    return Ok(None);
                }

                let until_deadline = deadline - now;
                match queue_state.next_event_at() {
                    Some(due) if due > now => (due - now).min(until_deadline),
                    Some(_) => continue,
                    None => until_deadline,
                }
            };

            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack_item(&self, item: &WorkItem) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue_state = state
            .queues
            .get_mut(&Self::queue_key(&item.queue))
            .ok_or(Error::QueueNotFound)?;
        queue_state
            .in_flight
            .remove(&item.handle)
            .map(|_| ())
            .ok_or(Error::StaleHandle {
                handle: item.handle,
            })
    }

    async fn nak_item(&self, item: &WorkItem, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue_state = state
            .queues
            .get_mut(&Self::queue_key(&item.queue))
            .ok_or(Error::QueueNotFound)?;
        let leased = queue_state
            .in_flight
            .remove(&item.handle)
            .ok_or(Error::StaleHandle {
                handle: item.handle,
            })?;
        queue_state.scheduled.push(Scheduled {
            due: Instant::now() + delay,
            message: leased.message,
        });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn in_progress(&self, item: &WorkItem) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue_state = state
            .queues
            .get_mut(&Self::queue_key(&item.queue))
            .ok_or(Error::QueueNotFound)?;
        let extension = queue_state.config.max_run_time;
        let leased = queue_state
            .in_flight
            .get_mut(&item.handle)
            .ok_or(Error::StaleHandle {
                handle: item.handle,
            })?;
        leased.deadline = Instant::now() + extension;
        Ok(())
    }

    async fn terminate_item(&self, item: &WorkItem) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue_state = state
            .queues
            .get_mut(&Self::queue_key(&item.queue))
            .ok_or(Error::QueueNotFound)?;
        queue_state
            .in_flight
            .remove(&item.handle)
            .map(|_| ())
            .ok_or(Error::StaleHandle {
                handle: item.handle,
            })
    }

    async fn purge_queue(&self, name: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let queue_state = state
            .queues
            .get_mut(&Self::queue_key(name))
            .ok_or(Error::QueueNotFound)?;
        let purged = queue_state.ready.len() + queue_state.scheduled.len();
        queue_state.ready.clear();
        queue_state.scheduled.clear();
        Ok(purged as u64)
    }

    async fn queue_info(&self, name: &str) -> Result<QueueInfo> {
        let state = self.state.lock().await;
        let queue_state = state
            .queues
            .get(&Self::queue_key(name))
            .ok_or(Error::QueueNotFound)?;
        Ok(QueueInfo {
            name: name.to_string(),
            depth: queue_state.ready.len() as u64,
            in_flight: queue_state.in_flight.len() as u64,
            scheduled: queue_state.scheduled.len() as u64,
            config: queue_state.config.clone(),
        })
    }

    async fn tasks(&self) -> Result<BoxStream<'static, Task>> {
        let state = self.state.lock().await;
        let mut tasks = Vec::with_capacity(state.tasks.len());
        for stored in state.tasks.values() {
            let mut task: Task = serde_json::from_slice(&stored.record)?;
            task.storage_revision = stored.revision;
            tasks.push(task);
        }
        Ok(Box::pin(stream::iter(tasks)))
    }
}
