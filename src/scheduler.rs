//! Task scheduler: pull loops, the worker pool, and lifecycle transitions.
//!
//! One scheduler runs per [`crate::Client::run`] call. A pull loop fetches
//! message deliveries from the storage adapter and feeds them through a
//! bounded channel to `max_concurrency` workers; backpressure is the channel
//! itself. Each worker executes the full per-delivery sequence: load the
//! record, activate it under the compare-and-swap discipline, keep the lease
//! alive while the handler runs, and commit the resulting transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::errors::{Error, Result};
use crate::events::{EventSink, LifecycleEvent};
use crate::queue::Queue;
use crate::retry::RetryPolicy;
use crate::router::TaskRouter;
use crate::storage::{StorageAdapter, WorkItem};
use crate::task::{Task, TaskResult, TaskState};

/// Local rounds of reload-and-save before a delivery is given back to the
/// broker for a later retry.
const CAS_ATTEMPTS: u32 = 5;

/// Redelivery delay requested after transient failures.
const TRANSIENT_NAK_DELAY: Duration = Duration::from_secs(5);

/// Backoff applied to the pull loop after a storage error.
const PULL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Creates a shutdown signal channel. Send `true` to stop a running client.
#[must_use]
pub fn shutdown_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Blocks until SIGINT or SIGTERM, then triggers the given shutdown channel.
pub async fn wait_for_shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }

    let _ = shutdown_tx.send(true);
}

/// How one handler attempt ended.
enum Attempt {
    Success(Vec<u8>),
    Failure(String),
}

/// Outcome of committing a terminal transition.
enum Commit {
    /// Our save landed.
    Saved,
    /// Another writer already committed a terminal state; the delivery is
    /// settled and repeating the write would change nothing.
    SettledElsewhere,
    /// The save could not land; the message goes back for redelivery.
    Failed,
}

pub(crate) struct Scheduler {
    pub(crate) storage: Arc<dyn StorageAdapter>,
    pub(crate) queue: Queue,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) discard_states: Vec<TaskState>,
    pub(crate) events: EventSink,
    pub(crate) paused: watch::Receiver<bool>,
    pub(crate) grace_period: Duration,
}

impl Scheduler {
    /// Runs pull loop and workers until the shutdown signal fires, then
    /// drains in-flight work for up to the grace period.
    pub(crate) async fn run(
        self: Arc<Self>,
        router: Arc<TaskRouter>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.storage.prepare_queue(&self.queue).await?;

        let (tx, rx) = mpsc::channel::<WorkItem>(self.queue.max_concurrency);
        let rx = Arc::new(Mutex::new(rx));

        let pull = tokio::spawn(Arc::clone(&self).pull_loop(tx, shutdown.clone()));

        let mut workers = JoinSet::new();
        for _ in 0..self.queue.max_concurrency {
            workers.spawn(Arc::clone(&self).worker_loop(
                Arc::clone(&router),
                Arc::clone(&rx),
                shutdown.clone(),
            ));
        }

        tracing::info!(
            queue = %self.queue.name,
            workers = self.queue.max_concurrency,
            "processing started"
        );

        // Block until shutdown is requested. A dropped sender counts too.
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        tracing::info!(
            queue = %self.queue.name,
            grace_period = ?self.grace_period,
            "shutting down, draining in-flight work"
        );

        let _ = pull.await;

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.grace_period, drain).await.is_err() {
            tracing::warn!(
                queue = %self.queue.name,
                "grace period elapsed with work still in flight, aborting"
            );
            workers.shutdown().await;
        }

        tracing::info!(queue = %self.queue.name, "processing stopped");
        Ok(())
    }

    /// Fetches deliveries and forwards them to the workers. Blocks on the
    /// bounded channel when all workers are busy, which in turn stops
    /// polling for more work.
    async fn pull_loop(
        self: Arc<Self>,
        tx: mpsc::Sender<WorkItem>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut paused = self.paused.clone();

        loop {
            if *shutdown.borrow() {
                return;
            }
            if *paused.borrow() {
                tokio::select! {
                    _ = paused.changed() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let polled = tokio::select! {
                polled = self.storage.poll_queue(&self.queue.name, self.queue.poll_timeout) => polled,
                _ = shutdown.changed() => continue,
            };

            match polled {
                Ok(Some(item)) => {
                    tokio::select! {
                        sent = tx.send(item) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        // An unforwarded delivery is redelivered once its
                        // lease lapses.
                        _ = shutdown.changed() => return,
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(queue = %self.queue.name, error = %e, "poll failed");
                    tokio::select! {
                        () = tokio::time::sleep(PULL_ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// One worker: takes deliveries off the shared channel until shutdown
    /// or channel close.
    async fn worker_loop(
        self: Arc<Self>,
        router: Arc<TaskRouter>,
        rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut paused = self.paused.clone();

        loop {
            if *shutdown.borrow() {
                return;
            }
            if *paused.borrow() {
                tokio::select! {
                    _ = paused.changed() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let item = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    item = guard.recv() => item,
                    _ = shutdown.changed() => continue,
                }
            };

            match item {
                Some(item) => self.process_item(&router, &item).await,
                None => return,
            }
        }
    }

    /// Loads a task record, retrying transient failures a few times before
    /// giving the delivery back to the broker.
    async fn load_task_with_retries(&self, id: &str) -> Result<Task> {
        let mut last_err = Error::TaskNotFound;
        for _ in 0..3 {
            match self.storage.load_task(id).await {
                Ok(task) => return Ok(task),
                Err(e) if e.is_transient() => {
                    tracing::debug!(task_id = %id, error = %e, "transient load failure");
                    last_err = e;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Executes the full lifecycle sequence for one delivery.
    pub(crate) async fn process_item(&self, router: &TaskRouter, item: &WorkItem) {
        let mut task = match self.load_task_with_retries(&item.task_id).await {
            Ok(task) => task,
            Err(Error::TaskNotFound) => {
                // The record was purged or discarded; the message is noise.
                tracing::debug!(task_id = %item.task_id, "task record gone, dropping message");
                self.ack(item).await;
                return;
            }
            Err(e) => {
                tracing::warn!(task_id = %item.task_id, error = %e, "task load failed");
                self.nak(item, TRANSIENT_NAK_DELAY).await;
                return;
            }
        };

        if !self.activate(&mut task, item).await {
            return;
        }

        let pinger = self.spawn_lease_pinger(item.clone());

        let Some(handler) = router.route(&task.task_type) else {
            pinger.abort();
            self.settle_queue_error(&mut task, item).await;
            return;
        };

        self.events.emit(LifecycleEvent::TaskAttempt {
            task_id: task.id.clone(),
            tries: task.tries,
        });

        let attempt = self.execute_handler(handler, &task).await;
        pinger.abort();

        match attempt {
            Attempt::Success(payload) => self.settle_completed(&mut task, item, payload).await,
            Attempt::Failure(message) => self.settle_failure(&mut task, item, &message).await,
        }
    }

    /// Steps the task to `Active`, incrementing `tries`, under bounded
    /// compare-and-swap retries. Handles obsolete deliveries, exhausted
    /// attempts, and passed deadlines along the way. Returns false when the
    /// delivery was settled without running a handler.
    async fn activate(&self, task: &mut Task, item: &WorkItem) -> bool {
        let max_tries = task.max_tries_or(self.queue.max_tries);

        for _ in 0..CAS_ATTEMPTS {
            if task.state.is_terminal() || task.state == TaskState::QueueError {
                tracing::debug!(task_id = %task.id, state = %task.state, "obsolete delivery");
                self.ack(item).await;
                return false;
            }
            if task.is_past_deadline(Utc::now()) {
                self.settle_expired(task, item).await;
                return false;
            }
            if task.tries >= max_tries {
                self.settle_terminated(task, item).await;
                return false;
            }

            task.tries += 1;
            task.state = TaskState::Active;
            task.last_triggered_at = Some(Utc::now());

            match self.storage.save_task_state(task).await {
                Ok(()) => return true,
                Err(Error::SaveConflict { .. }) => {
                    match self.storage.load_task(&item.task_id).await {
                        Ok(fresh) => *task = fresh,
                        Err(Error::TaskNotFound) => {
                            self.ack(item).await;
                            return false;
                        }
                        Err(e) => {
                            tracing::warn!(task_id = %task.id, error = %e, "reload failed");
                            self.nak(item, TRANSIENT_NAK_DELAY).await;
                            return false;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "activation save failed");
                    self.nak(item, TRANSIENT_NAK_DELAY).await;
                    return false;
                }
            }
        }

        tracing::warn!(
            task_id = %task.id,
            "activation lost {CAS_ATTEMPTS} compare-and-swap rounds, requeueing"
        );
        self.nak(item, jittered(TRANSIENT_NAK_DELAY)).await;
        false
    }

    /// Extends the delivery lease at half the run-time interval until
    /// aborted.
    fn spawn_lease_pinger(&self, item: WorkItem) -> tokio::task::JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        let interval = self.queue.max_run_time / 2;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = storage.in_progress(&item).await {
                    tracing::warn!(task_id = %item.task_id, error = %e, "lease extension failed");
                    return;
                }
            }
        })
    }

    /// Runs the handler inside its own task so a panic is contained, bounded
    /// by the queue run time and the task deadline.
    async fn execute_handler(
        &self,
        handler: Arc<dyn crate::router::TaskHandler>,
        task: &Task,
    ) -> Attempt {
        let mut budget = self.queue.max_run_time;
        if let Some(deadline) = task.deadline {
            let remaining = (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            budget = budget.min(remaining);
        }

        let handler_task = task.clone();
        let join = tokio::spawn(async move { handler.process(handler_task).await });
        let abort = join.abort_handle();

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(budget, join).await;
        histogram!("asyncjobs.task.duration_seconds", "task_type" => task.task_type.clone())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(Ok(payload))) => Attempt::Success(payload),
            Ok(Ok(Err(e))) => Attempt::Failure(e.to_string()),
            Ok(Err(join_err)) if join_err.is_panic() => {
                tracing::error!(task_id = %task.id, "handler panicked");
                Attempt::Failure("handler panicked".to_string())
            }
            Ok(Err(_)) => Attempt::Failure("handler was cancelled".to_string()),
            Err(_) => {
                abort.abort();
                Attempt::Failure(format!("attempt exceeded {budget:?}"))
            }
        }
    }

    async fn settle_completed(&self, task: &mut Task, item: &WorkItem, payload: Vec<u8>) {
        task.state = TaskState::Completed;
        task.result = Some(TaskResult {
            payload,
            completed_at: Utc::now(),
        });

        match self.commit_terminal(task).await {
            Commit::Saved => {
                tracing::info!(task_id = %task.id, tries = task.tries, "task completed");
                counter!("asyncjobs.tasks.completed", "task_type" => task.task_type.clone())
                    .increment(1);
                self.ack(item).await;
                self.events.emit(LifecycleEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    tries: task.tries,
                });
                self.discard_if_desired(task).await;
            }
            Commit::SettledElsewhere => self.ack(item).await,
            Commit::Failed => self.nak(item, TRANSIENT_NAK_DELAY).await,
        }
    }

    async fn settle_failure(&self, task: &mut Task, item: &WorkItem, message: &str) {
        let max_tries = task.max_tries_or(self.queue.max_tries);
        tracing::warn!(
            task_id = %task.id,
            tries = task.tries,
            max_tries = max_tries,
            error = message,
            "task attempt failed"
        );

        if task.tries >= max_tries {
            self.settle_terminated(task, item).await;
            return;
        }

        task.state = TaskState::Retry;
        match self.storage.save_task_state(task).await {
            Ok(()) => {}
            Err(Error::SaveConflict { .. }) => {
                // Lost the record race; the next delivery re-evaluates from
                // scratch.
                tracing::warn!(task_id = %task.id, "retry save conflicted");
                self.nak(item, TRANSIENT_NAK_DELAY).await;
                return;
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "retry save failed");
                self.nak(item, TRANSIENT_NAK_DELAY).await;
                return;
            }
        }

        let delay = self.retry_policy.delay(task.tries.saturating_sub(1));
        counter!("asyncjobs.tasks.retried", "task_type" => task.task_type.clone()).increment(1);
        self.nak(item, delay).await;
        self.events.emit(LifecycleEvent::TaskRetried {
            task_id: task.id.clone(),
            delay,
        });
    }

    async fn settle_terminated(&self, task: &mut Task, item: &WorkItem) {
        task.state = TaskState::Terminated;
        if task.result.is_none() {
            task.result = Some(TaskResult {
                payload: Vec::new(),
                completed_at: Utc::now(),
            });
        }

        match self.commit_terminal(task).await {
            Commit::Saved => {
                tracing::warn!(task_id = %task.id, tries = task.tries, "task terminated");
                counter!("asyncjobs.tasks.terminated", "task_type" => task.task_type.clone())
                    .increment(1);
                self.ack(item).await;
                self.events.emit(LifecycleEvent::TaskTerminated {
                    task_id: task.id.clone(),
                });
                self.discard_if_desired(task).await;
            }
            Commit::SettledElsewhere => self.ack(item).await,
            Commit::Failed => self.nak(item, TRANSIENT_NAK_DELAY).await,
        }
    }

    async fn settle_expired(&self, task: &mut Task, item: &WorkItem) {
        task.state = TaskState::Expired;

        match self.commit_terminal(task).await {
            Commit::Saved => {
                tracing::info!(task_id = %task.id, "task expired");
                counter!("asyncjobs.tasks.expired", "task_type" => task.task_type.clone())
                    .increment(1);
                self.ack(item).await;
                self.events.emit(LifecycleEvent::TaskExpired {
                    task_id: task.id.clone(),
                });
                self.discard_if_desired(task).await;
            }
            Commit::SettledElsewhere => self.ack(item).await,
            Commit::Failed => self.nak(item, TRANSIENT_NAK_DELAY).await,
        }
    }

    /// Marks the task unprocessable and drops the message without
    /// redelivery.
    async fn settle_queue_error(&self, task: &mut Task, item: &WorkItem) {
        tracing::error!(
            task_id = %task.id,
            task_type = %task.task_type,
            "no handler for task type"
        );

        task.state = TaskState::QueueError;
        if let Err(e) = self.storage.save_task_state(task).await {
            tracing::warn!(task_id = %task.id, error = %e, "queue error save failed");
        }

        counter!("asyncjobs.tasks.queue_error", "task_type" => task.task_type.clone())
            .increment(1);
        if let Err(e) = self.storage.terminate_item(item).await {
            tracing::warn!(task_id = %task.id, error = %e, "terminate failed");
        }
        self.events.emit(LifecycleEvent::QueueError {
            task_id: task.id.clone(),
        });
    }

    /// Commits a terminal state under bounded compare-and-swap retries.
    /// A conflicting writer that already left the record terminal settles
    /// the delivery: terminal states are write-once and repeating the write
    /// is a no-op.
    async fn commit_terminal(&self, task: &mut Task) -> Commit {
        let state = task.state;
        let result = task.result.clone();
        let last_triggered_at = task.last_triggered_at;
        let tries = task.tries;

        for _ in 0..CAS_ATTEMPTS {
            match self.storage.save_task_state(task).await {
                Ok(()) => return Commit::Saved,
                Err(Error::SaveConflict { .. }) => {
                    match self.storage.load_task(&task.id).await {
                        Ok(fresh) => {
                            if fresh.state.is_terminal() {
                                return Commit::SettledElsewhere;
                            }
                            *task = fresh;
                            task.state = state;
                            task.result = result.clone();
                            task.last_triggered_at = last_triggered_at;
                            task.tries = task.tries.max(tries);
                        }
                        Err(e) => {
                            tracing::warn!(task_id = %task.id, error = %e, "reload failed");
                            return Commit::Failed;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "terminal save failed");
                    return Commit::Failed;
                }
            }
        }

        Commit::Failed
    }

    async fn discard_if_desired(&self, task: &Task) {
        if !self.discard_states.contains(&task.state) {
            return;
        }
        match self.storage.delete_task(&task.id).await {
            Ok(()) => {
                tracing::debug!(task_id = %task.id, state = %task.state, "task discarded");
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "discard failed");
            }
        }
    }

    async fn ack(&self, item: &WorkItem) {
        if let Err(e) = self.storage.ack_item(item).await {
            tracing::warn!(task_id = %item.task_id, error = %e, "ack failed");
        }
    }

    async fn nak(&self, item: &WorkItem, delay: Duration) {
        if let Err(e) = self.storage.nak_item(item, delay).await {
            tracing::warn!(task_id = %item.task_id, error = %e, "nak failed");
        }
    }
}

/// Scales a delay by a random factor in `[1.0, 1.5)` so colliding workers
/// spread out.
fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
    delay.mul_f64(factor)
}
