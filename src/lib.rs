//! asyncjobs - Asynchronous Job Processing Core
//!
//! A task processing runtime built on a durable, replicated stream store.
//! Producers enqueue tasks (a type, an opaque payload, and scheduling
//! metadata); a pool of workers consumes them, executes user-supplied
//! handlers, and completes, retries, or terminates each task according to
//! policy. Delivery is at-least-once: handlers should be effectively
//! idempotent.
//!
//! The backing store is abstracted behind [`StorageAdapter`], which needs
//! ordered replayable message streams with per-message acknowledgement and
//! a record store with optimistic concurrency. An in-memory implementation
//! ships for tests and single-process use.
//!
//! ```no_run
//! use asyncjobs::{Client, Task, TaskRouter};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder().memory_storage().build()?;
//!
//! let mut task = Task::new("email.welcome", br#"{"user":42}"#.to_vec())?;
//! client.enqueue_task(&mut task).await?;
//!
//! let mut router = TaskRouter::new();
//! router.handle_func("email.welcome", |task| async move {
//!     println!("sending welcome mail for task {}", task.id);
//!     Ok(b"sent".to_vec())
//! })?;
//!
//! let (shutdown_tx, shutdown_rx) = asyncjobs::shutdown_signal();
//! tokio::spawn(async move {
//!     asyncjobs::wait_for_shutdown_signal(shutdown_tx).await;
//! });
//! client.run(router, shutdown_rx).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod errors;
pub mod events;
pub mod queue;
pub mod retry;
pub mod router;
mod scheduler;
pub mod storage;
pub mod task;

pub use client::{Client, ClientBuilder, TaskFilter};
pub use errors::{Error, Result};
pub use events::{LifecycleEvent, DEFAULT_EVENT_CAPACITY};
pub use queue::{Queue, QueueInfo, DEFAULT_QUEUE};
pub use retry::RetryPolicy;
pub use router::{HandlerError, HandlerFn, TaskHandler, TaskRouter};
pub use scheduler::{shutdown_signal, wait_for_shutdown_signal};
pub use storage::{MemoryStorage, StorageAdapter, WorkEnvelope, WorkItem};
pub use task::{Task, TaskBuilder, TaskResult, TaskState};
