//! Handler routing by task type.
//!
//! The router maps task type strings to handlers. Lookup tries an exact
//! match first, then walks dot-separated prefixes from longest to shortest
//! (`"a.b.c"` falls back to `"a.b"`, then `"a"`), and finally an empty-string
//! catch-all if one was registered. Registration is one-shot per key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{Error, Result};
use crate::task::Task;

/// Error type handlers may return. Any boxed error works; the scheduler only
/// records its message.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// User-supplied logic that executes one task attempt.
///
/// The handler receives its own copy of the task (including `tries`, so it
/// can behave differently on retries) and returns the result bytes persisted
/// on completion. The future is dropped if the attempt exceeds the queue's
/// run time or the runtime shuts down, so handlers must be cancel-safe.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Executes one attempt of the task.
    async fn process(&self, task: Task) -> std::result::Result<Vec<u8>, HandlerError>;
}

/// Adapter lifting a plain async function into a [`TaskHandler`].
pub struct HandlerFn<F>(F);

impl<F> HandlerFn<F> {
    /// Wraps an async function as a handler.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Vec<u8>, HandlerError>> + Send,
{
    async fn process(&self, task: Task) -> std::result::Result<Vec<u8>, HandlerError> {
        (self.0)(task).await
    }
}

/// Registry mapping task types to handlers.
///
/// Populated before [`crate::Client::run`] and read-only afterwards.
#[derive(Default)]
pub struct TaskRouter {
    routes: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a task type. The empty string registers a
    /// catch-all consulted after every prefix fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateHandler`] if the key is already taken.
    pub fn handler(
        &mut self,
        task_type: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> Result<()> {
        let task_type = task_type.into();
        if self.routes.contains_key(&task_type) {
            return Err(Error::DuplicateHandler { task_type });
        }
        self.routes.insert(task_type, Arc::new(handler));
        Ok(())
    }

    /// Registers an async function as a handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateHandler`] if the key is already taken.
    pub fn handle_func<F, Fut>(&mut self, task_type: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<u8>, HandlerError>> + Send + 'static,
    {
        self.handler(task_type, HandlerFn(f))
    }

    /// Resolves the handler for a task type: exact, then longest prefix,
    /// then the catch-all.
    #[must_use]
    pub fn route(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        let mut key = task_type;
        loop {
            if let Some(handler) = self.routes.get(key) {
                return Some(Arc::clone(handler));
            }
            match key.rfind('.') {
                Some(pos) => key = &key[..pos],
                None => break,
            }
        }

        if task_type.is_empty() {
            // The loop above already consulted the catch-all.
            return None;
        }
        self.routes.get("").map(Arc::clone)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for TaskRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.routes.keys().collect();
        keys.sort();
        f.debug_struct("TaskRouter").field("routes", &keys).finish()
    }
}
