//! Example worker: enqueues a batch of tasks, then processes them until
//! the queue drains or the process is interrupted.
//!
//! Run with:
//!     cargo run --example worker
//!
//! This example demonstrates:
//! - Registering handlers, including a prefix fallback
//! - Running the scheduler with graceful shutdown on SIGINT/SIGTERM
//! - Handlers inspecting the attempt counter to behave differently on
//!   retries

use std::env;
use std::sync::Arc;
use std::time::Duration;

use asyncjobs::{
    shutdown_signal, wait_for_shutdown_signal, Client, Queue, RetryPolicy, Task, TaskRouter,
    TaskState, DEFAULT_QUEUE,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let queue_name = env::var("AJ_WORK_QUEUE").unwrap_or_else(|_| DEFAULT_QUEUE.to_string());
    println!("[worker] Using work queue {queue_name}");

    let client = Arc::new(
        Client::builder()
            .memory_storage()
            .work_queue(Queue::new(&queue_name).with_max_concurrency(4))
            .retry_policy(RetryPolicy::constant(Duration::from_millis(500)))
            .build()?,
    );

    // Seed some work; the memory store lives in this process only.
    let mut ids = Vec::new();
    for i in 0..10 {
        let mut task = Task::new("demo.flaky", format!("job {i}").into_bytes())?;
        client.enqueue_task(&mut task).await?;
        ids.push(task.id);
    }

    // This type has no exact handler and lands on the "demo" prefix route.
    let mut cleanup = Task::new("demo.cleanup", b"sweep".to_vec())?;
    client.enqueue_task(&mut cleanup).await?;
    ids.push(cleanup.id);

    println!("[worker] Enqueued {} tasks", ids.len());

    let mut router = TaskRouter::new();
    router.handle_func("demo.flaky", |task| async move {
        // Fail the first attempt to show the retry machinery.
        if task.tries < 2 {
            println!("[worker] {} try {} failed, will retry", task.id, task.tries);
            return Err("simulated flake".to_string().into());
        }
        println!("[worker] {} succeeded on try {}", task.id, task.tries);
        Ok(b"done".to_vec())
    })?;
    router.handle_func("demo", |task| async move {
        println!("[worker] prefix fallback handled {}", task.task_type);
        Ok(Vec::new())
    })?;

    let (shutdown_tx, shutdown_rx) = shutdown_signal();
    tokio::spawn(wait_for_shutdown_signal(shutdown_tx.clone()));

    // Stop once everything settles.
    {
        let client = Arc::clone(&client);
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let mut done = 0;
                for id in &ids {
                    if let Ok(task) = client.load_task_by_id(id).await {
                        if task.state == TaskState::Completed {
                            done += 1;
                        }
                    }
                }
                if done == ids.len() {
                    println!("[worker] All tasks completed, shutting down");
                    let _ = shutdown_tx.send(true);
                    return;
                }
            }
        });
    }

    client.run(router, shutdown_rx).await?;
    println!("[worker] Clean shutdown");
    Ok(())
}
