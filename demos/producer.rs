//! Example producer that enqueues tasks and watches their lifecycle.
//!
//! Run with:
//!     cargo run --example producer
//!
//! This example demonstrates:
//! - Building a client in memory-only mode
//! - Enqueueing tasks with custom limits
//! - Subscribing to lifecycle events
//! - Operator-level queue inspection

use std::env;
use std::time::Duration;

use asyncjobs::{Client, Queue, Task, DEFAULT_QUEUE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let queue_name = env::var("AJ_WORK_QUEUE").unwrap_or_else(|_| DEFAULT_QUEUE.to_string());
    println!("[producer] Using work queue {queue_name}");

    let client = Client::builder()
        .memory_storage()
        .work_queue(Queue::new(&queue_name))
        .build()?;

    let mut events = client.subscribe();

    for i in 0..5 {
        let payload = format!(r#"{{"order":{i}}}"#);
        let mut task = Task::builder("orders.process", payload.into_bytes())
            .max_tries(5)
            .build()?;
        client.enqueue_task(&mut task).await?;
        println!("[producer] Enqueued task {} ({})", task.id, task.task_type);
    }

    let info = client.queue_info().await?;
    println!(
        "[producer] Queue {}: {} ready, {} in flight, {} scheduled",
        info.name, info.depth, info.in_flight, info.scheduled
    );

    // Drain the enqueue notifications that arrived while we were producing.
    while let Ok(event) = events.try_recv() {
        println!("[producer] Event: {event:?}");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("[producer] Done");
    Ok(())
}
