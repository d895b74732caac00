//! End-to-end lifecycle scenarios against the in-memory storage adapter.
//!
//! These drive the full runtime: enqueue through the client, consume with a
//! router and running scheduler, and observe the resulting records and
//! lifecycle events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use asyncjobs::{
    shutdown_signal, Client, LifecycleEvent, Queue, RetryPolicy, Task, TaskRouter, TaskState,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn fast_queue(name: &str) -> Queue {
    Queue::new(name)
        .with_max_run_time(Duration::from_millis(500))
        .with_poll_timeout(Duration::from_millis(50))
}

fn spawn_run(
    client: Arc<Client>,
    router: TaskRouter,
) -> (watch::Sender<bool>, JoinHandle<asyncjobs::Result<()>>) {
    let (shutdown_tx, shutdown_rx) = shutdown_signal();
    let handle = tokio::spawn(async move { client.run(router, shutdown_rx).await });
    (shutdown_tx, handle)
}

async fn wait_for_state(client: &Client, id: &str, state: TaskState) -> Task {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(task) = client.load_task_by_id(id).await {
                if task.state == state {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reached state {state}"))
}

async fn shut_down(
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<asyncjobs::Result<()>>,
) {
    shutdown_tx.send(true).expect("runtime already gone");
    handle
        .await
        .expect("runtime task panicked")
        .expect("run returned an error");
}

#[tokio::test]
async fn happy_path_completes_with_result() {
    let client = Arc::new(
        Client::builder()
            .memory_storage()
            .work_queue(fast_queue("HAPPY"))
            .build()
            .expect("client builds"),
    );

    let mut task = Task::new("x", b"payload".to_vec()).expect("task builds");
    client.enqueue_task(&mut task).await.expect("enqueue works");

    let mut router = TaskRouter::new();
    router
        .handle_func("x", |_task| async { Ok(b"done".to_vec()) })
        .expect("handler registers");

    let (shutdown_tx, handle) = spawn_run(Arc::clone(&client), router);

    let finished = wait_for_state(&client, &task.id, TaskState::Completed).await;
    assert_eq!(finished.tries, 1);
    let result = finished.result.expect("completed task has a result");
    assert_eq!(result.payload, b"done");

    shut_down(shutdown_tx, handle).await;
}

#[tokio::test]
async fn retry_then_success_respects_backoff() {
    let first_step = Duration::from_millis(200);
    let client = Arc::new(
        Client::builder()
            .memory_storage()
            .work_queue(fast_queue("RETRIES"))
            .retry_policy(RetryPolicy::constant(first_step))
            .build()
            .expect("client builds"),
    );

    let mut ids = Vec::new();
    for _ in 0..3 {
        let mut task = Task::new("ginkgo", b"test".to_vec()).expect("task builds");
        client.enqueue_task(&mut task).await.expect("enqueue works");
        ids.push(task.id);
    }

    let attempts: Arc<Mutex<HashMap<String, Vec<Instant>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let mut router = TaskRouter::new();
    {
        let attempts = Arc::clone(&attempts);
        router
            .handle_func("ginkgo", move |task| {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts
                        .lock()
                        .expect("attempt log lock")
                        .entry(task.id.clone())
                        .or_default()
                        .push(Instant::now());

                    if task.tries < 2 {
                        return Err("simulated failure".to_string().into());
                    }
                    Ok(b"done".to_vec())
                }
            })
            .expect("handler registers");
    }

    let (shutdown_tx, handle) = spawn_run(Arc::clone(&client), router);

    for id in &ids {
        let task = wait_for_state(&client, id, TaskState::Completed).await;
        assert_eq!(task.tries, 2, "task {id} should complete on the second try");
    }

    let attempts = attempts.lock().expect("attempt log lock");
    let total: usize = attempts.values().map(Vec::len).sum();
    assert_eq!(total, 6, "three tasks, two attempts each");

    for id in &ids {
        let timestamps = &attempts[id];
        assert_eq!(timestamps.len(), 2);
        let gap = timestamps[1] - timestamps[0];
        assert!(
            gap >= first_step,
            "retry for {id} came after {gap:?}, before the {first_step:?} backoff"
        );
    }
    drop(attempts);

    shut_down(shutdown_tx, handle).await;
}

#[tokio::test]
async fn discard_on_expire_removes_record() {
    let client = Client::builder()
        .memory_storage()
        .work_queue(fast_queue("DISCARDS"))
        .discard_states(&[TaskState::Expired, TaskState::Completed])
        .build()
        .expect("client builds");

    let mut task = Task::new("x", b"".to_vec()).expect("task builds");
    client.enqueue_task(&mut task).await.expect("enqueue works");

    task.state = TaskState::Expired;
    client
        .discard_task_if_desired(&task)
        .await
        .expect("discard works");

    let err = client.load_task_by_id(&task.id).await.unwrap_err();
    assert_eq!(err.to_string(), "task not found");
}

#[tokio::test]
async fn non_discard_states_are_retained() {
    let client = Client::builder()
        .memory_storage()
        .work_queue(fast_queue("DISCARDS"))
        .discard_states(&[TaskState::Expired, TaskState::Completed])
        .build()
        .expect("client builds");

    let mut task = Task::new("x", b"".to_vec()).expect("task builds");
    client.enqueue_task(&mut task).await.expect("enqueue works");

    // Still New: not in the discard set.
    client
        .discard_task_if_desired(&task)
        .await
        .expect("discard works");

    assert!(client.load_task_by_id(&task.id).await.is_ok());
}

#[tokio::test]
async fn max_tries_terminates_after_exact_attempt_count() {
    let client = Arc::new(
        Client::builder()
            .memory_storage()
            .work_queue(fast_queue("EXHAUST"))
            .retry_policy(RetryPolicy::constant(Duration::from_millis(50)))
            .build()
            .expect("client builds"),
    );

    let mut task = Task::builder("doomed", b"".to_vec())
        .max_tries(3)
        .build()
        .expect("task builds");
    client.enqueue_task(&mut task).await.expect("enqueue works");

    let invocations = Arc::new(AtomicU32::new(0));
    let mut router = TaskRouter::new();
    {
        let invocations = Arc::clone(&invocations);
        router
            .handle_func("doomed", move |_task| {
                let invocations = Arc::clone(&invocations);
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err::<Vec<u8>, _>("always fails".to_string().into())
                }
            })
            .expect("handler registers");
    }

    let (shutdown_tx, handle) = spawn_run(Arc::clone(&client), router);

    let finished = wait_for_state(&client, &task.id, TaskState::Terminated).await;
    assert_eq!(finished.tries, 3);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // Give any stray redelivery a chance to show up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let info = client.queue_info().await.expect("queue info");
    assert_eq!(info.depth + info.in_flight + info.scheduled, 0);

    shut_down(shutdown_tx, handle).await;
}

#[tokio::test]
async fn router_miss_becomes_queue_error_without_redelivery() {
    let client = Arc::new(
        Client::builder()
            .memory_storage()
            .work_queue(fast_queue("MISSES"))
            .build()
            .expect("client builds"),
    );
    let mut events = client.subscribe();

    let mut task = Task::new("unknown", b"".to_vec()).expect("task builds");
    client.enqueue_task(&mut task).await.expect("enqueue works");

    let mut router = TaskRouter::new();
    router
        .handle_func("registered.elsewhere", |_task| async { Ok(Vec::new()) })
        .expect("handler registers");

    let (shutdown_tx, handle) = spawn_run(Arc::clone(&client), router);

    let finished = wait_for_state(&client, &task.id, TaskState::QueueError).await;
    assert_eq!(finished.tries, 1);

    // The message was terminated, not left for redelivery.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let info = client.queue_info().await.expect("queue info");
    assert_eq!(info.depth + info.in_flight + info.scheduled, 0);

    let mut queue_error_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, LifecycleEvent::QueueError { ref task_id } if *task_id == task.id) {
            queue_error_events += 1;
        }
    }
    assert_eq!(queue_error_events, 1);

    shut_down(shutdown_tx, handle).await;
}

#[tokio::test]
async fn concurrency_stays_within_the_configured_bound() {
    let max_concurrency = 2;
    let client = Arc::new(
        Client::builder()
            .memory_storage()
            .work_queue(fast_queue("BOUNDED").with_max_concurrency(max_concurrency))
            .build()
            .expect("client builds"),
    );

    let mut ids = Vec::new();
    for _ in 0..6 {
        let mut task = Task::new("busy", b"".to_vec()).expect("task builds");
        client.enqueue_task(&mut task).await.expect("enqueue works");
        ids.push(task.id);
    }

    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut router = TaskRouter::new();
    {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        router
            .handle_func("busy", move |_task| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(Vec::new())
                }
            })
            .expect("handler registers");
    }

    let (shutdown_tx, handle) = spawn_run(Arc::clone(&client), router);

    for id in &ids {
        wait_for_state(&client, id, TaskState::Completed).await;
    }
    assert!(
        peak.load(Ordering::SeqCst) <= max_concurrency as u32,
        "peak concurrency {} exceeded the bound {max_concurrency}",
        peak.load(Ordering::SeqCst)
    );

    shut_down(shutdown_tx, handle).await;
}

#[tokio::test]
async fn panicking_handler_does_not_poison_the_pool() {
    let client = Arc::new(
        Client::builder()
            .memory_storage()
            .work_queue(fast_queue("PANICS"))
            .retry_policy(RetryPolicy::constant(Duration::from_millis(50)))
            .build()
            .expect("client builds"),
    );

    let mut bad = Task::builder("explosive", b"".to_vec())
        .max_tries(1)
        .build()
        .expect("task builds");
    client.enqueue_task(&mut bad).await.expect("enqueue works");

    let mut good = Task::new("calm", b"".to_vec()).expect("task builds");
    client.enqueue_task(&mut good).await.expect("enqueue works");

    let mut router = TaskRouter::new();
    router
        .handle_func("explosive", |_task| async { panic!("boom") })
        .expect("handler registers");
    router
        .handle_func("calm", |_task| async { Ok(b"fine".to_vec()) })
        .expect("handler registers");

    let (shutdown_tx, handle) = spawn_run(Arc::clone(&client), router);

    let bad_task = wait_for_state(&client, &bad.id, TaskState::Terminated).await;
    assert_eq!(bad_task.tries, 1);

    // The pool survived the panic and still serves other work.
    let good_task = wait_for_state(&client, &good.id, TaskState::Completed).await;
    assert_eq!(good_task.result.expect("result present").payload, b"fine");

    shut_down(shutdown_tx, handle).await;
}

#[tokio::test]
async fn pause_stops_consumption_and_resume_restarts_it() {
    let client = Arc::new(
        Client::builder()
            .memory_storage()
            .work_queue(fast_queue("PAUSED"))
            .build()
            .expect("client builds"),
    );

    client.pause();

    let mut task = Task::new("x", b"".to_vec()).expect("task builds");
    client.enqueue_task(&mut task).await.expect("enqueue works");

    let mut router = TaskRouter::new();
    router
        .handle_func("x", |_task| async { Ok(Vec::new()) })
        .expect("handler registers");

    let (shutdown_tx, handle) = spawn_run(Arc::clone(&client), router);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let paused_view = client.load_task_by_id(&task.id).await.expect("load works");
    assert_eq!(paused_view.state, TaskState::New, "paused client must not consume");

    client.resume();
    wait_for_state(&client, &task.id, TaskState::Completed).await;

    shut_down(shutdown_tx, handle).await;
}

#[tokio::test]
async fn lifecycle_events_cover_the_full_retry_arc() {
    let client = Arc::new(
        Client::builder()
            .memory_storage()
            .work_queue(fast_queue("EVENTS"))
            .retry_policy(RetryPolicy::constant(Duration::from_millis(50)))
            .build()
            .expect("client builds"),
    );
    let mut events = client.subscribe();

    let mut task = Task::new("wobbly", b"".to_vec()).expect("task builds");
    client.enqueue_task(&mut task).await.expect("enqueue works");

    let mut router = TaskRouter::new();
    router
        .handle_func("wobbly", |task| async move {
            if task.tries < 2 {
                return Err("first try fails".to_string().into());
            }
            Ok(b"ok".to_vec())
        })
        .expect("handler registers");

    let (shutdown_tx, handle) = spawn_run(Arc::clone(&client), router);
    wait_for_state(&client, &task.id, TaskState::Completed).await;
    shut_down(shutdown_tx, handle).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    assert_eq!(
        seen[0],
        LifecycleEvent::TaskEnqueued {
            task_id: task.id.clone(),
            queue: "EVENTS".to_string(),
        }
    );
    assert_eq!(
        seen[1],
        LifecycleEvent::TaskAttempt {
            task_id: task.id.clone(),
            tries: 1,
        }
    );
    assert!(matches!(
        seen[2],
        LifecycleEvent::TaskRetried { ref task_id, .. } if *task_id == task.id
    ));
    assert_eq!(
        seen[3],
        LifecycleEvent::TaskAttempt {
            task_id: task.id.clone(),
            tries: 2,
        }
    );
    assert_eq!(
        seen[4],
        LifecycleEvent::TaskCompleted {
            task_id: task.id.clone(),
            tries: 2,
        }
    );
}
