//! Integration tests for the runner.

use async_trait::async_trait;
use maintflow::enumerator;
use maintflow::{
    Config, ItemStream, MemoryRunStore, RunStatus, RunStore, RunnerBuilder, RunnerError,
    StoreError, Task,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Normalizes user emails, recording every id it touches.
struct NormalizeEmails {
    users: BTreeMap<u32, String>,
    seen: Arc<Mutex<Vec<u32>>>,
    delay: Duration,
}

impl NormalizeEmails {
    fn new(n: u32) -> Self {
        Self {
            users: (1..=n).map(|id| (id, format!("User{id}@Example.com"))).collect(),
            seen: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl Task for NormalizeEmails {
    type Item = String;
    type Position = u32;

    fn name(&self) -> &'static str {
        "NormalizeEmails"
    }

    fn enumerate(&self, cursor: Option<u32>) -> ItemStream<'_, String, u32> {
        enumerator::records(&self.users, cursor, 2)
    }

    async fn process(&self, email: &String) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let id = email
            .trim_start_matches("User")
            .split('@')
            .next()
            .unwrap_or_default()
            .parse()?;
        self.seen.lock().await.push(id);
        Ok(())
    }
}

#[tokio::test]
async fn test_enqueue_qualifies_names_and_rejects_unknown_tasks() {
    let runner = RunnerBuilder::new(MemoryRunStore::new())
        .task(NormalizeEmails::new(3))
        .build()
        .unwrap();

    assert_eq!(runner.tasks(), vec!["Maintenance::NormalizeEmails".to_string()]);

    let run = runner.enqueue("NormalizeEmails").await.unwrap();
    assert_eq!(run.task_name, "Maintenance::NormalizeEmails");
    assert_eq!(run.status, RunStatus::Enqueued);

    let qualified = runner.enqueue("Maintenance::NormalizeEmails").await.unwrap();
    assert_eq!(qualified.task_name, run.task_name);

    let err = runner.enqueue("DropTables").await.unwrap_err();
    assert!(matches!(err, RunnerError::UnknownTask(name) if name == "DropTables"));
}

#[tokio::test]
async fn test_duplicate_task_names_fail_build() {
    let result = RunnerBuilder::new(MemoryRunStore::new())
        .task(NormalizeEmails::new(1))
        .task(NormalizeEmails::new(2))
        .build();

    assert!(matches!(result, Err(RunnerError::DuplicateTask(_))));
}

#[tokio::test]
async fn test_execute_runs_to_completion() {
    let task = NormalizeEmails::new(5);
    let seen = task.seen.clone();
    let runner = RunnerBuilder::new(MemoryRunStore::new())
        .task(task)
        .build()
        .unwrap();

    let run = runner.enqueue("NormalizeEmails").await.unwrap();
    let outcome = runner.execute(run.id, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.tick_count, 5);
    assert_eq!(*seen.lock().await, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_pause_and_cancel_settle_runs_that_are_not_running() {
    let runner = RunnerBuilder::new(MemoryRunStore::new())
        .task(NormalizeEmails::new(3))
        .build()
        .unwrap();

    let run = runner.enqueue("NormalizeEmails").await.unwrap();
    let paused = runner.pause(run.id).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert!(!paused.pause_requested);

    // A paused run is not picked up by workers
    assert!(runner.store().claim_runnable(10).await.unwrap().is_empty());

    let cancelled = runner.cancel(run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(cancelled.ended_at.is_some());

    // Terminal runs reject further requests
    let err = runner.cancel(run.id).await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::Store(StoreError::RequestRejected { .. })
    ));
}

#[tokio::test]
async fn test_resume_continues_paused_run() {
    let task = NormalizeEmails::new(4);
    let seen = task.seen.clone();
    let config = Config::builder().max_slice_items(2).build().unwrap();
    let runner = RunnerBuilder::new(MemoryRunStore::new())
        .config(config)
        .task(task)
        .build()
        .unwrap();

    let run = runner.enqueue("NormalizeEmails").await.unwrap();
    let outcome = runner.execute(run.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Interrupted);
    assert_eq!(outcome.tick_count, 2);

    let paused = runner.pause(run.id).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.tick_count, 2);

    let outcome = runner.resume(run.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Interrupted);
    assert_eq!(outcome.tick_count, 4);

    let outcome = runner.execute(run.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(*seen.lock().await, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_retry_only_accepts_errored_runs() {
    let runner = RunnerBuilder::new(MemoryRunStore::new())
        .task(NormalizeEmails::new(1))
        .build()
        .unwrap();

    let run = runner.enqueue("NormalizeEmails").await.unwrap();
    let err = runner.retry(run.id).await.unwrap_err();
    assert!(matches!(err, RunnerError::Store(StoreError::Conflict { .. })));
}

#[tokio::test]
async fn test_work_drains_queue_and_stops_on_shutdown() {
    let first = NormalizeEmails::new(6);
    let seen = first.seen.clone();
    let config = Config::builder().max_slice_items(4).build().unwrap();
    let runner = Arc::new(
        RunnerBuilder::new(MemoryRunStore::new())
            .config(config)
            .task(first)
            .poll_interval(Duration::from_millis(10))
            .max_concurrent(2)
            .build()
            .unwrap(),
    );

    let a = runner.enqueue("NormalizeEmails").await.unwrap();
    let b = runner.enqueue("NormalizeEmails").await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = {
        let runner = runner.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.work(shutdown).await })
    };

    let mut done = false;
    for _ in 0..200 {
        let a = runner.run(a.id).await.unwrap();
        let b = runner.run(b.id).await.unwrap();
        if a.status == RunStatus::Succeeded && b.status == RunStatus::Succeeded {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    assert!(done, "runs did not finish");
    // Each run processed every user exactly once, across two slices
    let mut seen = seen.lock().await.clone();
    seen.sort();
    assert_eq!(seen, vec![1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6]);
}

#[tokio::test]
async fn test_shutdown_interrupts_in_flight_slices() {
    let mut task = NormalizeEmails::new(50);
    task.delay = Duration::from_millis(5);
    let runner = Arc::new(
        RunnerBuilder::new(MemoryRunStore::new())
            .task(task)
            .poll_interval(Duration::from_millis(5))
            .build()
            .unwrap(),
    );
    let run = runner.enqueue("NormalizeEmails").await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = {
        let runner = runner.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.work(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(40)).await;
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    let run = runner.run(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Interrupted);
    assert!(run.tick_count > 0 && run.tick_count < 50);
    assert!(run.cursor.is_some());
}

#[tokio::test]
async fn test_work_recovers_orphaned_runs() {
    let task = NormalizeEmails::new(2);
    let seen = task.seen.clone();
    let runner = Arc::new(
        RunnerBuilder::new(MemoryRunStore::new())
            .task(task)
            .poll_interval(Duration::from_millis(10))
            .build()
            .unwrap(),
    );

    // Left running by a worker that died
    let run = runner.enqueue("NormalizeEmails").await.unwrap();
    runner.store().claim(run.id).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = {
        let runner = runner.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.work(shutdown).await })
    };

    for _ in 0..100 {
        if runner.run(run.id).await.unwrap().status == RunStatus::Succeeded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    assert_eq!(runner.run(run.id).await.unwrap().status, RunStatus::Succeeded);
    assert_eq!(*seen.lock().await, vec![1, 2]);
}

/// Panics on one id while processing, or while building its enumerator.
struct Explosive {
    panic_on: Option<u32>,
    panic_in_enumerate: bool,
}

#[async_trait]
impl Task for Explosive {
    type Item = u32;
    type Position = usize;

    fn name(&self) -> &'static str {
        "Explosive"
    }

    fn enumerate(&self, cursor: Option<usize>) -> ItemStream<'_, u32, usize> {
        if self.panic_in_enumerate {
            panic!("enumerator blew up");
        }
        enumerator::from_vec(vec![1, 2, 3], cursor)
    }

    async fn process(&self, id: &u32) -> anyhow::Result<()> {
        if self.panic_on == Some(*id) {
            panic!("user {id} has no email");
        }
        Ok(())
    }
}

/// Work the queue until `id` leaves `running`/`enqueued`, then shut down.
async fn work_until_settled(
    runner: Arc<maintflow::Runner<MemoryRunStore>>,
    id: maintflow::RunId,
) -> maintflow::Run {
    let shutdown = CancellationToken::new();
    let worker = {
        let runner = runner.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.work(shutdown).await })
    };

    for _ in 0..100 {
        let status = runner.run(id).await.unwrap().status;
        if status != RunStatus::Enqueued && status != RunStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    worker.await.unwrap().unwrap();
    runner.run(id).await.unwrap()
}

#[tokio::test]
async fn test_panicking_item_errors_run() {
    let reported = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = reported.clone();
    let config = Config::builder()
        .error_handler(maintflow::ErrorHandler::new(move |error, _ctx, item| {
            sink.lock().unwrap().push((error.to_string(), item.cloned()));
        }))
        .build()
        .unwrap();
    let runner = Arc::new(
        RunnerBuilder::new(MemoryRunStore::new())
            .config(config)
            .task(Explosive {
                panic_on: Some(2),
                panic_in_enumerate: false,
            })
            .poll_interval(Duration::from_millis(10))
            .build()
            .unwrap(),
    );
    let run = runner.enqueue("Explosive").await.unwrap();

    let run = work_until_settled(runner.clone(), run.id).await;

    assert_eq!(run.status, RunStatus::Errored);
    assert_eq!(run.error_kind.as_deref(), Some("iteration"));
    assert!(run
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("user 2 has no email")));
    assert_eq!(run.tick_count, 1);
    assert!(run.ended_at.is_some());

    let reported = reported.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert!(reported[0].0.contains("panicked"));
    assert_eq!(reported[0].1, Some(serde_json::json!(2)));
}

#[tokio::test]
async fn test_panicking_slice_is_recorded_by_worker() {
    let runner = Arc::new(
        RunnerBuilder::new(MemoryRunStore::new())
            .task(Explosive {
                panic_on: None,
                panic_in_enumerate: true,
            })
            .poll_interval(Duration::from_millis(10))
            .build()
            .unwrap(),
    );
    let run = runner.enqueue("Explosive").await.unwrap();

    let run = work_until_settled(runner.clone(), run.id).await;

    assert_eq!(run.status, RunStatus::Errored);
    assert_eq!(run.error_kind.as_deref(), Some("panic"));
    assert!(run
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("enumerator blew up")));
    assert!(run.ended_at.is_some());

    // The errored run can be retried like any other
    assert_eq!(
        runner.retry(run.id).await.unwrap().status,
        RunStatus::Enqueued
    );
}
