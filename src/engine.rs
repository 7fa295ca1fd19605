//! The run engine: drives one slice of a run.
//!
//! A slice pulls items from the task's enumerator one at a time, processes
//! them, and stops at the first item boundary where the run has to yield:
//!
//! 1. a cancel request (highest precedence)
//! 2. a pause request
//! 3. the host interrupting the slice (shutdown, deploy)
//! 4. the slice's time or item budget running out
//!
//! Progress (tick count and cursor) is written at most once per ticker
//! window while running, and always together with the status whenever the
//! run stops running. Failures processing one item are reported to the error
//! handler and iteration carries on; failures of the enumeration itself, and
//! items that panic, error the run and are returned to the caller.

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::backtrace::BacktraceStatus;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::cursor::{self, Cursor};
use crate::error_handler::{panic_message, RunContext};
use crate::run::{Progress, Run, RunFailure, RunId, RunStatus, Transition};
use crate::runner::store::{RunStore, StoreError};
use crate::task::{ItemErrorPolicy, Task};
use crate::ticker::Ticker;

/// Where a fatal failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The enumerator failed to produce the next item.
    Enumeration,
    /// An item failed and the task asked for the run to error.
    Iteration,
    /// The stored cursor could not be decoded, or a position encoded.
    Cursor,
    /// Counting the collection failed.
    Count,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Enumeration => "enumeration",
            FailureKind::Iteration => "iteration",
            FailureKind::Cursor => "cursor",
            FailureKind::Count => "count",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a slice.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("run {id} is {status}, only running runs can be driven")]
    NotRunning { id: RunId, status: RunStatus },

    /// The run errored. Its record carries the failure details.
    #[error("run {run_id} errored during {kind}: {source:#}")]
    TaskFailed {
        run_id: RunId,
        kind: FailureKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// How a slice ended, for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub tick_count: u64,
    pub cursor: Option<Cursor>,
    /// Job the scheduler should re-enqueue the run with.
    pub job: String,
}

impl SliceOutcome {
    /// Interrupted runs continue in a new slice; everything else waits for
    /// an operator or is finished.
    pub fn reenqueue(&self) -> bool {
        self.status == RunStatus::Interrupted
    }
}

struct Slice<'a, T: Task> {
    task: &'a T,
    store: &'a dyn RunStore,
    config: &'a Config,
    interrupt: &'a CancellationToken,
    run: Run,
    tick_count: u64,
    cursor: Option<Cursor>,
    started: Instant,
    items: u64,
    ticker: Ticker,
}

impl<'a, T: Task> Slice<'a, T> {
    fn progress(&self) -> Progress {
        Progress {
            tick_count: self.tick_count,
            cursor: self.cursor.clone(),
            time_running: self.run.time_running + self.started.elapsed(),
        }
    }

    fn context(&self) -> RunContext {
        RunContext {
            task_name: self.run.task_name.clone(),
            run_id: self.run.id,
            started_at: self.run.started_at,
            ended_at: None,
            tick_count: self.tick_count,
        }
    }

    fn outcome(&self, run: Run) -> SliceOutcome {
        SliceOutcome {
            run_id: run.id,
            status: run.status,
            tick_count: run.tick_count,
            cursor: run.cursor,
            job: self.config.job.clone(),
        }
    }

    fn budget_spent(&self) -> bool {
        let out_of_time = self
            .config
            .max_slice_runtime
            .is_some_and(|budget| self.started.elapsed() >= budget);
        let out_of_items = self
            .config
            .max_slice_items
            .is_some_and(|budget| self.items >= budget);
        out_of_time || out_of_items
    }

    /// The status the run must move to at this boundary, if any.
    async fn stop_reason(&self) -> Result<Option<RunStatus>, EngineError> {
        let requests = self.store.requests(self.run.id).await?;
        let reason = if requests.cancel {
            Some(RunStatus::Cancelled)
        } else if requests.pause {
            Some(RunStatus::Paused)
        } else if self.interrupt.is_cancelled() || self.budget_spent() {
            Some(RunStatus::Interrupted)
        } else {
            None
        };
        Ok(reason)
    }

    /// The item as handed to the error handler.
    fn item_json<I: Serialize>(&self, item: &I) -> serde_json::Value {
        serde_json::to_value(item).unwrap_or_else(|e| {
            warn!(
                run_id = %self.run.id,
                error = %e,
                "errored item could not be serialized for the error handler"
            );
            serde_json::Value::Null
        })
    }

    fn tick(&mut self, cursor_after: Cursor) {
        self.tick_count += 1;
        self.items += 1;
        self.cursor = Some(cursor_after);
    }

    async fn maybe_persist(&mut self) -> Result<(), EngineError> {
        if self.ticker.should_persist(Instant::now(), false) {
            self.store
                .persist_progress(self.run.id, self.progress())
                .await?;
            debug!(
                run_id = %self.run.id,
                tick_count = self.tick_count,
                "persisted progress"
            );
        }
        Ok(())
    }

    async fn suspend(mut self, to: RunStatus) -> Result<SliceOutcome, EngineError> {
        self.ticker.should_persist(Instant::now(), true);
        let mut transition = Transition::to(to).with_progress(self.progress());
        if to == RunStatus::Cancelled {
            transition = transition.ended_at(Utc::now());
        }
        let run = self
            .store
            .transition(self.run.id, RunStatus::Running, transition)
            .await?;

        info!(
            task = %run.task_name,
            run_id = %run.id,
            status = %run.status,
            tick_count = run.tick_count,
            items = self.items,
            "task slice suspended"
        );
        Ok(self.outcome(run))
    }

    async fn succeed(mut self) -> Result<SliceOutcome, EngineError> {
        self.ticker.should_persist(Instant::now(), true);
        let transition = Transition::to(RunStatus::Succeeded)
            .with_progress(self.progress())
            .ended_at(Utc::now());
        let run = self
            .store
            .transition(self.run.id, RunStatus::Running, transition)
            .await?;

        info!(
            task = %run.task_name,
            run_id = %run.id,
            tick_count = run.tick_count,
            "task run succeeded"
        );
        Ok(self.outcome(run))
    }

    /// Record a fatal failure, report it, and build the error to return.
    async fn fail(
        mut self,
        kind: FailureKind,
        source: anyhow::Error,
        item: Option<serde_json::Value>,
    ) -> EngineError {
        self.ticker.should_persist(Instant::now(), true);
        let ended_at = Utc::now();
        let failure = RunFailure {
            kind: kind.as_str().to_string(),
            message: format!("{source:#}"),
            backtrace: self.backtrace(&source),
        };
        let transition = Transition::to(RunStatus::Errored)
            .with_progress(self.progress())
            .ended_at(ended_at)
            .with_failure(failure);

        error!(
            task = %self.run.task_name,
            run_id = %self.run.id,
            kind = kind.as_str(),
            tick_count = self.tick_count,
            error = %source,
            "task run errored"
        );

        if let Err(e) = self
            .store
            .transition(self.run.id, RunStatus::Running, transition)
            .await
        {
            error!(run_id = %self.run.id, error = %e, "failed to record run error");
        }

        let mut context = self.context();
        context.ended_at = Some(ended_at);
        self.config
            .error_handler
            .report(&source, &context, item.as_ref());

        EngineError::TaskFailed {
            run_id: self.run.id,
            kind,
            source,
        }
    }

    fn backtrace(&self, error: &anyhow::Error) -> Option<String> {
        let backtrace = error.backtrace();
        if backtrace.status() != BacktraceStatus::Captured {
            return None;
        }
        let raw = backtrace.to_string();
        Some(match &self.config.backtrace_cleaner {
            Some(cleaner) => cleaner.clean(&raw),
            None => raw,
        })
    }
}

/// Drive a running run until it finishes or has to yield.
///
/// The caller must have claimed the run (status `running`) and guarantee no
/// other slice of it executes concurrently.
pub async fn run_slice<T: Task>(
    task: &T,
    store: &dyn RunStore,
    config: &Config,
    run: Run,
    interrupt: &CancellationToken,
) -> Result<SliceOutcome, EngineError> {
    if run.status != RunStatus::Running {
        return Err(EngineError::NotRunning {
            id: run.id,
            status: run.status,
        });
    }

    let interval = task
        .minimum_tick_interval()
        .unwrap_or(config.ticker_delay);
    let started = Instant::now();

    info!(
        task = %run.task_name,
        run_id = %run.id,
        tick_count = run.tick_count,
        resuming = run.cursor.is_some(),
        "starting task slice"
    );

    let mut slice = Slice {
        task,
        store,
        config,
        interrupt,
        tick_count: run.tick_count,
        cursor: run.cursor.clone(),
        run,
        started,
        items: 0,
        ticker: Ticker::new(interval, started),
    };

    // Requests made before the slice started are honored before any work.
    if let Some(to) = slice.stop_reason().await? {
        return slice.suspend(to).await;
    }

    if slice.run.tick_total.is_none() {
        match task.count().await {
            Ok(Some(total)) => store.set_tick_total(slice.run.id, total).await?,
            Ok(None) => {}
            Err(e) => return Err(slice.fail(FailureKind::Count, e, None).await),
        }
    }

    let position = match cursor::decode_opt::<T::Position>(slice.cursor.as_ref()) {
        Ok(position) => position,
        Err(e) => return Err(slice.fail(FailureKind::Cursor, e.into(), None).await),
    };

    let mut items = task.enumerate(position);
    while let Some(next) = items.next().await {
        let (item, position) = match next {
            Ok(pair) => pair,
            Err(e) => return Err(slice.fail(FailureKind::Enumeration, e, None).await),
        };
        let cursor_after = match Cursor::encode(&position) {
            Ok(cursor) => cursor,
            Err(e) => return Err(slice.fail(FailureKind::Cursor, e.into(), None).await),
        };

        let processed = match AssertUnwindSafe(slice.task.process(&item)).catch_unwind().await {
            Ok(processed) => processed,
            Err(panic) => {
                // A panicking item leaves the cursor before it, like MarkErrored.
                let error = anyhow::anyhow!(
                    "item processing panicked: {}",
                    panic_message(panic.as_ref())
                );
                let errored_item = slice.item_json(&item);
                return Err(slice
                    .fail(FailureKind::Iteration, error, Some(errored_item))
                    .await);
            }
        };

        if let Err(error) = processed {
            let errored_item = slice.item_json(&item);
            if slice.task.on_item_error(&error, &item) == ItemErrorPolicy::MarkErrored {
                return Err(slice
                    .fail(FailureKind::Iteration, error, Some(errored_item))
                    .await);
            }
            warn!(
                task = %slice.run.task_name,
                run_id = %slice.run.id,
                error = %error,
                "item failed, continuing"
            );
            config
                .error_handler
                .report(&error, &slice.context(), Some(&errored_item));
        }

        slice.tick(cursor_after);

        if let Some(to) = slice.stop_reason().await? {
            return slice.suspend(to).await;
        }
        slice.maybe_persist().await?;
    }

    slice.succeed().await
}
