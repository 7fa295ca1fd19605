//! Runner that owns the registered tasks and drives their runs.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::erased::{ErasedTask, TaskWrapper};
use super::registry::TaskRegistry;
use super::store::{RunStore, StoreError};
use crate::config::Config;
use crate::engine::{EngineError, SliceOutcome};
use crate::error_handler::panic_message;
use crate::run::{Run, RunFailure, RunId, RunStatus, Transition};
use crate::task::Task;

/// Error type for runner operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task registered twice: {0}")]
    DuplicateTask(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A runner that executes task runs from a store.
pub struct Runner<S: RunStore> {
    store: Arc<S>,
    registry: Arc<TaskRegistry>,
    config: Arc<Config>,
    poll_interval: Duration,
    max_concurrent: usize,
}

impl<S: RunStore + 'static> Runner<S> {
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Qualified names of the registered tasks.
    pub fn tasks(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Create an enqueued run of a registered task.
    pub async fn enqueue(&self, task: &str) -> Result<Run, RunnerError> {
        let (name, _) = self.registry.resolve(task)?;
        let run = self.store.create(&name).await?;
        info!(task = %name, run_id = %run.id, "enqueued task run");
        Ok(run)
    }

    /// Look up a run.
    pub async fn run(&self, id: RunId) -> Result<Run, RunnerError> {
        Ok(self.store.get(id).await?)
    }

    /// Claim an enqueued or interrupted run and drive one slice of it on the
    /// current task.
    pub async fn execute(
        &self,
        id: RunId,
        interrupt: &CancellationToken,
    ) -> Result<SliceOutcome, RunnerError> {
        let run = self.store.get(id).await?;
        let (_, task) = self.registry.resolve(&run.task_name)?;
        let run = self.store.claim(id).await?;
        Ok(task
            .run_slice(self.store.as_ref(), &self.config, run, interrupt)
            .await?)
    }

    /// Ask a run to pause. Runs that are not running pause immediately; a
    /// running run pauses at its next item boundary.
    pub async fn pause(&self, id: RunId) -> Result<Run, RunnerError> {
        let run = self.store.request_pause(id).await?;
        if run.status == RunStatus::Running {
            return Ok(run);
        }
        self.settle(run, Transition::to(RunStatus::Paused)).await
    }

    /// Resume a paused run and drive one slice of it.
    pub async fn resume(
        &self,
        id: RunId,
        interrupt: &CancellationToken,
    ) -> Result<SliceOutcome, RunnerError> {
        let run = self.store.get(id).await?;
        let (_, task) = self.registry.resolve(&run.task_name)?;
        let run = self
            .store
            .transition(id, RunStatus::Paused, Transition::to(RunStatus::Running))
            .await?;
        info!(task = %run.task_name, run_id = %id, "resuming paused run");
        Ok(task
            .run_slice(self.store.as_ref(), &self.config, run, interrupt)
            .await?)
    }

    /// Ask a run to cancel. Runs that are not running are cancelled
    /// immediately; a running run stops at its next item boundary.
    pub async fn cancel(&self, id: RunId) -> Result<Run, RunnerError> {
        let run = self.store.request_cancel(id).await?;
        if run.status == RunStatus::Running {
            return Ok(run);
        }
        self.settle(run, Transition::to(RunStatus::Cancelled).ended_at(Utc::now()))
            .await
    }

    /// Put an errored run back in the queue. It resumes from its cursor.
    pub async fn retry(&self, id: RunId) -> Result<Run, RunnerError> {
        let run = self
            .store
            .transition(id, RunStatus::Errored, Transition::to(RunStatus::Enqueued))
            .await?;
        info!(task = %run.task_name, run_id = %id, tick_count = run.tick_count, "retrying errored run");
        Ok(run)
    }

    /// Apply a transition to a run that is not running. If a worker claimed
    /// it in the meantime, the request flag is already set and the engine
    /// honors it.
    async fn settle(&self, run: Run, transition: Transition) -> Result<Run, RunnerError> {
        match self.store.transition(run.id, run.status, transition).await {
            Ok(run) => Ok(run),
            Err(StoreError::Conflict { .. }) => Ok(self.store.get(run.id).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim and drive runs until `shutdown` is cancelled.
    ///
    /// Runs left running by a previous process are interrupted first so they
    /// get picked up again. On shutdown, in-flight slices are interrupted at
    /// their next item boundary and awaited.
    pub async fn work(&self, shutdown: CancellationToken) -> Result<(), RunnerError> {
        let recovered = self.store.recover_orphans().await?;
        if recovered > 0 {
            warn!(recovered, "recovered orphaned runs");
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut in_flight = JoinSet::new();

        while !shutdown.is_cancelled() {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "task slice panicked");
                }
            }

            let available = semaphore.available_permits();
            if available > 0 {
                match self.store.claim_runnable(available).await {
                    Ok(runs) => {
                        for run in runs {
                            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                                break;
                            };
                            let store = self.store.clone();
                            let registry = self.registry.clone();
                            let config = self.config.clone();
                            let interrupt = shutdown.child_token();

                            in_flight.spawn(async move {
                                // Hold the permit for the duration of the slice
                                let _permit = permit;
                                let id = run.id;
                                let slice = Self::drive(
                                    store.as_ref(),
                                    &registry,
                                    &config,
                                    run,
                                    &interrupt,
                                );
                                if let Err(panic) = AssertUnwindSafe(slice).catch_unwind().await {
                                    let reason = panic_message(panic.as_ref());
                                    Self::record_panic(store.as_ref(), id, &reason).await;
                                }
                            });
                        }
                    }
                    Err(e) => error!(error = %e, "failed to claim runs"),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(in_flight = in_flight.len(), "shutting down, waiting for slices");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task slice panicked");
            }
        }
        Ok(())
    }

    /// Error a run whose slice panicked outside item processing.
    async fn record_panic(store: &S, id: RunId, reason: &str) {
        error!(run_id = %id, panic = %reason, "task slice panicked");
        let failure = RunFailure {
            kind: "panic".to_string(),
            message: reason.to_string(),
            backtrace: None,
        };
        let transition = Transition::to(RunStatus::Errored)
            .ended_at(Utc::now())
            .with_failure(failure);
        match store.transition(id, RunStatus::Running, transition).await {
            Ok(_) | Err(StoreError::Conflict { .. }) => {}
            Err(e) => error!(run_id = %id, error = %e, "failed to record run error"),
        }
    }

    async fn drive(
        store: &S,
        registry: &TaskRegistry,
        config: &Config,
        run: Run,
        interrupt: &CancellationToken,
    ) {
        let id = run.id;
        let task = match registry.resolve(&run.task_name) {
            Ok((_, task)) => task,
            Err(e) => {
                error!(task = %run.task_name, run_id = %id, "no task registered for run");
                let failure = RunFailure {
                    kind: "unknown_task".to_string(),
                    message: e.to_string(),
                    backtrace: None,
                };
                let transition = Transition::to(RunStatus::Errored)
                    .ended_at(Utc::now())
                    .with_failure(failure);
                if let Err(e) = store.transition(id, RunStatus::Running, transition).await {
                    error!(run_id = %id, error = %e, "failed to record run error");
                }
                return;
            }
        };

        match task.run_slice(store, config, run, interrupt).await {
            Ok(outcome) if outcome.reenqueue() => {
                debug!(run_id = %id, job = %outcome.job, "run interrupted, will be picked up again");
            }
            Ok(_) => {}
            // Already recorded on the run and reported to the error handler
            Err(EngineError::TaskFailed { .. }) => {}
            Err(e) => error!(run_id = %id, error = %e, "task slice failed"),
        }
    }
}

/// Builder for constructing a Runner.
pub struct RunnerBuilder<S: RunStore> {
    store: S,
    config: Config,
    tasks: Vec<Arc<dyn ErasedTask>>,
    poll_interval: Duration,
    max_concurrent: usize,
}

impl<S: RunStore + 'static> RunnerBuilder<S> {
    /// Create a new builder with the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: Config::default(),
            tasks: Vec::new(),
            poll_interval: Duration::from_secs(1),
            max_concurrent: 1,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Register a task with the runner.
    pub fn task<T: Task>(mut self, task: T) -> Self {
        self.tasks.push(Arc::new(TaskWrapper::new(task)));
        self
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum number of slices driven at once.
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    /// Build the runner. Fails if two tasks share a name.
    pub fn build(self) -> Result<Runner<S>, RunnerError> {
        let mut registry = TaskRegistry::new(&self.config.tasks_module);
        for task in self.tasks {
            registry.register(task)?;
        }

        Ok(Runner {
            store: Arc::new(self.store),
            registry: Arc::new(registry),
            config: Arc::new(self.config),
            poll_interval: self.poll_interval,
            max_concurrent: self.max_concurrent,
        })
    }
}
