//! Type-erased task wrapper for runtime dispatch.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::store::RunStore;
use crate::config::Config;
use crate::engine::{self, EngineError, SliceOutcome};
use crate::run::Run;
use crate::task::Task;

/// Type-erased task that can be stored in a registry.
#[async_trait]
pub trait ErasedTask: Send + Sync {
    /// Unqualified task name.
    fn name(&self) -> &'static str;

    /// Drive one slice of `run`, which must already be running.
    async fn run_slice(
        &self,
        store: &dyn RunStore,
        config: &Config,
        run: Run,
        interrupt: &CancellationToken,
    ) -> Result<SliceOutcome, EngineError>;
}

/// Wrapper that implements ErasedTask for a concrete Task.
pub struct TaskWrapper<T: Task> {
    task: T,
}

impl<T: Task> TaskWrapper<T> {
    pub fn new(task: T) -> Self {
        Self { task }
    }
}

#[async_trait]
impl<T: Task> ErasedTask for TaskWrapper<T> {
    fn name(&self) -> &'static str {
        self.task.name()
    }

    async fn run_slice(
        &self,
        store: &dyn RunStore,
        config: &Config,
        run: Run,
        interrupt: &CancellationToken,
    ) -> Result<SliceOutcome, EngineError> {
        engine::run_slice(&self.task, store, config, run, interrupt).await
    }
}
