//! Run storage trait and types.

use async_trait::async_trait;
use thiserror::Error;

use crate::run::{Progress, Run, RunId, RunStatus, StopRequests, Transition};

/// Error type for run storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("run {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("run {id} is {actual}, expected {expected}")]
    Conflict {
        id: RunId,
        expected: RunStatus,
        actual: RunStatus,
    },

    #[error("run {id} is {status}, progress can only be recorded while running")]
    NotRunning { id: RunId, status: RunStatus },

    #[error("run {id} is {status} and cannot accept a {request} request")]
    RequestRejected {
        id: RunId,
        status: RunStatus,
        request: &'static str,
    },

    #[error("corrupt run record: {0}")]
    CorruptRecord(String),
}

/// Trait for run storage backends.
///
/// The engine is the only writer of status, cursor and tick count while a run
/// is running. Everybody else only sets request flags.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create an enqueued run for a task.
    async fn create(&self, task_name: &str) -> Result<Run, StoreError>;

    /// Load a run.
    async fn get(&self, id: RunId) -> Result<Run, StoreError>;

    /// Move a single enqueued or interrupted run to running.
    async fn claim(&self, id: RunId) -> Result<Run, StoreError>;

    /// Claim up to `limit` enqueued or interrupted runs, oldest first.
    async fn claim_runnable(&self, limit: usize) -> Result<Vec<Run>, StoreError>;

    /// Record the number of items the run is expected to process.
    async fn set_tick_total(&self, id: RunId, tick_total: u64) -> Result<(), StoreError>;

    /// Record progress of a running run. Safe to repeat.
    async fn persist_progress(&self, id: RunId, progress: Progress) -> Result<(), StoreError>;

    /// Atomically change status (and progress) if the run is still in
    /// `expected`.
    async fn transition(
        &self,
        id: RunId,
        expected: RunStatus,
        transition: Transition,
    ) -> Result<Run, StoreError>;

    /// Flag a pause request.
    async fn request_pause(&self, id: RunId) -> Result<Run, StoreError>;

    /// Flag a cancel request.
    async fn request_cancel(&self, id: RunId) -> Result<Run, StoreError>;

    /// Read the pending stop requests for a run.
    async fn requests(&self, id: RunId) -> Result<StopRequests, StoreError> {
        Ok(self.get(id).await?.requests())
    }

    /// Move runs left "running" by a crashed worker to interrupted, keeping
    /// their cursor. Call on startup. Returns the number of runs recovered.
    async fn recover_orphans(&self) -> Result<usize, StoreError> {
        Ok(0) // Default: no-op for stores that don't support recovery
    }
}
