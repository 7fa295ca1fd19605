//! In-process implementation of RunStore.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::store::{RunStore, StoreError};
use crate::run::{Progress, Run, RunId, RunStatus, StopRequests, Transition};

/// Run store kept in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    runs: BTreeMap<RunId, Run>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::StorageError("run store lock poisoned".to_string()))
    }
}

impl Inner {
    fn run_mut(&mut self, id: RunId) -> Result<&mut Run, StoreError> {
        self.runs.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, task_name: &str) -> Result<Run, StoreError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let run = Run::new(RunId(inner.next_id), task_name, Utc::now());
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get(&self, id: RunId) -> Result<Run, StoreError> {
        let inner = self.lock()?;
        inner.runs.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn claim(&self, id: RunId) -> Result<Run, StoreError> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(id)?;
        if !run.status.is_claimable() {
            return Err(StoreError::InvalidTransition {
                id,
                from: run.status,
                to: RunStatus::Running,
            });
        }
        let status = run.status;
        run.apply(status, Transition::to(RunStatus::Running), Utc::now())?;
        Ok(run.clone())
    }

    async fn claim_runnable(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let mut claimed = Vec::new();
        // BTreeMap order is id order, which is creation order.
        for run in inner.runs.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if run.status.is_claimable() {
                let status = run.status;
                run.apply(status, Transition::to(RunStatus::Running), now)?;
                claimed.push(run.clone());
            }
        }
        Ok(claimed)
    }

    async fn set_tick_total(&self, id: RunId, tick_total: u64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.run_mut(id)?.tick_total = Some(tick_total);
        Ok(())
    }

    async fn persist_progress(&self, id: RunId, progress: Progress) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.run_mut(id)?.record_progress(progress)
    }

    async fn transition(
        &self,
        id: RunId,
        expected: RunStatus,
        transition: Transition,
    ) -> Result<Run, StoreError> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(id)?;
        // Apply to a copy so a rejected transition leaves the record untouched.
        let mut updated = run.clone();
        updated.apply(expected, transition, Utc::now())?;
        *run = updated.clone();
        Ok(updated)
    }

    async fn request_pause(&self, id: RunId) -> Result<Run, StoreError> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(id)?;
        run.request_pause()?;
        Ok(run.clone())
    }

    async fn request_cancel(&self, id: RunId) -> Result<Run, StoreError> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(id)?;
        run.request_cancel()?;
        Ok(run.clone())
    }

    async fn requests(&self, id: RunId) -> Result<StopRequests, StoreError> {
        let inner = self.lock()?;
        inner
            .runs
            .get(&id)
            .map(Run::requests)
            .ok_or(StoreError::NotFound(id))
    }

    async fn recover_orphans(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let mut recovered = 0;
        for run in inner.runs.values_mut() {
            if run.status == RunStatus::Running {
                run.apply(RunStatus::Running, Transition::to(RunStatus::Interrupted), now)?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
