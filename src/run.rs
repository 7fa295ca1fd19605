//! Run records and the run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::cursor::Cursor;
use crate::runner::store::StoreError;

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a run.
///
/// ```text
/// enqueued ──> running ──> succeeded
///    │  ▲        │ ├──> errored ──(retry)──> enqueued
///    │  │        │ ├──> cancelled
///    │  │        │ ├──> paused ──(resume)──> running
///    │  │        │ └──> interrupted ──(re-enqueue)──> running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Enqueued,
    Running,
    Paused,
    Interrupted,
    Succeeded,
    Errored,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 7] = [
        RunStatus::Enqueued,
        RunStatus::Running,
        RunStatus::Paused,
        RunStatus::Interrupted,
        RunStatus::Succeeded,
        RunStatus::Errored,
        RunStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Enqueued => "enqueued",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Errored => "errored",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (*self, next),
            (Enqueued, Running | Paused | Cancelled)
                | (Running, Paused | Interrupted | Succeeded | Errored | Cancelled)
                | (Paused, Running | Cancelled)
                | (Interrupted, Running | Paused | Cancelled)
                | (Errored, Enqueued)
        )
    }

    /// Terminal runs are immutable. Errored runs only leave this state
    /// through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Errored | RunStatus::Cancelled
        )
    }

    /// Statuses a worker may pick up and move to running.
    pub fn is_claimable(&self) -> bool {
        matches!(self, RunStatus::Enqueued | RunStatus::Interrupted)
    }

    pub fn accepts_pause_request(&self) -> bool {
        matches!(
            self,
            RunStatus::Enqueued | RunStatus::Running | RunStatus::Interrupted
        )
    }

    pub fn accepts_cancel_request(&self) -> bool {
        matches!(
            self,
            RunStatus::Enqueued | RunStatus::Running | RunStatus::Paused | RunStatus::Interrupted
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown run status: {s}"))
    }
}

/// Error details captured when a run errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: String,
    pub message: String,
    pub backtrace: Option<String>,
}

/// Progress of a running run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub tick_count: u64,
    pub cursor: Option<Cursor>,
    pub time_running: Duration,
}

/// A status change, applied together with the progress it carries.
#[derive(Debug, Clone)]
pub struct Transition {
    pub to: RunStatus,
    /// `None` keeps the stored tick count and cursor.
    pub progress: Option<Progress>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<RunFailure>,
}

impl Transition {
    /// Change only the status.
    pub fn to(status: RunStatus) -> Self {
        Self {
            to: status,
            progress: None,
            ended_at: None,
            failure: None,
        }
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.ended_at = Some(at);
        self
    }

    pub fn with_failure(mut self, failure: RunFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Out-of-band stop requests for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopRequests {
    pub pause: bool,
    pub cancel: bool,
}

/// One tracked execution of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task_name: String,
    pub status: RunStatus,
    pub cursor: Option<Cursor>,
    pub tick_count: u64,
    pub tick_total: Option<u64>,
    pub time_running: Duration,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub backtrace: Option<String>,
    pub pause_requested: bool,
    pub cancel_requested: bool,
}

impl Run {
    /// A freshly enqueued run.
    pub fn new(id: RunId, task_name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            task_name: task_name.into(),
            status: RunStatus::Enqueued,
            cursor: None,
            tick_count: 0,
            tick_total: None,
            time_running: Duration::ZERO,
            created_at,
            started_at: None,
            ended_at: None,
            error_kind: None,
            error_message: None,
            backtrace: None,
            pause_requested: false,
            cancel_requested: false,
        }
    }

    pub fn requests(&self) -> StopRequests {
        StopRequests {
            pause: self.pause_requested,
            cancel: self.cancel_requested,
        }
    }

    /// Apply a status change if the run is still in `expected` and the state
    /// machine allows it.
    pub fn apply(
        &mut self,
        expected: RunStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.status != expected {
            return Err(StoreError::Conflict {
                id: self.id,
                expected,
                actual: self.status,
            });
        }
        if !self.status.can_transition_to(transition.to) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: transition.to,
            });
        }

        if let Some(progress) = transition.progress {
            self.merge_progress(progress);
        }

        match transition.to {
            RunStatus::Running => {
                self.started_at.get_or_insert(now);
                // Resuming satisfies the pause; a claim must leave it for
                // the engine to observe.
                if self.status == RunStatus::Paused {
                    self.pause_requested = false;
                }
            }
            RunStatus::Paused => {
                self.pause_requested = false;
            }
            RunStatus::Succeeded => {
                self.cursor = None;
            }
            RunStatus::Cancelled => {
                self.cursor = None;
                self.pause_requested = false;
                self.cancel_requested = false;
            }
            RunStatus::Errored => {
                if let Some(failure) = transition.failure {
                    self.error_kind = Some(failure.kind);
                    self.error_message = Some(failure.message);
                    self.backtrace = failure.backtrace;
                }
            }
            RunStatus::Enqueued => {
                self.ended_at = None;
                self.error_kind = None;
                self.error_message = None;
                self.backtrace = None;
            }
            RunStatus::Interrupted => {}
        }

        if let Some(ended_at) = transition.ended_at {
            self.ended_at = Some(ended_at);
        }
        self.status = transition.to;
        Ok(())
    }

    /// Record progress of a running run.
    pub fn record_progress(&mut self, progress: Progress) -> Result<(), StoreError> {
        if self.status != RunStatus::Running {
            return Err(StoreError::NotRunning {
                id: self.id,
                status: self.status,
            });
        }
        self.merge_progress(progress);
        Ok(())
    }

    /// Flag a pause request for the orchestrator to observe.
    pub fn request_pause(&mut self) -> Result<(), StoreError> {
        if !self.status.accepts_pause_request() {
            return Err(StoreError::RequestRejected {
                id: self.id,
                status: self.status,
                request: "pause",
            });
        }
        self.pause_requested = true;
        Ok(())
    }

    /// Flag a cancel request for the orchestrator to observe.
    pub fn request_cancel(&mut self) -> Result<(), StoreError> {
        if !self.status.accepts_cancel_request() {
            return Err(StoreError::RequestRejected {
                id: self.id,
                status: self.status,
                request: "cancel",
            });
        }
        self.cancel_requested = true;
        Ok(())
    }

    fn merge_progress(&mut self, progress: Progress) {
        // Tick count never goes backwards, even on a replayed write.
        self.tick_count = self.tick_count.max(progress.tick_count);
        self.cursor = progress.cursor;
        self.time_running = self.time_running.max(progress.time_running);
    }
}
