//! Process-wide callback for task failures.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

use crate::run::RunId;

/// What a handler learns about the run an error happened in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunContext {
    pub task_name: String,
    pub run_id: RunId,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tick_count: u64,
}

/// Current handler shape: error, run context, and the failing item when the
/// failure came from processing one.
pub type HandlerFn =
    dyn Fn(&anyhow::Error, &RunContext, Option<&serde_json::Value>) + Send + Sync;

/// Older handler shape that only receives the error.
pub type LegacyHandlerFn = dyn Fn(&anyhow::Error) + Send + Sync;

/// A handler as supplied by the host application.
#[derive(Clone)]
pub enum ErrorHandlerFn {
    Legacy(Arc<LegacyHandlerFn>),
    Current(Arc<HandlerFn>),
}

/// Error handler in its three-argument form.
///
/// Handlers run after a failure has been recorded and can never affect the
/// run: a panicking handler is caught and logged.
#[derive(Clone)]
pub struct ErrorHandler {
    callback: Arc<HandlerFn>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler").finish_non_exhaustive()
    }
}

impl ErrorHandler {
    /// Handler that ignores every error.
    pub fn noop() -> Self {
        Self {
            callback: Arc::new(
                |_: &anyhow::Error, _: &RunContext, _: Option<&serde_json::Value>| {},
            ),
        }
    }

    /// Handler with the current three-argument shape.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&anyhow::Error, &RunContext, Option<&serde_json::Value>) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(f),
        }
    }

    /// Handler that only takes the error. Prefer [`ErrorHandler::new`].
    pub fn legacy<F>(f: F) -> Self
    where
        F: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        Self::from_fn(ErrorHandlerFn::Legacy(Arc::new(f)))
    }

    /// Normalize a supplied handler, wrapping legacy handlers.
    ///
    /// Called once while building configuration, so the deprecation warning
    /// is emitted at startup and never per error.
    pub fn from_fn(handler: ErrorHandlerFn) -> Self {
        match handler {
            ErrorHandlerFn::Current(callback) => Self { callback },
            ErrorHandlerFn::Legacy(legacy) => {
                warn!(
                    "error handler takes only the error; handlers should accept \
                     (error, run context, errored item)"
                );
                Self {
                    callback: Arc::new(
                        move |error: &anyhow::Error,
                              _: &RunContext,
                              _: Option<&serde_json::Value>| legacy(error),
                    ),
                }
            }
        }
    }

    /// Invoke the handler, containing any panic.
    pub fn report(&self, error: &anyhow::Error, context: &RunContext, item: Option<&serde_json::Value>) {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.callback)(error, context, item)));
        if let Err(panic) = outcome {
            let reason = panic_message(panic.as_ref());
            error!(
                task = %context.task_name,
                run_id = %context.run_id,
                handler_panic = %reason,
                error = %error,
                "error handler panicked"
            );
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
