//! # Maintflow
//!
//! Resumable background maintenance tasks.
//!
//! A task walks a collection item by item. Each run of a task records how
//! far it got as a cursor, so it can be paused, cancelled, interrupted by a
//! deploy, or retried after an error, and picks up exactly where it left off.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use maintflow::{enumerator, ItemStream, MemoryRunStore, RunnerBuilder, Task};
//!
//! struct BackfillSlugs { posts: BTreeMap<i64, Post> }
//!
//! #[async_trait]
//! impl Task for BackfillSlugs {
//!     type Item = Post;
//!     type Position = i64;
//!
//!     fn name(&self) -> &'static str { "BackfillSlugs" }
//!
//!     fn enumerate(&self, cursor: Option<i64>) -> ItemStream<'_, Post, i64> {
//!         enumerator::records(&self.posts, cursor, 100)
//!     }
//!
//!     async fn process(&self, post: &Post) -> anyhow::Result<()> {
//!         save_slug(post).await
//!     }
//! }
//!
//! let runner = RunnerBuilder::new(MemoryRunStore::new())
//!     .task(BackfillSlugs { posts })
//!     .max_concurrent(4)
//!     .build()?;
//!
//! let run = runner.enqueue("BackfillSlugs").await?;
//! runner.work(shutdown_token).await?;
//! ```
//!
//! ## Run lifecycle
//!
//! ```text
//! enqueued -> running -> succeeded
//!                     -> paused      -> running (resume)
//!                     -> interrupted -> running (picked up again)
//!                     -> cancelled
//!                     -> errored     -> enqueued (retry)
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - SQLite-backed run storage (default)

pub mod config;
pub mod cursor;
pub mod engine;
pub mod enumerator;
pub mod error_handler;
pub mod run;
pub mod runner;
pub mod task;
pub mod ticker;

pub use config::{BacktraceCleaner, Config, ConfigBuilder, ConfigError, Settings};
pub use cursor::{Cursor, CursorError};
pub use engine::{run_slice, EngineError, FailureKind, SliceOutcome};
pub use enumerator::{ItemStream, KeyedSource};
pub use error_handler::{ErrorHandler, ErrorHandlerFn, RunContext};
pub use run::{Progress, Run, RunFailure, RunId, RunStatus, StopRequests, Transition};
pub use runner::{
    ErasedTask, MemoryRunStore, RunStore, Runner, RunnerBuilder, RunnerError, StoreError,
    TaskRegistry,
};
pub use task::{ItemErrorPolicy, Task};
pub use ticker::Ticker;

#[cfg(feature = "sqlite")]
pub use runner::SqliteRunStore;
