//! Run storage and the runner that drives runs.

pub mod erased;
pub mod memory_store;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod runner;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;
pub mod store;

pub use erased::{ErasedTask, TaskWrapper};
pub use memory_store::MemoryRunStore;
pub use registry::TaskRegistry;
pub use runner::{Runner, RunnerBuilder, RunnerError};
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteRunStore;
pub use store::{RunStore, StoreError};
