//! Task trait: the unit of work a run iterates.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::enumerator::ItemStream;

/// What the engine should do after an item failed to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemErrorPolicy {
    /// Report the failure and move on to the next item.
    #[default]
    Continue,
    /// Stop and mark the run errored. The cursor stays before the failing
    /// item, so a retry processes it again.
    MarkErrored,
}

/// A maintenance task: a collection to walk and what to do with each item.
///
/// ```rust,ignore
/// struct BackfillSlugs { posts: BTreeMap<i64, Post> }
///
/// #[async_trait]
/// impl Task for BackfillSlugs {
///     type Item = Post;
///     type Position = i64;
///
///     fn name(&self) -> &'static str { "BackfillSlugs" }
///
///     fn enumerate(&self, cursor: Option<i64>) -> ItemStream<'_, Post, i64> {
///         enumerator::records(&self.posts, cursor, 100)
///     }
///
///     async fn process(&self, post: &Post) -> anyhow::Result<()> {
///         save_slug(post).await
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// One unit of work. A batch of records is a valid item.
    type Item: Serialize + Send + Sync + 'static;

    /// Position in the collection, stored as the run's cursor.
    type Position: Serialize + DeserializeOwned + Send + 'static;

    /// Name used to register and look up the task.
    fn name(&self) -> &'static str;

    /// Items after `cursor`, or from the start when `cursor` is `None`.
    fn enumerate(&self, cursor: Option<Self::Position>) -> ItemStream<'_, Self::Item, Self::Position>;

    /// Process a single item.
    async fn process(&self, item: &Self::Item) -> anyhow::Result<()>;

    /// Number of items the task will process, if cheaply known.
    async fn count(&self) -> anyhow::Result<Option<u64>> {
        Ok(None)
    }

    /// Override the configured minimum delay between progress writes.
    fn minimum_tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Decide how a failed item affects the run.
    fn on_item_error(&self, _error: &anyhow::Error, _item: &Self::Item) -> ItemErrorPolicy {
        ItemErrorPolicy::Continue
    }
}
