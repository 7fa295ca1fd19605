//! Restartable, cursor-driven enumeration of a task's collection.
//!
//! An enumerator is a lazy stream of `(item, position_after_item)` pairs.
//! Starting it again from a position it yielded must produce exactly the
//! items after that position: no duplicates, no gaps.
//!
//! Two adapters cover the common shapes:
//!
//! - [`from_vec`] walks an in-memory list, using the index as position.
//! - [`records`] and [`batches`] page through a [`KeyedSource`] in ascending
//!   key order, using the last key seen as position.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, VecDeque};

/// Lazy sequence of items, each paired with the position just after it.
///
/// An `Err` means the enumeration itself failed, which is fatal for the run.
pub type ItemStream<'a, I, P> = BoxStream<'a, anyhow::Result<(I, P)>>;

/// Enumerate a list by index. `cursor` is the index of the last processed
/// item.
pub fn from_vec<T>(items: Vec<T>, cursor: Option<usize>) -> ItemStream<'static, T, usize>
where
    T: Send + 'static,
{
    let skip = cursor.map_or(0, |index| index + 1);
    stream::iter(
        items
            .into_iter()
            .enumerate()
            .skip(skip)
            .map(|(index, item)| Ok((item, index))),
    )
    .boxed()
}

/// A collection that can be read in pages ordered by a unique key.
///
/// `fetch_after` must return records with keys strictly greater than `after`
/// in ascending order, at most `limit` of them. Fewer than `limit` records
/// means the collection is exhausted.
#[async_trait]
pub trait KeyedSource: Send + Sync {
    type Key: Ord + Clone + Send + Sync + 'static;
    type Record: Send + 'static;

    async fn fetch_after(
        &self,
        after: Option<&Self::Key>,
        limit: usize,
    ) -> anyhow::Result<Vec<(Self::Key, Self::Record)>>;
}

#[async_trait]
impl<K, V> KeyedSource for BTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Key = K;
    type Record = V;

    async fn fetch_after(&self, after: Option<&K>, limit: usize) -> anyhow::Result<Vec<(K, V)>> {
        let page = match after {
            Some(key) => self
                .range((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => self
                .iter()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(page)
    }
}

struct Paging<K, R> {
    after: Option<K>,
    buffer: VecDeque<(K, R)>,
    exhausted: bool,
}

/// Fetch the next page into the buffer, checking the ordering contract.
async fn fill<S>(source: &S, state: &mut Paging<S::Key, S::Record>, batch_size: usize) -> anyhow::Result<()>
where
    S: KeyedSource + ?Sized,
{
    let page = source.fetch_after(state.after.as_ref(), batch_size).await?;
    state.exhausted = page.len() < batch_size;

    let mut previous = state.after.clone();
    for (key, _) in &page {
        if previous.as_ref().is_some_and(|prev| key <= prev) {
            anyhow::bail!("keyed source returned keys out of order; cursor resumption would skip or repeat records");
        }
        previous = Some(key.clone());
    }
    state.buffer.extend(page);
    Ok(())
}

/// Enumerate a keyed source one record at a time, fetching `batch_size`
/// records per page. Each record's key is its cursor.
pub fn records<'a, S>(
    source: &'a S,
    cursor: Option<S::Key>,
    batch_size: usize,
) -> ItemStream<'a, S::Record, S::Key>
where
    S: KeyedSource + ?Sized,
{
    let batch_size = batch_size.max(1);
    let state = Paging {
        after: cursor,
        buffer: VecDeque::new(),
        exhausted: false,
    };

    stream::try_unfold(state, move |mut state| async move {
        if state.buffer.is_empty() && !state.exhausted {
            fill(source, &mut state, batch_size).await?;
        }
        match state.buffer.pop_front() {
            Some((key, record)) => {
                state.after = Some(key.clone());
                Ok(Some(((record, key), state)))
            }
            None => Ok(None),
        }
    })
    .boxed()
}

/// Enumerate a keyed source a page at a time. The cursor sits at the batch
/// boundary, so a resumed run never re-enters a batch it finished.
pub fn batches<'a, S>(
    source: &'a S,
    cursor: Option<S::Key>,
    batch_size: usize,
) -> ItemStream<'a, Vec<S::Record>, S::Key>
where
    S: KeyedSource + ?Sized,
{
    let batch_size = batch_size.max(1);
    let state = Paging {
        after: cursor,
        buffer: VecDeque::new(),
        exhausted: false,
    };

    stream::try_unfold(state, move |mut state| async move {
        if state.exhausted {
            return Ok(None);
        }
        fill(source, &mut state, batch_size).await?;
        let Some((last_key, _)) = state.buffer.back() else {
            return Ok(None);
        };
        let last_key = last_key.clone();
        let batch = state.buffer.drain(..).map(|(_, record)| record).collect();
        state.after = Some(last_key.clone());
        Ok(Some(((batch, last_key), state)))
    })
    .boxed()
}
