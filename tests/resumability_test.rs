//! Property tests: a run split into any number of slices, with failing items
//! mixed in, processes every item exactly once and never loses progress.

use async_trait::async_trait;
use maintflow::enumerator;
use maintflow::{
    run_slice, Config, ItemStream, MemoryRunStore, RunStatus, RunStore, Task,
};
use proptest::prelude::*;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct Walk {
    len: usize,
    failing: Vec<bool>,
    processed: Mutex<Vec<usize>>,
}

#[async_trait]
impl Task for Walk {
    type Item = usize;
    type Position = usize;

    fn name(&self) -> &'static str {
        "Walk"
    }

    fn enumerate(&self, cursor: Option<usize>) -> ItemStream<'_, usize, usize> {
        enumerator::from_vec((0..self.len).collect(), cursor)
    }

    async fn process(&self, item: &usize) -> anyhow::Result<()> {
        self.processed.lock().unwrap().push(*item);
        if self.failing.get(*item).copied().unwrap_or(false) {
            anyhow::bail!("item {item} failed");
        }
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Property: slicing never repeats or skips an item, and the tick count
    /// after each slice equals the items processed so far.
    #[test]
    fn prop_sliced_run_processes_each_item_once(
        len in 0usize..40,
        budgets in prop::collection::vec(1u64..6, 1..10),
        failing in prop::collection::vec(any::<bool>(), 40),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let store = MemoryRunStore::new();
            let task = Walk { len, failing, processed: Mutex::new(Vec::new()) };
            let created = store.create("Maintenance::Walk").await.unwrap();
            let mut run = store.claim(created.id).await.unwrap();

            let mut last_ticks = 0;
            for slice in 0.. {
                let budget = budgets[slice % budgets.len()];
                let config = Config::builder().max_slice_items(budget).build().unwrap();
                let outcome = run_slice(&task, &store, &config, run, &CancellationToken::new())
                    .await
                    .unwrap();

                let processed = task.processed.lock().unwrap().len() as u64;
                prop_assert_eq!(outcome.tick_count, processed);
                prop_assert!(outcome.tick_count >= last_ticks);
                prop_assert!(outcome.tick_count - last_ticks <= budget);
                last_ticks = outcome.tick_count;

                if !outcome.reenqueue() {
                    prop_assert_eq!(outcome.status, RunStatus::Succeeded);
                    break;
                }
                run = store.claim(outcome.run_id).await.unwrap();
            }

            let processed = task.processed.lock().unwrap().clone();
            prop_assert_eq!(processed, (0..len).collect::<Vec<_>>());
            prop_assert_eq!(last_ticks, len as u64);
            Ok(())
        })?;
    }
}
