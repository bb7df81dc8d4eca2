//! High-water-mark tracking for idempotent replay.
//!
//! For every `(topic, partition, logical_key)` we remember the highest offset
//! that has been durably handled. On replay — after a crash, a rebalance, or
//! a redelivered batch — anything at or below the mark is dropped before it
//! can cause a side effect.
//!
//! Two kinds of logical key are in play: the session id itself, written when
//! that session's buffer is flushed, and [`PARTITION_GLOBAL_KEY`], written at
//! the same time to record the partition's overall durable progress. The
//! per-session marks let a worker self-heal mid-stream; the partition-global
//! mark lets a *different* worker skip work a previous owner already flushed.
//!
//! Marks live in the shared store so they survive the worker, with a local
//! write-through cache in front so the hot path (one check per record) stays
//! off the network. The cache is only ever populated from the store or raised
//! by `add`, so it can never report a higher mark than the store has seen.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use rewind_core::TopicPartition;

use crate::error::Result;
use crate::store::SharedStore;

/// Sentinel logical key recording partition-wide durable progress.
pub const PARTITION_GLOBAL_KEY: &str = "$partition";

pub struct HighWaterMarker {
    store: Arc<dyn SharedStore>,
    /// Per-partition cache of store lookups. `None` records a confirmed
    /// store miss, which is distinct from a mark of 0: offset 0 is at or
    /// below a mark of 0 but below nothing when no mark was ever written.
    marks: RwLock<HashMap<TopicPartition, HashMap<String, Option<u64>>>>,
}

impl HighWaterMarker {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            marks: RwLock::new(HashMap::new()),
        }
    }

    fn store_key(tp: &TopicPartition, key: &str) -> String {
        format!("high-water-marks/{}/{}/{}", tp.topic, tp.partition, key)
    }

    /// True iff the recorded mark for `(tp, key)` is at or above `offset`,
    /// i.e. the event was already durably handled and must be dropped.
    ///
    /// Served from the local cache when possible; a local miss consults the
    /// shared store once and caches the answer, including a confirmed
    /// absence.
    pub async fn is_below(&self, tp: &TopicPartition, key: &str, offset: u64) -> Result<bool> {
        {
            let marks = self.marks.read().await;
            if let Some(cached) = marks.get(tp).and_then(|keys| keys.get(key)) {
                return Ok(cached.is_some_and(|mark| offset <= mark));
            }
        }

        let stored = self.store.get_counter(&Self::store_key(tp, key)).await?;

        let mut marks = self.marks.write().await;
        marks
            .entry(tp.clone())
            .or_default()
            .entry(key.to_string())
            .or_insert(stored);

        Ok(stored.is_some_and(|mark| offset <= mark))
    }

    /// Raise the mark for `(tp, key)` to at least `offset`.
    ///
    /// Writes through to the shared store first so a concurrent or later
    /// reader on another worker can never observe the cache ahead of the
    /// store. Lowering is impossible: concurrent adds settle on the maximum.
    pub async fn add(&self, tp: &TopicPartition, key: &str, offset: u64) -> Result<()> {
        let settled = self
            .store
            .put_counter_max(&Self::store_key(tp, key), offset)
            .await?;

        let mut marks = self.marks.write().await;
        let slot = marks
            .entry(tp.clone())
            .or_default()
            .entry(key.to_string())
            .or_insert(None);
        if slot.map_or(true, |mark| settled > mark) {
            *slot = Some(settled);
        }
        Ok(())
    }

    /// Discard per-session marks at or below `up_to` for `tp`, locally and in
    /// the shared store. The partition-global mark is never cleared.
    ///
    /// Called after the committed offset advances: a replay will start above
    /// `up_to`, so marks at or below it can no longer filter anything.
    pub async fn clear_below(&self, tp: &TopicPartition, up_to: u64) -> Result<()> {
        let stale: Vec<String> = {
            let mut marks = self.marks.write().await;
            let Some(keys) = marks.get_mut(tp) else {
                return Ok(());
            };
            let stale: Vec<String> = keys
                .iter()
                .filter(|(key, mark)| {
                    key.as_str() != PARTITION_GLOBAL_KEY
                        && mark.is_some_and(|mark| mark <= up_to)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                keys.remove(key);
            }
            stale
        };

        for key in &stale {
            self.store.delete(&Self::store_key(tp, key)).await?;
        }
        if !stale.is_empty() {
            debug!(
                topic_partition = %tp,
                up_to,
                cleared = stale.len(),
                "Cleared stale high-water marks"
            );
        }
        Ok(())
    }

    /// Forget all local state for `tp`. The shared store is left intact for
    /// the partition's next owner.
    pub async fn revoke(&self, tp: &TopicPartition) {
        self.marks.write().await.remove(tp);
    }
}
