//! Best-effort partition leases in the shared store.
//!
//! A worker that owns a partition keeps a short-TTL lease on it so that a
//! formerly-owning worker can notice it has been superseded and stop writing
//! after a revoke. The lease is an optimization for clean handover, not a
//! safety mechanism: claim failures are logged and ingestion continues, and
//! correctness still rests on the high-water marks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use rewind_core::TopicPartition;

use crate::store::SharedStore;

pub struct PartitionLocker {
    store: Arc<dyn SharedStore>,
    holder_id: String,
    ttl: Duration,
}

impl PartitionLocker {
    pub fn new(store: Arc<dyn SharedStore>, holder_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            holder_id: holder_id.into(),
            ttl,
        }
    }

    fn lease_key(tp: &TopicPartition) -> String {
        format!("partition-locks/{}/{}", tp.topic, tp.partition)
    }

    /// (Re)acquire or extend the leases for `partitions`.
    ///
    /// Returns how many leases are held after the call. Failures never block.
    pub async fn claim(&self, partitions: &[TopicPartition]) -> usize {
        let mut held = 0;
        for tp in partitions {
            match self
                .store
                .try_claim(&Self::lease_key(tp), &self.holder_id, self.ttl)
                .await
            {
                Ok(true) => held += 1,
                Ok(false) => {
                    warn!(
                        topic_partition = %tp,
                        holder = %self.holder_id,
                        "Partition lock held by another worker"
                    );
                }
                Err(e) => {
                    warn!(
                        topic_partition = %tp,
                        error = %e,
                        "Failed to claim partition lock"
                    );
                }
            }
        }
        held
    }

    /// Release any of `partitions`' leases held by this worker.
    pub async fn release(&self, partitions: &[TopicPartition]) {
        for tp in partitions {
            if let Err(e) = self
                .store
                .release_claim(&Self::lease_key(tp), &self.holder_id)
                .await
            {
                warn!(
                    topic_partition = %tp,
                    error = %e,
                    "Failed to release partition lock"
                );
            } else {
                debug!(topic_partition = %tp, "Released partition lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySharedStore;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("snapshots", partition)
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let store = Arc::new(MemorySharedStore::new());
        let locker = PartitionLocker::new(store.clone(), "worker-a", Duration::from_secs(5));

        let held = locker.claim(&[tp(0), tp(1)]).await;
        assert_eq!(held, 2);
        assert_eq!(
            store.lease_holder("partition-locks/snapshots/0").await,
            Some("worker-a".to_string())
        );

        locker.release(&[tp(0), tp(1)]).await;
        assert_eq!(store.lease_holder("partition-locks/snapshots/0").await, None);
    }

    #[tokio::test]
    async fn test_claim_conflict_does_not_block() {
        let store = Arc::new(MemorySharedStore::new());
        let a = PartitionLocker::new(store.clone(), "worker-a", Duration::from_secs(5));
        let b = PartitionLocker::new(store.clone(), "worker-b", Duration::from_secs(5));

        assert_eq!(a.claim(&[tp(0)]).await, 1);
        // The second worker fails to claim but the call itself succeeds.
        assert_eq!(b.claim(&[tp(0)]).await, 0);
        assert_eq!(
            store.lease_holder("partition-locks/snapshots/0").await,
            Some("worker-a".to_string())
        );
    }

    #[tokio::test]
    async fn test_reclaim_extends_own_lease() {
        let store = Arc::new(MemorySharedStore::new());
        let locker = PartitionLocker::new(store.clone(), "worker-a", Duration::from_secs(5));

        assert_eq!(locker.claim(&[tp(0)]).await, 1);
        assert_eq!(locker.claim(&[tp(0)]).await, 1);
    }

    #[tokio::test]
    async fn test_release_does_not_touch_foreign_lease() {
        let store = Arc::new(MemorySharedStore::new());
        let a = PartitionLocker::new(store.clone(), "worker-a", Duration::from_secs(5));
        let b = PartitionLocker::new(store.clone(), "worker-b", Duration::from_secs(5));

        a.claim(&[tp(0)]).await;
        b.release(&[tp(0)]).await;
        assert_eq!(
            store.lease_holder("partition-locks/snapshots/0").await,
            Some("worker-a".to_string())
        );
    }
}
