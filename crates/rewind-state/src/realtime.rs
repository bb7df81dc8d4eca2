//! Realtime snapshot tails for live viewers.
//!
//! While a session is being recorded, the most recent snapshot fragments are
//! mirrored into a bounded, TTL'd list in the shared store, and an activity
//! message is published so readers can discover which sessions are live. The
//! list is an accelerant, not the source of truth: it is left in place on
//! flush and reaped by its TTL once the session goes quiet.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use rewind_core::SessionKey;

use crate::error::Result;
use crate::store::SharedStore;

#[derive(Debug, Clone)]
pub struct RealtimeCacheConfig {
    /// Maximum fragments retained per session.
    pub max_tail_events: usize,
    /// List TTL, refreshed on every push.
    pub ttl: Duration,
    /// Pub/sub channel announcing session activity.
    pub activity_channel: String,
}

impl Default for RealtimeCacheConfig {
    fn default() -> Self {
        Self {
            max_tail_events: 300,
            ttl: Duration::from_secs(300),
            activity_channel: "realtime-activity".to_string(),
        }
    }
}

/// Activity announcement published once per appended batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionActivity {
    pub team_id: u64,
    pub session_id: String,
    pub event_count: usize,
}

pub struct RealtimeCache {
    store: Arc<dyn SharedStore>,
    config: RealtimeCacheConfig,
}

impl RealtimeCache {
    pub fn new(store: Arc<dyn SharedStore>, config: RealtimeCacheConfig) -> Self {
        Self { store, config }
    }

    fn tail_key(key: &SessionKey) -> String {
        format!("snapshots/team-{}/session-{}", key.team_id, key.session_id)
    }

    /// Append serialized fragments to the session's tail and announce the
    /// activity. Each push refreshes the tail's TTL.
    pub async fn append(&self, key: &SessionKey, fragments: &[Bytes]) -> Result<()> {
        if fragments.is_empty() {
            return Ok(());
        }

        let tail_key = Self::tail_key(key);
        for fragment in fragments {
            self.store
                .push_bounded(
                    &tail_key,
                    fragment.clone(),
                    self.config.max_tail_events,
                    self.config.ttl,
                )
                .await?;
        }

        let activity = SessionActivity {
            team_id: key.team_id,
            session_id: key.session_id.clone(),
            event_count: fragments.len(),
        };
        let payload = serde_json::to_vec(&activity)
            .map_err(|e| crate::error::Error::Backend(e.to_string()))?;
        self.store
            .publish(&self.config.activity_channel, Bytes::from(payload))
            .await
    }

    /// Current tail for a session, newest first.
    pub async fn tail(&self, key: &SessionKey) -> Result<Vec<Bytes>> {
        self.store.list(&Self::tail_key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySharedStore;

    fn cache_with_store() -> (Arc<MemorySharedStore>, RealtimeCache) {
        let store = Arc::new(MemorySharedStore::new());
        let cache = RealtimeCache::new(
            store.clone(),
            RealtimeCacheConfig {
                max_tail_events: 3,
                ttl: Duration::from_secs(60),
                activity_channel: "realtime-activity".to_string(),
            },
        );
        (store, cache)
    }

    #[tokio::test]
    async fn test_append_and_read_tail() {
        let (_store, cache) = cache_with_store();
        let key = SessionKey::new(7, "a");

        cache
            .append(&key, &[Bytes::from("one"), Bytes::from("two")])
            .await
            .unwrap();

        let tail = cache.tail(&key).await.unwrap();
        assert_eq!(tail, vec![Bytes::from("two"), Bytes::from("one")]);
    }

    #[tokio::test]
    async fn test_tail_is_bounded() {
        let (_store, cache) = cache_with_store();
        let key = SessionKey::new(7, "a");

        let fragments: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("{i}"))).collect();
        cache.append(&key, &fragments).await.unwrap();

        let tail = cache.tail(&key).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0], Bytes::from("4"));
    }

    #[tokio::test]
    async fn test_append_publishes_activity() {
        let (store, cache) = cache_with_store();
        let key = SessionKey::new(7, "a");

        cache.append(&key, &[Bytes::from("one")]).await.unwrap();

        let published = store.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "realtime-activity");
        let activity: SessionActivity = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(
            activity,
            SessionActivity {
                team_id: 7,
                session_id: "a".to_string(),
                event_count: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_empty_append_is_a_noop() {
        let (store, cache) = cache_with_store();
        let key = SessionKey::new(7, "a");

        cache.append(&key, &[]).await.unwrap();

        assert!(cache.tail(&key).await.unwrap().is_empty());
        assert!(store.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_sessions_have_independent_tails() {
        let (_store, cache) = cache_with_store();
        let a = SessionKey::new(7, "a");
        let b = SessionKey::new(7, "b");

        cache.append(&a, &[Bytes::from("for-a")]).await.unwrap();

        assert_eq!(cache.tail(&a).await.unwrap().len(), 1);
        assert!(cache.tail(&b).await.unwrap().is_empty());
    }
}
