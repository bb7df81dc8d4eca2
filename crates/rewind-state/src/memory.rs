//! In-memory [`SharedStore`] backend for tests and single-node development.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::SharedStore;

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

/// A process-local store with the same semantics as the Redis backend.
///
/// TTLs are honored for leases (checked on access); list TTLs are not
/// enforced, which is fine for the lifetimes tests exercise.
#[derive(Default)]
pub struct MemorySharedStore {
    counters: RwLock<HashMap<String, u64>>,
    lists: RwLock<HashMap<String, VecDeque<Bytes>>>,
    maps: RwLock<HashMap<String, HashMap<String, String>>>,
    leases: RwLock<HashMap<String, Lease>>,
    published: RwLock<Vec<(String, Bytes)>>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a map key, e.g. the token table. Test/dev helper.
    pub async fn insert_map(&self, key: &str, map: HashMap<String, String>) {
        self.maps.write().await.insert(key.to_string(), map);
    }

    /// All messages published so far, in order. Test helper.
    pub async fn published(&self) -> Vec<(String, Bytes)> {
        self.published.read().await.clone()
    }

    /// Current holder of a lease, if any and unexpired. Test helper.
    pub async fn lease_holder(&self, key: &str) -> Option<String> {
        let leases = self.leases.read().await;
        leases
            .get(key)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.holder.clone())
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn get_counter(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.counters.read().await.get(key).copied())
    }

    async fn put_counter_max(&self, key: &str, value: u64) -> Result<u64> {
        let mut counters = self.counters.write().await;
        let entry = counters.entry(key.to_string()).or_insert(value);
        if value > *entry {
            *entry = value;
        }
        Ok(*entry)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.counters.write().await.remove(key);
        self.lists.write().await.remove(key);
        self.maps.write().await.remove(key);
        Ok(())
    }

    async fn push_bounded(
        &self,
        key: &str,
        item: Bytes,
        max_len: usize,
        _ttl: Duration,
    ) -> Result<()> {
        let mut lists = self.lists.write().await;
        let list = lists.entry(key.to_string()).or_default();
        list.push_front(item);
        while list.len() > max_len {
            list.pop_back();
        }
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<Bytes>> {
        Ok(self
            .lists
            .read()
            .await
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.published
            .write()
            .await
            .push((channel.to_string(), payload));
        Ok(())
    }

    async fn read_map(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.maps.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn try_claim(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.write().await;
        let now = Instant::now();
        match leases.get(key) {
            Some(lease) if lease.holder != holder && lease.expires_at > now => Ok(false),
            _ => {
                leases.insert(
                    key.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_claim(&self, key: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.write().await;
        if leases.get(key).is_some_and(|lease| lease.holder == holder) {
            leases.remove(key);
        }
        Ok(())
    }
}
