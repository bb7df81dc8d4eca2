//! The shared key-value store seam.
//!
//! Multiple workers coordinate through one logical store. Safety rests on
//! [`put_counter_max`](SharedStore::put_counter_max) being monotonic under
//! concurrent writers; everything else (leases, lists, pub/sub) is
//! best-effort. The trait is object-safe and consumed as
//! `Arc<dyn SharedStore>` so components can be wired against Redis in
//! production and the in-memory backend in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a numeric value, `None` if the key does not exist.
    async fn get_counter(&self, key: &str) -> Result<Option<u64>>;

    /// Raise a numeric value monotonically and return the resulting value.
    ///
    /// Concurrent calls race safely: the final stored value is at least the
    /// maximum argument of every completed call.
    async fn put_counter_max(&self, key: &str, value: u64) -> Result<u64>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Prepend an item to a bounded list, trim it to `max_len`, and refresh
    /// the list's TTL.
    async fn push_bounded(
        &self,
        key: &str,
        item: Bytes,
        max_len: usize,
        ttl: Duration,
    ) -> Result<()>;

    /// Read a full list, newest first. Missing keys read as empty.
    async fn list(&self, key: &str) -> Result<Vec<Bytes>>;

    /// Publish a payload on a pub/sub channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Read a string map (used for the token table).
    async fn read_map(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Claim or extend a lease. Returns `true` when the lease is now held by
    /// `holder`, `false` when another holder owns it.
    async fn try_claim(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release a lease if held by `holder`; otherwise leave it alone.
    async fn release_claim(&self, key: &str, holder: &str) -> Result<()>;
}
