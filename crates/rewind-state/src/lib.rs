//! Shared-state layer for the rewind ingester.
//!
//! Everything that must be visible across workers lives behind the
//! [`SharedStore`] trait: high-water marks, partition leases, the realtime
//! snapshot tails, and the token table. Production uses the Redis backend;
//! tests and single-node development use the in-memory backend.

pub mod error;
pub mod high_water_mark;
pub mod memory;
pub mod partition_lock;
pub mod realtime;
pub mod redis_store;
pub mod store;

pub use error::{Error, Result};
pub use high_water_mark::{HighWaterMarker, PARTITION_GLOBAL_KEY};
pub use memory::MemorySharedStore;
pub use partition_lock::PartitionLocker;
pub use realtime::{RealtimeCache, RealtimeCacheConfig, SessionActivity};
pub use redis_store::RedisSharedStore;
pub use store::SharedStore;
