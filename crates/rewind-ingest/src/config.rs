//! Ingester Configuration
//!
//! This module defines configuration for the whole consume/flush path.
//!
//! ## IngestConfig
//!
//! Controls fetch sizing, batch shape, session-flush thresholds, and the
//! shared-store namespaces:
//!
//! - **consumption_max_bytes** / **consumption_max_bytes_per_partition**:
//!   bound what a single fetch can pull off the bus
//! - **kafka_queue_size**: minimum messages buffered per partition
//! - **consumption_max_wait_ms**: fetch long-poll timeout
//! - **batch_size** / **batching_timeout_ms**: batch shape handed to the
//!   consumer
//! - **flush_age_ms** / **flush_size_bytes**: session-flush thresholds
//! - **local_directory**: temp-file root for session buffers (purged on
//!   startup)
//! - **redis_prefix**: key namespace in the shared cache
//! - **partition_revoke_optimization**: enables partition locks and
//!   revoke-time flushing
//!
//! ## Usage
//!
//! ```ignore
//! use rewind_ingest::IngestConfig;
//!
//! let config = IngestConfig {
//!     topic: "session_recording_snapshot_items".to_string(),
//!     group_id: "session-recordings-blob".to_string(),
//!     bucket: "rewind-recordings".to_string(),
//!     flush_size_bytes: 1024 * 1024,
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Inbound snapshot topic
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group id
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Downstream topic for compact replay events
    #[serde(default = "default_replay_events_topic")]
    pub replay_events_topic: String,

    /// Object-store bucket receiving flushed session blobs
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Object key prefix (default: `session_recordings`)
    #[serde(default = "default_object_prefix")]
    pub object_prefix: String,

    /// Maximum bytes per fetch across all partitions
    #[serde(default = "default_consumption_max_bytes")]
    pub consumption_max_bytes: usize,

    /// Maximum bytes per fetch per partition
    #[serde(default = "default_consumption_max_bytes_per_partition")]
    pub consumption_max_bytes_per_partition: usize,

    /// Minimum messages buffered per partition in the client
    #[serde(default = "default_kafka_queue_size")]
    pub kafka_queue_size: usize,

    /// Fetch long-poll timeout in milliseconds
    #[serde(default = "default_consumption_max_wait_ms")]
    pub consumption_max_wait_ms: u64,

    /// Maximum messages per handled batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long to wait filling a batch before handing it over
    #[serde(default = "default_batching_timeout_ms")]
    pub batching_timeout_ms: u64,

    /// Temp-file root for session buffers; purged and recreated on startup
    #[serde(default = "default_local_directory")]
    pub local_directory: String,

    /// Key namespace in the shared cache
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,

    /// Enables partition locks and revoke-time flushing
    #[serde(default = "default_partition_revoke_optimization")]
    pub partition_revoke_optimization: bool,

    /// Flush a session once its oldest buffered event is this old, measured
    /// against the newest ingested timestamp on the partition
    #[serde(default = "default_flush_age_ms")]
    pub flush_age_ms: u64,

    /// Flush a session once its buffer reaches this size
    #[serde(default = "default_flush_size_bytes")]
    pub flush_size_bytes: u64,

    /// Object-store upload retries with exponential backoff
    #[serde(default = "default_upload_retries")]
    pub upload_retries: u32,

    /// Fragments retained per session in the realtime cache
    #[serde(default = "default_realtime_tail_events")]
    pub realtime_tail_events: usize,

    /// Realtime tail TTL in seconds, refreshed on each push
    #[serde(default = "default_realtime_ttl_secs")]
    pub realtime_ttl_secs: u64,

    /// Partition lock TTL in seconds
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Token table refresh interval in seconds
    #[serde(default = "default_team_refresh_secs")]
    pub team_refresh_secs: u64,

    /// Soft timeout for handling one batch; exceeded batches are logged
    #[serde(default = "default_batch_soft_timeout_ms")]
    pub batch_soft_timeout_ms: u64,

    /// Hard timeout for the flush sweep; exceeded sweeps are reported
    #[serde(default = "default_flush_hard_timeout_ms")]
    pub flush_hard_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            group_id: default_group_id(),
            replay_events_topic: default_replay_events_topic(),
            bucket: default_bucket(),
            object_prefix: default_object_prefix(),
            consumption_max_bytes: default_consumption_max_bytes(),
            consumption_max_bytes_per_partition: default_consumption_max_bytes_per_partition(),
            kafka_queue_size: default_kafka_queue_size(),
            consumption_max_wait_ms: default_consumption_max_wait_ms(),
            batch_size: default_batch_size(),
            batching_timeout_ms: default_batching_timeout_ms(),
            local_directory: default_local_directory(),
            redis_prefix: default_redis_prefix(),
            partition_revoke_optimization: default_partition_revoke_optimization(),
            flush_age_ms: default_flush_age_ms(),
            flush_size_bytes: default_flush_size_bytes(),
            upload_retries: default_upload_retries(),
            realtime_tail_events: default_realtime_tail_events(),
            realtime_ttl_secs: default_realtime_ttl_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            team_refresh_secs: default_team_refresh_secs(),
            batch_soft_timeout_ms: default_batch_soft_timeout_ms(),
            flush_hard_timeout_ms: default_flush_hard_timeout_ms(),
        }
    }
}

fn default_topic() -> String {
    "session_recording_snapshot_items".to_string()
}

fn default_group_id() -> String {
    "session-recordings-blob".to_string()
}

fn default_replay_events_topic() -> String {
    "session_replay_events".to_string()
}

fn default_bucket() -> String {
    "rewind-recordings".to_string()
}

fn default_object_prefix() -> String {
    "session_recordings".to_string()
}

fn default_consumption_max_bytes() -> usize {
    500 * 1024 * 1024 // 500MB
}

fn default_consumption_max_bytes_per_partition() -> usize {
    50 * 1024 * 1024 // 50MB
}

fn default_kafka_queue_size() -> usize {
    100
}

fn default_consumption_max_wait_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    500
}

fn default_batching_timeout_ms() -> u64 {
    500
}

fn default_local_directory() -> String {
    "./data/session-buffers".to_string()
}

fn default_redis_prefix() -> String {
    "@rewind/replay/".to_string()
}

fn default_partition_revoke_optimization() -> bool {
    true
}

fn default_flush_age_ms() -> u64 {
    10 * 60 * 1000 // 10 minutes
}

fn default_flush_size_bytes() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_upload_retries() -> u32 {
    3
}

fn default_realtime_tail_events() -> usize {
    300
}

fn default_realtime_ttl_secs() -> u64 {
    300
}

fn default_lock_ttl_secs() -> u64 {
    15
}

fn default_team_refresh_secs() -> u64 {
    300
}

fn default_batch_soft_timeout_ms() -> u64 {
    60_000
}

fn default_flush_hard_timeout_ms() -> u64 {
    120_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.topic, "session_recording_snapshot_items");
        assert_eq!(config.flush_age_ms, 10 * 60 * 1000);
        assert_eq!(config.flush_size_bytes, 50 * 1024 * 1024);
        assert!(config.partition_revoke_optimization);
        assert_eq!(config.redis_prefix, "@rewind/replay/");
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: IngestConfig =
            serde_json::from_str(r#"{"topic": "custom", "flush_size_bytes": 1024}"#).unwrap();
        assert_eq!(config.topic, "custom");
        assert_eq!(config.flush_size_bytes, 1024);
        assert_eq!(config.group_id, "session-recordings-blob");
        assert_eq!(config.batch_size, 500);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = IngestConfig {
            bucket: "custom-bucket".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: IngestConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bucket, "custom-bucket");
        assert_eq!(back.batch_size, config.batch_size);
    }
}
