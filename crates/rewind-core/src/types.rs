//! Identity and record types shared across the ingester.
//!
//! A recording session is identified by `(team_id, session_id)` and is pinned
//! to a single source partition for its lifetime in a worker, so the two key
//! types here are [`SessionKey`] and [`TopicPartition`]. [`ConsumedRecord`] is
//! the raw unit handed over by the message bus; [`RecordMetadata`] is the
//! subset of it that travels with every parsed snapshot batch.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A `(topic, partition)` pair on the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Unique identity of a recording session within the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub team_id: u64,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(team_id: u64, session_id: impl Into<String>) -> Self {
        Self {
            team_id,
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.team_id, self.session_id)
    }
}

/// A raw record as fetched from the message bus, before parsing.
///
/// `timestamp_ms` and `payload` are optional because the bus can hand over
/// records without either; the parser turns those into labelled drops rather
/// than errors.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: u64,
    pub timestamp_ms: Option<u64>,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
}

impl ConsumedRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Source position of a parsed snapshot batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: u64,
    pub timestamp_ms: u64,
}

impl RecordMetadata {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("snapshots", 3);
        assert_eq!(tp.to_string(), "snapshots[3]");
    }

    #[test]
    fn test_topic_partition_equality_and_hash() {
        use std::collections::HashSet;
        let a = TopicPartition::new("t", 0);
        let b = TopicPartition::new("t", 0);
        let c = TopicPartition::new("t", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::new(7, "abc");
        assert_eq!(key.to_string(), "7/abc");
    }

    #[test]
    fn test_session_key_distinct_teams_are_distinct_keys() {
        let a = SessionKey::new(1, "s");
        let b = SessionKey::new(2, "s");
        assert_ne!(a, b);
    }

    #[test]
    fn test_consumed_record_topic_partition() {
        let record = ConsumedRecord {
            topic: "snapshots".to_string(),
            partition: 5,
            offset: 42,
            timestamp_ms: Some(1_700_000_000_000),
            key: None,
            payload: Some(Bytes::from("{}")),
        };
        assert_eq!(record.topic_partition(), TopicPartition::new("snapshots", 5));
    }

    #[test]
    fn test_record_metadata_serde_roundtrip() {
        let meta = RecordMetadata {
            topic: "snapshots".to_string(),
            partition: 0,
            offset: 10,
            timestamp_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: RecordMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }
}
