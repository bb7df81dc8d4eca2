pub mod message;
pub mod types;

pub use message::{DropCause, RawSnapshot, SnapshotMessage, TeamRef, SNAPSHOT_EVENT};
pub use types::{ConsumedRecord, RecordMetadata, SessionKey, TopicPartition};
