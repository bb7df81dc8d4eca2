//! rewind-ingest: the streaming session-recording blob ingester.
//!
//! A partitioned consumer reads session-replay snapshot batches off the
//! message bus, groups them by `(team, session)` into temp-file-backed
//! buffers, periodically flushes compressed buffers to the object store, and
//! advances committed offsets only after durability is guaranteed. The tail
//! of each active session is mirrored into the shared cache for live
//! viewers, and a compact replay event per batch feeds the analytics path.
//!
//! Delivery is at-least-once end to end; idempotence comes from the
//! high-water marks in `rewind-state` and deterministic object keys.

pub mod buffer;
pub mod committer;
pub mod config;
pub mod consumer;
pub mod error;
pub mod kafka;
pub mod manager;
pub mod refresher;
pub mod replay_events;
pub mod teams;

pub use buffer::SessionBuffer;
pub use committer::{MemoryCommitter, OffsetCommitter};
pub use config::IngestConfig;
pub use consumer::{BrokerWatermarks, ConsumerState, RecordingConsumer};
pub use error::{Error, Result};
pub use manager::{FlushReason, SessionManager};
pub use refresher::BackgroundRefresher;
pub use replay_events::{EventPublisher, MemoryPublisher, ReplayEvent, ReplayEventsIngester};
pub use teams::TeamRegistry;
