//! Replay Events Ingester - Compact Summaries for the Analytics Path
//!
//! Alongside blob storage, every parsed snapshot batch is summarized into a
//! compact replay event (team, session, window, distinct id, timestamp span,
//! event count) and published to a downstream topic.
//!
//! The sink is gated by the high-water marker under its own logical key, so
//! its progress is independent of the blob flushes: a batch replayed because
//! blob flushing fell behind will not re-publish summaries it already sent,
//! and vice versa. A publish failure fails the whole batch so the batch is
//! re-processed; the marks make that re-processing idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use rewind_core::SnapshotMessage;
use rewind_state::HighWaterMarker;

use crate::error::{Error, Result};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()>;
}

/// Compact summary derived from one snapshot batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEvent {
    pub team_id: u64,
    pub session_id: String,
    pub distinct_id: String,
    pub window_id: Option<String>,
    pub first_timestamp_ms: u64,
    pub last_timestamp_ms: u64,
    pub event_count: usize,
}

impl ReplayEvent {
    /// Derive the summary, preferring the snapshot items' own timestamps and
    /// falling back to the bus timestamp when none are present.
    pub fn derive(msg: &SnapshotMessage) -> Self {
        let mut first: Option<u64> = None;
        let mut last: Option<u64> = None;
        for event in &msg.events {
            if let Some(ts) = event.get("timestamp").and_then(|v| v.as_u64()) {
                first = Some(first.map_or(ts, |f| f.min(ts)));
                last = Some(last.map_or(ts, |l| l.max(ts)));
            }
        }
        let fallback = msg.metadata.timestamp_ms;

        Self {
            team_id: msg.team_id,
            session_id: msg.session_id.clone(),
            distinct_id: msg.distinct_id.clone(),
            window_id: msg.window_id.clone(),
            first_timestamp_ms: first.unwrap_or(fallback),
            last_timestamp_ms: last.unwrap_or(fallback),
            event_count: msg.events.len(),
        }
    }
}

pub struct ReplayEventsIngester {
    publisher: Arc<dyn EventPublisher>,
    topic: String,
    marks: Arc<HighWaterMarker>,
}

impl ReplayEventsIngester {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        topic: impl Into<String>,
        marks: Arc<HighWaterMarker>,
    ) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            marks,
        }
    }

    fn mark_key(session_id: &str) -> String {
        format!("replay-events:{session_id}")
    }

    /// Publish one summary per message that has not been published before.
    ///
    /// The first error aborts the batch; the caller re-processes it and the
    /// marks skip whatever already went out.
    pub async fn consume_batch(&self, msgs: &[SnapshotMessage]) -> Result<()> {
        for msg in msgs {
            let tp = msg.metadata.topic_partition();
            let key = Self::mark_key(&msg.session_id);
            if self
                .marks
                .is_below(&tp, &key, msg.metadata.offset)
                .await?
            {
                debug!(
                    session_id = %msg.session_id,
                    offset = msg.metadata.offset,
                    "Replay event already published, skipping"
                );
                continue;
            }

            let event = ReplayEvent::derive(msg);
            let payload = Bytes::from(serde_json::to_vec(&event)?);
            self.publisher
                .publish(&self.topic, &msg.session_id, payload)
                .await?;

            self.marks.add(&tp, &key, msg.metadata.offset).await?;
        }
        Ok(())
    }
}

/// In-memory publisher for tests and dry runs.
#[derive(Default)]
pub struct MemoryPublisher {
    records: RwLock<Vec<(String, String, Bytes)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<(String, String, Bytes)> {
        self.records.read().await.clone()
    }

    /// Make subsequent publishes fail. Test helper.
    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Publish("injected publish failure".to_string()));
        }
        self.records
            .write()
            .await
            .push((topic.to_string(), key.to_string(), payload));
        Ok(())
    }
}
