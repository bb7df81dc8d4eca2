//! Session Manager - Flushing Buffered Sessions to the Object Store
//!
//! One `SessionManager` owns one session's [`SessionBuffer`] and the decision
//! of when and how to flush it. A flush:
//!
//! 1. Snapshots the buffer's offset range and finalizes the temp file
//! 2. Gzips the newline-delimited events
//! 3. Uploads them under a deterministic key derived from
//!    `(team_id, session_id, partition, lowest_offset, highest_offset, created_at)`,
//!    with the identity, offset range, and event count attached as object
//!    attributes so the blob is self-describing via the store's metadata API
//! 4. Advances the high-water mark for the session, then for the partition
//! 5. Resets the buffer
//!
//! The deterministic key makes re-uploads after a crash idempotent: replaying
//! the same offset range produces the same object key. Marks advance only
//! after the upload succeeds, and the per-session mark advances before the
//! partition-global one, so a crash between the two writes re-delivers
//! instead of skipping.
//!
//! On failure the buffer is left intact and the error surfaces to the
//! consumer, which retries on the next flush tick and keeps the committed
//! offset below the buffered range.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use std::io::Write;
use tracing::{debug, error, info, warn};

use rewind_core::{SessionKey, SnapshotMessage, TopicPartition};
use rewind_observability::metrics;
use rewind_state::{HighWaterMarker, RealtimeCache, PARTITION_GLOBAL_KEY};

use crate::buffer::SessionBuffer;
use crate::config::IngestConfig;
use crate::error::{Error, Result};

/// Why a flush was started. Used as the label on the flush counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    BufferSize,
    BufferAge,
    PartitionShutdown,
    ProcessStop,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::BufferSize => "buffer_size",
            FlushReason::BufferAge => "buffer_age",
            FlushReason::PartitionShutdown => "partition_shutdown",
            FlushReason::ProcessStop => "process_stop",
        }
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const REALTIME_PUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct SessionManager {
    key: SessionKey,
    tp: TopicPartition,
    buffer: SessionBuffer,
    object_store: Arc<dyn ObjectStore>,
    marks: Arc<HighWaterMarker>,
    realtime: Arc<RealtimeCache>,
    config: Arc<IngestConfig>,
    flushing: bool,
    destroyed: bool,
}

impl SessionManager {
    pub async fn new(
        key: SessionKey,
        tp: TopicPartition,
        object_store: Arc<dyn ObjectStore>,
        marks: Arc<HighWaterMarker>,
        realtime: Arc<RealtimeCache>,
        config: Arc<IngestConfig>,
    ) -> Result<Self> {
        let stem = file_stem(&key, &tp);
        let buffer = SessionBuffer::new(
            std::path::Path::new(&config.local_directory),
            &stem,
            config.realtime_tail_events,
        )
        .await?;

        Ok(Self {
            key,
            tp,
            buffer,
            object_store,
            marks,
            realtime,
            config,
            flushing: false,
            destroyed: false,
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    /// Lowest un-flushed offset, `None` when the buffer is empty. The
    /// consumer uses this to compute the safe commit point.
    pub fn lowest_offset(&self) -> Option<u64> {
        self.buffer.lowest_offset()
    }

    /// Oldest buffered event timestamp; drives the age trigger and the
    /// oldest-first ordering of revoke-time flushes.
    pub fn oldest_timestamp(&self) -> Option<u64> {
        self.buffer.oldest_timestamp()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether anything has been mirrored for live viewers yet.
    pub fn has_realtime_tail(&self) -> bool {
        !self.buffer.tail().is_empty()
    }

    /// Buffer one snapshot batch and mirror it to the realtime cache.
    ///
    /// Kicks off a flush when the buffer crosses the size threshold. A
    /// failure here leaves the session in an undefined state; the consumer
    /// destroys the manager without advancing any mark so the range is
    /// re-delivered.
    pub async fn add(&mut self, msg: &SnapshotMessage) -> Result<()> {
        let mut lines = Vec::with_capacity(msg.events.len());
        for event in &msg.events {
            let line = Bytes::from(serde_json::to_vec(event)?);
            self.buffer
                .append(line.clone(), msg.metadata.offset, msg.metadata.timestamp_ms)
                .await?;
            lines.push(line);
        }

        // Best-effort: live viewers lag a little rather than slow ingestion.
        let realtime = self.realtime.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(REALTIME_PUSH_TIMEOUT, realtime.append(&key, &lines)).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(session = %key, error = %e, "Realtime tail push failed")
                }
                Err(_) => warn!(session = %key, "Realtime tail push timed out"),
            }
        });

        if self.buffer.size() >= self.config.flush_size_bytes {
            self.flush(FlushReason::BufferSize).await?;
        }
        Ok(())
    }

    /// Flush when the buffer is old (measured against `reference_time_ms`,
    /// the newest ingested timestamp on this partition) or over the size
    /// threshold.
    pub async fn flush_if_old(&mut self, reference_time_ms: u64) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let oldest = self.buffer.oldest_timestamp().unwrap_or(reference_time_ms);
        if reference_time_ms.saturating_sub(oldest) >= self.config.flush_age_ms {
            return self.flush(FlushReason::BufferAge).await;
        }
        if self.buffer.size() >= self.config.flush_size_bytes {
            return self.flush(FlushReason::BufferSize).await;
        }
        Ok(())
    }

    /// Upload the buffered events and advance the high-water marks.
    ///
    /// Flushing an empty buffer is a successful no-op, and a flush started
    /// while one is in flight coalesces into it.
    pub async fn flush(&mut self, reason: FlushReason) -> Result<()> {
        if self.buffer.is_empty() || self.flushing {
            return Ok(());
        }

        self.flushing = true;
        let result = self.do_flush(reason).await;
        self.flushing = false;

        if result.is_err() {
            metrics::FLUSH_ERRORS.with_label_values(&[reason.as_str()]).inc();
        }
        result
    }

    async fn do_flush(&mut self, reason: FlushReason) -> Result<()> {
        let lowest = self
            .buffer
            .lowest_offset()
            .ok_or_else(|| Error::UploadFailed("flush of empty buffer".to_string()))?;
        let highest = self
            .buffer
            .highest_offset()
            .ok_or_else(|| Error::UploadFailed("flush of empty buffer".to_string()))?;
        let event_count = self.buffer.event_count();
        let created_at = self.buffer.created_at_ms();

        let path = self.buffer.finalize().await?.to_path_buf();
        let raw = tokio::fs::read(&path).await?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let compressed = encoder.finish()?;
        let size_bytes = compressed.len();

        let object_key = format!(
            "{}/team_id={}/session_id={}/partition={}/{}-{}-{}.jsonl.gz",
            self.config.object_prefix,
            self.key.team_id,
            self.key.session_id,
            self.tp.partition,
            lowest,
            highest,
            created_at,
        );

        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::Metadata("team_id".into()),
            self.key.team_id.to_string().into(),
        );
        attributes.insert(
            Attribute::Metadata("session_id".into()),
            self.key.session_id.clone().into(),
        );
        attributes.insert(
            Attribute::Metadata("lowest_offset".into()),
            lowest.to_string().into(),
        );
        attributes.insert(
            Attribute::Metadata("highest_offset".into()),
            highest.to_string().into(),
        );
        attributes.insert(
            Attribute::Metadata("event_count".into()),
            event_count.to_string().into(),
        );

        self.upload(&object_key, Bytes::from(compressed), attributes)
            .await?;

        // Per-session mark first, partition-global second: a crash in between
        // under-advances the global mark, which re-delivers instead of skips.
        self.marks
            .add(&self.tp, &self.key.session_id, highest)
            .await?;
        self.marks
            .add(&self.tp, PARTITION_GLOBAL_KEY, highest)
            .await?;

        self.buffer.reset().await?;

        metrics::SESSION_FLUSHES
            .with_label_values(&[reason.as_str()])
            .inc();
        info!(
            session = %self.key,
            topic_partition = %self.tp,
            reason = %reason,
            lowest_offset = lowest,
            highest_offset = highest,
            event_count,
            size_bytes,
            object_key = %object_key,
            "Session flushed to object store"
        );

        Ok(())
    }

    /// Upload with exponential backoff retry.
    async fn upload(&self, key: &str, data: Bytes, attributes: Attributes) -> Result<()> {
        let path = object_store::path::Path::from(key);
        let payload = PutPayload::from(data.clone());
        let attempts = self.config.upload_retries.max(1);

        for attempt in 0..attempts {
            let opts = PutOptions {
                attributes: attributes.clone(),
                ..Default::default()
            };
            match self
                .object_store
                .put_opts(&path, payload.clone(), opts)
                .await
            {
                Ok(_) => {
                    debug!(
                        key = %key,
                        size = data.len(),
                        attempt = attempt + 1,
                        "Uploaded session blob"
                    );
                    return Ok(());
                }
                Err(e) if attempt < attempts - 1 => {
                    let backoff_ms = 100 * 2_u64.pow(attempt);
                    warn!(
                        key = %key,
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "Session blob upload failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    error!(
                        key = %key,
                        error = %e,
                        "Session blob upload failed after all retries"
                    );
                    return Err(Error::UploadFailed(e.to_string()));
                }
            }
        }

        unreachable!()
    }

    /// Unlink temp files and stop accepting work. Idempotent.
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Err(e) = self.buffer.destroy().await {
            warn!(session = %self.key, error = %e, "Failed to remove session buffer file");
        }
    }
}

fn file_stem(key: &SessionKey, tp: &TopicPartition) -> String {
    let safe_session: String = key
        .session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("{}-{}-{}", tp.partition, key.team_id, safe_session)
}
