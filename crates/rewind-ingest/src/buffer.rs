//! Session Buffer - Accumulating Snapshot Events on Disk
//!
//! A `SessionBuffer` is the per-session accumulation point between the
//! message bus and the object store. Serialized events are appended to a
//! newline-delimited temp file while lightweight bookkeeping stays in memory:
//!
//! - offset range (`lowest_offset`..`highest_offset`) on the source partition
//! - timestamp range of the buffered events
//! - byte size and event count, which drive the flush triggers
//! - a bounded ring of the most recent serialized events (the realtime tail)
//!
//! The buffer itself decides nothing; the owning `SessionManager` reads the
//! counters and triggers flushes. After a successful flush the buffer is
//! `reset()`: the file is unlinked and recreated, counters are zeroed, and
//! only the realtime tail survives.
//!
//! ## Thread Safety
//!
//! A `SessionBuffer` is NOT thread-safe. Each buffer is owned by a single
//! session's manager, which is owned by the consumer task.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::{Error, Result};

/// Current wall-clock time in milliseconds since epoch
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct SessionBuffer {
    dir: PathBuf,
    stem: String,
    generation: u64,
    path: PathBuf,
    writer: Option<BufWriter<File>>,

    event_count: u64,
    byte_size: u64,
    lowest_offset: Option<u64>,
    highest_offset: Option<u64>,
    oldest_kafka_timestamp: Option<u64>,
    newest_kafka_timestamp: Option<u64>,
    created_at_ms: u64,

    tail: VecDeque<Bytes>,
    tail_capacity: usize,
}

impl SessionBuffer {
    /// Create an empty buffer backed by a fresh temp file under `dir`.
    ///
    /// `stem` should be unique per session instance (the manager derives it
    /// from the partition and session id).
    pub async fn new(dir: &Path, stem: &str, tail_capacity: usize) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let mut buffer = Self {
            dir: dir.to_path_buf(),
            stem: stem.to_string(),
            generation: 0,
            path: PathBuf::new(),
            writer: None,
            event_count: 0,
            byte_size: 0,
            lowest_offset: None,
            highest_offset: None,
            oldest_kafka_timestamp: None,
            newest_kafka_timestamp: None,
            created_at_ms: now_ms(),
            tail: VecDeque::with_capacity(tail_capacity),
            tail_capacity,
        };
        buffer.open_file().await?;
        Ok(buffer)
    }

    async fn open_file(&mut self) -> Result<()> {
        self.path = self
            .dir
            .join(format!("{}-{}.jsonl", self.stem, self.generation));
        let file = File::create(&self.path).await?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// Append one serialized event observed at `(offset, timestamp_ms)`.
    pub async fn append(&mut self, event: Bytes, offset: u64, timestamp_ms: u64) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("buffer file already destroyed")))?;
        writer.write_all(&event).await?;
        writer.write_all(b"\n").await?;

        self.byte_size += event.len() as u64 + 1;
        self.event_count += 1;

        self.lowest_offset = Some(self.lowest_offset.map_or(offset, |o| o.min(offset)));
        self.highest_offset = Some(self.highest_offset.map_or(offset, |o| o.max(offset)));
        self.oldest_kafka_timestamp = Some(
            self.oldest_kafka_timestamp
                .map_or(timestamp_ms, |t| t.min(timestamp_ms)),
        );
        self.newest_kafka_timestamp = Some(
            self.newest_kafka_timestamp
                .map_or(timestamp_ms, |t| t.max(timestamp_ms)),
        );

        self.tail.push_back(event);
        while self.tail.len() > self.tail_capacity {
            self.tail.pop_front();
        }

        Ok(())
    }

    /// Flush userspace and OS buffers so the file content is durable enough
    /// to upload, and return the file path.
    pub async fn finalize(&mut self) -> Result<&Path> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().await?;
            writer.get_ref().sync_all().await?;
        }
        Ok(&self.path)
    }

    /// Unlink the temp file and zero all counters. The realtime tail is kept.
    pub async fn reset(&mut self) -> Result<()> {
        self.writer = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.generation += 1;
        self.event_count = 0;
        self.byte_size = 0;
        self.lowest_offset = None;
        self.highest_offset = None;
        self.oldest_kafka_timestamp = None;
        self.newest_kafka_timestamp = None;
        self.created_at_ms = now_ms();
        self.open_file().await
    }

    /// Drop the file handle and unlink the temp file. Idempotent.
    pub async fn destroy(&mut self) -> Result<()> {
        self.writer = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    pub fn size(&self) -> u64 {
        self.byte_size
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn lowest_offset(&self) -> Option<u64> {
        self.lowest_offset
    }

    pub fn highest_offset(&self) -> Option<u64> {
        self.highest_offset
    }

    pub fn oldest_timestamp(&self) -> Option<u64> {
        self.oldest_kafka_timestamp
    }

    pub fn newest_timestamp(&self) -> Option<u64> {
        self.newest_kafka_timestamp
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn tail(&self) -> &VecDeque<Bytes> {
        &self.tail
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
