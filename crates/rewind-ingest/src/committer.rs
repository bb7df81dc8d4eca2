//! Offset-commit seam.
//!
//! Commits use the standard log-consumer convention: the committed value is
//! the next offset to read. Auto-commit stays disabled on the bus; the
//! consumer decides when a commit is safe.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use rewind_core::TopicPartition;

use crate::error::{Error, Result};

#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Record `next_offset` as the next offset to read for `tp`.
    async fn commit(&self, tp: &TopicPartition, next_offset: u64) -> Result<()>;
}

/// In-memory committer for tests and dry runs.
#[derive(Default)]
pub struct MemoryCommitter {
    commits: RwLock<HashMap<TopicPartition, u64>>,
    history: RwLock<Vec<(TopicPartition, u64)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn committed(&self, tp: &TopicPartition) -> Option<u64> {
        self.commits.read().await.get(tp).copied()
    }

    pub async fn history(&self) -> Vec<(TopicPartition, u64)> {
        self.history.read().await.clone()
    }

    /// Make subsequent commits fail. Test helper.
    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl OffsetCommitter for MemoryCommitter {
    async fn commit(&self, tp: &TopicPartition, next_offset: u64) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Commit("injected commit failure".to_string()));
        }
        self.commits.write().await.insert(tp.clone(), next_offset);
        self.history.write().await.push((tp.clone(), next_offset));
        Ok(())
    }
}
