//! Recording Consumer - The Batch Coordinator
//!
//! `RecordingConsumer` owns everything that happens between a fetched batch
//! and a committed offset:
//!
//! 1. Claim partition locks (when the revoke optimization is enabled)
//! 2. Parse each record, resolve its team, and drop invalid, unknown-team,
//!    and already-handled (high-water-marked) records with labelled counters
//! 3. Route surviving messages to their `SessionManager`, creating managers
//!    lazily
//! 4. Commit, per source partition, the lowest un-flushed offset across live
//!    managers (or one past the batch's highest offset when none) - never
//!    advancing past buffered-but-unflushed work
//! 5. Feed the parsed batch to the replay-events ingester
//! 6. Flush sessions whose buffers are old or oversized, measured against
//!    the partition's newest ingested timestamp rather than the wall clock
//!
//! Rebalances arrive as `assign`/`revoke` events serialized with batch
//! processing, so a revoke can never interleave with an in-flight batch of
//! the revoked partition. On revoke the affected sessions are flushed
//! (oldest buffer first, when the lock optimization is on), destroyed, and
//! their partition state dropped; the next owner re-reads from the committed
//! offset and the high-water marks make the overlap idempotent.
//!
//! The session map is only ever touched by the consumer task. Other tasks
//! observe progress through metric gauges, not shared state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use object_store::ObjectStore;
use tracing::{debug, error, info, warn};

use rewind_core::{
    ConsumedRecord, DropCause, RawSnapshot, SessionKey, SnapshotMessage, TopicPartition,
};
use rewind_observability::metrics;
use rewind_state::{HighWaterMarker, PartitionLocker, RealtimeCache, PARTITION_GLOBAL_KEY};

use crate::buffer::now_ms;
use crate::committer::OffsetCommitter;
use crate::config::IngestConfig;
use crate::error::Result;
use crate::manager::{FlushReason, SessionManager};
use crate::refresher::BackgroundRefresher;
use crate::replay_events::ReplayEventsIngester;
use crate::teams::TeamRegistry;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Broker high offsets per partition, refreshed in the background for the
/// lag gauge.
pub type BrokerWatermarks = BackgroundRefresher<Arc<HashMap<i32, u64>>>;

#[derive(Debug, Default)]
struct PartitionState {
    /// Highest offset seen in any batch, valid or not.
    last_offset: Option<u64>,
    /// Newest bus timestamp seen; the reference clock for age flushes.
    last_timestamp_ms: Option<u64>,
    /// Last committed value (next offset to read).
    committed: Option<u64>,
}

pub struct RecordingConsumer {
    config: Arc<IngestConfig>,
    object_store: Arc<dyn ObjectStore>,
    marks: Arc<HighWaterMarker>,
    locker: PartitionLocker,
    realtime: Arc<RealtimeCache>,
    teams: TeamRegistry,
    committer: Arc<dyn OffsetCommitter>,
    replay_events: ReplayEventsIngester,
    broker_watermarks: Option<BrokerWatermarks>,

    sessions: HashMap<SessionKey, SessionManager>,
    partitions: HashMap<i32, PartitionState>,
    state: ConsumerState,
}

impl RecordingConsumer {
    /// Build a consumer. Purges and recreates the session-buffer directory;
    /// failure to do so is fatal.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: Arc<IngestConfig>,
        object_store: Arc<dyn ObjectStore>,
        marks: Arc<HighWaterMarker>,
        locker: PartitionLocker,
        realtime: Arc<RealtimeCache>,
        teams: TeamRegistry,
        committer: Arc<dyn OffsetCommitter>,
        replay_events: ReplayEventsIngester,
        broker_watermarks: Option<BrokerWatermarks>,
    ) -> Result<Self> {
        let dir = std::path::Path::new(&config.local_directory);
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(dir).await?;
        info!(directory = %config.local_directory, "Session buffer directory ready");

        Ok(Self {
            config,
            object_store,
            marks,
            locker,
            realtime,
            teams,
            committer,
            replay_events,
            broker_watermarks,
            sessions: HashMap::new(),
            partitions: HashMap::new(),
            state: ConsumerState::Starting,
        })
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ConsumerState::Running
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn start(&mut self) {
        self.state = ConsumerState::Running;
        info!(group_id = %self.config.group_id, topic = %self.config.topic, "Consumer running");
    }

    /// Process one batch end to end.
    ///
    /// Per-message failures are dropped and counted; a replay-events failure
    /// propagates so the batch is re-processed. An empty batch changes
    /// nothing.
    pub async fn handle_batch(&mut self, records: Vec<ConsumedRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if matches!(self.state, ConsumerState::Stopping | ConsumerState::Stopped) {
            warn!("Batch received while stopping; ignored");
            return Ok(());
        }

        let started = Instant::now();
        metrics::BATCH_SIZE.observe(records.len() as f64);

        // Highest offset per partition across every record in the batch,
        // valid or not. This is the commit floor when no manager is live.
        let mut batch_max: HashMap<i32, (String, u64)> = HashMap::new();
        for record in &records {
            let entry = batch_max
                .entry(record.partition)
                .or_insert_with(|| (record.topic.clone(), record.offset));
            entry.1 = entry.1.max(record.offset);
        }

        if self.config.partition_revoke_optimization {
            let tps: Vec<TopicPartition> = batch_max
                .iter()
                .map(|(partition, (topic, _))| TopicPartition::new(topic.clone(), *partition))
                .collect();
            self.locker.claim(&tps).await;
        }

        let mut parsed: Vec<SnapshotMessage> = Vec::new();
        for record in &records {
            metrics::MESSAGES_RECEIVED
                .with_label_values(&[&record.partition.to_string()])
                .inc();

            let partition = self.partitions.entry(record.partition).or_default();
            partition.last_offset = Some(
                partition
                    .last_offset
                    .map_or(record.offset, |o| o.max(record.offset)),
            );
            if let Some(ts) = record.timestamp_ms {
                partition.last_timestamp_ms =
                    Some(partition.last_timestamp_ms.map_or(ts, |t| t.max(ts)));
            }

            let raw = match RawSnapshot::parse(record) {
                Ok(raw) => raw,
                Err(cause) => {
                    drop_event(record, cause);
                    continue;
                }
            };

            // A team-table outage must not advance offsets past real events,
            // so resolution errors abort the batch instead of dropping.
            let team_id = match self.teams.resolve(&raw.team).await? {
                Some(team_id) => team_id,
                None => {
                    drop_event(record, DropCause::UnknownTeam);
                    continue;
                }
            };

            let tp = raw.metadata.topic_partition();
            if self
                .marks
                .is_below(&tp, &raw.session_id, raw.metadata.offset)
                .await?
                || self
                    .marks
                    .is_below(&tp, PARTITION_GLOBAL_KEY, raw.metadata.offset)
                    .await?
            {
                drop_event(record, DropCause::HighWaterMark);
                continue;
            }

            let msg = raw.into_message(team_id);
            self.route(&msg).await?;
            parsed.push(msg);
        }

        self.commit_safe_offsets(&batch_max).await;

        self.replay_events.consume_batch(&parsed).await?;

        self.flush_ready_sessions().await;
        self.export_lag().await;

        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(self.config.batch_soft_timeout_ms) {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                batch_size = records.len(),
                "Batch processing exceeded soft timeout"
            );
        }
        Ok(())
    }

    /// Route a message to its session manager, creating one on first sight.
    async fn route(&mut self, msg: &SnapshotMessage) -> Result<()> {
        let key = msg.session_key();
        let tp = msg.metadata.topic_partition();

        // A session is pinned to one partition for its lifetime. A same-key
        // message from a different partition means the previous instance was
        // not torn down cleanly; replace it.
        let stale_partition = self
            .sessions
            .get(&key)
            .map(|m| m.topic_partition().clone())
            .filter(|old_tp| old_tp != &tp);
        if let Some(old_tp) = stale_partition {
            warn!(
                session = %key,
                old_partition = %old_tp,
                new_partition = %tp,
                "Session reappeared on a different partition; replacing manager"
            );
            if let Some(mut old) = self.sessions.remove(&key) {
                old.destroy().await;
            }
        }

        if !self.sessions.contains_key(&key) {
            let manager = SessionManager::new(
                key.clone(),
                tp,
                self.object_store.clone(),
                self.marks.clone(),
                self.realtime.clone(),
                self.config.clone(),
            )
            .await?;
            self.sessions.insert(key.clone(), manager);
            metrics::SESSIONS_HANDLED.set(self.sessions.len() as i64);
        }

        let manager = self
            .sessions
            .get_mut(&key)
            .expect("manager inserted above");
        if let Err(e) = manager.add(msg).await {
            // The buffer state is suspect; drop the manager without touching
            // any mark so the whole range is re-delivered and replayed.
            error!(
                session = %key,
                error = %e,
                "Failed to buffer snapshot batch; destroying session for re-delivery"
            );
            if let Some(mut broken) = self.sessions.remove(&key) {
                broken.destroy().await;
            }
            metrics::SESSIONS_HANDLED.set(self.sessions.len() as i64);
        }
        Ok(())
    }

    /// Commit, per batch partition, the lowest un-flushed offset across live
    /// managers - or one past the batch maximum when nothing is buffered.
    async fn commit_safe_offsets(&mut self, batch_max: &HashMap<i32, (String, u64)>) {
        for (&partition, (topic, max_offset)) in batch_max {
            let tp = TopicPartition::new(topic.clone(), partition);

            let lowest_buffered = self
                .sessions
                .values()
                .filter(|m| m.topic_partition() == &tp)
                .filter_map(|m| m.lowest_offset())
                .min();

            // Committed value is the next offset to read: the lowest offset
            // still buffered (it must be re-read if we restart), or one past
            // the batch when every message is flushed or dropped.
            let target = match lowest_buffered {
                Some(lowest) => lowest,
                None => max_offset + 1,
            };

            let state = self.partitions.entry(partition).or_default();
            if state.committed.is_some_and(|committed| target <= committed) {
                continue;
            }

            match self.committer.commit(&tp, target).await {
                Ok(()) => {
                    state.committed = Some(target);
                    metrics::LAST_COMMITTED_OFFSET
                        .with_label_values(&[&partition.to_string()])
                        .set(target as i64);
                    debug!(topic_partition = %tp, offset = target, "Committed offset");

                    if let Err(e) = self
                        .marks
                        .clear_below(&tp, target.saturating_sub(1))
                        .await
                    {
                        warn!(topic_partition = %tp, error = %e, "Failed to clear stale marks");
                    }
                }
                Err(e) => {
                    metrics::COMMIT_FAILURES
                        .with_label_values(&[&partition.to_string()])
                        .inc();
                    warn!(
                        topic_partition = %tp,
                        offset = target,
                        error = %e,
                        "Offset commit failed; will retry next batch"
                    );
                }
            }
        }
    }

    /// Flush sessions that are old or oversized, then drop managers whose
    /// buffers are empty after a flush.
    async fn flush_ready_sessions(&mut self) {
        let deadline = Duration::from_millis(self.config.flush_hard_timeout_ms);
        if tokio::time::timeout(deadline, self.flush_sweep()).await.is_err() {
            error!(
                timeout_ms = self.config.flush_hard_timeout_ms,
                "Flush sweep exceeded hard timeout"
            );
        }
    }

    async fn flush_sweep(&mut self) {
        let reference_times: HashMap<i32, u64> = self
            .partitions
            .iter()
            .filter_map(|(&partition, state)| {
                state.last_timestamp_ms.map(|ts| (partition, ts))
            })
            .collect();

        let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        for key in keys {
            let Some(manager) = self.sessions.get_mut(&key) else {
                continue;
            };
            let Some(&reference) = reference_times.get(&manager.topic_partition().partition)
            else {
                continue;
            };

            if let Err(e) = manager.flush_if_old(reference).await {
                warn!(
                    session = %key,
                    error = %e,
                    "Session flush failed; buffer kept for retry"
                );
            }

            if manager.is_empty() {
                if let Some(mut drained) = self.sessions.remove(&key) {
                    drained.destroy().await;
                }
            }
        }
        metrics::SESSIONS_HANDLED.set(self.sessions.len() as i64);
        metrics::REALTIME_SESSIONS.set(
            self.sessions
                .values()
                .filter(|m| m.has_realtime_tail())
                .count() as i64,
        );
    }

    /// Partition assignment: initialize metrics state, claim locks, refresh
    /// broker offsets.
    pub async fn on_assign(&mut self, assigned: &[TopicPartition]) {
        info!(partitions = assigned.len(), "Partitions assigned");
        for tp in assigned {
            self.partitions.entry(tp.partition).or_default();
        }
        if self.config.partition_revoke_optimization {
            self.locker.claim(assigned).await;
        }
        if let Some(watermarks) = &self.broker_watermarks {
            if let Err(e) = watermarks.get().await {
                warn!(error = %e, "Broker watermark refresh failed on assign");
            }
        }
    }

    /// Partition revoke: flush (oldest first, when the lock optimization is
    /// on), destroy, release locks, and drop partition state.
    pub async fn on_revoke(&mut self, revoked: &[TopicPartition]) {
        let revoked_partitions: HashSet<i32> =
            revoked.iter().map(|tp| tp.partition).collect();

        let mut affected: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, manager)| {
                revoked_partitions.contains(&manager.topic_partition().partition)
            })
            .map(|(key, _)| key.clone())
            .collect();
        metrics::SESSIONS_REVOKED.set(affected.len() as i64);
        info!(
            partitions = revoked.len(),
            sessions = affected.len(),
            "Partitions revoked"
        );

        if self.config.partition_revoke_optimization {
            // Oldest buffers first: if the handover window closes early, the
            // data most at risk has already been flushed.
            affected.sort_by_key(|key| {
                self.sessions
                    .get(key)
                    .and_then(|m| m.oldest_timestamp())
                    .unwrap_or(u64::MAX)
            });
            for key in &affected {
                if let Some(manager) = self.sessions.get_mut(key) {
                    if let Err(e) = manager.flush(FlushReason::PartitionShutdown).await {
                        warn!(
                            session = %key,
                            error = %e,
                            "Revoke-time flush failed; new owner will replay"
                        );
                    }
                }
            }
        }

        for key in &affected {
            if let Some(mut manager) = self.sessions.remove(key) {
                manager.destroy().await;
            }
        }

        for tp in revoked {
            self.marks.revoke(tp).await;
            self.partitions.remove(&tp.partition);
        }
        if self.config.partition_revoke_optimization {
            self.locker.release(revoked).await;
        }
        metrics::SESSIONS_HANDLED.set(self.sessions.len() as i64);
    }

    /// Stop the worker: flush and destroy every session as if all partitions
    /// were revoked, then release all locks.
    pub async fn stop(&mut self) {
        if matches!(self.state, ConsumerState::Stopping | ConsumerState::Stopped) {
            return;
        }
        self.state = ConsumerState::Stopping;
        info!(sessions = self.sessions.len(), "Consumer stopping");

        let mut keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        keys.sort_by_key(|key| {
            self.sessions
                .get(key)
                .and_then(|m| m.oldest_timestamp())
                .unwrap_or(u64::MAX)
        });
        for key in &keys {
            if let Some(manager) = self.sessions.get_mut(key) {
                if let Err(e) = manager.flush(FlushReason::ProcessStop).await {
                    warn!(session = %key, error = %e, "Stop-time flush failed");
                }
            }
            if let Some(mut manager) = self.sessions.remove(key) {
                manager.destroy().await;
            }
        }

        let held: Vec<TopicPartition> = self
            .partitions
            .keys()
            .map(|&partition| TopicPartition::new(self.config.topic.clone(), partition))
            .collect();
        if self.config.partition_revoke_optimization {
            self.locker.release(&held).await;
        }
        for tp in &held {
            self.marks.revoke(tp).await;
        }
        self.partitions.clear();
        metrics::SESSIONS_HANDLED.set(0);

        self.state = ConsumerState::Stopped;
        info!("Consumer stopped");
    }

    /// Export per-partition lag gauges from the broker watermark refresher.
    async fn export_lag(&self) {
        let Some(watermarks) = &self.broker_watermarks else {
            return;
        };
        let high_offsets = match watermarks.get().await {
            Ok(map) => map,
            Err(e) => {
                debug!(error = %e, "Broker watermarks unavailable for lag export");
                return;
            }
        };

        let now = now_ms();
        for (&partition, state) in &self.partitions {
            let label = partition.to_string();
            if let (Some(&high), Some(last)) =
                (high_offsets.get(&partition), state.last_offset)
            {
                let lag = high.saturating_sub(last + 1);
                metrics::LAG_MESSAGES
                    .with_label_values(&[&label])
                    .set(lag as i64);
            }
            if let Some(ts) = state.last_timestamp_ms {
                metrics::LAG_MILLISECONDS
                    .with_label_values(&[&label])
                    .set(now.saturating_sub(ts) as i64);
            }
        }
    }
}

fn drop_event(record: &ConsumedRecord, cause: DropCause) {
    metrics::EVENTS_DROPPED
        .with_label_values(&[cause.as_label()])
        .inc();
    debug!(
        topic = %record.topic,
        partition = record.partition,
        offset = record.offset,
        cause = %cause,
        "Dropped record"
    );
}
