//! End-to-end pipeline tests against in-memory backends.
//!
//! These exercise the full consume -> buffer -> flush -> commit path and the
//! delivery guarantees: across a session's lifecycle, the concatenation of
//! its flushed objects contains every ingested event exactly once, and a
//! worker taking over a partition skips work the previous owner already
//! flushed.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use serde_json::json;

use rewind_core::{ConsumedRecord, TopicPartition, SNAPSHOT_EVENT};
use rewind_ingest::{
    IngestConfig, MemoryCommitter, MemoryPublisher, RecordingConsumer, ReplayEventsIngester,
    TeamRegistry,
};
use rewind_state::{
    HighWaterMarker, MemorySharedStore, PartitionLocker, RealtimeCache, RealtimeCacheConfig,
    SharedStore,
};

struct World {
    shared: Arc<MemorySharedStore>,
    object_store: Arc<InMemory>,
}

impl World {
    fn new() -> Self {
        Self {
            shared: Arc::new(MemorySharedStore::new()),
            object_store: Arc::new(InMemory::new()),
        }
    }

    /// Build a worker against this world's shared state.
    async fn worker(
        &self,
        name: &str,
        flush_size_bytes: u64,
    ) -> (RecordingConsumer, Arc<MemoryCommitter>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(IngestConfig {
            topic: "snapshots".to_string(),
            local_directory: dir.path().join("buffers").to_str().unwrap().to_string(),
            flush_size_bytes,
            flush_age_ms: 600_000,
            upload_retries: 1,
            ..Default::default()
        });
        let marks = Arc::new(HighWaterMarker::new(
            self.shared.clone() as Arc<dyn SharedStore>
        ));
        let locker = PartitionLocker::new(
            self.shared.clone() as Arc<dyn SharedStore>,
            name,
            Duration::from_secs(5),
        );
        let realtime = Arc::new(RealtimeCache::new(
            self.shared.clone() as Arc<dyn SharedStore>,
            RealtimeCacheConfig::default(),
        ));
        let teams = TeamRegistry::from_shared_store(
            self.shared.clone() as Arc<dyn SharedStore>,
            Duration::from_secs(60),
        );
        let committer = Arc::new(MemoryCommitter::new());
        let replay_events = ReplayEventsIngester::new(
            Arc::new(MemoryPublisher::new()),
            "session_replay_events",
            marks.clone(),
        );

        let mut consumer = RecordingConsumer::new(
            config,
            self.object_store.clone(),
            marks,
            locker,
            realtime,
            teams,
            committer.clone(),
            replay_events,
            None,
        )
        .await
        .unwrap();
        consumer.start();
        (consumer, committer, dir)
    }

    /// All flushed events per session, concatenated in `lowest_offset` order
    /// of the objects they were flushed in.
    async fn flushed_events_by_session(&self) -> HashMap<String, Vec<String>> {
        let metas = self
            .object_store
            .list(None)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();

        // (session, lowest_offset, key)
        let mut keys: Vec<(String, u64, String)> = metas
            .into_iter()
            .map(|meta| {
                let key = meta.location.to_string();
                let session = key
                    .split("session_id=")
                    .nth(1)
                    .and_then(|rest| rest.split('/').next())
                    .unwrap()
                    .to_string();
                let file = key.rsplit('/').next().unwrap();
                let lowest: u64 = file.split('-').next().unwrap().parse().unwrap();
                (session, lowest, key)
            })
            .collect();
        keys.sort();

        let mut result: HashMap<String, Vec<String>> = HashMap::new();
        for (session, _, key) in keys {
            let body = self
                .object_store
                .get(&object_store::path::Path::from(key.as_str()))
                .await
                .unwrap()
                .bytes()
                .await
                .unwrap();
            let mut decoder = GzDecoder::new(&body[..]);
            let mut content = String::new();
            decoder.read_to_string(&mut content).unwrap();

            let entry = result.entry(session).or_default();
            for line in content.lines() {
                let event: serde_json::Value = serde_json::from_str(line).unwrap();
                entry.push(event["data"].as_str().unwrap().to_string());
            }
        }
        result
    }
}

/// A snapshot record whose single event carries a unique `data` marker.
fn record(session: &str, partition: i32, offset: u64, timestamp_ms: u64) -> ConsumedRecord {
    let marker = format!("evt-{session}-{offset}");
    let data = json!({
        "event": SNAPSHOT_EVENT,
        "properties": {
            "$snapshot_items": [{"type": 3, "timestamp": timestamp_ms, "data": marker}],
            "$session_id": session,
            "$window_id": "w",
        }
    })
    .to_string();
    let envelope = json!({
        "team_id": 7,
        "distinct_id": "user",
        "data": data,
    })
    .to_string();

    ConsumedRecord {
        topic: "snapshots".to_string(),
        partition,
        offset,
        timestamp_ms: Some(timestamp_ms),
        key: Some(Bytes::from(session.to_string())),
        payload: Some(Bytes::from(envelope)),
    }
}

fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new("snapshots", partition)
}

#[tokio::test]
async fn test_steady_state_delivers_each_event_exactly_once() {
    let world = World::new();
    // Small threshold so sessions flush several times mid-stream.
    let (mut consumer, committer, _dir) = world.worker("worker-a", 150).await;

    // Two sessions interleaved on one partition plus one on another, over
    // three batches with contiguous offsets per partition.
    let mut p0_offset = 0u64;
    let mut p1_offset = 0u64;
    let mut expected: HashMap<String, Vec<String>> = HashMap::new();
    for batch_index in 0..3u64 {
        let mut batch = Vec::new();
        for i in 0..6u64 {
            let session = if i % 2 == 0 { "alpha" } else { "beta" };
            let ts = 1_000 + batch_index * 100 + i;
            batch.push(record(session, 0, p0_offset, ts));
            expected
                .entry(session.to_string())
                .or_default()
                .push(format!("evt-{session}-{p0_offset}"));
            p0_offset += 1;
        }
        for _ in 0..2u64 {
            let ts = 2_000 + batch_index * 100;
            batch.push(record("gamma", 1, p1_offset, ts));
            expected
                .entry("gamma".to_string())
                .or_default()
                .push(format!("evt-gamma-{p1_offset}"));
            p1_offset += 1;
        }
        consumer.handle_batch(batch).await.unwrap();
    }

    // Stop flushes whatever is still buffered.
    consumer.stop().await;

    let flushed = world.flushed_events_by_session().await;
    assert_eq!(flushed.len(), 3);
    for (session, events) in &expected {
        assert_eq!(
            flushed.get(session),
            Some(events),
            "session {session} must contain each event exactly once, in order"
        );
    }

    // Commits never ran past buffered work while it existed.
    let history = committer.history().await;
    assert!(!history.is_empty());
    for (tp_committed, offset) in &history {
        if tp_committed.partition == 0 {
            assert!(*offset <= p0_offset);
        } else {
            assert!(*offset <= p1_offset);
        }
    }
}

#[tokio::test]
async fn test_takeover_skips_previously_flushed_work() {
    let world = World::new();

    // Worker A flushes offsets 0..=2 of "solo" by size, then crashes without
    // a clean stop (no revoke, nothing released).
    let batch1: Vec<ConsumedRecord> =
        (0..3).map(|offset| record("solo", 0, offset, 1_000)).collect();
    {
        let (mut worker_a, committer_a, _dir) = world.worker("worker-a", 100).await;
        worker_a.handle_batch(batch1.clone()).await.unwrap();
        assert_eq!(committer_a.committed(&tp(0)).await, Some(3));
        drop(worker_a);
    }
    assert_eq!(world.flushed_events_by_session().await["solo"].len(), 3);

    // Worker B takes over and, as after a crash, re-reads the partition from
    // offset 0, then sees new data.
    let (mut worker_b, committer_b, _dir) = world.worker("worker-b", 1_000_000).await;
    let batch2: Vec<ConsumedRecord> =
        (3..5).map(|offset| record("solo", 0, offset, 2_000)).collect();
    worker_b.handle_batch(batch1).await.unwrap();
    worker_b.handle_batch(batch2).await.unwrap();
    worker_b.stop().await;

    // The replayed range produced no duplicate events.
    let flushed = world.flushed_events_by_session().await;
    assert_eq!(
        flushed["solo"],
        vec![
            "evt-solo-0".to_string(),
            "evt-solo-1".to_string(),
            "evt-solo-2".to_string(),
            "evt-solo-3".to_string(),
            "evt-solo-4".to_string(),
        ]
    );
    // Stop flushes without committing; the next start re-reads from 3 and
    // the marks drop everything already flushed.
    assert_eq!(committer_b.committed(&tp(0)).await, Some(3));
}
