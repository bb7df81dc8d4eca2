//! Kafka plumbing around the bus-agnostic consumer.
//!
//! The `RecordingConsumer` never talks to Kafka directly: this module owns
//! the `StreamConsumer`, converts fetched messages into [`ConsumedRecord`]s,
//! implements the commit and publish seams, and forwards rebalance callbacks
//! as [`RebalanceEvent`]s over a channel.
//!
//! Rebalance callbacks run on rdkafka's background thread, so they only
//! enqueue events; the drive loop applies them between batches. That
//! serializes `assign`/`revoke` with batch processing - a revoke is never
//! interleaved with an in-flight batch of the revoked partition. The window
//! where librdkafka has already moved the partition while our revoke event
//! is still queued is covered by the partition locks and high-water marks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use rewind_core::{ConsumedRecord, TopicPartition};

use crate::committer::OffsetCommitter;
use crate::config::IngestConfig;
use crate::consumer::{BrokerWatermarks, RecordingConsumer};
use crate::error::{Error, Result};
use crate::refresher::{BackgroundRefresher, LoaderFuture};
use crate::replay_events::EventPublisher;

/// A partition assignment change forwarded from the rebalance callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assign(Vec<TopicPartition>),
    Revoke(Vec<TopicPartition>),
}

fn tpl_to_partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

/// Consumer context that forwards rebalances to the drive loop.
pub struct IngestContext {
    rebalances: mpsc::UnboundedSender<RebalanceEvent>,
}

impl IngestContext {
    pub fn new(rebalances: mpsc::UnboundedSender<RebalanceEvent>) -> Self {
        Self { rebalances }
    }
}

impl ClientContext for IngestContext {}

impl ConsumerContext for IngestContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = tpl_to_partitions(tpl);
                info!(partitions = partitions.len(), "Rebalance: assign");
                let _ = self.rebalances.send(RebalanceEvent::Assign(partitions));
            }
            Rebalance::Revoke(tpl) => {
                let partitions = tpl_to_partitions(tpl);
                info!(partitions = partitions.len(), "Rebalance: revoke");
                let _ = self.rebalances.send(RebalanceEvent::Revoke(partitions));
            }
            Rebalance::Error(e) => {
                // Non-assign/revoke rebalance errors do not stop ingestion.
                warn!(error = %e, "Rebalance error");
            }
        }
    }
}

pub type IngestStreamConsumer = StreamConsumer<IngestContext>;

/// Build the client configuration for the snapshot consumer.
pub fn consumer_client_config(brokers: &str, config: &IngestConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", brokers)
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", "earliest")
        .set("fetch.max.bytes", config.consumption_max_bytes.to_string())
        .set(
            "max.partition.fetch.bytes",
            config.consumption_max_bytes_per_partition.to_string(),
        )
        .set("queued.min.messages", config.kafka_queue_size.to_string())
        .set(
            "fetch.wait.max.ms",
            config.consumption_max_wait_ms.to_string(),
        )
        .set("session.timeout.ms", "30000");
    client_config
}

/// Create the subscribed stream consumer and the rebalance event channel.
pub fn create_consumer(
    brokers: &str,
    config: &IngestConfig,
) -> Result<(
    Arc<IngestStreamConsumer>,
    mpsc::UnboundedReceiver<RebalanceEvent>,
)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let consumer: IngestStreamConsumer =
        consumer_client_config(brokers, config).create_with_context(IngestContext::new(tx))?;
    consumer.subscribe(&[&config.topic])?;
    Ok((Arc::new(consumer), rx))
}

/// Create the producer for the replay-events topic.
pub fn create_producer(brokers: &str) -> Result<FutureProducer> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "10000")
        .create()?;
    Ok(producer)
}

fn to_consumed(msg: &BorrowedMessage<'_>) -> ConsumedRecord {
    ConsumedRecord {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset().max(0) as u64,
        timestamp_ms: msg.timestamp().to_millis().and_then(|ts| {
            if ts >= 0 {
                Some(ts as u64)
            } else {
                None
            }
        }),
        key: msg.key().map(Bytes::copy_from_slice),
        payload: msg.payload().map(Bytes::copy_from_slice),
    }
}

/// Manual, synchronous offset commits against the consumer group.
pub struct KafkaOffsetCommitter {
    consumer: Arc<IngestStreamConsumer>,
}

impl KafkaOffsetCommitter {
    pub fn new(consumer: Arc<IngestStreamConsumer>) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl OffsetCommitter for KafkaOffsetCommitter {
    async fn commit(&self, tp: &TopicPartition, next_offset: u64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(next_offset as i64))
            .map_err(|e| Error::Commit(e.to_string()))?;
        self.consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Sync)
            .map_err(|e| Error::Commit(e.to_string()))
    }
}

/// Publisher for the downstream replay-events topic.
pub struct KafkaEventPublisher {
    producer: FutureProducer,
}

impl KafkaEventPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload.as_ref());
        self.producer
            .send(record, Duration::from_secs(10))
            .await
            .map(|_| ())
            .map_err(|(e, _)| Error::Publish(e.to_string()))
    }
}

/// Broker high-offset refresher feeding the lag gauges.
pub fn broker_watermarks(
    consumer: Arc<IngestStreamConsumer>,
    topic: String,
    interval: Duration,
) -> BrokerWatermarks {
    let loader = move || -> LoaderFuture<Arc<HashMap<i32, u64>>> {
        let consumer = consumer.clone();
        let topic = topic.clone();
        Box::pin(async move {
            let map = tokio::task::spawn_blocking(move || -> Result<HashMap<i32, u64>> {
                let assignment = consumer.assignment()?;
                let mut map = HashMap::new();
                for elem in assignment.elements() {
                    if elem.topic() != topic {
                        continue;
                    }
                    let (_, high) = consumer.fetch_watermarks(
                        elem.topic(),
                        elem.partition(),
                        Duration::from_secs(5),
                    )?;
                    map.insert(elem.partition(), high.max(0) as u64);
                }
                Ok(map)
            })
            .await
            .map_err(|e| Error::Refresh(e.to_string()))??;
            Ok(Arc::new(map))
        })
    };
    BackgroundRefresher::new("broker-watermarks", interval, loader)
}

/// Drive the consumer until shutdown: collect batches, interleave rebalance
/// events between them, and stop cleanly when `shutdown` flips.
pub async fn run_loop(
    consumer: Arc<IngestStreamConsumer>,
    mut rebalances: mpsc::UnboundedReceiver<RebalanceEvent>,
    mut recording: RecordingConsumer,
    config: Arc<IngestConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    recording.start();
    let batch_timeout = Duration::from_millis(config.batching_timeout_ms);

    loop {
        // Rebalance events are applied only here, between batches.
        while let Ok(event) = rebalances.try_recv() {
            apply_rebalance(&mut recording, event).await;
        }
        if *shutdown.borrow() {
            break;
        }

        let mut batch: Vec<ConsumedRecord> = Vec::with_capacity(config.batch_size);
        let mut pending_rebalance = None;
        let deadline = tokio::time::sleep(batch_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = rebalances.recv() => {
                    // Finish the batch first; the event applies right after.
                    pending_rebalance = event;
                    break;
                }
                _ = &mut deadline => break,
                result = consumer.recv() => match result {
                    Ok(msg) => {
                        batch.push(to_consumed(&msg));
                        if batch.len() >= config.batch_size {
                            break;
                        }
                    }
                    Err(KafkaError::MessageConsumption(RDKafkaErrorCode::Fatal)) => {
                        error!("Fatal consumer error; stopping");
                        recording.stop().await;
                        return Err(KafkaError::MessageConsumption(
                            RDKafkaErrorCode::Fatal,
                        )
                        .into());
                    }
                    Err(e) => {
                        warn!(error = %e, "Consumer poll error");
                    }
                },
            }
        }

        if !batch.is_empty() {
            if let Err(e) = recording.handle_batch(batch).await {
                // The uncommitted tail of the batch is re-processed; the
                // high-water marks make that idempotent.
                error!(error = %e, "Batch processing failed; will be re-processed");
            }
        }
        if let Some(event) = pending_rebalance {
            apply_rebalance(&mut recording, event).await;
        }
    }

    info!("Shutdown requested; stopping consumer");
    recording.stop().await;
    consumer.unsubscribe();
    Ok(())
}

async fn apply_rebalance(recording: &mut RecordingConsumer, event: RebalanceEvent) {
    match event {
        RebalanceEvent::Assign(partitions) => recording.on_assign(&partitions).await,
        RebalanceEvent::Revoke(partitions) => recording.on_revoke(&partitions).await,
    }
}
