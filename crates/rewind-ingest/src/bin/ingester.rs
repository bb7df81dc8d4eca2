//! Rewind Session-Recording Ingester Binary
//!
//! Standalone worker process: consumes snapshot batches from Kafka, flushes
//! session blobs to the object store, mirrors realtime tails into Redis, and
//! publishes replay summaries downstream.
//!
//! # Environment Variables
//!
//! - `KAFKA_HOSTS`: Kafka bootstrap servers (default: localhost:9092)
//! - `REDIS_URL`: shared cache (default: redis://127.0.0.1:6379)
//! - `SESSION_RECORDING_REDIS_PREFIX`: key namespace (default: @rewind/replay/)
//! - `OBJECT_STORAGE_BUCKET`: bucket for session blobs
//! - `AWS_REGION` / `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` /
//!   `AWS_ENDPOINT_URL`: object-store credentials (MinIO supported)
//! - `SESSION_RECORDING_KAFKA_TOPIC`: inbound topic
//! - `SESSION_RECORDING_KAFKA_GROUP_ID`: consumer group
//! - `KAFKA_CONSUMPTION_MAX_BYTES`, `KAFKA_CONSUMPTION_MAX_BYTES_PER_PARTITION`,
//!   `SESSION_RECORDING_KAFKA_QUEUE_SIZE`, `KAFKA_CONSUMPTION_MAX_WAIT_MS`,
//!   `SESSION_RECORDING_KAFKA_BATCH_SIZE`, `KAFKA_CONSUMPTION_BATCHING_TIMEOUT_MS`:
//!   fetch and batch shaping
//! - `SESSION_RECORDING_LOCAL_DIRECTORY`: temp-file root (purged on startup)
//! - `SESSION_RECORDING_PARTITION_REVOKE_OPTIMIZATION`: enable revoke-time
//!   flushing (default: true)
//! - `SESSION_RECORDING_MAX_BUFFER_AGE_MS`, `SESSION_RECORDING_MAX_BUFFER_SIZE_BYTES`:
//!   flush thresholds
//! - `METRICS_PORT`: exporter port (default: 8080)
//!
//! # Example
//!
//! ```bash
//! export KAFKA_HOSTS=localhost:9092
//! export REDIS_URL=redis://localhost:6379
//! export OBJECT_STORAGE_BUCKET=rewind-recordings
//! export AWS_ENDPOINT_URL=http://localhost:9000
//! cargo run --bin ingester
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use rewind_ingest::kafka::{
    broker_watermarks, create_consumer, create_producer, KafkaEventPublisher,
    KafkaOffsetCommitter,
};
use rewind_ingest::{IngestConfig, RecordingConsumer, ReplayEventsIngester, TeamRegistry};
use rewind_state::{
    HighWaterMarker, PartitionLocker, RealtimeCache, RealtimeCacheConfig, RedisSharedStore,
    SharedStore,
};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn config_from_env() -> IngestConfig {
    let mut config = IngestConfig::default();
    if let Ok(topic) = std::env::var("SESSION_RECORDING_KAFKA_TOPIC") {
        config.topic = topic;
    }
    if let Ok(group_id) = std::env::var("SESSION_RECORDING_KAFKA_GROUP_ID") {
        config.group_id = group_id;
    }
    if let Ok(bucket) = std::env::var("OBJECT_STORAGE_BUCKET") {
        config.bucket = bucket;
    }
    if let Some(v) = env_parse("KAFKA_CONSUMPTION_MAX_BYTES") {
        config.consumption_max_bytes = v;
    }
    if let Some(v) = env_parse("KAFKA_CONSUMPTION_MAX_BYTES_PER_PARTITION") {
        config.consumption_max_bytes_per_partition = v;
    }
    if let Some(v) = env_parse("SESSION_RECORDING_KAFKA_QUEUE_SIZE") {
        config.kafka_queue_size = v;
    }
    if let Some(v) = env_parse("KAFKA_CONSUMPTION_MAX_WAIT_MS") {
        config.consumption_max_wait_ms = v;
    }
    if let Some(v) = env_parse("SESSION_RECORDING_KAFKA_BATCH_SIZE") {
        config.batch_size = v;
    }
    if let Some(v) = env_parse("KAFKA_CONSUMPTION_BATCHING_TIMEOUT_MS") {
        config.batching_timeout_ms = v;
    }
    if let Ok(dir) = std::env::var("SESSION_RECORDING_LOCAL_DIRECTORY") {
        config.local_directory = dir;
    }
    if let Ok(prefix) = std::env::var("SESSION_RECORDING_REDIS_PREFIX") {
        config.redis_prefix = prefix;
    }
    if let Some(v) = env_parse("SESSION_RECORDING_PARTITION_REVOKE_OPTIMIZATION") {
        config.partition_revoke_optimization = v;
    }
    if let Some(v) = env_parse("SESSION_RECORDING_MAX_BUFFER_AGE_MS") {
        config.flush_age_ms = v;
    }
    if let Some(v) = env_parse("SESSION_RECORDING_MAX_BUFFER_SIZE_BYTES") {
        config.flush_size_bytes = v;
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    rewind_observability::metrics::init();

    let config = Arc::new(config_from_env());
    let brokers = env_or("KAFKA_HOSTS", "localhost:9092");
    let redis_url = env_or("REDIS_URL", "redis://127.0.0.1:6379");
    let worker_id = env_or(
        "WORKER_ID",
        &format!("ingester-{}", std::process::id()),
    );

    info!("Rewind session-recording ingester starting");
    info!("  Kafka:  {} (topic {})", brokers, config.topic);
    info!("  Redis:  {}", redis_url);
    info!("  Bucket: {}", config.bucket);
    info!("  Worker: {}", worker_id);

    // Shared cache
    let shared: Arc<dyn SharedStore> = Arc::new(
        RedisSharedStore::connect(&redis_url, config.redis_prefix.clone()).await?,
    );
    info!("Shared cache connected");

    // Object store
    let object_store: Arc<dyn ObjectStore> = Arc::new(
        AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_allow_http(true)
            .build()?,
    );
    info!("Object store connected (bucket: {})", config.bucket);

    // Kafka
    let (stream_consumer, rebalances) = create_consumer(&brokers, &config)?;
    let producer = create_producer(&brokers)?;
    info!("Kafka consumer subscribed");

    // Coordination components
    let marks = Arc::new(HighWaterMarker::new(shared.clone()));
    let locker = PartitionLocker::new(
        shared.clone(),
        worker_id.clone(),
        Duration::from_secs(config.lock_ttl_secs),
    );
    let realtime = Arc::new(RealtimeCache::new(
        shared.clone(),
        RealtimeCacheConfig {
            max_tail_events: config.realtime_tail_events,
            ttl: Duration::from_secs(config.realtime_ttl_secs),
            ..Default::default()
        },
    ));
    let teams = TeamRegistry::from_shared_store(
        shared.clone(),
        Duration::from_secs(config.team_refresh_secs),
    );
    let committer = Arc::new(KafkaOffsetCommitter::new(stream_consumer.clone()));
    let replay_events = ReplayEventsIngester::new(
        Arc::new(KafkaEventPublisher::new(producer)),
        config.replay_events_topic.clone(),
        marks.clone(),
    );
    let watermarks = broker_watermarks(
        stream_consumer.clone(),
        config.topic.clone(),
        Duration::from_secs(30),
    );

    let recording = RecordingConsumer::new(
        config.clone(),
        object_store,
        marks,
        locker,
        realtime,
        teams,
        committer,
        replay_events,
        Some(watermarks),
    )
    .await?;

    // Metrics exporter
    let metrics_port: u16 = env_parse("METRICS_PORT").unwrap_or(8080);
    let running = Arc::new(AtomicBool::new(true));
    let ready = {
        let running = running.clone();
        Arc::new(move || running.load(Ordering::Relaxed)) as Arc<dyn Fn() -> bool + Send + Sync>
    };
    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{metrics_port}").parse().expect("valid addr");
        if let Err(e) = rewind_observability::exporter::serve(addr, ready).await {
            error!(error = %e, "Metrics exporter failed");
        }
    });
    info!("Metrics exporter on port {}", metrics_port);

    // Graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                running.store(false, Ordering::Relaxed);
                let _ = shutdown_tx.send(true);
            }
        });
    }

    rewind_ingest::kafka::run_loop(
        stream_consumer,
        rebalances,
        recording,
        config,
        shutdown_rx,
    )
    .await?;

    info!("Ingester stopped");
    Ok(())
}
