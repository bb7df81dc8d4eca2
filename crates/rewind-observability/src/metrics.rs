use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, Histogram, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Ingestion Metrics
    // ============================================================================

    /// Messages received from the snapshot topic
    pub static ref MESSAGES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("rewind_messages_received_total", "Messages received from the snapshot topic"),
        &["partition"]
    ).expect("metric can be created");

    /// Events dropped before buffering, by cause
    pub static ref EVENTS_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("rewind_events_dropped_total", "Events dropped before buffering"),
        &["cause"]
    ).expect("metric can be created");

    /// Batch size in messages
    pub static ref BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new("rewind_batch_size", "Consumed batch size in messages")
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0])
    ).expect("metric can be created");

    // ============================================================================
    // Session Metrics
    // ============================================================================

    /// Live session managers in this worker
    pub static ref SESSIONS_HANDLED: IntGauge = IntGauge::new(
        "rewind_sessions_handled",
        "Live session managers in this worker"
    ).expect("metric can be created");

    /// Sessions destroyed by the most recent partition revoke
    pub static ref SESSIONS_REVOKED: IntGauge = IntGauge::new(
        "rewind_sessions_revoked",
        "Sessions destroyed by the most recent partition revoke"
    ).expect("metric can be created");

    /// Sessions with a realtime tail being mirrored
    pub static ref REALTIME_SESSIONS: IntGauge = IntGauge::new(
        "rewind_realtime_sessions",
        "Sessions with a realtime tail being mirrored"
    ).expect("metric can be created");

    /// Session buffer flushes, by reason
    pub static ref SESSION_FLUSHES: IntCounterVec = IntCounterVec::new(
        Opts::new("rewind_session_flushes_total", "Session buffer flushes"),
        &["reason"]
    ).expect("metric can be created");

    /// Session buffer flush failures, by reason
    pub static ref FLUSH_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("rewind_flush_errors_total", "Session buffer flush failures"),
        &["reason"]
    ).expect("metric can be created");

    // ============================================================================
    // Offset Metrics
    // ============================================================================

    /// Consumer lag in messages, by partition
    pub static ref LAG_MESSAGES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("rewind_lag_messages", "Consumer lag in messages"),
        &["partition"]
    ).expect("metric can be created");

    /// Consumer lag in milliseconds, by partition
    pub static ref LAG_MILLISECONDS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("rewind_lag_milliseconds", "Consumer lag in milliseconds"),
        &["partition"]
    ).expect("metric can be created");

    /// Last committed offset, by partition
    pub static ref LAST_COMMITTED_OFFSET: IntGaugeVec = IntGaugeVec::new(
        Opts::new("rewind_last_committed_offset", "Last committed offset"),
        &["partition"]
    ).expect("metric can be created");

    /// Offset commit failures, by partition
    pub static ref COMMIT_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("rewind_commit_failures_total", "Offset commit failures"),
        &["partition"]
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(MESSAGES_RECEIVED.clone()))
            .expect("messages_received can be registered");
        REGISTRY
            .register(Box::new(EVENTS_DROPPED.clone()))
            .expect("events_dropped can be registered");
        REGISTRY
            .register(Box::new(BATCH_SIZE.clone()))
            .expect("batch_size can be registered");
        REGISTRY
            .register(Box::new(SESSIONS_HANDLED.clone()))
            .expect("sessions_handled can be registered");
        REGISTRY
            .register(Box::new(SESSIONS_REVOKED.clone()))
            .expect("sessions_revoked can be registered");
        REGISTRY
            .register(Box::new(REALTIME_SESSIONS.clone()))
            .expect("realtime_sessions can be registered");
        REGISTRY
            .register(Box::new(SESSION_FLUSHES.clone()))
            .expect("session_flushes can be registered");
        REGISTRY
            .register(Box::new(FLUSH_ERRORS.clone()))
            .expect("flush_errors can be registered");
        REGISTRY
            .register(Box::new(LAG_MESSAGES.clone()))
            .expect("lag_messages can be registered");
        REGISTRY
            .register(Box::new(LAG_MILLISECONDS.clone()))
            .expect("lag_milliseconds can be registered");
        REGISTRY
            .register(Box::new(LAST_COMMITTED_OFFSET.clone()))
            .expect("last_committed_offset can be registered");
        REGISTRY
            .register(Box::new(COMMIT_FAILURES.clone()))
            .expect("commit_failures can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        init();
        // Calling twice must not panic
        init();
    }

    #[test]
    fn test_received_and_dropped_counters() {
        MESSAGES_RECEIVED.with_label_values(&["97"]).inc();
        EVENTS_DROPPED
            .with_label_values(&["test_cause"])
            .inc_by(3);

        assert_eq!(MESSAGES_RECEIVED.with_label_values(&["97"]).get(), 1);
        assert_eq!(EVENTS_DROPPED.with_label_values(&["test_cause"]).get(), 3);
    }

    #[test]
    fn test_lag_gauges() {
        LAG_MESSAGES.with_label_values(&["98"]).set(1000);
        LAG_MILLISECONDS.with_label_values(&["98"]).set(2500);

        assert_eq!(LAG_MESSAGES.with_label_values(&["98"]).get(), 1000);
        assert_eq!(LAG_MILLISECONDS.with_label_values(&["98"]).get(), 2500);
    }

    #[test]
    fn test_flush_counters() {
        SESSION_FLUSHES.with_label_values(&["test_reason"]).inc();
        FLUSH_ERRORS.with_label_values(&["test_reason"]).inc();

        assert_eq!(SESSION_FLUSHES.with_label_values(&["test_reason"]).get(), 1);
        assert_eq!(FLUSH_ERRORS.with_label_values(&["test_reason"]).get(), 1);
    }
}
