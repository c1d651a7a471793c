//! Prometheus metrics for the daemon.
//!
//! # Metric Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `waiting_conversations_count` | Gauge | - |
//! | `timeout_notifications_sent_total` | Counter | `level` |
//! | `timeout_leader_changes_total` | Counter | - |
//! | `timeout_check_duration_seconds` | Histogram | - |
//! | `redis_operation_duration_seconds` | Histogram | `operation` |
//! | `leader_election_duration_seconds` | Histogram | - |
//! | `stream_processing_duration_seconds` | Histogram | - |
//! | `stream_messages_processed_total` | Counter | `status` |
//!
//! All metrics use interior mutability; [`ServiceMetrics`] is `Clone` and
//! safe to hand to every task. The registry encodes to Prometheus text
//! format for the `/metrics` endpoints.

use std::sync::Arc;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use replywatch_core::event::EscalationLevel;
use thiserror::Error;

/// `status` label value for successfully processed stream entries.
pub const STATUS_SUCCESS: &str = "success";

/// `status` label value for entries acknowledged as unparseable.
pub const STATUS_PARSE_ERROR: &str = "parse_error";

/// `status` label value for entries whose notification delivery failed.
pub const STATUS_NOTIFICATION_ERROR: &str = "notification_error";

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Service metrics handed to every task.
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Conversations currently waiting for a customer response.
    waiting_conversations: Gauge,

    /// Timeout notifications delivered, labeled by `level`.
    notifications_sent: CounterVec,

    /// Leadership acquisitions observed by this replica.
    leader_changes: Counter,

    /// Duration of a full detector pass.
    check_duration: Histogram,

    /// Duration of individual store operations, labeled by `operation`.
    store_op_duration: HistogramVec,

    /// Duration of a lease acquisition round.
    election_duration: Histogram,

    /// Duration of processing one consumed batch.
    stream_processing_duration: Histogram,

    /// Consumed stream entries, labeled by `status`.
    messages_processed: CounterVec,
}

impl ServiceMetrics {
    /// Creates the metric families and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g. a duplicate
    /// name in the same registry).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let waiting_conversations = Gauge::with_opts(Opts::new(
            "waiting_conversations_count",
            "Current number of conversations waiting for customer response",
        ))?;
        registry.register(Box::new(waiting_conversations.clone()))?;

        let notifications_sent = CounterVec::new(
            Opts::new(
                "timeout_notifications_sent_total",
                "Total number of timeout notifications sent",
            ),
            &["level"],
        )?;
        registry.register(Box::new(notifications_sent.clone()))?;

        let leader_changes = Counter::with_opts(Opts::new(
            "timeout_leader_changes_total",
            "Total number of leader changes",
        ))?;
        registry.register(Box::new(leader_changes.clone()))?;

        let check_duration = Histogram::with_opts(HistogramOpts::new(
            "timeout_check_duration_seconds",
            "Time taken to check all timeouts",
        ))?;
        registry.register(Box::new(check_duration.clone()))?;

        let store_op_duration = HistogramVec::new(
            HistogramOpts::new(
                "redis_operation_duration_seconds",
                "Time taken for store operations",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(store_op_duration.clone()))?;

        let election_duration = Histogram::with_opts(HistogramOpts::new(
            "leader_election_duration_seconds",
            "Time taken for leader election operations",
        ))?;
        registry.register(Box::new(election_duration.clone()))?;

        let stream_processing_duration = Histogram::with_opts(HistogramOpts::new(
            "stream_processing_duration_seconds",
            "Time taken to process stream messages",
        ))?;
        registry.register(Box::new(stream_processing_duration.clone()))?;

        let messages_processed = CounterVec::new(
            Opts::new(
                "stream_messages_processed_total",
                "Total number of stream messages processed",
            ),
            &["status"],
        )?;
        registry.register(Box::new(messages_processed.clone()))?;

        Ok(Self {
            waiting_conversations,
            notifications_sent,
            leader_changes,
            check_duration,
            store_op_duration,
            election_duration,
            stream_processing_duration,
            messages_processed,
        })
    }

    /// Sets the waiting-conversations gauge.
    #[allow(clippy::cast_precision_loss)] // gauge resolution is fine for counts
    pub fn set_waiting(&self, count: u64) {
        self.waiting_conversations.set(count as f64);
    }

    /// Records a delivered notification at `level`.
    pub fn notification_sent(&self, level: EscalationLevel) {
        self.notifications_sent
            .with_label_values(&[level.metric_label()])
            .inc();
    }

    /// Records this replica gaining leadership.
    pub fn leader_change(&self) {
        self.leader_changes.inc();
    }

    /// Records the duration of a detector pass.
    pub fn observe_check(&self, seconds: f64) {
        self.check_duration.observe(seconds);
    }

    /// Records the duration of a store operation.
    pub fn observe_store_op(&self, operation: &str, seconds: f64) {
        self.store_op_duration
            .with_label_values(&[operation])
            .observe(seconds);
    }

    /// Records the duration of a lease acquisition round.
    pub fn observe_election(&self, seconds: f64) {
        self.election_duration.observe(seconds);
    }

    /// Records the duration of processing one consumed batch.
    pub fn observe_stream_processing(&self, seconds: f64) {
        self.stream_processing_duration.observe(seconds);
    }

    /// Records the outcome of one consumed stream entry.
    pub fn message_processed(&self, status: &str) {
        self.messages_processed.with_label_values(&[status]).inc();
    }

    /// Current value of the `status`-labeled processed counter. Test
    /// support.
    #[must_use]
    pub fn messages_processed_count(&self, status: &str) -> f64 {
        self.messages_processed.with_label_values(&[status]).get()
    }

    /// Current value of the per-level notification counter. Test support.
    #[must_use]
    pub fn notifications_sent_count(&self, level: EscalationLevel) -> f64 {
        self.notifications_sent
            .with_label_values(&[level.metric_label()])
            .get()
    }
}

/// Owns the Prometheus registry plus the service metric families.
pub struct MetricsRegistry {
    registry: Registry,
    service: ServiceMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all service metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let service = ServiceMetrics::new(&registry)?;
        Ok(Self { registry, service })
    }

    /// The service metric families.
    #[must_use]
    pub fn service(&self) -> &ServiceMetrics {
        &self.service
    }

    /// Encodes all registered metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or produces invalid UTF-8.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared handle to the metrics registry.
pub type SharedMetrics = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetrics> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_encodes_all_families() {
        let registry = MetricsRegistry::new().unwrap();
        let service = registry.service();

        service.set_waiting(3);
        service.notification_sent(EscalationLevel::Level1);
        service.leader_change();
        service.observe_check(0.01);
        service.observe_store_op("track_agent_message", 0.002);
        service.message_processed(STATUS_SUCCESS);

        let text = registry.encode_text().unwrap();
        assert!(text.contains("waiting_conversations_count 3"));
        assert!(text.contains("timeout_notifications_sent_total{level=\"level1\"} 1"));
        assert!(text.contains("timeout_leader_changes_total 1"));
        assert!(text.contains("stream_messages_processed_total{status=\"success\"} 1"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        ServiceMetrics::new(&registry).unwrap();
        assert!(matches!(
            ServiceMetrics::new(&registry),
            Err(MetricsError::RegistrationFailed(_))
        ));
    }
}
