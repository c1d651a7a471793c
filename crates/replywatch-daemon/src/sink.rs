//! Notification sink: the injected downstream delivery capability.
//!
//! The consumer delivers every timeout event through a [`NotificationSink`].
//! Delivery is at-least-once - duplicates can reach the sink across leader
//! transitions and redeliveries - so implementations MUST be idempotent on
//! `(conversation_id, level)`.

use async_trait::async_trait;
use replywatch_core::event::TimeoutEvent;
use thiserror::Error;
use tracing::info;

/// A failed delivery. The triggering entry stays pending and is
/// redelivered by the recovery loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct SinkError(String);

impl SinkError {
    /// Creates a delivery error with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Downstream delivery of timeout notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Delivers one timeout event.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when delivery fails; the caller leaves the
    /// originating stream entry unacknowledged.
    async fn deliver(&self, event: &TimeoutEvent) -> Result<(), SinkError>;
}

/// Sink that records deliveries in the log only.
///
/// Stands in for the notification service, which is deployed separately.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, event: &TimeoutEvent) -> Result<(), SinkError> {
        info!(
            conversation_id = %event.conversation_id,
            level = %event.level,
            detected_at = event.detected_at,
            attempt = event.attempt,
            "sending timeout notification"
        );
        Ok(())
    }
}
