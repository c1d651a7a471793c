//! Event consumer: at-least-once processing of the timeout stream.
//!
//! Every replica reads its share of the consumer group and delivers
//! events to the notification sink. Acknowledgment happens only after
//! successful delivery, so a crashed or failing consumer leaves entries
//! pending; the recovery loop claims entries idle past a threshold and
//! runs them through the same processing path.
//!
//! Unparseable entries are acknowledged immediately (poison-pill policy):
//! a malformed entry can never succeed, and leaving it pending would
//! head-of-line block recovery forever.

use std::sync::Arc;
use std::time::{Duration, Instant};

use replywatch_core::config::{CONSUMER_BATCH, CONSUMER_BLOCK, RECOVERY_MIN_IDLE};
use replywatch_core::event::TimeoutEvent;
use replywatch_core::store::{StoreError, StreamEntry, TimeoutStore};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::metrics::{
    STATUS_NOTIFICATION_ERROR, STATUS_PARSE_ERROR, STATUS_SUCCESS, ServiceMetrics,
};
use crate::sink::NotificationSink;

/// Consumer-group reader plus pending-entry recovery.
pub struct EventConsumer {
    store: Arc<dyn TimeoutStore>,
    sink: Arc<dyn NotificationSink>,
    metrics: ServiceMetrics,
    group: String,
    consumer_name: String,
    batch: usize,
    read_block: Duration,
    min_idle: Duration,
}

impl EventConsumer {
    /// Creates a consumer for this replica.
    #[must_use]
    pub fn new(
        store: Arc<dyn TimeoutStore>,
        sink: Arc<dyn NotificationSink>,
        metrics: ServiceMetrics,
        group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sink,
            metrics,
            group: group.into(),
            consumer_name: consumer_name.into(),
            batch: CONSUMER_BATCH,
            read_block: CONSUMER_BLOCK,
            min_idle: RECOVERY_MIN_IDLE,
        }
    }

    /// Overrides the server-side block timeout for group reads.
    #[must_use]
    pub const fn with_read_block(mut self, read_block: Duration) -> Self {
        self.read_block = read_block;
        self
    }

    /// Overrides the minimum idle time before pending entries are
    /// claimed.
    #[must_use]
    pub const fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Creates the consumer group if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Propagates store errors; an already-existing group is not one.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.store.ensure_group(&self.group).await?;
        info!(consumer_group = %self.group, "consumer group ready");
        Ok(())
    }

    /// Reads and processes one batch. Returns the number of entries read.
    ///
    /// # Errors
    ///
    /// Returns the store error when the group read fails. Per-entry
    /// failures are absorbed: they either poison-ack or stay pending.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let entries = self
            .store
            .read_group(&self.group, &self.consumer_name, self.batch, self.read_block)
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        for entry in &entries {
            self.process_entry(entry).await;
        }
        self.metrics
            .observe_stream_processing(start.elapsed().as_secs_f64());
        Ok(entries.len())
    }

    /// Claims and processes entries orphaned by crashed consumers.
    /// Returns the number of entries claimed.
    ///
    /// # Errors
    ///
    /// Returns the store error when the pending query or the claim fails.
    pub async fn recover_once(&self) -> Result<usize, StoreError> {
        let pending = self.store.pending_count(&self.group).await?;
        if pending == 0 {
            return Ok(0);
        }

        info!(pending_count = pending, "processing pending messages");

        let claimed = self
            .store
            .claim_idle(&self.group, &self.consumer_name, self.min_idle, self.batch)
            .await?;
        for entry in &claimed {
            self.process_entry(entry).await;
        }
        Ok(claimed.len())
    }

    /// Processes one entry through parse, deliver, acknowledge.
    async fn process_entry(&self, entry: &StreamEntry) {
        let start = Instant::now();

        let event = match TimeoutEvent::from_fields(&entry.fields) {
            Ok(event) => event,
            Err(err) => {
                error!(
                    entry_id = %entry.id,
                    error = %err,
                    "failed to parse timeout event"
                );
                self.metrics.message_processed(STATUS_PARSE_ERROR);
                // Poison-pill: parse failures are permanent, drop the entry.
                self.ack_entry(&entry.id).await;
                return;
            },
        };

        if let Err(err) = self.sink.deliver(&event).await {
            error!(
                conversation_id = %event.conversation_id,
                level = %event.level,
                entry_id = %entry.id,
                error = %err,
                "failed to send notification"
            );
            self.metrics.message_processed(STATUS_NOTIFICATION_ERROR);
            // Not acknowledged: stays pending for redelivery.
            return;
        }

        self.ack_entry(&entry.id).await;
        self.metrics.message_processed(STATUS_SUCCESS);
        self.metrics.notification_sent(event.level);
        self.metrics
            .observe_store_op("process_message", start.elapsed().as_secs_f64());

        debug!(
            conversation_id = %event.conversation_id,
            level = %event.level,
            entry_id = %entry.id,
            "processed timeout event"
        );
    }

    async fn ack_entry(&self, entry_id: &str) {
        if let Err(err) = self.store.ack(&self.group, entry_id).await {
            error!(entry_id = %entry_id, error = %err, "failed to acknowledge message");
        }
    }

    /// Runs the consume loop until shutdown.
    ///
    /// The group read blocks server-side, so the loop needs no ticker;
    /// a failed read is paced to avoid hammering an unreachable store.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(consumer_name = %self.consumer_name, "starting stream consumer");

        loop {
            tokio::select! {
                result = self.poll_once() => {
                    if let Err(err) = result {
                        error!(error = %err, "failed to read from stream");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                _ = shutdown.changed() => {
                    debug!("stream consumer stopping");
                    return;
                }
            }
        }
    }

    /// Runs the pending-recovery loop until shutdown.
    pub async fn run_recovery(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would race group creation; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.recover_once().await {
                        error!(error = %err, "failed to recover pending messages");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("recovery loop stopping");
                    return;
                }
            }
        }
    }
}
