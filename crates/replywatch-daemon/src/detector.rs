//! Leader-gated timeout detector.
//!
//! Every check interval the leading replica scans the waiting index for
//! entries whose basis lies in the past, decides the newly-due escalation
//! level per conversation, publishes an event to the stream, and then
//! records the published level. Publish-before-state-update means a crash
//! between the two writes redelivers the event on the next pass; the
//! notification sink's `(conversation_id, level)` idempotence absorbs the
//! duplicate.
//!
//! The detector reads the leadership hint only - a stale hint at worst
//! produces a concurrent pass on another replica, which the monotone
//! level guard renders harmless.

use std::sync::Arc;
use std::time::{Duration, Instant};

use replywatch_core::clock::Clock;
use replywatch_core::event::{EscalationLevel, TimeoutEvent};
use replywatch_core::store::{StoreError, TimeoutStore};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::leader::LeaderElector;
use crate::metrics::ServiceMetrics;

/// Scans the waiting index and publishes newly-due timeout events.
pub struct TimeoutDetector {
    store: Arc<dyn TimeoutStore>,
    leader: Arc<LeaderElector>,
    clock: Arc<dyn Clock>,
    metrics: ServiceMetrics,
    timeout_interval_ms: i64,
    check_interval: Duration,
}

impl TimeoutDetector {
    /// Creates a detector.
    #[must_use]
    pub fn new(
        store: Arc<dyn TimeoutStore>,
        leader: Arc<LeaderElector>,
        clock: Arc<dyn Clock>,
        metrics: ServiceMetrics,
        timeout_interval_ms: i64,
        check_interval: Duration,
    ) -> Self {
        Self {
            store,
            leader,
            clock,
            metrics,
            timeout_interval_ms,
            check_interval,
        }
    }

    /// Runs one detection pass. Returns the number of events published.
    ///
    /// # Errors
    ///
    /// Returns the store error when the range scan fails; the whole pass
    /// is aborted and retried at the next tick. Per-conversation failures
    /// do not abort the pass.
    pub async fn run_pass(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let due = self.store.due_before(now).await?;
        self.metrics.set_waiting(due.len() as u64);

        let mut published = 0;
        for (conversation_id, basis_ms) in due {
            if self
                .process_conversation(&conversation_id, basis_ms, now)
                .await
            {
                published += 1;
            }
        }
        Ok(published)
    }

    /// Decides and publishes the newly-due level for one conversation.
    /// Returns whether an event was published.
    async fn process_conversation(&self, conversation_id: &str, basis_ms: i64, now: i64) -> bool {
        let current = match self.store.level(conversation_id).await {
            Ok(level) => level,
            Err(err) => {
                error!(
                    conversation_id,
                    error = %err,
                    "failed to get notification state"
                );
                return false;
            },
        };

        let wait_ms = now - basis_ms;
        let Some(level) =
            EscalationLevel::next_due(wait_ms, current, self.timeout_interval_ms)
        else {
            return false;
        };

        let event = TimeoutEvent {
            conversation_id: conversation_id.to_string(),
            level,
            agent_message_time: basis_ms,
            detected_at: now,
            attempt: 1,
        };

        // Publish first: losing the event is worse than duplicating it.
        let entry_id = match self.store.append_event(&event).await {
            Ok(id) => id,
            Err(err) => {
                error!(
                    conversation_id,
                    level = %level,
                    error = %err,
                    "failed to publish timeout event"
                );
                return false;
            },
        };

        // State failure here leaves a duplicate window for the next pass;
        // the sink's (conversation_id, level) idempotence covers it.
        if let Err(err) = self.store.set_level(conversation_id, level).await {
            error!(
                conversation_id,
                level = %level,
                error = %err,
                "failed to update notification state"
            );
        }

        debug!(
            conversation_id,
            level = %level,
            wait_time_ms = wait_ms,
            entry_id = %entry_id,
            "published timeout event"
        );
        true
    }

    /// Runs the detection loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            timeout_interval_ms = self.timeout_interval_ms,
            "starting timeout detection loop"
        );
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.leader.is_leader_hint() {
                        continue;
                    }
                    let start = Instant::now();
                    if let Err(err) = self.run_pass().await {
                        error!(error = %err, "timeout detection pass failed");
                    }
                    self.metrics.observe_check(start.elapsed().as_secs_f64());
                }
                _ = shutdown.changed() => {
                    debug!("timeout detector stopping");
                    return;
                }
            }
        }
    }
}
