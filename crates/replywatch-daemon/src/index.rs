//! Timeout index: ingress-facing operations on the waiting state.
//!
//! A thin layer over the store that adds logging and per-operation
//! latency metrics. Any replica serves these operations; nothing here is
//! leader-gated except the cleanup task, which prunes abandoned entries.
//!
//! Store errors propagate unchanged - the HTTP layer turns them into 500s
//! and loop callers log and retry at their own cadence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use replywatch_core::clock::Clock;
use replywatch_core::event::{AgentMessage, CustomerResponse, EscalationLevel};
use replywatch_core::store::{StoreError, TimeoutStore};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::leader::LeaderElector;
use crate::metrics::ServiceMetrics;

/// Ingress-facing operations on the waiting index and notification state.
#[derive(Clone)]
pub struct TimeoutIndex {
    store: Arc<dyn TimeoutStore>,
    metrics: ServiceMetrics,
}

impl TimeoutIndex {
    /// Creates an index over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn TimeoutStore>, metrics: ServiceMetrics) -> Self {
        Self { store, metrics }
    }

    /// Starts (or restarts) deadline tracking for a conversation.
    ///
    /// Upserts the waiting entry and clears any published escalation
    /// state in one batch: after success the conversation is back at
    /// level 0 and later detector passes re-escalate from scratch.
    ///
    /// # Errors
    ///
    /// Propagates store errors unchanged.
    pub async fn track_agent_message(&self, message: &AgentMessage) -> Result<(), StoreError> {
        let start = Instant::now();
        let result = self
            .store
            .track(&message.conversation_id, message.timestamp_ms)
            .await;
        self.metrics
            .observe_store_op("track_agent_message", start.elapsed().as_secs_f64());

        match &result {
            Ok(()) => debug!(
                conversation_id = %message.conversation_id,
                agent_id = %message.agent_id,
                timestamp_ms = message.timestamp_ms,
                "started tracking conversation timeout"
            ),
            Err(err) => error!(
                conversation_id = %message.conversation_id,
                error = %err,
                "failed to track agent message"
            ),
        }
        result
    }

    /// Cancels tracking when the customer responds.
    ///
    /// Idempotent: clearing an untracked conversation succeeds.
    ///
    /// # Errors
    ///
    /// Propagates store errors unchanged.
    pub async fn clear_on_customer_response(
        &self,
        response: &CustomerResponse,
    ) -> Result<(), StoreError> {
        let start = Instant::now();
        let result = self.store.clear(&response.conversation_id).await;
        self.metrics
            .observe_store_op("clear_timeout", start.elapsed().as_secs_f64());

        match &result {
            Ok(()) => debug!(
                conversation_id = %response.conversation_id,
                customer_id = %response.customer_id,
                "cleared conversation timeout"
            ),
            Err(err) => error!(
                conversation_id = %response.conversation_id,
                error = %err,
                "failed to clear timeout"
            ),
        }
        result
    }

    /// Number of conversations currently waiting.
    ///
    /// # Errors
    ///
    /// Propagates store errors unchanged.
    pub async fn waiting_count(&self) -> Result<u64, StoreError> {
        let start = Instant::now();
        let result = self.store.waiting_count().await;
        self.metrics
            .observe_store_op("get_waiting_count", start.elapsed().as_secs_f64());
        result
    }

    /// Published escalation level for a conversation; absent means none.
    ///
    /// # Errors
    ///
    /// Propagates store errors unchanged.
    pub async fn notification_level(
        &self,
        conversation_id: &str,
    ) -> Result<EscalationLevel, StoreError> {
        let start = Instant::now();
        let result = self.store.level(conversation_id).await;
        self.metrics
            .observe_store_op("get_notification_state", start.elapsed().as_secs_f64());
        result
    }

    /// Removes waiting entries older than `cutoff_ms` together with their
    /// escalation state. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Propagates store errors unchanged.
    pub async fn cleanup_older_than(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let start = Instant::now();
        let result = self.store.remove_older_than(cutoff_ms).await;
        self.metrics
            .observe_store_op("cleanup_expired", start.elapsed().as_secs_f64());

        if let Ok(removed) = &result {
            if *removed > 0 {
                info!(removed_count = removed, cutoff_ms, "cleaned up expired conversations");
            }
        }
        result
    }
}

/// Leader-gated maintenance task that prunes abandoned waiting entries.
pub struct CleanupTask {
    index: TimeoutIndex,
    leader: Arc<LeaderElector>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    max_age_ms: i64,
}

impl CleanupTask {
    /// Creates the cleanup task.
    #[must_use]
    pub fn new(
        index: TimeoutIndex,
        leader: Arc<LeaderElector>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        max_age_ms: i64,
    ) -> Self {
        Self {
            index,
            leader,
            clock,
            interval,
            max_age_ms,
        }
    }

    /// Runs one cleanup pass if this replica leads.
    ///
    /// Deleting waiting state is irreversible, so the gate is the
    /// store-verified leadership check, not the cached hint - a stale
    /// hint during a lease handover must not prune data.
    ///
    /// # Errors
    ///
    /// Propagates store errors unchanged; the loop logs and retries.
    pub async fn run_once(&self) -> Result<u64, StoreError> {
        if !self.leader.is_leader_verified().await {
            return Ok(0);
        }
        let cutoff = self.clock.now_ms() - self.max_age_ms;
        self.index.cleanup_older_than(cutoff).await
    }

    /// Runs the cleanup loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would race startup; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(error = %err, "cleanup pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("cleanup task stopping");
                    return;
                }
            }
        }
    }
}
