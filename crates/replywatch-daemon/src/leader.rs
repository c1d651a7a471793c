//! Leader election over the shared store lease.
//!
//! Exactly one replica should run the detector at a time. Replicas race a
//! conditional set-with-TTL on the lease key every election interval; the
//! holder refreshes the TTL with a compare-and-set script and steps down
//! automatically when the lease expires. Brief dual-leader windows around
//! expiry are tolerated by the detector's monotone state guard.
//!
//! The local `is_leader` flag is a hint written only by the election loop.
//! The detection hot path reads the hint; anything externally observable
//! (health and status endpoints) must use [`LeaderElector::is_leader_verified`],
//! which re-checks the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use replywatch_core::store::TimeoutStore;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::ServiceMetrics;

/// Lease-based leader elector.
pub struct LeaderElector {
    store: Arc<dyn TimeoutStore>,
    metrics: ServiceMetrics,
    pod_id: String,
    ttl: Duration,
    election_interval: Duration,
    is_leader: AtomicBool,
}

impl LeaderElector {
    /// Creates an elector for this replica.
    #[must_use]
    pub fn new(
        store: Arc<dyn TimeoutStore>,
        metrics: ServiceMetrics,
        pod_id: impl Into<String>,
        ttl: Duration,
        election_interval: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            pod_id: pod_id.into(),
            ttl,
            election_interval,
            is_leader: AtomicBool::new(false),
        }
    }

    /// This replica's identity.
    #[must_use]
    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    /// Cached leadership hint. Cheap, but may lag the store by up to one
    /// election interval; never use it for externally observable claims.
    #[must_use]
    pub fn is_leader_hint(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// Leadership verified against the store.
    ///
    /// Reconciles the hint with the lease key and logs transitions. A
    /// store error demotes the hint: claiming leadership while blind is
    /// worse than a missed detector tick.
    pub async fn is_leader_verified(&self) -> bool {
        let holder = match self.store.lease_holder().await {
            Ok(holder) => holder,
            Err(err) => {
                error!(error = %err, "failed to read lease holder");
                self.is_leader.store(false, Ordering::Relaxed);
                return false;
            },
        };

        let actual = holder.as_deref() == Some(self.pod_id.as_str());
        let hinted = self.is_leader.swap(actual, Ordering::Relaxed);
        if hinted != actual {
            if actual {
                info!("confirmed leadership from store");
            } else {
                info!("leadership lost - lease not held");
            }
        }
        actual
    }

    /// Runs one election round: try to acquire, reconcile, renew.
    pub async fn election_round(&self) {
        let start = Instant::now();

        match self.store.acquire_lease(&self.pod_id, self.ttl).await {
            Ok(true) => {
                if !self.is_leader.swap(true, Ordering::Relaxed) {
                    info!(pod_id = %self.pod_id, "became leader");
                    self.metrics.leader_change();
                }
                self.renew().await;
            },
            Ok(false) => {
                // Someone holds the lease; it may still be us.
                match self.store.lease_holder().await {
                    Ok(Some(holder)) if holder == self.pod_id => {
                        self.is_leader.store(true, Ordering::Relaxed);
                        self.renew().await;
                    },
                    Ok(_) => {
                        if self.is_leader.swap(false, Ordering::Relaxed) {
                            info!("lost leadership");
                        }
                    },
                    Err(err) => {
                        error!(error = %err, "failed to read lease holder");
                        self.is_leader.store(false, Ordering::Relaxed);
                    },
                }
            },
            Err(err) => {
                error!(error = %err, "failed to attempt leader election");
            },
        }

        self.metrics.observe_election(start.elapsed().as_secs_f64());
    }

    async fn renew(&self) {
        match self.store.renew_lease(&self.pod_id, self.ttl).await {
            Ok(true) => {},
            Ok(false) => {
                warn!("leadership renewal failed - no longer leader");
                self.is_leader.store(false, Ordering::Relaxed);
            },
            Err(err) => {
                error!(error = %err, "failed to renew leadership");
                self.is_leader.store(false, Ordering::Relaxed);
            },
        }
    }

    /// Releases the lease if held. Best effort: on failure the TTL
    /// expires the lease anyway.
    pub async fn resign(&self) {
        match self.store.release_lease(&self.pod_id).await {
            Ok(true) => info!("resigned leadership"),
            Ok(false) => debug!("resign skipped - lease not held"),
            Err(err) => error!(error = %err, "failed to resign leadership"),
        }
        self.is_leader.store(false, Ordering::Relaxed);
    }

    /// Runs the election loop until shutdown, then resigns.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(pod_id = %self.pod_id, "starting leader election loop");
        let mut ticker = tokio::time::interval(self.election_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.election_round().await;
                }
                _ = shutdown.changed() => {
                    self.resign().await;
                    return;
                }
            }
        }
    }
}
