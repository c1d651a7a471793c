//! Shared test harness: replicas wired to one in-memory store.
//!
//! Builds the same component graph as the binary, but against
//! `MemoryStore` and `ManualClock` so escalation, lease expiry, and
//! pending-entry idle times move on demand instead of by sleeping.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use replywatch_core::clock::{Clock, ManualClock};
use replywatch_core::event::TimeoutEvent;
use replywatch_core::store::{MemoryStore, TimeoutStore};
use replywatch_daemon::consumer::EventConsumer;
use replywatch_daemon::detector::TimeoutDetector;
use replywatch_daemon::index::TimeoutIndex;
use replywatch_daemon::leader::LeaderElector;
use replywatch_daemon::metrics::{MetricsRegistry, SharedMetrics};
use replywatch_daemon::sink::{NotificationSink, SinkError};

/// Base interval N used throughout the scenario tests, in ms.
pub const N: i64 = 1_000;

/// Lease TTL used by test electors.
pub const LEASE_TTL: Duration = Duration::from_secs(10);

/// Consumer group name used by the tests.
pub const GROUP: &str = "timeout-processors";

/// Sink that records deliveries and can be switched to fail.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<TimeoutEvent>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes future deliveries fail (or succeed again).
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Everything delivered so far, in order.
    pub fn delivered(&self) -> Vec<TimeoutEvent> {
        self.delivered.lock().unwrap().clone()
    }

    /// Levels delivered for one conversation, in order.
    pub fn levels_for(&self, conversation_id: &str) -> Vec<u8> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .map(|e| e.level.as_u8())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, event: &TimeoutEvent) -> Result<(), SinkError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::new("sink unavailable"));
        }
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// One replica's component graph over a shared store and clock.
pub struct TestReplica {
    pub metrics: SharedMetrics,
    pub index: TimeoutIndex,
    pub leader: Arc<LeaderElector>,
    pub detector: TimeoutDetector,
    pub consumer: Arc<EventConsumer>,
    pub sink: Arc<RecordingSink>,
}

impl TestReplica {
    /// Builds a replica named `pod_id` over the shared store and clock.
    pub fn new(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>, pod_id: &str) -> Self {
        let metrics = Arc::new(MetricsRegistry::new().expect("metrics registry"));
        let service = metrics.service().clone();
        let store: Arc<dyn TimeoutStore> = Arc::clone(store) as Arc<dyn TimeoutStore>;

        let index = TimeoutIndex::new(Arc::clone(&store), service.clone());
        let leader = Arc::new(LeaderElector::new(
            Arc::clone(&store),
            service.clone(),
            pod_id,
            LEASE_TTL,
            Duration::from_secs(5),
        ));
        let detector_clock: Arc<dyn Clock> = Arc::clone(clock) as Arc<dyn Clock>;
        let detector = TimeoutDetector::new(
            Arc::clone(&store),
            Arc::clone(&leader),
            detector_clock,
            service.clone(),
            N,
            Duration::from_millis(100),
        );
        let sink = RecordingSink::new();
        let consumer = Arc::new(
            EventConsumer::new(
                Arc::clone(&store),
                Arc::clone(&sink) as Arc<dyn NotificationSink>,
                service,
                GROUP,
                format!("consumer-{pod_id}"),
            )
            .with_read_block(Duration::ZERO),
        );

        Self {
            metrics,
            index,
            leader,
            detector,
            consumer,
            sink,
        }
    }
}

/// A fresh shared world: store, clock, and one replica.
pub fn world(pod_id: &str) -> (Arc<MemoryStore>, Arc<ManualClock>, TestReplica) {
    let clock = ManualClock::new(0);
    let store_clock: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
    let store = Arc::new(MemoryStore::with_clock(store_clock));
    let replica = TestReplica::new(&store, &clock, pod_id);
    (store, clock, replica)
}
