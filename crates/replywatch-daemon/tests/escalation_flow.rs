//! End-to-end escalation scenarios against the in-memory store.
//!
//! The manual clock drives the ladder: ticks are explicit `run_pass`
//! calls at chosen instants, and the consumer drains the stream after
//! each pass.

mod common;

use replywatch_core::event::{AgentMessage, CustomerResponse, EscalationLevel};
use replywatch_core::store::TimeoutStore;

use common::{N, TestReplica, world};

fn agent_message(conversation_id: &str, timestamp_ms: i64) -> AgentMessage {
    AgentMessage {
        conversation_id: conversation_id.to_string(),
        agent_id: "agent_456".to_string(),
        message_id: "msg_789".to_string(),
        timestamp_ms,
    }
}

fn customer_response(conversation_id: &str, timestamp_ms: i64) -> CustomerResponse {
    CustomerResponse {
        conversation_id: conversation_id.to_string(),
        customer_id: "customer_123".to_string(),
        message_id: "msg_999".to_string(),
        timestamp_ms,
    }
}

async fn become_leader(replica: &TestReplica) {
    replica.leader.election_round().await;
    assert!(replica.leader.is_leader_hint());
}

#[tokio::test]
async fn test_basic_escalation_ladder() {
    let (store, clock, replica) = world("pod-a");
    become_leader(&replica).await;
    replica.consumer.init().await.unwrap();

    replica.index.track_agent_message(&agent_message("convA", 0)).await.unwrap();

    // t = N: not yet due, strictly-greater boundary.
    clock.set(N);
    assert_eq!(replica.detector.run_pass().await.unwrap(), 0);

    // t = N + 1: level 1.
    clock.set(N + 1);
    assert_eq!(replica.detector.run_pass().await.unwrap(), 1);
    assert_eq!(
        replica.index.notification_level("convA").await.unwrap(),
        EscalationLevel::Level1
    );

    // Same instant again: the published level guards re-publication.
    assert_eq!(replica.detector.run_pass().await.unwrap(), 0);

    // t = 2N + 1: level 2; t = 3N + 1: level 3.
    clock.set(2 * N + 1);
    assert_eq!(replica.detector.run_pass().await.unwrap(), 1);
    clock.set(3 * N + 1);
    assert_eq!(replica.detector.run_pass().await.unwrap(), 1);
    assert_eq!(
        replica.index.notification_level("convA").await.unwrap(),
        EscalationLevel::Level3
    );

    // Far beyond: the ladder is exhausted.
    clock.set(10 * N);
    assert_eq!(replica.detector.run_pass().await.unwrap(), 0);

    // Drain the stream: three events, strictly increasing levels.
    while replica.consumer.poll_once().await.unwrap() > 0 {}
    assert_eq!(replica.sink.levels_for("convA"), vec![1, 2, 3]);

    let delivered = replica.sink.delivered();
    assert!(delivered.iter().all(|e| e.agent_message_time == 0));
    assert!(delivered.iter().all(|e| e.attempt == 1));
    assert_eq!(store.stream_len(), 3);
}

#[tokio::test]
async fn test_customer_response_cancels_escalation() {
    let (store, clock, replica) = world("pod-a");
    become_leader(&replica).await;
    replica.consumer.init().await.unwrap();

    replica.index.track_agent_message(&agent_message("convB", 0)).await.unwrap();

    clock.set(N + 1);
    assert_eq!(replica.detector.run_pass().await.unwrap(), 1);

    // Customer answers at t = 1200: tracking and state both go.
    clock.set(1_200);
    replica
        .index
        .clear_on_customer_response(&customer_response("convB", 1_200))
        .await
        .unwrap();
    assert_eq!(replica.index.waiting_count().await.unwrap(), 0);
    assert_eq!(
        replica.index.notification_level("convB").await.unwrap(),
        EscalationLevel::None
    );

    // Later passes find nothing.
    clock.set(5 * N);
    assert_eq!(replica.detector.run_pass().await.unwrap(), 0);
    assert_eq!(store.stream_len(), 1);
}

#[tokio::test]
async fn test_retrack_resets_the_ladder() {
    let (store, clock, replica) = world("pod-a");
    become_leader(&replica).await;
    replica.consumer.init().await.unwrap();

    replica.index.track_agent_message(&agent_message("convC", 0)).await.unwrap();

    clock.set(N + 1);
    replica.detector.run_pass().await.unwrap();
    clock.set(2 * N + 1);
    replica.detector.run_pass().await.unwrap();
    assert_eq!(
        replica.index.notification_level("convC").await.unwrap(),
        EscalationLevel::Level2
    );

    // A new agent message at t = 2500 resets basis and level.
    clock.set(2_500);
    replica
        .index
        .track_agent_message(&agent_message("convC", 2_500))
        .await
        .unwrap();
    assert_eq!(store.waiting_basis("convC"), Some(2_500));
    assert_eq!(
        replica.index.notification_level("convC").await.unwrap(),
        EscalationLevel::None
    );

    // t = 3502: a fresh ladder starts at level 1, not level 3.
    clock.set(3_502);
    assert_eq!(replica.detector.run_pass().await.unwrap(), 1);

    while replica.consumer.poll_once().await.unwrap() > 0 {}
    assert_eq!(replica.sink.levels_for("convC"), vec![1, 2, 1]);
}

#[tokio::test]
async fn test_stale_conversation_jumps_to_level_three() {
    let (store, clock, replica) = world("pod-a");
    become_leader(&replica).await;
    replica.consumer.init().await.unwrap();

    replica.index.track_agent_message(&agent_message("convD", 0)).await.unwrap();

    // Discovered long past 3N with nothing published: one event, level 3.
    clock.set(7 * N);
    assert_eq!(replica.detector.run_pass().await.unwrap(), 1);
    assert_eq!(store.stream_len(), 1);

    while replica.consumer.poll_once().await.unwrap() > 0 {}
    assert_eq!(replica.sink.levels_for("convD"), vec![3]);
}

#[tokio::test]
async fn test_concurrent_detectors_publish_once() {
    let (store, clock, replica_a) = world("pod-a");
    let replica_b = TestReplica::new(&store, &clock, "pod-b");
    become_leader(&replica_a).await;
    replica_a.consumer.init().await.unwrap();

    replica_a
        .index
        .track_agent_message(&agent_message("convE", 0))
        .await
        .unwrap();

    // Two replicas believe they lead during a lease transition. run_pass
    // is deliberately not lease-checked; the state guard must hold alone.
    clock.set(N + 1);
    let published_a = replica_a.detector.run_pass().await.unwrap();
    let published_b = replica_b.detector.run_pass().await.unwrap();
    assert_eq!(published_a + published_b, 1);
    assert_eq!(store.stream_len(), 1);
}

#[tokio::test]
async fn test_detector_ignores_conversations_without_leadership_claim() {
    // The loop gates on the hint; a follower's ticks never scan. Here we
    // assert the hint stays false without an election round.
    let (_store, _clock, replica) = world("pod-a");
    assert!(!replica.leader.is_leader_hint());
}

#[tokio::test]
async fn test_track_overwrites_basis_and_clears_state() {
    let (store, _clock, replica) = world("pod-a");

    replica.index.track_agent_message(&agent_message("conv1", 100)).await.unwrap();
    replica.index.track_agent_message(&agent_message("conv1", 250)).await.unwrap();

    assert_eq!(store.waiting_basis("conv1"), Some(250));
    assert_eq!(replica.index.waiting_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_clear_on_idle_conversation_is_a_noop() {
    let (_store, _clock, replica) = world("pod-a");

    replica
        .index
        .clear_on_customer_response(&customer_response("ghost", 10))
        .await
        .unwrap();
    assert_eq!(replica.index.waiting_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cleanup_prunes_abandoned_conversations() {
    use std::time::Duration;

    use replywatch_core::clock::Clock;
    use replywatch_daemon::index::CleanupTask;

    let (store, clock, replica) = world("pod-a");

    let day_ms: i64 = 24 * 3_600 * 1_000;
    replica.index.track_agent_message(&agent_message("stale", 0)).await.unwrap();
    store.set_level("stale", EscalationLevel::Level2).await.unwrap();
    replica
        .index
        .track_agent_message(&agent_message("fresh", day_ms))
        .await
        .unwrap();

    // Win the lease after the jump: cleanup verifies leadership against
    // the store, and any earlier lease would have expired by now.
    clock.set(day_ms + 1);
    become_leader(&replica).await;

    let clock_dyn: std::sync::Arc<dyn Clock> = std::sync::Arc::clone(&clock) as std::sync::Arc<dyn Clock>;
    let cleanup = CleanupTask::new(
        replica.index.clone(),
        std::sync::Arc::clone(&replica.leader),
        clock_dyn,
        Duration::from_secs(3_600),
        day_ms,
    );

    assert_eq!(cleanup.run_once().await.unwrap(), 1);
    assert_eq!(store.waiting_basis("stale"), None);
    assert_eq!(store.waiting_basis("fresh"), Some(day_ms));
    // The escalation state goes with the waiting entry.
    assert_eq!(
        replica.index.notification_level("stale").await.unwrap(),
        EscalationLevel::None
    );
}
