//! Store abstraction for fleet coordination.
//!
//! All shared mutable state lives in the store: the waiting index, the
//! notification-state map, the leader lease, and the event stream. The
//! [`TimeoutStore`] trait captures the exact capability set the service
//! needs - ordered-map range/upsert/remove, hash get/set/delete,
//! conditional set with TTL plus CAS-scripted refresh, and an append
//! stream with consumer groups and idle-claim - so an in-memory
//! implementation can drive every test without a broker.
//!
//! Key names are part of the deployed contract and shared across replicas
//! regardless of which replica wrote them.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{EscalationLevel, TimeoutEvent};

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Sorted set of waiting conversations; score = deadline basis in ms.
pub const WAITING_CONVERSATIONS_KEY: &str = "waiting_conversations";

/// Hash of conversation id to published escalation level.
pub const NOTIFICATION_STATES_KEY: &str = "notification_states";

/// Leader lease key; value = holder pod id, expires with the lease TTL.
pub const LEADER_KEY: &str = "timeout:leader";

/// Stream of published timeout events.
pub const TIMEOUT_EVENTS_STREAM: &str = "timeout_events";

/// Errors surfaced by store operations.
///
/// Logical absence (missing member, empty hash field, no lease holder) is
/// never an error; these variants cover transport failures and responses
/// the client cannot interpret. The store performs no retries - callers
/// decide whether to retry at their own cadence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store was unreachable or the connection failed mid-operation.
    #[error("store transport error: {0}")]
    Transport(String),

    /// The store answered, but not in the shape the client expected.
    #[error("unexpected store response: {0}")]
    UnexpectedResponse(String),
}

/// A raw stream entry: server-assigned id plus field pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Server-assigned monotone entry id.
    pub id: String,
    /// Field name/value pairs as written by the producer.
    pub fields: Vec<(String, String)>,
}

/// The capability set the timeout pipeline requires of its shared store.
///
/// Mutations are atomic per call: `track` and `clear` batch their two key
/// writes so no observer sees the waiting index and the notification state
/// disagree after a successful call. Nothing here is transactional across
/// calls.
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Upserts the waiting entry for a conversation and clears any
    /// published escalation state in the same batch.
    async fn track(&self, conversation_id: &str, basis_ms: i64) -> Result<(), StoreError>;

    /// Removes a conversation from the waiting index and clears its
    /// escalation state in the same batch. Missing keys are not errors.
    async fn clear(&self, conversation_id: &str) -> Result<(), StoreError>;

    /// Number of conversations currently waiting.
    async fn waiting_count(&self) -> Result<u64, StoreError>;

    /// All waiting entries with basis `<= max_ms`, ascending by basis.
    async fn due_before(&self, max_ms: i64) -> Result<Vec<(String, i64)>, StoreError>;

    /// Published escalation level for a conversation; absent means
    /// [`EscalationLevel::None`].
    async fn level(&self, conversation_id: &str) -> Result<EscalationLevel, StoreError>;

    /// Records the published escalation level for a conversation.
    async fn set_level(
        &self,
        conversation_id: &str,
        level: EscalationLevel,
    ) -> Result<(), StoreError>;

    /// Removes waiting entries with basis strictly below `cutoff_ms`,
    /// together with their escalation state. Returns the number of
    /// waiting entries removed.
    async fn remove_older_than(&self, cutoff_ms: i64) -> Result<u64, StoreError>;

    /// Attempts to take the leader lease for `holder`. Succeeds only when
    /// no live lease exists. Returns whether the lease was acquired.
    async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Extends the lease iff `holder` still owns it (compare-and-set on
    /// the holder value). Returns whether the lease was extended.
    async fn renew_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Deletes the lease iff `holder` still owns it. Returns whether the
    /// lease was released.
    async fn release_lease(&self, holder: &str) -> Result<bool, StoreError>;

    /// Current lease holder, if any.
    async fn lease_holder(&self) -> Result<Option<String>, StoreError>;

    /// Creates the consumer group at the stream tail, creating the stream
    /// if needed. Succeeds when the group already exists.
    async fn ensure_group(&self, group: &str) -> Result<(), StoreError>;

    /// Appends a timeout event to the stream. Returns the assigned id.
    async fn append_event(&self, event: &TimeoutEvent) -> Result<String, StoreError>;

    /// Reads up to `count` new entries for `consumer` from the group,
    /// blocking server-side up to `block`. An empty read is `Ok(vec![])`.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Acknowledges an entry as processed by the group.
    async fn ack(&self, group: &str, entry_id: &str) -> Result<(), StoreError>;

    /// Number of delivered-but-unacknowledged entries in the group.
    async fn pending_count(&self, group: &str) -> Result<u64, StoreError>;

    /// Atomically reassigns up to `count` pending entries idle at least
    /// `min_idle` to `consumer`, bumping their delivery counts.
    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;
}
