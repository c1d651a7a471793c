//! In-memory [`TimeoutStore`] for tests.
//!
//! Mirrors the store semantics the service relies on: batched paired
//! writes, lazy lease expiry against the injected clock, and a stream
//! with consumer-group bookkeeping (delivery cursor, pending entries with
//! idle times and delivery counts, atomic idle-claim). Every integration
//! test runs against this implementation; nothing here talks to a
//! network.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{StoreError, StreamEntry, TimeoutStore};
use crate::clock::{Clock, SystemClock};
use crate::event::{EscalationLevel, TimeoutEvent};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at_ms: i64,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    delivered_at_ms: i64,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next stream entry to deliver to `>` readers.
    cursor: usize,
    /// Delivered-but-unacked entries, keyed by stream index.
    pending: BTreeMap<usize, PendingEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    waiting: HashMap<String, i64>,
    levels: HashMap<String, u8>,
    lease: Option<Lease>,
    stream: Vec<StreamEntry>,
    last_id_ms: i64,
    last_id_seq: u64,
    groups: HashMap<String, GroupState>,
}

/// Mutex-guarded in-memory store.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a store driven by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a store driven by the given clock. Tests pass a manual
    /// clock so lease expiry and pending idle times move on demand.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Appends a raw entry with arbitrary fields, bypassing the event
    /// encoder. Test support for malformed-entry scenarios.
    pub fn append_raw(&self, fields: Vec<(String, String)>) -> String {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let id = inner.next_entry_id(now);
        inner.stream.push(StreamEntry {
            id: id.clone(),
            fields,
        });
        id
    }

    /// Total number of entries ever appended to the stream.
    #[must_use]
    pub fn stream_len(&self) -> usize {
        self.lock().stream.len()
    }

    /// Deadline basis currently recorded for a conversation, if any.
    #[must_use]
    pub fn waiting_basis(&self, conversation_id: &str) -> Option<i64> {
        self.lock().waiting.get(conversation_id).copied()
    }

    /// Delivery count the group has recorded for an entry, if pending.
    #[must_use]
    pub fn delivery_count(&self, group: &str, entry_id: &str) -> Option<u64> {
        let inner = self.lock();
        let index = inner.stream.iter().position(|e| e.id == entry_id)?;
        inner
            .groups
            .get(group)
            .and_then(|g| g.pending.get(&index))
            .map(|p| p.delivery_count)
    }
}

impl Inner {
    fn next_entry_id(&mut self, now_ms: i64) -> String {
        if now_ms > self.last_id_ms {
            self.last_id_ms = now_ms;
            self.last_id_seq = 0;
        } else {
            self.last_id_seq += 1;
        }
        format!("{}-{}", self.last_id_ms, self.last_id_seq)
    }

    fn live_lease(&mut self, now_ms: i64) -> Option<&Lease> {
        if let Some(lease) = &self.lease {
            if lease.expires_at_ms <= now_ms {
                self.lease = None;
            }
        }
        self.lease.as_ref()
    }
}

#[allow(clippy::cast_possible_wrap)] // durations in this store are far below i64::MAX ms
fn ttl_ms(ttl: Duration) -> i64 {
    ttl.as_millis() as i64
}

#[async_trait]
impl TimeoutStore for MemoryStore {
    async fn track(&self, conversation_id: &str, basis_ms: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.waiting.insert(conversation_id.to_string(), basis_ms);
        inner.levels.remove(conversation_id);
        Ok(())
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.waiting.remove(conversation_id);
        inner.levels.remove(conversation_id);
        Ok(())
    }

    async fn waiting_count(&self) -> Result<u64, StoreError> {
        Ok(self.lock().waiting.len() as u64)
    }

    async fn due_before(&self, max_ms: i64) -> Result<Vec<(String, i64)>, StoreError> {
        let inner = self.lock();
        let mut due: Vec<(String, i64)> = inner
            .waiting
            .iter()
            .filter(|(_, &basis)| basis >= 0 && basis <= max_ms)
            .map(|(id, &basis)| (id.clone(), basis))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(due)
    }

    async fn level(&self, conversation_id: &str) -> Result<EscalationLevel, StoreError> {
        match self.lock().levels.get(conversation_id) {
            None => Ok(EscalationLevel::None),
            Some(&raw) => EscalationLevel::try_from(raw)
                .map_err(|e| StoreError::UnexpectedResponse(e.to_string())),
        }
    }

    async fn set_level(
        &self,
        conversation_id: &str,
        level: EscalationLevel,
    ) -> Result<(), StoreError> {
        self.lock()
            .levels
            .insert(conversation_id.to_string(), level.as_u8());
        Ok(())
    }

    async fn remove_older_than(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .waiting
            .iter()
            .filter(|(_, &basis)| basis < cutoff_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.waiting.remove(id);
            inner.levels.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        if inner.live_lease(now).is_some() {
            return Ok(false);
        }
        inner.lease = Some(Lease {
            holder: holder.to_string(),
            expires_at_ms: now + ttl_ms(ttl),
        });
        Ok(true)
    }

    async fn renew_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let renewed = matches!(inner.live_lease(now), Some(lease) if lease.holder == holder);
        if renewed {
            if let Some(lease) = inner.lease.as_mut() {
                lease.expires_at_ms = now + ttl_ms(ttl);
            }
        }
        Ok(renewed)
    }

    async fn release_lease(&self, holder: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let owned = matches!(inner.live_lease(now), Some(lease) if lease.holder == holder);
        if owned {
            inner.lease = None;
        }
        Ok(owned)
    }

    async fn lease_holder(&self) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        Ok(inner.live_lease(now).map(|l| l.holder.clone()))
    }

    async fn ensure_group(&self, group: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let tail = inner.stream.len();
        inner
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                cursor: tail,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn append_event(&self, event: &TimeoutEvent) -> Result<String, StoreError> {
        Ok(self.append_raw(event.to_fields()))
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let started = Instant::now();
        loop {
            {
                let now = self.clock.now_ms();
                let mut inner = self.lock();
                let Inner { stream, groups, .. } = &mut *inner;
                let state = groups.get_mut(group).ok_or_else(|| {
                    StoreError::UnexpectedResponse(format!("no such group: {group}"))
                })?;

                if state.cursor < stream.len() {
                    let take = (stream.len() - state.cursor).min(count.max(1));
                    let mut delivered = Vec::with_capacity(take);
                    for offset in 0..take {
                        let index = state.cursor + offset;
                        state.pending.insert(
                            index,
                            PendingEntry {
                                consumer: consumer.to_string(),
                                delivered_at_ms: now,
                                delivery_count: 1,
                            },
                        );
                        delivered.push(stream[index].clone());
                    }
                    state.cursor += take;
                    return Ok(delivered);
                }
            }

            if started.elapsed() >= block {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, group: &str, entry_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let Some(index) = inner.stream.iter().position(|e| e.id == entry_id) else {
            return Ok(());
        };
        if let Some(state) = inner.groups.get_mut(group) {
            state.pending.remove(&index);
        }
        Ok(())
    }

    async fn pending_count(&self, group: &str) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .groups
            .get(group)
            .map_or(0, |state| state.pending.len() as u64))
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let Inner { stream, groups, .. } = &mut *inner;
        let Some(state) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for (&index, pending) in &mut state.pending {
            if claimed.len() >= count {
                break;
            }
            if now - pending.delivered_at_ms < ttl_ms(min_idle) {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at_ms = now;
            pending.delivery_count += 1;
            claimed.push(stream[index].clone());
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = ManualClock::new(1_000_000);
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    fn event(conversation_id: &str, level: EscalationLevel) -> TimeoutEvent {
        TimeoutEvent {
            conversation_id: conversation_id.to_string(),
            level,
            agent_message_time: 0,
            detected_at: 1_000,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_track_upserts_and_clears_level() {
        let (_, store) = store();
        store.track("c1", 100).await.unwrap();
        store.set_level("c1", EscalationLevel::Level2).await.unwrap();

        store.track("c1", 200).await.unwrap();
        assert_eq!(store.waiting_basis("c1"), Some(200));
        assert_eq!(store.level("c1").await.unwrap(), EscalationLevel::None);
        assert_eq!(store.waiting_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (_, store) = store();
        store.clear("ghost").await.unwrap();
        store.track("c1", 100).await.unwrap();
        store.clear("c1").await.unwrap();
        store.clear("c1").await.unwrap();
        assert_eq!(store.waiting_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_due_before_orders_by_basis() {
        let (_, store) = store();
        store.track("late", 300).await.unwrap();
        store.track("early", 100).await.unwrap();
        store.track("future", 900).await.unwrap();

        let due = store.due_before(500).await.unwrap();
        assert_eq!(
            due,
            vec![("early".to_string(), 100), ("late".to_string(), 300)]
        );
    }

    #[tokio::test]
    async fn test_remove_older_than_is_exclusive_and_drops_levels() {
        let (_, store) = store();
        store.track("old", 99).await.unwrap();
        store.track("edge", 100).await.unwrap();
        store.set_level("old", EscalationLevel::Level1).await.unwrap();

        let removed = store.remove_older_than(100).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.waiting_basis("old"), None);
        assert_eq!(store.waiting_basis("edge"), Some(100));
        assert_eq!(store.level("old").await.unwrap(), EscalationLevel::None);
    }

    #[tokio::test]
    async fn test_lease_single_holder_and_expiry() {
        let (clock, store) = store();
        let ttl = Duration::from_secs(10);

        assert!(store.acquire_lease("pod-a", ttl).await.unwrap());
        assert!(!store.acquire_lease("pod-b", ttl).await.unwrap());
        assert_eq!(store.lease_holder().await.unwrap(), Some("pod-a".to_string()));

        assert!(store.renew_lease("pod-a", ttl).await.unwrap());
        assert!(!store.renew_lease("pod-b", ttl).await.unwrap());

        // Expiry steps the holder down; the next acquisition wins.
        clock.advance(10_001);
        assert_eq!(store.lease_holder().await.unwrap(), None);
        assert!(!store.renew_lease("pod-a", ttl).await.unwrap());
        assert!(store.acquire_lease("pod-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let (_, store) = store();
        let ttl = Duration::from_secs(10);
        assert!(store.acquire_lease("pod-a", ttl).await.unwrap());
        assert!(!store.release_lease("pod-b").await.unwrap());
        assert!(store.release_lease("pod-a").await.unwrap());
        assert_eq!(store.lease_holder().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_group_starts_at_tail_and_is_idempotent() {
        let (_, store) = store();
        store.append_event(&event("before", EscalationLevel::Level1)).await.unwrap();
        store.ensure_group("g").await.unwrap();
        store.ensure_group("g").await.unwrap();

        // Entries appended before group creation are never delivered.
        let read = store
            .read_group("g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(read.is_empty());

        store.append_event(&event("after", EscalationLevel::Level1)).await.unwrap();
        let read = store
            .read_group("g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_drains_pending_and_is_idempotent() {
        let (_, store) = store();
        store.ensure_group("g").await.unwrap();
        store.append_event(&event("c1", EscalationLevel::Level1)).await.unwrap();

        let read = store
            .read_group("g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.pending_count("g").await.unwrap(), 1);

        store.ack("g", &read[0].id).await.unwrap();
        store.ack("g", &read[0].id).await.unwrap();
        assert_eq!(store.pending_count("g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_idle_respects_min_idle_and_bumps_delivery() {
        let (clock, store) = store();
        store.ensure_group("g").await.unwrap();
        store.append_event(&event("c1", EscalationLevel::Level1)).await.unwrap();

        let read = store
            .read_group("g", "dead-consumer", 10, Duration::ZERO)
            .await
            .unwrap();
        let entry_id = read[0].id.clone();

        // Too fresh to claim.
        let claimed = store
            .claim_idle("g", "survivor", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());

        clock.advance(60_000);
        let claimed = store
            .claim_idle("g", "survivor", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, entry_id);
        assert_eq!(store.delivery_count("g", &entry_id), Some(2));
    }

    #[tokio::test]
    async fn test_entry_ids_are_monotone() {
        let (_, store) = store();
        let a = store.append_event(&event("c1", EscalationLevel::Level1)).await.unwrap();
        let b = store.append_event(&event("c2", EscalationLevel::Level1)).await.unwrap();
        assert_ne!(a, b);
    }
}
