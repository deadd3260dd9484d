//! Keyed per-peer session state: `(peer, transfer id)` maps with visit
//!  stamping and idle expiry, plus the per-peer transfer id allocator.

use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Identity of one transfer on one endpoint: remote peer plus the peer-scoped
///  transfer id.
pub type SessionKey = (SocketAddr, u32);

struct Slot<V> {
    value: V,
    last_visit: Instant,
}

/// A `(peer, id)` keyed table. Every lookup stamps the entry's visit time;
///  `sweep_expired` hands idle entries back to the caller, which is
///  responsible for cancelling their timers before dropping them (sessions
///  own their timer handles, see the session types).
pub struct SessionTable<V> {
    slots: FxHashMap<SessionKey, Slot<V>>,
}

impl<V> Default for SessionTable<V> {
    fn default() -> Self {
        SessionTable { slots: FxHashMap::default() }
    }
}

impl<V> SessionTable<V> {
    pub fn new() -> SessionTable<V> {
        Self::default()
    }

    /// Looks up an entry, stamping its visit time.
    pub fn get(&mut self, key: &SessionKey) -> Option<&V> {
        self.slots.get_mut(key).map(|slot| {
            slot.last_visit = Instant::now();
            &slot.value
        })
    }

    /// Inserts an entry, returning a replaced predecessor (same `(peer, id)`)
    ///  for the caller to tear down.
    pub fn insert(&mut self, key: SessionKey, value: V) -> Option<V> {
        self.slots
            .insert(key, Slot { value, last_visit: Instant::now() })
            .map(|slot| slot.value)
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<V> {
        self.slots.remove(key).map(|slot| slot.value)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes and returns every entry that has not been visited within
    ///  `ttl`.
    pub fn sweep_expired(&mut self, ttl: Duration) -> Vec<(SessionKey, V)> {
        let now = Instant::now();
        let expired: Vec<SessionKey> = self.slots.iter()
            .filter(|(_, slot)| now.duration_since(slot.last_visit) > ttl)
            .map(|(key, _)| *key)
            .collect();

        expired.into_iter()
            .map(|key| {
                let slot = self.slots.remove(&key).expect("key was just enumerated");
                (key, slot.value)
            })
            .collect()
    }

    /// Removes and returns everything - the shutdown path.
    pub fn drain_all(&mut self) -> Vec<(SessionKey, V)> {
        self.slots.drain()
            .map(|(key, slot)| (key, slot.value))
            .collect()
    }
}


/// Per-peer transfer id allocation: a monotonic u32 counter per remote peer,
///  wrapping to 0 after `u32::MAX`.
#[derive(Default)]
pub struct IdAllocator {
    next: FxHashMap<SocketAddr, u32>,
}

impl IdAllocator {
    pub fn new() -> IdAllocator {
        Self::default()
    }

    pub fn alloc(&mut self, peer: SocketAddr) -> u32 {
        let slot = self.next.entry(peer).or_insert(0);
        let id = *slot;
        *slot = slot.wrapping_add(1);
        id
    }

    #[cfg(test)]
    pub fn force_next(&mut self, peer: SocketAddr, next: u32) {
        self.next.insert(peer, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    fn key(port: u16, id: u32) -> SessionKey {
        (SocketAddr::from(([127, 0, 0, 1], port)), id)
    }

    #[test]
    fn test_insert_returns_replaced_entry() {
        let mut table = SessionTable::new();
        assert_eq!(table.insert(key(1, 7), "a"), None);
        assert_eq!(table.insert(key(1, 8), "b"), None);
        assert_eq!(table.insert(key(1, 7), "c"), Some("a"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut table = SessionTable::new();
        table.insert(key(1, 7), "a");
        assert_eq!(table.remove(&key(1, 7)), Some("a"));
        assert_eq!(table.remove(&key(1, 7)), None);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_idle_entries() {
        let ttl = Duration::from_secs(60);
        let mut table = SessionTable::new();

        table.insert(key(1, 0), "idle");
        table.insert(key(2, 0), "visited");

        time::advance(Duration::from_secs(45)).await;
        table.get(&key(2, 0));
        time::advance(Duration::from_secs(30)).await;

        let expired = table.sweep_expired(ttl);
        assert_eq!(expired, vec![(key(1, 0), "idle")]);
        assert!(table.contains(&key(2, 0)));
        assert!(!table.contains(&key(1, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_stamps_visit_time() {
        let ttl = Duration::from_secs(10);
        let mut table = SessionTable::new();
        table.insert(key(1, 0), "a");

        for _ in 0..5 {
            time::advance(Duration::from_secs(8)).await;
            assert!(table.get(&key(1, 0)).is_some());
            assert!(table.sweep_expired(ttl).is_empty());
        }
    }

    #[test]
    fn test_drain_all() {
        let mut table = SessionTable::new();
        table.insert(key(1, 0), "a");
        table.insert(key(2, 4), "b");

        let mut drained = table.drain_all();
        drained.sort();
        assert_eq!(drained, vec![(key(1, 0), "a"), (key(2, 4), "b")]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_id_allocation_is_monotonic_per_peer() {
        let mut allocator = IdAllocator::new();
        let peer_a = SocketAddr::from(([127, 0, 0, 1], 1));
        let peer_b = SocketAddr::from(([127, 0, 0, 1], 2));

        assert_eq!(allocator.alloc(peer_a), 0);
        assert_eq!(allocator.alloc(peer_a), 1);
        assert_eq!(allocator.alloc(peer_b), 0);
        assert_eq!(allocator.alloc(peer_a), 2);
    }

    #[test]
    fn test_id_allocation_wraps_to_zero() {
        let mut allocator = IdAllocator::new();
        let peer = SocketAddr::from(([127, 0, 0, 1], 1));

        allocator.force_next(peer, u32::MAX);
        assert_eq!(allocator.alloc(peer), u32::MAX);
        assert_eq!(allocator.alloc(peer), 0);
        assert_eq!(allocator.alloc(peer), 1);
    }
}
