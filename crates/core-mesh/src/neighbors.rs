//! Direct-neighbor tracking.
//!
//! Admission is position-driven (a peer within discovery range becomes a
//! neighbor); eviction is heartbeat-driven only. Both maps live under one lock
//! so the invariant holds at every observable point: a peer is present in the
//! neighbor map iff it has a last-heartbeat entry.

use crate::position::Position;
use core_packet::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub position: Position,
    pub distance: f64,
}

#[derive(Default)]
struct Inner {
    neighbors: HashMap<PeerId, NeighborEntry>,
    last_heartbeat: HashMap<PeerId, f64>,
}

#[derive(Default)]
pub struct NeighborTable {
    inner: Mutex<Inner>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a neighbor. First admission seeds the heartbeat
    /// timestamp with `now`. Returns true when the peer is newly admitted.
    pub fn upsert(&self, id: PeerId, position: Position, distance: f64, now: f64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let fresh = inner
            .neighbors
            .insert(id, NeighborEntry { position, distance })
            .is_none();
        inner.last_heartbeat.entry(id).or_insert(now);
        fresh
    }

    /// Record a heartbeat timestamp. Heartbeats from peers that are not
    /// neighbors are ignored (returns false) to preserve the map invariant.
    pub fn record_heartbeat(&self, id: PeerId, ts: f64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.neighbors.contains_key(&id) {
            return false;
        }
        inner.last_heartbeat.insert(id, ts);
        true
    }

    /// Remove every neighbor whose last heartbeat is older than `timeout`
    /// seconds before `now`, returning the evicted ids.
    pub fn evict_stale(&self, now: f64, timeout: f64) -> Vec<PeerId> {
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<PeerId> = inner
            .last_heartbeat
            .iter()
            .filter(|(_, &ts)| now - ts > timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            inner.neighbors.remove(id);
            inner.last_heartbeat.remove(id);
        }
        stale
    }

    pub fn remove(&self, id: PeerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.last_heartbeat.remove(&id);
        inner.neighbors.remove(&id).is_some()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.inner.lock().unwrap().neighbors.contains_key(&id)
    }

    pub fn distance_to(&self, id: PeerId) -> Option<f64> {
        self.inner.lock().unwrap().neighbors.get(&id).map(|n| n.distance)
    }

    /// Snapshot of the current neighbor ids; safe to iterate while the table
    /// mutates underneath.
    pub fn ids(&self) -> Vec<PeerId> {
        self.inner.lock().unwrap().neighbors.keys().copied().collect()
    }

    pub fn snapshot(&self) -> HashMap<PeerId, NeighborEntry> {
        self.inner.lock().unwrap().neighbors.clone()
    }

    pub fn last_heartbeat(&self, id: PeerId) -> Option<f64> {
        self.inner.lock().unwrap().last_heartbeat.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: f64) -> Position {
        Position::new(x, 0.0, 0.0)
    }

    #[test]
    fn upsert_seeds_heartbeat_once() {
        let table = NeighborTable::new();
        assert!(table.upsert(2, pos(3.0), 3.0, 100.0));
        assert_eq!(table.last_heartbeat(2), Some(100.0));

        // Refresh does not reset the heartbeat clock
        assert!(!table.upsert(2, pos(4.0), 4.0, 200.0));
        assert_eq!(table.last_heartbeat(2), Some(100.0));
        assert_eq!(table.distance_to(2), Some(4.0));
    }

    #[test]
    fn heartbeat_from_non_neighbor_ignored() {
        let table = NeighborTable::new();
        assert!(!table.record_heartbeat(9, 50.0));
        assert_eq!(table.last_heartbeat(9), None);
        assert!(table.is_empty());
    }

    #[test]
    fn evict_stale_removes_both_maps() {
        let table = NeighborTable::new();
        table.upsert(2, pos(3.0), 3.0, 100.0);
        table.upsert(3, pos(5.0), 5.0, 100.0);
        table.record_heartbeat(3, 105.0);

        // At t=108 with timeout 7: peer 2 last beat 100 (stale), peer 3 at 105 (fresh)
        let evicted = table.evict_stale(108.0, 7.0);
        assert_eq!(evicted, vec![2]);
        assert!(!table.contains(2));
        assert_eq!(table.last_heartbeat(2), None);
        assert!(table.contains(3));
    }

    #[test]
    fn snapshot_is_detached() {
        let table = NeighborTable::new();
        table.upsert(2, pos(3.0), 3.0, 0.0);
        let snap = table.snapshot();
        table.remove(2);
        assert!(snap.contains_key(&2));
        assert!(table.is_empty());
    }
}
