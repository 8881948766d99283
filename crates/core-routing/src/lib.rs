//! Distance-vector routing table.
//!
//! Each peer keeps `{destination -> (next_hop, cost)}` where cost is the
//! summed Euclidean link distance along the chosen path. Neighbors are always
//! reachable directly (`route[n] = (n, distance(n))`); everything else is
//! learned from neighbor advertisements via the Bellman-Ford relaxation in
//! [`RoutingTable::merge`]. Ties keep the existing route so tables do not
//! churn, and count-to-infinity is deliberately unmitigated: link changes are
//! driven by position updates and heartbeat eviction.

use core_packet::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One table entry: forward via `next_hop` at total path cost `cost`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub next_hop: PeerId,
    pub cost: f64,
}

/// A full-table advertisement as sent to neighbors. The sender is named
/// explicitly rather than inferred from the transport address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    pub sender_id: PeerId,
    pub table: HashMap<PeerId, Route>,
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    self_id: PeerId,
    routes: HashMap<PeerId, Route>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            routes: HashMap::new(),
        }
    }

    /// Install or refresh the direct route to a neighbor. Returns true if the
    /// entry changed.
    pub fn set_direct(&mut self, neighbor: PeerId, distance: f64) -> bool {
        debug_assert_ne!(neighbor, self.self_id);
        let route = Route {
            next_hop: neighbor,
            cost: distance,
        };
        match self.routes.insert(neighbor, route) {
            Some(old) => old != route,
            None => true,
        }
    }

    /// Merge a neighbor's advertised table. `sender_cost` is our direct
    /// distance to the sender. For each advertised destination the candidate
    /// cost is `sender_cost + advertised cost`; it is adopted only on strict
    /// improvement (equal cost keeps the existing route). Returns true if any
    /// entry changed, in which case the caller should propagate.
    pub fn merge(
        &mut self,
        sender_id: PeerId,
        sender_cost: f64,
        advertised: &HashMap<PeerId, Route>,
    ) -> bool {
        let mut changed = false;
        for (&dest, adv) in advertised {
            if dest == self.self_id {
                continue;
            }
            let new_cost = sender_cost + adv.cost;
            let better = match self.routes.get(&dest) {
                Some(current) => new_cost < current.cost,
                None => true,
            };
            if better {
                self.routes.insert(
                    dest,
                    Route {
                        next_hop: sender_id,
                        cost: new_cost,
                    },
                );
                log::debug!(
                    "routing: node {}: route to {} via {} at cost {:.3}",
                    self.self_id,
                    dest,
                    sender_id,
                    new_cost
                );
                changed = true;
            }
        }
        changed
    }

    /// Next hop for `dst`, or None when unrouted (callers fall back to flood).
    /// `dst == self` never has an entry; the forward path delivers locally
    /// before consulting the table.
    pub fn next_hop(&self, dst: PeerId) -> Option<PeerId> {
        self.routes.get(&dst).map(|r| r.next_hop)
    }

    pub fn route(&self, dst: PeerId) -> Option<Route> {
        self.routes.get(&dst).copied()
    }

    /// Drop every route through `hop` (used when a neighbor is evicted).
    /// Returns the destinations that lost their route.
    pub fn purge_next_hop(&mut self, hop: PeerId) -> Vec<PeerId> {
        let dropped: Vec<PeerId> = self
            .routes
            .iter()
            .filter(|(_, r)| r.next_hop == hop)
            .map(|(&d, _)| d)
            .collect();
        for dest in &dropped {
            self.routes.remove(dest);
        }
        dropped
    }

    /// Remove a single destination entry. Returns true if it was present.
    pub fn clear_route(&mut self, dst: PeerId) -> bool {
        self.routes.remove(&dst).is_some()
    }

    pub fn snapshot(&self) -> HashMap<PeerId, Route> {
        self.routes.clone()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(entries: &[(PeerId, PeerId, f64)]) -> HashMap<PeerId, Route> {
        entries
            .iter()
            .map(|&(dest, next_hop, cost)| (dest, Route { next_hop, cost }))
            .collect()
    }

    #[test]
    fn direct_route_install_and_refresh() {
        let mut table = RoutingTable::new(1);
        assert!(table.set_direct(2, 3.0));
        assert_eq!(table.next_hop(2), Some(2));
        // Same entry again is not a change
        assert!(!table.set_direct(2, 3.0));
        // Distance moved
        assert!(table.set_direct(2, 4.5));
        assert_eq!(table.route(2).unwrap().cost, 4.5);
    }

    #[test]
    fn merge_learns_two_hop_route() {
        // A(1) -- 8.0 -- B(2) -- 8.0 -- C(3): A learns C via B at cost 16
        let mut table = RoutingTable::new(1);
        table.set_direct(2, 8.0);
        let changed = table.merge(2, 8.0, &adv(&[(1, 1, 8.0), (3, 3, 8.0)]));
        assert!(changed);
        assert_eq!(table.route(3), Some(Route { next_hop: 2, cost: 16.0 }));
        // Route back to self was ignored
        assert_eq!(table.next_hop(1), None);
    }

    #[test]
    fn merge_keeps_better_route() {
        let mut table = RoutingTable::new(1);
        table.set_direct(2, 2.0);
        table.set_direct(4, 1.0);
        table.merge(4, 1.0, &adv(&[(3, 3, 2.0)])); // 3 via 4 at cost 3
        let changed = table.merge(2, 2.0, &adv(&[(3, 3, 5.0)])); // 3 via 2 at cost 7
        assert!(!changed);
        assert_eq!(table.route(3), Some(Route { next_hop: 4, cost: 3.0 }));
    }

    #[test]
    fn merge_equal_cost_keeps_existing() {
        let mut table = RoutingTable::new(1);
        table.set_direct(2, 2.0);
        table.set_direct(4, 2.0);
        assert!(table.merge(2, 2.0, &adv(&[(3, 3, 3.0)])));
        // Same total cost via another neighbor: no churn
        assert!(!table.merge(4, 2.0, &adv(&[(3, 3, 3.0)])));
        assert_eq!(table.route(3).unwrap().next_hop, 2);
    }

    #[test]
    fn merge_adopts_strictly_better_cost() {
        let mut table = RoutingTable::new(1);
        table.set_direct(2, 8.0);
        table.merge(2, 8.0, &adv(&[(3, 3, 8.0)]));
        // B moved closer to C; re-advertised cost drops
        assert!(table.merge(2, 8.0, &adv(&[(3, 3, 4.0)])));
        assert_eq!(table.route(3).unwrap().cost, 12.0);
    }

    #[test]
    fn purge_next_hop_drops_all_dependent_routes() {
        let mut table = RoutingTable::new(1);
        table.set_direct(2, 3.0);
        table.set_direct(5, 6.0);
        table.merge(2, 3.0, &adv(&[(3, 3, 8.0), (4, 3, 12.0)]));

        let mut dropped = table.purge_next_hop(2);
        dropped.sort_unstable();
        assert_eq!(dropped, vec![2, 3, 4]);
        assert_eq!(table.next_hop(3), None);
        // Routes through other neighbors survive
        assert_eq!(table.next_hop(5), Some(5));
    }

    #[test]
    fn clear_route_forces_flood_fallback() {
        let mut table = RoutingTable::new(1);
        table.set_direct(2, 3.0);
        assert!(table.clear_route(2));
        assert!(!table.clear_route(2));
        assert_eq!(table.next_hop(2), None);
    }

    #[test]
    fn advertisement_json_roundtrip() {
        let mut table = RoutingTable::new(1);
        table.set_direct(2, 3.0);
        table.merge(2, 3.0, &adv(&[(3, 3, 5.0)]));
        let ad = Advertisement {
            sender_id: 1,
            table: table.snapshot(),
        };
        let json = serde_json::to_string(&ad).unwrap();
        let back: Advertisement = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sender_id, 1);
        assert_eq!(back.table.len(), 2);
        assert_eq!(back.table[&3], Route { next_hop: 2, cost: 8.0 });
    }
}
