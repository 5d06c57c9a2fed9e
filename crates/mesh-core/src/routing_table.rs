use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::node_id::NodeId;

/// A discovered path to a destination ("controller" or a specific node id).
#[derive(Debug, Clone)]
pub struct RoutePath {
    pub target: String,
    pub next_hop: NodeId,
    pub next_hop_addr: SocketAddr,
    pub total_hops: u16,
    pub estimated_rtt_ms: f64,
    pub last_updated: Instant,
    pub reliability: f64,
    pub success_count: u32,
    pub failure_count: u32,
}

/// Routes expire 60 seconds after their last confirmation.
pub const ROUTE_TTL: Duration = Duration::from_secs(60);

impl RoutePath {
    pub fn new(
        target: impl Into<String>,
        next_hop: NodeId,
        next_hop_addr: SocketAddr,
        total_hops: u16,
        estimated_rtt_ms: f64,
    ) -> Self {
        Self {
            target: target.into(),
            next_hop,
            next_hop_addr,
            total_hops,
            estimated_rtt_ms,
            last_updated: Instant::now(),
            reliability: 1.0,
            success_count: 0,
            failure_count: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.last_updated.elapsed() > ROUTE_TTL
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.update_reliability();
        self.last_updated = Instant::now();
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.update_reliability();
    }

    fn update_reliability(&mut self) {
        let total = self.success_count + self.failure_count;
        if total > 0 {
            self.reliability = self.success_count as f64 / total as f64;
        }
    }

    /// A route is still worth trying unless it has both a low success rate
    /// and enough recent failures to trip the circuit breaker.
    pub fn is_viable(&self) -> bool {
        self.reliability >= 0.2 || self.failure_count < 3
    }
}

/// Sort key used everywhere routes are ranked: fewest hops, then lowest RTT,
/// then highest reliability.
fn sort_key(r: &RoutePath) -> (u16, f64, f64, &str) {
    (r.total_hops, r.estimated_rtt_ms, -r.reliability, r.next_hop.as_str())
}

pub fn sort_routes(routes: &mut [RoutePath]) {
    routes.sort_by(|a, b| {
        let ka = sort_key(a);
        let kb = sort_key(b);
        ka.0.cmp(&kb.0)
            .then_with(|| ka.1.total_cmp(&kb.1))
            .then_with(|| ka.2.total_cmp(&kb.2))
            .then_with(|| ka.3.cmp(kb.3))
    });
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: std::collections::HashMap<String, Vec<RoutePath>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a discovered route, or update the existing entry for the same
    /// (destination, next_hop) pair in place.
    pub fn upsert(&mut self, route: RoutePath) {
        let entry = self.routes.entry(route.target.clone()).or_default();
        if let Some(existing) = entry.iter_mut().find(|r| r.next_hop == route.next_hop) {
            existing.total_hops = route.total_hops;
            existing.estimated_rtt_ms = route.estimated_rtt_ms;
            existing.last_updated = route.last_updated;
        } else {
            entry.push(route);
        }
    }

    pub fn has_route_to(&self, destination: &str) -> bool {
        self.routes
            .get(destination)
            .is_some_and(|rs| rs.iter().any(|r| !r.is_expired()))
    }

    /// All non-expired routes to a destination, unsorted.
    pub fn all_routes(&self, destination: &str) -> Vec<RoutePath> {
        self.routes
            .get(destination)
            .map(|rs| rs.iter().filter(|r| !r.is_expired()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn select_best(&self, destination: &str) -> Option<RoutePath> {
        let mut valid = self.all_routes(destination);
        if valid.is_empty() {
            return None;
        }
        sort_routes(&mut valid);
        valid.into_iter().next()
    }

    pub fn invalidate(&mut self, destination: &str, next_hop: &NodeId) {
        if let Some(routes) = self.routes.get_mut(destination) {
            routes.retain(|r| &r.next_hop != next_hop);
        }
    }

    /// Mutate a route in place (used to record success/failure by next hop).
    pub fn with_route_mut<F: FnOnce(&mut RoutePath)>(
        &mut self,
        destination: &str,
        next_hop: &NodeId,
        f: F,
    ) {
        if let Some(route) = self
            .routes
            .get_mut(destination)
            .and_then(|rs| rs.iter_mut().find(|r| &r.next_hop == next_hop))
        {
            f(route);
        }
    }

    /// Record success on every route whose next-hop address matches `from`,
    /// used when a forwarding peer's delivery to the controller succeeds.
    pub fn record_success_by_addr(&mut self, from: SocketAddr) {
        for routes in self.routes.values_mut() {
            for route in routes.iter_mut() {
                if route.next_hop_addr == from {
                    route.record_success();
                }
            }
        }
    }

    pub fn cleanup_expired(&mut self) -> usize {
        let mut removed = 0;
        self.routes.retain(|_, routes| {
            let before = routes.len();
            routes.retain(|r| !r.is_expired());
            removed += before - routes.len();
            !routes.is_empty()
        });
        removed
    }

    pub fn destinations(&self) -> impl Iterator<Item = &String> {
        self.routes.keys()
    }
}

impl Clone for RoutePath {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            next_hop: self.next_hop.clone(),
            next_hop_addr: self.next_hop_addr,
            total_hops: self.total_hops,
            estimated_rtt_ms: self.estimated_rtt_ms,
            last_updated: self.last_updated,
            reliability: self.reliability,
            success_count: self.success_count,
            failure_count: self.failure_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.168.1.102:7777".parse().unwrap()
    }

    fn route(hops: u16, rtt: f64) -> RoutePath {
        RoutePath::new("controller", NodeId::new("node-002").unwrap(), addr(), hops, rtt)
    }

    #[test]
    fn fewer_hops_wins_regardless_of_rtt() {
        let mut routes = vec![route(2, 50.0), route(1, 100.0)];
        sort_routes(&mut routes);
        assert_eq!(routes[0].total_hops, 1);
    }

    #[test]
    fn tie_break_by_rtt_when_hops_equal() {
        let mut routes = vec![route(2, 150.0), route(2, 50.0)];
        sort_routes(&mut routes);
        assert_eq!(routes[0].estimated_rtt_ms, 50.0);
    }

    #[test]
    fn tie_break_by_reliability_when_hops_and_rtt_equal() {
        let mut reliable = route(2, 50.0);
        reliable.success_count = 19;
        reliable.failure_count = 1;
        reliable.reliability = 0.95;
        let mut unreliable = route(2, 50.0);
        unreliable.success_count = 1;
        unreliable.failure_count = 1;
        unreliable.reliability = 0.5;
        let mut routes = vec![unreliable, reliable];
        sort_routes(&mut routes);
        assert_eq!(routes[0].reliability, 0.95);
    }

    #[test]
    fn record_success_and_failure_update_reliability() {
        let mut r = route(2, 50.0);
        r.failure_count = 1;
        r.reliability = 0.0;
        r.record_success();
        assert_eq!(r.success_count, 1);
        assert_eq!(r.reliability, 0.5);

        let mut r2 = route(2, 50.0);
        r2.success_count = 3;
        r2.reliability = 1.0;
        r2.record_failure();
        assert_eq!(r2.failure_count, 1);
        assert_eq!(r2.reliability, 0.75);
    }

    #[test]
    fn upsert_replaces_route_from_same_next_hop() {
        let mut table = RoutingTable::new();
        table.upsert(route(3, 80.0));
        table.upsert(route(1, 20.0));
        let best = table.select_best("controller").unwrap();
        assert_eq!(best.total_hops, 1);
        assert_eq!(table.all_routes("controller").len(), 1);
    }

    #[test]
    fn viability_circuit_breaker() {
        let mut r = route(1, 10.0);
        r.reliability = 0.1;
        r.failure_count = 3;
        assert!(!r.is_viable());
        r.failure_count = 2;
        assert!(r.is_viable());
    }
}
