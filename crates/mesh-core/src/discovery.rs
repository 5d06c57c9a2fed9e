//! Route discovery: broadcasting `ROUTE_REQUEST` to reachable peers and
//! turning `ROUTE_RESPONSE` replies into routing-table entries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::controller::ControllerClient;
use crate::node_id::{NodeId, CONTROLLER};
use crate::peer::PeerStatus;
use crate::peering::Peering;
use crate::routing_table::{RoutePath, RoutingTable};
use crate::wire::Frame;

/// Pending route requests older than this are no longer matched against
/// incoming responses.
pub const PENDING_REQUEST_TTL: Duration = Duration::from_secs(10);

pub struct RouteDiscovery {
    node_id: NodeId,
    pending_requests: parking_lot::Mutex<HashMap<String, Instant>>,
}

impl RouteDiscovery {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            pending_requests: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn generate_request_id(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect()
    }

    /// Broadcast a `ROUTE_REQUEST` to all currently reachable peers, returning
    /// the request id so callers can correlate later responses.
    pub fn discover_routes(&self, peering: &Peering, destination: &str) -> String {
        let request_id = self.generate_request_id();
        self.pending_requests
            .lock()
            .insert(request_id.clone(), Instant::now());

        let frame = Frame::RouteRequest {
            node_id: self.node_id.clone(),
            request_id: request_id.clone(),
            destination: destination.to_string(),
        };
        let Ok(bytes) = frame.encode() else {
            return request_id;
        };

        let peers = peering.get_reachable_peers();
        for peer in &peers {
            match peering.send(peer.addr(), &bytes) {
                Ok(()) => log::debug!("mesh: sent route_request to {} for {destination}", peer.node_id),
                Err(e) => log::warn!("mesh: failed to send route_request to {}: {e}", peer.node_id),
            }
        }
        log::info!(
            "mesh: route discovery initiated: destination={destination}, request_id={request_id}, peers={}",
            peers.len()
        );
        request_id
    }

    /// Respond to a peer's `ROUTE_REQUEST` if we can reach the destination.
    pub fn handle_route_request(
        &self,
        peering: &Peering,
        routing_table: &RoutingTable,
        controller: &dyn ControllerClient,
        sender_id: &str,
        sender_addr: SocketAddr,
        request_id: &str,
        destination: &str,
    ) {
        log::debug!("mesh: received route_request from {sender_id} for {destination}");

        let (hops, rtt_ms): (i32, f32) = if destination == CONTROLLER {
            if crate::controller::direct_ok(controller) {
                (0, 10.0)
            } else if let Some(route) = routing_table.select_best(destination) {
                if !route.is_expired() {
                    (route.total_hops as i32 + 1, route.estimated_rtt_ms as f32 + 20.0)
                } else {
                    (-1, 0.0)
                }
            } else {
                (-1, 0.0)
            }
        } else if destination == self.node_id.as_str() {
            (0, 0.0)
        } else if let Some(peer) = peering.peer(destination) {
            if peer.status == PeerStatus::Reachable {
                (1, peer.rtt_ms.unwrap_or(50.0) as f32)
            } else {
                (-1, 0.0)
            }
        } else {
            (-1, 0.0)
        };

        if hops >= 0 {
            let frame = Frame::RouteResponse {
                node_id: self.node_id.clone(),
                request_id: request_id.to_string(),
                destination: destination.to_string(),
                hops: hops as u16,
                rtt_ms,
            };
            if let Ok(bytes) = frame.encode() {
                let _ = peering.send(sender_addr, &bytes);
                log::debug!("mesh: sent route_response: {destination} via {hops} hops, {rtt_ms:.1}ms");
            }
        }
    }

    /// Process a `ROUTE_RESPONSE`, inserting or updating the routing table.
    /// Responses to unknown request ids are silently ignored.
    pub fn handle_route_response(
        &self,
        routing_table: &mut RoutingTable,
        peering: &Peering,
        sender_id: &NodeId,
        sender_addr: SocketAddr,
        request_id: &str,
        destination: &str,
        hops: u16,
        rtt_ms: f32,
    ) {
        if !self.pending_requests.lock().contains_key(request_id) {
            log::debug!("mesh: ignoring route_response with unknown request_id: {request_id}");
            return;
        }

        let hop_to_sender = peering
            .peer(sender_id.as_str())
            .and_then(|p| p.rtt_ms)
            .unwrap_or(20.0);
        let route = RoutePath::new(
            destination,
            sender_id.clone(),
            sender_addr,
            hops + 1,
            rtt_ms as f64 + hop_to_sender,
        );
        log::info!(
            "mesh: route discovered: {destination} via {sender_id} ({} hops, {:.1}ms)",
            route.total_hops,
            route.estimated_rtt_ms
        );
        routing_table.upsert(route);
    }

    pub fn pending_count(&self) -> usize {
        self.pending_requests.lock().len()
    }

    /// Drop pending requests older than [`PENDING_REQUEST_TTL`].
    pub fn sweep_expired_requests(&self) {
        let mut pending = self.pending_requests.lock();
        pending.retain(|_, sent| sent.elapsed() < PENDING_REQUEST_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NullControllerClient;
    use std::net::Ipv4Addr;
    use std::time::Duration as StdDuration;

    fn nid(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn handle_route_request_to_self_returns_zero_hops() {
        let discovery = RouteDiscovery::new(nid("test-node-001"));
        let peering = Peering::new(nid("test-node-001"), 0, StdDuration::from_secs(10), StdDuration::from_secs(30));
        let table = RoutingTable::new();
        let controller = NullControllerClient::default();
        discovery.handle_route_request(
            &peering,
            &table,
            &controller,
            "node-002",
            SocketAddr::new(Ipv4Addr::new(192, 168, 1, 102).into(), 7777),
            "req1",
            "test-node-001",
        );
        // no panic, response sent on an unbound peering socket is swallowed
    }

    #[test]
    fn handle_route_response_ignores_unknown_request() {
        let discovery = RouteDiscovery::new(nid("test-node-001"));
        let peering = Peering::new(nid("test-node-001"), 0, StdDuration::from_secs(10), StdDuration::from_secs(30));
        let mut table = RoutingTable::new();
        discovery.handle_route_response(
            &mut table,
            &peering,
            &nid("node-002"),
            SocketAddr::new(Ipv4Addr::new(192, 168, 1, 102).into(), 7777),
            "unknown-id",
            "controller",
            1,
            50.0,
        );
        assert!(!table.has_route_to("controller"));
    }

    #[test]
    fn handle_route_response_inserts_route_for_known_request() {
        let discovery = RouteDiscovery::new(nid("test-node-001"));
        let peering = Peering::new(nid("test-node-001"), 0, StdDuration::from_secs(10), StdDuration::from_secs(30));
        let mut table = RoutingTable::new();
        let request_id = discovery.discover_routes(&peering, "controller");
        discovery.handle_route_response(
            &mut table,
            &peering,
            &nid("node-002"),
            SocketAddr::new(Ipv4Addr::new(192, 168, 1, 102).into(), 7777),
            &request_id,
            "controller",
            0,
            10.0,
        );
        assert!(table.has_route_to("controller"));
        let best = table.select_best("controller").unwrap();
        assert_eq!(best.total_hops, 1);
    }
}
