//! End-to-end scenarios matching the agent's documented relay behavior:
//! a three-node relay through a single peer, route tie-breaking, route
//! expiry, TTL enforcement, and degraded-route fallback.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use mesh_core::node_id::{NodeId, CONTROLLER};
use mesh_core::relay::{FrameSender, MessageType, RelayEngine, RelayError, RelayMessage};
use mesh_core::routing_table::RoutePath;

fn nid(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

struct CapturingSender {
    sent: Mutex<Vec<SocketAddr>>,
}

impl CapturingSender {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl FrameSender for CapturingSender {
    fn send_to(&self, addr: SocketAddr, _data: &[u8]) -> Result<(), RelayError> {
        self.sent.lock().unwrap().push(addr);
        Ok(())
    }
}

fn heartbeat(origin: &NodeId, max_hops: u16) -> RelayMessage {
    RelayMessage::new(
        "seed-msg-1",
        MessageType::Heartbeat,
        origin,
        CONTROLLER,
        max_hops,
        BTreeMap::new(),
    )
}

/// Node `test-node-001` has no direct controller link but can reach
/// `node-002` at `192.168.1.102:7777`, which advertises a 1-hop route to
/// the controller; the message should relay through it.
#[test]
fn three_node_relay_through_single_peer() {
    let mut engine = RelayEngine::new(nid("test-node-001"));
    let next_hop_addr: SocketAddr = "192.168.1.102:7777".parse().unwrap();
    engine
        .routing_table_mut()
        .upsert(RoutePath::new(CONTROLLER, nid("node-002"), next_hop_addr, 1, 40.0));

    let sender = CapturingSender::new();
    let delivered = engine
        .relay_message(heartbeat(&nid("test-node-001"), 5), &sender, 2)
        .unwrap();

    assert!(delivered);
    assert_eq!(sender.sent.lock().unwrap().as_slice(), &[next_hop_addr]);
    assert_eq!(engine.metrics().messages_relayed, 1);
}

/// When two candidate next hops tie on hop count, the one with the lower
/// RTT is preferred even though it was registered second.
#[test]
fn tie_break_prefers_lower_rtt() {
    let mut engine = RelayEngine::new(nid("test-node-001"));
    let slow: SocketAddr = "192.168.1.103:7777".parse().unwrap();
    let fast: SocketAddr = "192.168.1.104:7777".parse().unwrap();
    engine
        .routing_table_mut()
        .upsert(RoutePath::new(CONTROLLER, nid("node-003"), slow, 2, 150.0));
    engine
        .routing_table_mut()
        .upsert(RoutePath::new(CONTROLLER, nid("node-004"), fast, 2, 50.0));

    let sender = CapturingSender::new();
    engine
        .relay_message(heartbeat(&nid("test-node-001"), 5), &sender, 2)
        .unwrap();

    assert_eq!(sender.sent.lock().unwrap().as_slice(), &[fast]);
}

/// A route with more hops but far lower RTT still loses to the route with
/// fewer hops: hop count dominates the ordering.
#[test]
fn fewer_hops_beats_lower_rtt() {
    let mut engine = RelayEngine::new(nid("test-node-001"));
    let one_hop: SocketAddr = "192.168.1.105:7777".parse().unwrap();
    let two_hop_fast: SocketAddr = "192.168.1.106:7777".parse().unwrap();
    engine
        .routing_table_mut()
        .upsert(RoutePath::new(CONTROLLER, nid("node-005"), one_hop, 1, 500.0));
    engine
        .routing_table_mut()
        .upsert(RoutePath::new(CONTROLLER, nid("node-006"), two_hop_fast, 2, 5.0));

    let sender = CapturingSender::new();
    engine
        .relay_message(heartbeat(&nid("test-node-001"), 5), &sender, 2)
        .unwrap();

    assert_eq!(sender.sent.lock().unwrap().as_slice(), &[one_hop]);
}

/// A message already at its hop ceiling is dropped before ever touching
/// the network, and counted as a failed relay.
#[test]
fn ttl_exceeded_message_is_dropped() {
    let mut engine = RelayEngine::new(nid("test-node-001"));
    let addr: SocketAddr = "192.168.1.102:7777".parse().unwrap();
    engine
        .routing_table_mut()
        .upsert(RoutePath::new(CONTROLLER, nid("node-002"), addr, 1, 10.0));

    let mut message = heartbeat(&nid("test-node-001"), 3);
    message.hop_count = 3;

    let sender = CapturingSender::new();
    let delivered = engine.relay_message(message, &sender, 2).unwrap();

    assert!(!delivered);
    assert!(sender.sent.lock().unwrap().is_empty());
    assert_eq!(engine.metrics().failed_relays, 1);
}

/// When every known route has tripped the circuit breaker, the engine
/// still attempts delivery rather than giving up outright.
#[test]
fn degraded_routes_fall_back_instead_of_failing_outright() {
    let mut engine = RelayEngine::new(nid("test-node-001"));
    let addr: SocketAddr = "192.168.1.107:7777".parse().unwrap();
    let mut degraded = RoutePath::new(CONTROLLER, nid("node-007"), addr, 1, 30.0);
    degraded.failure_count = 4;
    degraded.reliability = 0.1;
    engine.routing_table_mut().upsert(degraded);

    let sender = CapturingSender::new();
    let delivered = engine
        .relay_message(heartbeat(&nid("test-node-001"), 5), &sender, 2)
        .unwrap();

    assert!(delivered);
    assert_eq!(sender.sent.lock().unwrap().as_slice(), &[addr]);
}

/// Routes older than the 60-second TTL are excluded from selection even
/// though they remain in the table until the next cleanup sweep.
#[test]
fn expired_routes_are_not_selected() {
    let mut engine = RelayEngine::new(nid("test-node-001"));
    let addr: SocketAddr = "192.168.1.108:7777".parse().unwrap();
    let mut route = RoutePath::new(CONTROLLER, nid("node-008"), addr, 1, 10.0);
    route.last_updated = std::time::Instant::now() - std::time::Duration::from_secs(120);
    engine.routing_table_mut().upsert(route);

    assert!(!engine.routing_table().has_route_to(CONTROLLER));

    let sender = CapturingSender::new();
    let delivered = engine
        .relay_message(heartbeat(&nid("test-node-001"), 5), &sender, 2)
        .unwrap();
    assert!(!delivered);
}
