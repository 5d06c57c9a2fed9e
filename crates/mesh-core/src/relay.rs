//! Relay engine: forwarding of [`RelayMessage`]s across the mesh when the
//! controller is not directly reachable.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::node_id::{NodeId, CONTROLLER};
use crate::routing_table::{sort_routes, RoutingTable};
use crate::wire::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Heartbeat,
    CommandResult,
    Command,
}

/// A small self-describing value, enough to carry heartbeat and
/// command-result payloads without a full JSON value type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Str(String),
    F64(f64),
    Bool(bool),
    Map(BTreeMap<String, PayloadValue>),
}

impl PayloadValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PayloadValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, PayloadValue>> {
        match self {
            PayloadValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub message_id: String,
    pub msg_type: MessageType,
    pub origin_node_id: String,
    pub destination: String,
    pub hop_count: u16,
    pub max_hops: u16,
    pub payload: BTreeMap<String, PayloadValue>,
    pub path_trace: Vec<String>,
    #[serde(with = "timestamp_secs")]
    pub timestamp: SystemTime,
}

mod timestamp_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let secs = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        secs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(UNIX_EPOCH + Duration::from_secs_f64(secs.max(0.0)))
    }
}

impl RelayMessage {
    pub fn new(
        message_id: impl Into<String>,
        msg_type: MessageType,
        origin_node_id: &NodeId,
        destination: impl Into<String>,
        max_hops: u16,
        payload: BTreeMap<String, PayloadValue>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            msg_type,
            origin_node_id: origin_node_id.as_str().to_string(),
            destination: destination.into(),
            hop_count: 0,
            max_hops,
            payload,
            path_trace: Vec::new(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|_| CodecError::Malformed("relay message not serializable"))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(data).map_err(|_| CodecError::Malformed("relay message json invalid"))
    }

    /// Increment hop count and append `node_id` to the path trace. Returns
    /// true if the message remains within its TTL after incrementing.
    pub fn increment_hop(&mut self, node_id: &NodeId) -> bool {
        self.hop_count += 1;
        self.path_trace.push(node_id.as_str().to_string());
        self.hop_count <= self.max_hops
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct RelayMetrics {
    pub routes_discovered: u64,
    pub messages_relayed: u64,
    pub successful_deliveries: u64,
    pub failed_relays: u64,
    pub avg_hop_count: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no route available to {0}")]
    NoRoute(String),
    #[error("message {0} exceeded max hops")]
    TtlExceeded(String),
    #[error("send to peer failed: {0}")]
    SendFailed(String),
}

/// Something that can hand a frame to a specific peer address. Lets the
/// relay engine send without reaching into the peering socket directly.
pub trait FrameSender {
    fn send_to(&self, addr: SocketAddr, data: &[u8]) -> Result<(), RelayError>;
}

pub struct RelayEngine {
    node_id: NodeId,
    routing_table: RoutingTable,
    relay_cache: std::collections::HashMap<String, RelayMessage>,
    metrics: RelayMetrics,
    hop_counts: std::collections::VecDeque<u16>,
}

const MAX_HOP_SAMPLES: usize = 100;

impl RelayEngine {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            routing_table: RoutingTable::new(),
            relay_cache: std::collections::HashMap::new(),
            metrics: RelayMetrics::default(),
            hop_counts: std::collections::VecDeque::new(),
        }
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn routing_table_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing_table
    }

    pub fn metrics(&self) -> RelayMetrics {
        self.metrics
    }

    pub fn cached_relay_count(&self) -> usize {
        self.relay_cache.len()
    }

    /// Send `message` to the next hop of the best viable route toward its
    /// destination, trying alternates on failure up to `max_retries` times.
    ///
    /// Mirrors the eight-step algorithm: TTL check, gather routes, sort and
    /// filter for viability (falling back to the unsorted-but-unfiltered
    /// list if every route is circuit-broken), increment hop once, cache for
    /// ack tracking, then try viable next hops in order until one sends.
    pub fn relay_message<S: FrameSender>(
        &mut self,
        mut message: RelayMessage,
        sender: &S,
        max_retries: u32,
    ) -> Result<bool, RelayError> {
        if message.hop_count >= message.max_hops {
            log::warn!("relay: message {} exceeded max hops ({})", message.message_id, message.max_hops);
            self.metrics.failed_relays += 1;
            return Ok(false);
        }

        let mut routes = self.routing_table.all_routes(&message.destination);
        if routes.is_empty() {
            log::warn!("relay: no route available to {}", message.destination);
            self.metrics.failed_relays += 1;
            return Ok(false);
        }
        sort_routes(&mut routes);

        let viable: Vec<_> = routes.iter().filter(|r| r.is_viable()).cloned().collect();
        let candidates = if viable.is_empty() {
            log::warn!(
                "relay: all routes to {} are degraded, trying anyway",
                message.destination
            );
            routes
        } else {
            viable
        };

        if !message.increment_hop(&self.node_id) {
            log::warn!(
                "relay: message {} ttl exceeded after increment",
                message.message_id
            );
            self.metrics.failed_relays += 1;
            return Ok(false);
        }

        self.relay_cache
            .insert(message.message_id.clone(), message.clone());

        let mut tried = std::collections::HashSet::new();
        let mut attempts = 0u32;
        let destination = message.destination.clone();

        for route in &candidates {
            if attempts >= max_retries + 1 {
                break;
            }
            if tried.contains(&route.next_hop) {
                continue;
            }
            // refuse to loop back through a peer already on the path
            if message.path_trace.contains(&route.next_hop.as_str().to_string()) {
                continue;
            }
            tried.insert(route.next_hop.clone());
            attempts += 1;

            let frame = crate::wire::Frame::RelayData(message.clone());
            let encoded = frame
                .encode()
                .map_err(|e| RelayError::SendFailed(e.to_string()))?;

            match sender.send_to(route.next_hop_addr, &encoded) {
                Ok(()) => {
                    self.routing_table
                        .with_route_mut(&destination, &route.next_hop, |r| r.record_success());
                    self.metrics.messages_relayed += 1;
                    self.push_hop_sample(message.hop_count);
                    log::info!(
                        "relay: relaying message {}: {} -> {} -> {} (hop {}/{})",
                        message.message_id,
                        message.origin_node_id,
                        route.next_hop,
                        message.destination,
                        message.hop_count,
                        message.max_hops
                    );
                    return Ok(true);
                }
                Err(e) => {
                    log::warn!(
                        "relay: attempt {} via {} failed: {}",
                        attempts,
                        route.next_hop,
                        e
                    );
                    self.routing_table
                        .with_route_mut(&destination, &route.next_hop, |r| r.record_failure());
                }
            }
        }

        log::error!(
            "relay: failed to relay message {} after {} attempts",
            message.message_id,
            attempts
        );
        self.metrics.failed_relays += 1;
        self.relay_cache.remove(&message.message_id);
        Ok(false)
    }

    fn push_hop_sample(&mut self, hops: u16) {
        self.hop_counts.push_back(hops);
        while self.hop_counts.len() > MAX_HOP_SAMPLES {
            self.hop_counts.pop_front();
        }
        let sum: u32 = self.hop_counts.iter().map(|&h| h as u32).sum();
        self.metrics.avg_hop_count = sum as f64 / self.hop_counts.len() as f64;
    }

    /// Route a message that just arrived for this node, the controller, or
    /// a further hop. `sender_addr` is only used to attribute success back
    /// to the forwarding peer's route.
    pub fn handle_incoming_relay<S: FrameSender>(
        &mut self,
        data: &[u8],
        sender_addr: SocketAddr,
        can_reach_controller: bool,
        sender: &S,
        max_retries: u32,
    ) -> Result<IncomingOutcome, RelayError> {
        let message = match RelayMessage::from_bytes(data) {
            Ok(m) => m,
            Err(e) => {
                log::error!("relay: failed to parse relay message: {e}");
                return Ok(IncomingOutcome::Dropped);
            }
        };
        log::debug!(
            "relay: received relay message {} from {}",
            message.message_id,
            sender_addr
        );

        if message.destination == self.node_id.as_str() {
            return Ok(IncomingOutcome::ForSelf(message));
        }

        if message.destination == CONTROLLER && can_reach_controller {
            return Ok(IncomingOutcome::ForController(message, sender_addr));
        }

        if message.hop_count < message.max_hops {
            let relayed = self.relay_message(message.clone(), sender, max_retries)?;
            if !relayed {
                log::warn!("relay: failed to relay message {} further", message.message_id);
            }
            Ok(IncomingOutcome::Forwarded(relayed))
        } else {
            log::warn!("relay: message {} reached max hops, dropping", message.message_id);
            Ok(IncomingOutcome::Dropped)
        }
    }

    pub fn handle_relay_ack(&mut self, message_id: &str, success: bool) -> Option<RelayMessage> {
        let popped = self.relay_cache.remove(message_id);
        if popped.is_some() {
            if success {
                log::info!("relay: relay confirmed: {message_id} delivered successfully");
            } else {
                log::warn!("relay: relay failed: {message_id} delivery unsuccessful");
            }
        }
        popped
    }

    pub fn cleanup_expired_routes(&mut self) -> usize {
        let removed = self.routing_table.cleanup_expired();
        if removed > 0 {
            log::debug!("relay: cleaned up {removed} expired routes");
        }
        removed
    }
}

pub enum IncomingOutcome {
    ForSelf(RelayMessage),
    ForController(RelayMessage, SocketAddr),
    Forwarded(bool),
    Dropped,
}
