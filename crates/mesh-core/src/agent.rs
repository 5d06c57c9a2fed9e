//! Ties the peer table, route discovery, relay engine, buffer, and
//! controller/metrics capabilities into one running mesh agent.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::{ItemType, LocalBuffer};
use crate::config::MeshConfig;
use crate::controller::{
    direct_ok, CommandResultReport, ControllerClient, HeartbeatRequest,
};
use crate::discovery::RouteDiscovery;
use crate::metrics_source::MetricsSource;
use crate::node_id::{NodeId, CONTROLLER};
use crate::peering::{Peering, PeeringError, RoutingMessageHandler};
use crate::relay::{FrameSender, IncomingOutcome, MessageType, PayloadValue, RelayEngine, RelayError, RelayMessage};
use crate::wire::Frame;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Peering(#[from] PeeringError),
}

impl FrameSender for Peering {
    fn send_to(&self, addr: SocketAddr, data: &[u8]) -> Result<(), RelayError> {
        self.send(addr, data).map_err(|e| RelayError::SendFailed(e.to_string()))
    }
}

struct Shared {
    node_id: NodeId,
    discovery: RouteDiscovery,
    relay: Mutex<RelayEngine>,
    controller: Arc<dyn ControllerClient>,
    buffer: LocalBuffer,
    max_retries: u32,
}

struct RoutingHandler {
    shared: Arc<Shared>,
    peering: Arc<Peering>,
}

impl RoutingMessageHandler for RoutingHandler {
    fn handle(&self, msg_type: u8, payload: &[u8], sender: SocketAddr) {
        let mut full = Vec::with_capacity(payload.len() + 1);
        full.push(msg_type);
        full.extend_from_slice(payload);
        let frame = match Frame::decode(&full) {
            Ok(f) => f,
            Err(e) => {
                log::debug!("mesh: dropping malformed routing message from {sender}: {e}");
                return;
            }
        };
        match frame {
            Frame::RouteRequest {
                node_id,
                request_id,
                destination,
            } => {
                let relay = self.shared.relay.lock();
                self.shared.discovery.handle_route_request(
                    &self.peering,
                    relay.routing_table(),
                    self.shared.controller.as_ref(),
                    node_id.as_str(),
                    sender,
                    &request_id,
                    &destination,
                );
            }
            Frame::RouteResponse {
                node_id,
                request_id,
                destination,
                hops,
                rtt_ms,
            } => {
                let mut relay = self.shared.relay.lock();
                self.shared.discovery.handle_route_response(
                    relay.routing_table_mut(),
                    &self.peering,
                    &node_id,
                    sender,
                    &request_id,
                    &destination,
                    hops,
                    rtt_ms,
                );
            }
            Frame::RelayData(_) => self.handle_relay_data(&full[1..], sender),
            Frame::RelayAck { message_id, success } => {
                self.shared.relay.lock().handle_relay_ack(&message_id, success);
            }
            Frame::Ping { .. } | Frame::Pong { .. } | Frame::Announce(_) => {}
        }
    }
}

impl RoutingHandler {
    fn handle_relay_data(&self, payload: &[u8], sender: SocketAddr) {
        let can_reach = direct_ok(self.shared.controller.as_ref());
        let outcome = {
            let mut relay = self.shared.relay.lock();
            relay.handle_incoming_relay(
                payload,
                sender,
                can_reach,
                self.peering.as_ref(),
                self.shared.max_retries,
            )
        };
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                log::warn!("mesh: relay dispatch failed: {e}");
                return;
            }
        };
        match outcome {
            IncomingOutcome::ForSelf(message) => self.handle_message_for_self(message),
            IncomingOutcome::ForController(message, sender_addr) => {
                self.forward_to_controller(message, sender_addr)
            }
            IncomingOutcome::Forwarded(_) | IncomingOutcome::Dropped => {}
        }
    }

    fn handle_message_for_self(&self, message: RelayMessage) {
        log::info!(
            "mesh: received message {} for self: type={:?}",
            message.message_id,
            message.msg_type
        );
        if message.msg_type == MessageType::Command {
            // command execution is owned by the process shell, not this crate
        }
        self.send_relay_ack(&message.message_id, &message.origin_node_id, true);
    }

    fn forward_to_controller(&self, message: RelayMessage, sender_addr: SocketAddr) {
        log::info!(
            "mesh: forwarding message {} to controller: type={:?}",
            message.message_id,
            message.msg_type
        );
        let success = match message.msg_type {
            MessageType::Heartbeat => {
                let req = HeartbeatRequest {
                    node_id: message.origin_node_id.clone(),
                    cpu_usage: message.payload.get("cpu_usage").and_then(PayloadValue::as_f64),
                    memory_usage: message.payload.get("memory_usage").and_then(PayloadValue::as_f64),
                    disk_usage: message.payload.get("disk_usage").and_then(PayloadValue::as_f64),
                    custom_metrics: message
                        .payload
                        .get("custom_metrics")
                        .and_then(PayloadValue::as_map)
                        .cloned()
                        .unwrap_or_default(),
                };
                self.shared.controller.heartbeat(req).is_some()
            }
            MessageType::CommandResult => {
                let result = CommandResultReport {
                    command_id: message
                        .payload
                        .get("command_id")
                        .and_then(PayloadValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: message
                        .payload
                        .get("status")
                        .and_then(PayloadValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    result: message.payload.get("result").and_then(PayloadValue::as_str).map(String::from),
                    error_message: message
                        .payload
                        .get("error_message")
                        .and_then(PayloadValue::as_str)
                        .map(String::from),
                };
                self.shared.controller.report_command_result(result)
            }
            MessageType::Command => {
                log::warn!("mesh: unknown message type for forwarding from {sender_addr}");
                false
            }
        };

        if success {
            self.shared.relay.lock().routing_table_mut().record_success_by_addr(sender_addr);
        }
        self.send_relay_ack(&message.message_id, &message.origin_node_id, success);
    }

    /// Best-effort only: the path trace is not currently used to build a
    /// reverse route, so this only records the acknowledgment locally
    /// rather than sending it back to the origin.
    fn send_relay_ack(&self, message_id: &str, origin_node_id: &str, success: bool) {
        log::debug!("mesh: ack for {message_id} (origin {origin_node_id}): success={success}");
    }
}

/// Debug/status snapshot, mirroring what operators need to see at a glance.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RouteStatus {
    pub next_hop: String,
    pub hops: u16,
    pub rtt_ms: f64,
    pub reliability: f64,
    pub expired: bool,
}

#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct RoutingStatus {
    pub node_id: String,
    pub can_reach_controller: bool,
    pub routes: BTreeMap<String, Vec<RouteStatus>>,
    pub pending_requests: usize,
    pub cached_relays: usize,
    pub metrics: crate::relay::RelayMetrics,
}

pub struct Agent {
    shared: Arc<Shared>,
    peering: Arc<Peering>,
    metrics_source: Arc<dyn MetricsSource>,
    config: MeshConfig,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Agent {
    pub fn new(
        node_id: NodeId,
        config: MeshConfig,
        controller: Arc<dyn ControllerClient>,
        metrics_source: Arc<dyn MetricsSource>,
        buffer: LocalBuffer,
    ) -> Self {
        let peering = Arc::new(Peering::new(
            node_id.clone(),
            config.listen_port,
            Duration::from_secs_f64(config.heartbeat_interval_seconds),
            Duration::from_secs_f64(config.peer_timeout_seconds),
        ));
        for peer in &config.peers {
            if let (Ok(nid), Ok(addr)) = (
                NodeId::new(peer.node_id.clone()),
                peer.address.parse(),
            ) {
                peering.add_static_peer(nid, addr, peer.port);
            } else {
                log::warn!("mesh: skipping invalid static peer entry: {}", peer.node_id);
            }
        }

        let shared = Arc::new(Shared {
            node_id: node_id.clone(),
            discovery: RouteDiscovery::new(node_id.clone()),
            relay: Mutex::new(RelayEngine::new(node_id)),
            controller,
            buffer,
            max_retries: 2,
        });

        Self {
            shared,
            peering,
            metrics_source,
            config,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) -> Result<(), AgentError> {
        let handler = Arc::new(RoutingHandler {
            shared: self.shared.clone(),
            peering: self.peering.clone(),
        });
        self.peering.set_routing_handler(handler);
        self.peering.start()?;

        self.running.store(true, Ordering::SeqCst);

        let sweeper = {
            let shared = self.shared.clone();
            let running = self.running.clone();
            let ttl = Duration::from_secs(self.config.route_cache_ttl_seconds as u64);
            std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    shared.relay.lock().cleanup_expired_routes();
                    shared.discovery.sweep_expired_requests();
                    std::thread::sleep(ttl.min(Duration::from_secs(10)));
                }
            })
        };

        let agent_loop = {
            let shared = self.shared.clone();
            let peering = self.peering.clone();
            let metrics_source = self.metrics_source.clone();
            let running = self.running.clone();
            let interval = Duration::from_secs_f64(self.config.heartbeat_interval_seconds);
            std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    run_agent_tick(&shared, &peering, metrics_source.as_ref());
                    std::thread::sleep(interval);
                }
            })
        };

        *self.threads.lock() = vec![sweeper, agent_loop];
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.peering.stop();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    pub fn routing_status(&self) -> RoutingStatus {
        let relay = self.shared.relay.lock();
        let mut routes = BTreeMap::new();
        for dest in relay.routing_table().destinations() {
            let entries = relay
                .routing_table()
                .all_routes(dest)
                .into_iter()
                .map(|r| RouteStatus {
                    next_hop: r.next_hop.as_str().to_string(),
                    hops: r.total_hops,
                    rtt_ms: r.estimated_rtt_ms,
                    reliability: r.reliability,
                    expired: r.is_expired(),
                })
                .collect();
            routes.insert(dest.clone(), entries);
        }
        RoutingStatus {
            node_id: self.shared.node_id.as_str().to_string(),
            can_reach_controller: direct_ok(self.shared.controller.as_ref()),
            routes,
            pending_requests: self.shared.discovery.pending_count(),
            cached_relays: relay.cached_relay_count(),
            metrics: relay.metrics(),
        }
    }

    pub fn peering(&self) -> &Arc<Peering> {
        &self.peering
    }

    pub fn buffer(&self) -> &LocalBuffer {
        &self.shared.buffer
    }
}

fn run_agent_tick(shared: &Arc<Shared>, peering: &Arc<Peering>, metrics_source: &dyn MetricsSource) {
    let can_reach = direct_ok(shared.controller.as_ref());
    if can_reach {
        let sample = metrics_source.sample();
        let mut custom = BTreeMap::new();
        custom.insert("cpu_usage".to_string(), PayloadValue::F64(sample.cpu_usage_pct));
        custom.insert(
            "memory_usage".to_string(),
            PayloadValue::F64(sample.memory_usage_pct),
        );
        custom.insert("disk_usage".to_string(), PayloadValue::F64(sample.disk_usage_pct));
        let req = HeartbeatRequest {
            node_id: shared.node_id.as_str().to_string(),
            cpu_usage: Some(sample.cpu_usage_pct),
            memory_usage: Some(sample.memory_usage_pct),
            disk_usage: Some(sample.disk_usage_pct),
            custom_metrics: custom,
        };
        shared.controller.heartbeat(req);
        return;
    }

    if !shared.relay.lock().routing_table().has_route_to(CONTROLLER) {
        shared.discovery.discover_routes(peering, CONTROLLER);
        return;
    }

    let pending = shared.buffer.items_to_flush(Some(ItemType::Telemetry));
    if pending.is_empty() {
        return;
    }
    for item in &pending {
        let mut payload = BTreeMap::new();
        if let Some(obj) = item.data.as_object() {
            for (k, v) in obj {
                if let Some(n) = v.as_f64() {
                    payload.insert(k.clone(), PayloadValue::F64(n));
                } else if let Some(s) = v.as_str() {
                    payload.insert(k.clone(), PayloadValue::Str(s.to_string()));
                }
            }
        }
        let message = RelayMessage::new(
            format!("{}-{}", shared.node_id, item.timestamp),
            MessageType::Heartbeat,
            &shared.node_id,
            CONTROLLER,
            10,
            payload,
        );
        let mut relay = shared.relay.lock();
        let _ = relay.relay_message(message, peering.as_ref(), shared.max_retries);
    }
    shared.buffer.mark_flushed(&pending);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NullControllerClient;
    use crate::metrics_source::NullMetricsSource;

    #[test]
    fn routing_status_reports_no_controller_reachability_by_default() {
        let agent = Agent::new(
            NodeId::new("test-node-001").unwrap(),
            MeshConfig {
                listen_port: 0,
                ..MeshConfig::default()
            },
            Arc::new(NullControllerClient::default()),
            Arc::new(NullMetricsSource),
            LocalBuffer::new(100, None, 10),
        );
        let status = agent.routing_status();
        assert!(!status.can_reach_controller);
        assert_eq!(status.node_id, "test-node-001");
    }
}
