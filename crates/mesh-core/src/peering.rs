//! Peer table and liveness: ping/pong exchange, status transitions, and
//! dispatch of routing-protocol frames to a registered handler.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};

use crate::node_id::NodeId;
use crate::peer::{PeerInfo, PeerStatus};
use crate::wire::{CodecError, Frame};

/// Binds a UDP socket with `SO_REUSEADDR` set before bind, matching the
/// reference peering service so a quick agent restart can rebind its port
/// immediately instead of waiting out `TIME_WAIT`.
fn bind_reusable(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[derive(Debug, thiserror::Error)]
pub enum PeeringError {
    #[error("failed to bind mesh socket on port {0}: {1}")]
    Bind(u16, std::io::Error),
    #[error("peering already running")]
    AlreadyRunning,
    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),
}

/// Routing-protocol frames (types 0x04-0x07) are handed to this callback
/// rather than interpreted by the peering layer itself.
pub trait RoutingMessageHandler: Send + Sync {
    fn handle(&self, msg_type: u8, payload: &[u8], sender: SocketAddr);
}

impl<F: Fn(u8, &[u8], SocketAddr) + Send + Sync> RoutingMessageHandler for F {
    fn handle(&self, msg_type: u8, payload: &[u8], sender: SocketAddr) {
        (self)(msg_type, payload, sender)
    }
}

pub trait PeerStatusListener: Send + Sync {
    fn on_discovered(&self, peer: &PeerInfo);
    fn on_status_changed(&self, peer: &PeerInfo, old: PeerStatus);
}

struct State {
    peers: HashMap<String, PeerInfo>,
    pending_pings: HashMap<String, Instant>,
}

pub struct Peering {
    node_id: NodeId,
    listen_port: u16,
    heartbeat_interval: Duration,
    peer_timeout: Duration,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    state: Mutex<State>,
    running: Arc<AtomicBool>,
    routing_handler: Mutex<Option<Arc<dyn RoutingMessageHandler>>>,
    status_listener: Mutex<Option<Arc<dyn PeerStatusListener>>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Peering {
    pub fn new(
        node_id: NodeId,
        listen_port: u16,
        heartbeat_interval: Duration,
        peer_timeout: Duration,
    ) -> Self {
        log::info!(
            "mesh: peering initialized: node_id={node_id}, port={listen_port}"
        );
        Self {
            node_id,
            listen_port,
            heartbeat_interval,
            peer_timeout,
            socket: Mutex::new(None),
            state: Mutex::new(State {
                peers: HashMap::new(),
                pending_pings: HashMap::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            routing_handler: Mutex::new(None),
            status_listener: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn set_routing_handler(&self, handler: Arc<dyn RoutingMessageHandler>) {
        *self.routing_handler.lock() = Some(handler);
    }

    pub fn set_status_listener(&self, listener: Arc<dyn PeerStatusListener>) {
        *self.status_listener.lock() = Some(listener);
    }

    pub fn add_static_peer(&self, node_id: NodeId, address: IpAddr, port: u16) {
        if node_id == self.node_id {
            log::debug!("mesh: skipping self as peer: {node_id}");
            return;
        }
        let peer = PeerInfo {
            node_id: node_id.clone(),
            address,
            port,
            status: PeerStatus::Discovered,
            last_seen: None,
            rtt_ms: None,
        };
        log::info!("mesh: added static peer: {node_id} at {address}:{port}");
        self.state.lock().peers.insert(node_id.as_str().to_string(), peer);
    }

    pub fn start(self: &Arc<Self>) -> Result<(), PeeringError> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            return Err(PeeringError::AlreadyRunning);
        }

        let socket = bind_reusable(self.listen_port).map_err(|e| PeeringError::Bind(self.listen_port, e))?;
        socket
            .set_read_timeout(Some(Duration::from_secs(1)))
            .map_err(|e| PeeringError::Bind(self.listen_port, e))?;
        let socket = Arc::new(socket);
        *self.socket.lock() = Some(socket.clone());
        log::info!("mesh: listening on udp port {}", self.listen_port);

        let listener = {
            let this = self.clone();
            let socket = socket.clone();
            std::thread::spawn(move || this.listener_loop(socket))
        };
        let heartbeat = {
            let this = self.clone();
            std::thread::spawn(move || this.heartbeat_loop())
        };
        *self.threads.lock() = vec![listener, heartbeat];
        log::info!("mesh: peering service started");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.socket.lock().take();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        log::info!("mesh: peering service stopped");
    }

    fn listener_loop(&self, socket: Arc<UdpSocket>) {
        log::debug!("mesh: listener loop started");
        let mut buf = [0u8; 1024];
        while self.running.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buf) {
                Ok((n, addr)) => self.handle_datagram(&buf[..n], addr),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        log::error!("mesh: listener error: {e}");
                    }
                }
            }
        }
    }

    fn heartbeat_loop(&self) {
        log::debug!("mesh: heartbeat loop started");
        while self.running.load(Ordering::SeqCst) {
            let peers: Vec<PeerInfo> = self.state.lock().peers.values().cloned().collect();
            for peer in &peers {
                self.send_ping(peer);
                self.check_peer_timeout(peer);
            }
            std::thread::sleep(self.heartbeat_interval);
        }
    }

    fn send_ping(&self, peer: &PeerInfo) {
        let Some(socket) = self.socket.lock().clone() else { return };
        let frame = Frame::Ping {
            node_id: self.node_id.clone(),
        };
        let Ok(bytes) = frame.encode() else { return };
        match socket.send_to(&bytes, peer.addr()) {
            Ok(_) => {
                self.state
                    .lock()
                    .pending_pings
                    .insert(peer.node_id.as_str().to_string(), Instant::now());
                log::debug!("mesh: sent ping to {} at {}", peer.node_id, peer.addr());
            }
            Err(e) => log::debug!("mesh: failed to ping {}: {e}", peer.node_id),
        }
    }

    fn send_pong(&self, sender_id: &str, addr: SocketAddr) {
        let Some(socket) = self.socket.lock().clone() else { return };
        let frame = Frame::Pong {
            node_id: self.node_id.clone(),
        };
        let Ok(bytes) = frame.encode() else { return };
        match socket.send_to(&bytes, addr) {
            Ok(_) => log::debug!("mesh: sent pong to {sender_id} at {addr}"),
            Err(e) => log::debug!("mesh: failed to send pong to {sender_id}: {e}"),
        }
    }

    fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let frame = match Frame::decode(data) {
            Ok(f) => f,
            Err(CodecError::Empty) => return,
            Err(e) => {
                log::debug!("mesh: dropping malformed datagram from {addr}: {e}");
                return;
            }
        };
        match frame {
            Frame::Ping { node_id } => {
                log::debug!("mesh: received ping from {node_id} at {addr}");
                self.send_pong(node_id.as_str(), addr);
                self.update_peer_status(&node_id, addr, PeerStatus::Reachable, None);
            }
            Frame::Pong { node_id } => {
                log::debug!("mesh: received pong from {node_id} at {addr}");
                let rtt_ms = {
                    let mut state = self.state.lock();
                    state
                        .pending_pings
                        .remove(node_id.as_str())
                        .map(|sent| sent.elapsed().as_secs_f64() * 1000.0)
                };
                self.update_peer_status(&node_id, addr, PeerStatus::Reachable, rtt_ms);
            }
            Frame::Announce(_) => {}
            Frame::RouteRequest { .. } => {
                self.dispatch_routing(crate::wire::TYPE_ROUTE_REQUEST, &data[1..], addr)
            }
            Frame::RouteResponse { .. } => {
                self.dispatch_routing(crate::wire::TYPE_ROUTE_RESPONSE, &data[1..], addr)
            }
            Frame::RelayData(_) => self.dispatch_routing(crate::wire::TYPE_RELAY_DATA, &data[1..], addr),
            Frame::RelayAck { .. } => self.dispatch_routing(crate::wire::TYPE_RELAY_ACK, &data[1..], addr),
        }
    }

    fn dispatch_routing(&self, msg_type: u8, payload: &[u8], addr: SocketAddr) {
        match self.routing_handler.lock().clone() {
            Some(handler) => handler.handle(msg_type, payload, addr),
            None => log::debug!("mesh: received routing message but no handler registered"),
        }
    }

    fn update_peer_status(
        &self,
        node_id: &NodeId,
        addr: SocketAddr,
        status: PeerStatus,
        rtt_ms: Option<f64>,
    ) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let key = node_id.as_str().to_string();
        let (discovered, old_status, snapshot) = if let Some(peer) = state.peers.get_mut(&key) {
            let old = peer.status;
            peer.status = status;
            peer.last_seen = Some(now);
            if let Some(rtt) = rtt_ms {
                peer.rtt_ms = Some(rtt);
            }
            (false, old, peer.clone())
        } else {
            let peer = PeerInfo {
                node_id: node_id.clone(),
                address: addr.ip(),
                port: addr.port(),
                status,
                last_seen: Some(now),
                rtt_ms,
            };
            state.peers.insert(key, peer.clone());
            (true, PeerStatus::Unknown, peer)
        };
        drop(state);

        if discovered {
            log::info!("mesh: discovered new peer: {} at {}", snapshot.node_id, addr);
            if let Some(listener) = self.status_listener.lock().clone() {
                listener.on_discovered(&snapshot);
            }
        } else if old_status != status {
            log::info!(
                "mesh: peer {} status changed: {} -> {}",
                snapshot.node_id,
                old_status.as_str(),
                snapshot.status.as_str()
            );
            if let Some(listener) = self.status_listener.lock().clone() {
                listener.on_status_changed(&snapshot, old_status);
            }
        }
    }

    fn check_peer_timeout(&self, peer: &PeerInfo) {
        let Some(last_seen) = peer.last_seen else { return };
        let elapsed = last_seen.elapsed();
        if elapsed > self.peer_timeout && peer.status == PeerStatus::Reachable {
            let mut state = self.state.lock();
            if let Some(p) = state.peers.get_mut(peer.node_id.as_str()) {
                p.status = PeerStatus::Unreachable;
            }
            drop(state);
            log::warn!(
                "mesh: peer {} unreachable (no response for {:.1}s)",
                peer.node_id,
                elapsed.as_secs_f64()
            );
        }
    }

    pub fn get_reachable_peers(&self) -> Vec<PeerInfo> {
        self.state
            .lock()
            .peers
            .values()
            .filter(|p| p.status == PeerStatus::Reachable)
            .cloned()
            .collect()
    }

    pub fn peer_status_summary(&self) -> std::collections::BTreeMap<&'static str, usize> {
        let mut summary: std::collections::BTreeMap<&'static str, usize> =
            PeerStatus::all().iter().map(|s| (s.as_str(), 0)).collect();
        for peer in self.state.lock().peers.values() {
            *summary.entry(peer.status.as_str()).or_insert(0) += 1;
        }
        summary
    }

    pub fn peer(&self, node_id: &str) -> Option<PeerInfo> {
        self.state.lock().peers.get(node_id).cloned()
    }

    pub fn send(&self, addr: SocketAddr, data: &[u8]) -> Result<(), PeeringError> {
        match self.socket.lock().clone() {
            Some(socket) => {
                socket.send_to(data, addr)?;
                Ok(())
            }
            None => Err(PeeringError::Send(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "peering socket not started",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn nid(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn add_static_peer_skips_self() {
        let peering = Peering::new(nid("self-node"), 0, Duration::from_secs(10), Duration::from_secs(30));
        peering.add_static_peer(nid("self-node"), IpAddr::V4(Ipv4Addr::LOCALHOST), 7777);
        assert!(peering.get_reachable_peers().is_empty());
        assert_eq!(peering.peer("self-node"), None);
    }

    #[test]
    fn add_static_peer_registers_as_discovered() {
        let peering = Peering::new(nid("self-node"), 0, Duration::from_secs(10), Duration::from_secs(30));
        peering.add_static_peer(nid("node-002"), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 102)), 7777);
        let peer = peering.peer("node-002").unwrap();
        assert_eq!(peer.status, PeerStatus::Discovered);
    }

    #[test]
    fn peer_status_summary_counts_all_buckets() {
        let peering = Peering::new(nid("self-node"), 0, Duration::from_secs(10), Duration::from_secs(30));
        peering.add_static_peer(nid("node-002"), IpAddr::V4(Ipv4Addr::LOCALHOST), 7777);
        let summary = peering.peer_status_summary();
        assert_eq!(summary["discovered"], 1);
        assert_eq!(summary["reachable"], 0);
    }
}
