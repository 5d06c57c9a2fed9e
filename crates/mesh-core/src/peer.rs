use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::node_id::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Unknown,
    Discovered,
    Reachable,
    Unreachable,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Unknown => "unknown",
            PeerStatus::Discovered => "discovered",
            PeerStatus::Reachable => "reachable",
            PeerStatus::Unreachable => "unreachable",
        }
    }

    pub fn all() -> [PeerStatus; 4] {
        [
            PeerStatus::Unknown,
            PeerStatus::Discovered,
            PeerStatus::Reachable,
            PeerStatus::Unreachable,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub address: IpAddr,
    pub port: u16,
    pub status: PeerStatus,
    pub last_seen: Option<Instant>,
    pub rtt_ms: Option<f64>,
}

impl PeerInfo {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}
