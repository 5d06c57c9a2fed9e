//! Mesh relay core: peer liveness, route discovery, message relay, and the
//! local store-and-forward buffer used while the controller is unreachable.
//!
//! The controller's own HTTP API and storage, process-shell concerns like
//! CLI parsing and signal handling, and system metric collection internals
//! are outside this crate; it only depends on the small [`controller`] and
//! [`metrics_source`] capability traits for those.

pub mod agent;
pub mod buffer;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod metrics_source;
pub mod node_id;
pub mod peer;
pub mod peering;
pub mod relay;
pub mod routing_table;
pub mod wire;

pub use agent::{Agent, AgentError};
pub use node_id::NodeId;
