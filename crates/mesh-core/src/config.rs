//! Configuration types.
//!
//! `MeshConfig` is the subset of settings this crate's core actually
//! consumes. `AgentConfig` is the ambient wrapper around it (node identity,
//! controller connection, retry/backoff, logging, local storage) that the
//! rest of the daemon's process shell loads and passes down; this crate
//! only reads the `mesh` section out of it.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),
    #[error("failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{field} must be between {min} and {max}, got {got}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        got: f64,
    },
    #[error("invalid log_level {0:?}")]
    InvalidLogLevel(String),
    #[error("peer_timeout_seconds ({got}) must be >= heartbeat_interval_seconds ({min})")]
    PeerTimeoutBelowHeartbeat { got: f64, min: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshPeerConfig {
    pub node_id: String,
    pub address: String,
    #[serde(default = "default_mesh_port")]
    pub port: u16,
}

fn default_mesh_port() -> u16 {
    7777
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mesh_port")]
    pub listen_port: u16,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: f64,
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_seconds: f64,
    #[serde(default = "default_route_cache_ttl")]
    pub route_cache_ttl_seconds: u32,
    #[serde(default = "default_max_hops")]
    pub max_hops: u16,
    #[serde(default)]
    pub peers: Vec<MeshPeerConfig>,
}

fn default_heartbeat_interval() -> f64 {
    10.0
}
fn default_peer_timeout() -> f64 {
    30.0
}
fn default_route_cache_ttl() -> u32 {
    60
}
fn default_max_hops() -> u16 {
    5
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_port: default_mesh_port(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            peer_timeout_seconds: default_peer_timeout(),
            route_cache_ttl_seconds: default_route_cache_ttl(),
            max_hops: default_max_hops(),
            peers: Vec::new(),
        }
    }
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("listen_port", self.listen_port as f64, 1024.0, 65535.0)?;
        check_range(
            "heartbeat_interval_seconds",
            self.heartbeat_interval_seconds,
            1.0,
            60.0,
        )?;
        check_range("peer_timeout_seconds", self.peer_timeout_seconds, 5.0, 300.0)?;
        check_range(
            "route_cache_ttl_seconds",
            self.route_cache_ttl_seconds as f64,
            10.0,
            600.0,
        )?;
        check_range("max_hops", self.max_hops as f64, 2.0, 10.0)?;
        if self.peer_timeout_seconds < self.heartbeat_interval_seconds {
            return Err(ConfigError::PeerTimeoutBelowHeartbeat {
                got: self.peer_timeout_seconds,
                min: self.heartbeat_interval_seconds,
            });
        }
        Ok(())
    }
}

fn check_range(field: &'static str, got: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if got < min || got > max {
        Err(ConfigError::OutOfRange { field, min, max, got })
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub primary_url: String,
    #[serde(default)]
    pub backup_urls: Vec<String>,
    #[serde(default = "default_controller_timeout")]
    pub timeout_seconds: u32,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

fn default_controller_timeout() -> u32 {
    30
}
fn default_true() -> bool {
    true
}

/// The full agent configuration the daemon's process shell loads; this
/// crate's core only reads the `mesh` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub node_id: String,
    pub name: Option<String>,
    pub node_type: Option<String>,
    pub controller: ControllerConfig,
    pub auth_token: Option<String>,
    #[serde(default = "default_agent_heartbeat")]
    pub heartbeat_interval_seconds: u32,
    #[serde(default = "default_command_poll_interval")]
    pub command_poll_interval_seconds: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_base")]
    pub retry_backoff_base: f64,
    #[serde(default = "default_retry_backoff_max")]
    pub retry_backoff_max: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub log_file: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_true")]
    pub buffer_commands: bool,
    #[serde(default)]
    pub mesh: Option<MeshConfig>,
}

fn default_agent_heartbeat() -> u32 {
    30
}
fn default_command_poll_interval() -> u32 {
    10
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_backoff_base() -> f64 {
    2.0
}
fn default_retry_backoff_max() -> u32 {
    300
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        check_range("max_retries", self.max_retries as f64, 1.0, 20.0)?;
        check_range("retry_backoff_base", self.retry_backoff_base, 1.0, 5.0)?;
        check_range(
            "heartbeat_interval_seconds",
            self.heartbeat_interval_seconds as f64,
            5.0,
            300.0,
        )?;
        check_range(
            "command_poll_interval_seconds",
            self.command_poll_interval_seconds as f64,
            5.0,
            60.0,
        )?;
        if let Some(mesh) = &self.mesh {
            mesh.validate()?;
        }
        Ok(())
    }
}

/// Load and validate an [`AgentConfig`] from a YAML file, substituting
/// `${VAR}` / `${VAR:-default}` references against the process environment.
pub fn load_config(path: &std::path::Path) -> Result<AgentConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
    let substituted = substitute_env_vars(value);
    let config: AgentConfig = serde_yaml::from_value(substituted)?;
    config.validate()?;
    Ok(config)
}

fn substitute_env_vars(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Mapping(map) => serde_yaml::Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, substitute_env_vars(v)))
                .collect(),
        ),
        serde_yaml::Value::Sequence(seq) => {
            serde_yaml::Value::Sequence(seq.into_iter().map(substitute_env_vars).collect())
        }
        serde_yaml::Value::String(s) => serde_yaml::Value::String(resolve_env_string(&s)),
        other => other,
    }
}

fn resolve_env_string(s: &str) -> String {
    let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) else {
        return s.to_string();
    };
    match inner.split_once(":-") {
        Some((var, default)) => std::env::var(var).unwrap_or_else(|_| default.to_string()),
        None => std::env::var(inner).unwrap_or_else(|_| s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mesh_config_validates() {
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn listen_port_out_of_range_is_rejected() {
        let mut cfg = MeshConfig::default();
        cfg.listen_port = 80;
        assert!(matches!(cfg.validate(), Err(ConfigError::OutOfRange { field: "listen_port", .. })));
    }

    #[test]
    fn peer_timeout_below_heartbeat_interval_is_rejected() {
        let mut cfg = MeshConfig::default();
        cfg.heartbeat_interval_seconds = 20.0;
        cfg.peer_timeout_seconds = 10.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::PeerTimeoutBelowHeartbeat { .. })
        ));
    }

    #[test]
    fn env_substitution_supports_default() {
        std::env::remove_var("MESH_TEST_VAR_UNSET");
        assert_eq!(resolve_env_string("${MESH_TEST_VAR_UNSET:-fallback}"), "fallback");
    }

    #[test]
    fn env_substitution_reads_set_var() {
        std::env::set_var("MESH_TEST_VAR_SET", "value-from-env");
        assert_eq!(resolve_env_string("${MESH_TEST_VAR_SET}"), "value-from-env");
        std::env::remove_var("MESH_TEST_VAR_SET");
    }

    #[test]
    fn plain_string_passes_through() {
        assert_eq!(resolve_env_string("plain-value"), "plain-value");
    }
}
