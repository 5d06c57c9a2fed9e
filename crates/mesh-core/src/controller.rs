//! The controller is an external collaborator: this crate only depends on
//! a small capability trait, never on the controller's own HTTP API.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::relay::PayloadValue;

#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub custom_metrics: BTreeMap<String, PayloadValue>,
}

#[derive(Debug, Clone)]
pub struct CommandResultReport {
    pub command_id: String,
    pub status: String,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command_id: String,
    pub command_type: String,
}

/// Capability consumed by the relay engine's controller-forwarding path.
/// The HTTP implementation of this trait, and the controller's own storage
/// and routing, live outside this crate.
pub trait ControllerClient: Send + Sync {
    fn heartbeat(&self, req: HeartbeatRequest) -> Option<Vec<PendingCommand>>;
    fn report_command_result(&self, result: CommandResultReport) -> bool;
    fn health_check(&self) -> bool;
    fn last_success(&self) -> Option<Instant>;
}

/// True if the controller client has had a successful contact within the
/// last 60 seconds, falling back to an active health check otherwise.
pub fn direct_ok(client: &dyn ControllerClient) -> bool {
    if let Some(last) = client.last_success() {
        if last.elapsed().as_secs_f64() < 60.0 {
            return true;
        }
    }
    client.health_check()
}

/// Always-unreachable controller, for tests and for nodes running with mesh
/// relay only.
#[derive(Default)]
pub struct NullControllerClient {
    last_success: Mutex<Option<Instant>>,
}

impl ControllerClient for NullControllerClient {
    fn heartbeat(&self, _req: HeartbeatRequest) -> Option<Vec<PendingCommand>> {
        None
    }

    fn report_command_result(&self, _result: CommandResultReport) -> bool {
        false
    }

    fn health_check(&self) -> bool {
        false
    }

    fn last_success(&self) -> Option<Instant> {
        *self.last_success.lock().unwrap()
    }
}

/// HTTP-backed controller client. The controller's API surface and storage
/// are out of scope for this crate; this is only the client-side capability
/// the relay engine forwards through.
pub struct HttpControllerClient {
    base_url: String,
    http: reqwest::blocking::Client,
    last_success: Mutex<Option<Instant>>,
}

impl HttpControllerClient {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a finite timeout");
        Self {
            base_url: base_url.into(),
            http,
            last_success: Mutex::new(None),
        }
    }

    fn mark_success(&self) {
        *self.last_success.lock().unwrap() = Some(Instant::now());
    }
}

impl ControllerClient for HttpControllerClient {
    fn heartbeat(&self, req: HeartbeatRequest) -> Option<Vec<PendingCommand>> {
        let url = format!("{}/api/v1/heartbeat", self.base_url);
        let resp = self.http.post(&url).json(&serde_json::json!({
            "node_id": req.node_id,
            "cpu_usage": req.cpu_usage,
            "memory_usage": req.memory_usage,
            "disk_usage": req.disk_usage,
        })).send().ok()?;
        if !resp.status().is_success() {
            return None;
        }
        self.mark_success();
        Some(Vec::new())
    }

    fn report_command_result(&self, result: CommandResultReport) -> bool {
        let url = format!("{}/api/v1/commands/{}/result", self.base_url, result.command_id);
        match self.http.post(&url).json(&serde_json::json!({
            "status": result.status,
            "result": result.result,
            "error_message": result.error_message,
        })).send() {
            Ok(resp) if resp.status().is_success() => {
                self.mark_success();
                true
            }
            _ => false,
        }
    }

    fn health_check(&self) -> bool {
        let url = format!("{}/api/v1/health", self.base_url);
        match self.http.get(&url).send() {
            Ok(resp) if resp.status().is_success() => {
                self.mark_success();
                true
            }
            _ => false,
        }
    }

    fn last_success(&self) -> Option<Instant> {
        *self.last_success.lock().unwrap()
    }
}
