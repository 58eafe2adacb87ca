//! Container inspection model and the response handle.
//!
//! [`ContainerResponse`] is a value handle: it carries the container's
//! identity and last-inspected state, and the [`Engine`](super::Engine) is
//! borrowed for each subsequent exec/copy call rather than owned by the
//! response.

use serde::Deserialize;
use std::collections::HashMap;

/// Health probe state reported by the engine
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthState {
    /// `starting`, `healthy`, or `unhealthy`
    #[serde(rename = "Status", default)]
    pub status: String,
    /// Recent probe results, oldest first
    #[serde(rename = "Log", default)]
    pub log: Vec<HealthLogEntry>,
}

/// One health probe result
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthLogEntry {
    /// Probe exit code
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i32,
    /// Probe output
    #[serde(rename = "Output", default)]
    pub output: String,
}

/// Process state reported by the engine
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessState {
    /// Status string (`created`, `running`, `exited`, ...)
    #[serde(rename = "Status", default)]
    pub status: String,
    /// Whether the process is running
    #[serde(rename = "Running", default)]
    pub running: bool,
    /// Exit code once exited
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i32,
    /// Healthcheck state when configured
    #[serde(rename = "Health", default)]
    pub health: Option<HealthState>,
}

/// One published-port binding
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortBinding {
    /// Host address the port is bound to
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    /// Host port as reported
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

/// Attached-network details
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkEndpoint {
    /// Network id
    #[serde(rename = "NetworkID", default)]
    pub network_id: String,
    /// Container address on this network
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

/// Network-facing state of a container
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettings {
    /// Published ports keyed by `<port>/<proto>`
    #[serde(rename = "Ports", default)]
    pub ports: HashMap<String, Option<Vec<PortBinding>>>,
    /// Attached networks by name
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, NetworkEndpoint>,
}

/// Image-config subset the engine reports back
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InspectedConfig {
    /// Labels on the container
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

/// Full inspected state of one container
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InspectState {
    /// Container id
    #[serde(rename = "Id", default)]
    pub id: String,
    /// Canonical name (leading slash stripped by the adapter)
    #[serde(rename = "Name", default)]
    pub name: String,
    /// Process state
    #[serde(rename = "State", default)]
    pub state: ProcessState,
    /// Network state
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
    /// Config subset
    #[serde(rename = "Config", default)]
    pub config: InspectedConfig,
}

impl InspectState {
    /// Health status string, empty when no healthcheck is configured
    pub fn health_status(&self) -> &str {
        self.state
            .health
            .as_ref()
            .map(|h| h.status.as_str())
            .unwrap_or("")
    }

    /// Most recent health-probe output, if any
    pub fn last_health_log(&self) -> Option<&HealthLogEntry> {
        self.state.health.as_ref().and_then(|h| h.log.last())
    }
}

/// Handle returned after a container starts.
#[derive(Debug, Clone)]
pub struct ContainerResponse {
    /// Container id
    pub id: String,
    /// Canonical container name
    pub name: String,
    /// State at the time of the last inspection
    pub state: InspectState,
}

impl ContainerResponse {
    pub(crate) fn from_state(state: InspectState) -> Self {
        let name = state.name.trim_start_matches('/').to_string();
        Self {
            id: state.id.clone(),
            name,
            state,
        }
    }

    /// Host port a container port was published to, if any
    pub fn published_port(&self, container_port: u16) -> Option<(String, u16)> {
        let key = format!("{container_port}/tcp");
        let bindings = self.state.network_settings.ports.get(&key)?.as_ref()?;
        let binding = bindings.first()?;
        let port: u16 = binding.host_port.parse().ok()?;
        let host = if binding.host_ip.is_empty() || binding.host_ip == "0.0.0.0" {
            "127.0.0.1".to_string()
        } else {
            binding.host_ip.clone()
        };
        Some((host, port))
    }

    /// Names of every network the container is attached to
    pub fn network_names(&self) -> Vec<String> {
        self.state
            .network_settings
            .networks
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT_JSON: &str = r#"{
        "Id": "abc123",
        "Name": "/imagetest-sandbox-0a1b2c3d",
        "State": {
            "Status": "running",
            "Running": true,
            "ExitCode": 0,
            "Health": {
                "Status": "healthy",
                "Log": [
                    {"ExitCode": 1, "Output": "starting"},
                    {"ExitCode": 0, "Output": "ok"}
                ]
            }
        },
        "NetworkSettings": {
            "Ports": {
                "6443/tcp": [{"HostIp": "0.0.0.0", "HostPort": "32768"}],
                "80/tcp": null
            },
            "Networks": {
                "imagetest-net": {"NetworkID": "n1", "IPAddress": "172.30.0.2"}
            }
        },
        "Config": {"Labels": {"dev.chainguard.imagetest": "true"}}
    }"#;

    #[test]
    fn test_inspect_parse() {
        let state: InspectState = serde_json::from_str(INSPECT_JSON).unwrap();
        assert_eq!(state.id, "abc123");
        assert!(state.state.running);
        assert_eq!(state.health_status(), "healthy");
        assert_eq!(state.last_health_log().unwrap().output, "ok");
    }

    #[test]
    fn test_response_name_and_ports() {
        let state: InspectState = serde_json::from_str(INSPECT_JSON).unwrap();
        let response = ContainerResponse::from_state(state);
        assert_eq!(response.name, "imagetest-sandbox-0a1b2c3d");
        assert_eq!(
            response.published_port(6443),
            Some(("127.0.0.1".to_string(), 32768))
        );
        assert_eq!(response.published_port(80), None);
        assert_eq!(response.network_names(), vec!["imagetest-net".to_string()]);
    }

    #[test]
    fn test_no_healthcheck_states() {
        let state: InspectState =
            serde_json::from_str(r#"{"Id": "x", "Name": "/x", "State": {"Status": "running", "Running": true}}"#)
                .unwrap();
        assert_eq!(state.health_status(), "");
        assert!(state.last_health_log().is_none());
    }
}
