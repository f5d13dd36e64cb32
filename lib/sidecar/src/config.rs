//! Sidecar connection settings.

use serde::Deserialize;

/// Where the sidecar listens and which components to use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SidecarConfig {
    /// Sidecar host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Sidecar HTTP port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Name of the state store component.
    #[serde(default = "default_state_store")]
    pub state_store: String,
    /// Name of the pub/sub component.
    #[serde(default = "default_pubsub")]
    pub pubsub: String,
    /// API token sent to the sidecar, when it requires one.
    #[serde(default)]
    pub api_token: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_http_port() -> u16 {
    3500
}

fn default_state_store() -> String {
    "statestore".to_string()
}

fn default_pubsub() -> String {
    "pubsub".to_string()
}

fn default_timeout_seconds() -> u64 {
    10
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            state_store: default_state_store(),
            pubsub: default_pubsub(),
            api_token: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl SidecarConfig {
    /// Base URL of the sidecar HTTP API.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }
}
