//! Agent configuration.
//!
//! Loaded from YAML with every field defaulted, so an empty file (or no file
//! at all) yields a runnable development setup. A few secrets can be
//! overridden from the environment:
//!
//! - `MCP_AGENT_CONFIG`: path of the YAML file
//! - `MCP_AGENT_AUTH_TOKEN`: gateway auth secret
//! - `MCP_AGENT_BEARER_TOKEN`: MCP HTTP bearer token

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::DEFAULT_BUCKET;

pub const ENV_CONFIG_PATH: &str = "MCP_AGENT_CONFIG";
pub const ENV_AUTH_TOKEN: &str = "MCP_AGENT_AUTH_TOKEN";
pub const ENV_BEARER_TOKEN: &str = "MCP_AGENT_BEARER_TOKEN";

/// Permissions every gateway receives unless configured otherwise.
pub const DEFAULT_PERMISSIONS: &[&str] = &[
    "mcp.capability.execution",
    "mcp.capability.event-emitter",
    "mcp.capability.command-manager",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Identity this agent reports to gateways.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentInfo {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_version: String,
    pub environment: String,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            agent_id: "mcp-agent-default".to_string(),
            agent_name: "MCP Agent".to_string(),
            agent_version: "1.0.0".to_string(),
            environment: "production".to_string(),
        }
    }
}

/// Description of the host system the agent runs inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: String,
    pub version: String,
    pub max_players: u32,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            server_type: "generic".to_string(),
            version: "unknown".to_string(),
            max_players: 0,
        }
    }
}

/// Gateway WebSocket listener. Intervals are milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketServerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Shared gateway secret. Empty means open authentication.
    pub auth_token: String,
    pub heartbeat_interval: u64,
    pub heartbeat_timeout: u64,
    pub reconnect_delay: u64,
    pub max_retries: u32,
    pub max_connections: usize,
    /// Idle timeout in seconds.
    pub session_timeout: u64,
}

impl Default for WebSocketServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            path: "/ws".to_string(),
            auth_token: "ChangeMe!".to_string(),
            heartbeat_interval: 30_000,
            heartbeat_timeout: 90_000,
            reconnect_delay: 5_000,
            max_retries: 3,
            max_connections: 1,
            session_timeout: 300,
        }
    }
}

impl WebSocketServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout)
    }
}

/// MCP JSON-RPC over HTTP listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub bearer_token: String,
    /// Permissions granted to HTTP callers.
    pub caller_permissions: Vec<String>,
    /// Roles granted to HTTP callers.
    pub caller_roles: Vec<String>,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8766,
            path: "/mcp".to_string(),
            bearer_token: "ChangeMeToo!".to_string(),
            caller_permissions: DEFAULT_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
            caller_roles: vec!["operator".to_string()],
        }
    }
}

impl McpServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_info: AgentInfo,
    pub server_info: ServerInfo,
    pub websocket_server: WebSocketServerConfig,
    pub mcp_server: McpServerConfig,
    /// Permission buckets keyed by gateway id, with a `default` bucket.
    pub gateway_permissions: HashMap<String, Vec<String>>,
    /// Role buckets keyed by gateway id, with a `default` bucket.
    pub gateway_roles: HashMap<String, Vec<String>>,
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let mut config = Self {
            agent_info: AgentInfo::default(),
            server_info: ServerInfo::default(),
            websocket_server: WebSocketServerConfig::default(),
            mcp_server: McpServerConfig::default(),
            gateway_permissions: HashMap::new(),
            gateway_roles: HashMap::new(),
            debug: false,
        };
        config.fill_default_buckets();
        config
    }
}

impl AgentConfig {
    /// Parse YAML. Missing sections and fields take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.fill_default_buckets();
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Load from `MCP_AGENT_CONFIG` (or defaults), apply environment
    /// overrides, and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => {
                log::info!("Loading configuration from {}", path);
                Self::from_file(path)?
            }
            Err(_) => {
                log::info!("{} not set, using default configuration", ENV_CONFIG_PATH);
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply secret overrides from `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ENV_AUTH_TOKEN) {
            log::debug!("Gateway auth token taken from {}", ENV_AUTH_TOKEN);
            self.websocket_server.auth_token = token;
        }
        if let Some(token) = lookup(ENV_BEARER_TOKEN) {
            log::debug!("MCP bearer token taken from {}", ENV_BEARER_TOKEN);
            self.mcp_server.bearer_token = token;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ws = &self.websocket_server;
        if ws.port == 0 {
            return Err(ConfigError::Validation("websocket_server.port must be non-zero".into()));
        }
        if self.mcp_server.enabled && self.mcp_server.port == 0 {
            return Err(ConfigError::Validation("mcp_server.port must be non-zero".into()));
        }
        if ws.heartbeat_timeout < ws.heartbeat_interval {
            return Err(ConfigError::Validation(format!(
                "websocket_server.heartbeat_timeout ({}) must be at least heartbeat_interval ({})",
                ws.heartbeat_timeout, ws.heartbeat_interval
            )));
        }
        for (field, path) in [("websocket_server.path", &ws.path), ("mcp_server.path", &self.mcp_server.path)] {
            if !path.starts_with('/') {
                return Err(ConfigError::Validation(format!("{} must start with '/': {}", field, path)));
            }
        }
        if ws.auth_token.is_empty() {
            log::warn!("websocket_server.auth_token is empty: gateway authentication is OPEN");
        }
        Ok(())
    }

    fn fill_default_buckets(&mut self) {
        self.gateway_permissions
            .entry(DEFAULT_BUCKET.to_string())
            .or_insert_with(|| DEFAULT_PERMISSIONS.iter().map(|p| p.to_string()).collect());
        self.gateway_roles.entry(DEFAULT_BUCKET.to_string()).or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.agent_info.agent_id, "mcp-agent-default");
        assert_eq!(config.websocket_server.bind_addr(), "127.0.0.1:8765");
        assert_eq!(config.websocket_server.max_connections, 1);
        assert_eq!(config.websocket_server.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.mcp_server.path, "/mcp");
        assert_eq!(config.gateway_permissions["default"].len(), 3);
        assert!(config.gateway_roles["default"].is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults_and_default_bucket() {
        let yaml = r#"
agent_info:
  agent_id: lobby-1
websocket_server:
  port: 9000
  max_connections: 4
server_info:
  type: paper
gateway_permissions:
  gw-admin: [a, b]
gateway_roles:
  gw-admin: [admin]
"#;
        let config = AgentConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.agent_info.agent_id, "lobby-1");
        assert_eq!(config.agent_info.agent_name, "MCP Agent");
        assert_eq!(config.websocket_server.port, 9000);
        assert_eq!(config.websocket_server.path, "/ws");
        assert_eq!(config.server_info.server_type, "paper");
        assert_eq!(config.gateway_permissions["gw-admin"], vec!["a", "b"]);
        assert!(config.gateway_permissions.contains_key("default"));
        assert_eq!(config.gateway_roles["gw-admin"], vec!["admin"]);
        assert!(AgentConfig::from_yaml("").unwrap().gateway_roles.contains_key("default"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "debug: true\nmcp_server:\n  bearer_token: abc").unwrap();
        let config = AgentConfig::from_file(file.path()).unwrap();
        assert!(config.debug);
        assert_eq!(config.mcp_server.bearer_token, "abc");

        let err = AgentConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_overrides() {
        let mut config = AgentConfig::default();
        config.apply_overrides(|key| match key {
            ENV_AUTH_TOKEN => Some("from-env".to_string()),
            _ => None,
        });
        assert_eq!(config.websocket_server.auth_token, "from-env");
        assert_eq!(config.mcp_server.bearer_token, "ChangeMeToo!");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AgentConfig::default();
        config.websocket_server.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = AgentConfig::default();
        config.websocket_server.heartbeat_timeout = 1_000;
        assert!(config.validate().unwrap_err().to_string().contains("heartbeat_timeout"));

        let mut config = AgentConfig::default();
        config.mcp_server.path = "mcp".into();
        assert!(config.validate().is_err());

        assert!(matches!(
            AgentConfig::from_yaml("websocket_server: [1, 2]"),
            Err(ConfigError::Yaml(_))
        ));
    }
}
