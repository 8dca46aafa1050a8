use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    pub fn includes_tcp(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Both)
    }

    pub fn includes_udp(&self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Both)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Both => write!(f, "both"),
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: GatewayServerConfig,

    #[serde(default)]
    pub port_ranges: Vec<PortRangeSpec>,

    #[serde(default)]
    pub specific_ports: Vec<SpecificPortSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayServerConfig {
    #[serde(default = "default_web_port")]
    pub web_port: u16,

    #[serde(default = "default_data_plane_port")]
    pub data_plane_port: u16,

    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
}

impl Default for GatewayServerConfig {
    fn default() -> Self {
        Self {
            web_port: default_web_port(),
            data_plane_port: default_data_plane_port(),
            bind_ip: default_bind_ip(),
        }
    }
}

/// A contiguous range of rentable public ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRangeSpec {
    pub start: u16,
    pub end: u16,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A single rentable public port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpecificPortSpec {
    pub port: u16,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// Agent configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: AgentServerConfig,

    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,

    #[serde(default)]
    pub connection: ConnectionTuning,
}

/// Where the gateway lives: `port` is the data plane, `web_port` the
/// control plane. `local_api_port` is the agent's own management API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentServerConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,

    #[serde(default = "default_data_plane_port")]
    pub port: u16,

    #[serde(default = "default_web_port")]
    pub web_port: u16,

    #[serde(default = "default_local_api_port")]
    pub local_api_port: u16,
}

impl Default for AgentServerConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_data_plane_port(),
            web_port: default_web_port(),
            local_api_port: default_local_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub id: u32,
    pub name: String,

    #[serde(default = "default_local_host")]
    pub local_host: String,

    pub local_port: u16,
    pub protocol: Protocol,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_port: Option<u16>,

    /// Sticky across reconnects until the gateway reports it gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_public_port: Option<u16>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Idle expiry for per-client UDP sockets. Game servers that
    /// exchange keepalives slowly want a much larger value here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_flow_idle_ms: Option<u64>,
}

impl PortMapping {
    pub fn udp_flow_idle(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.udp_flow_idle_ms.unwrap_or(30_000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionTuning {
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    #[serde(default = "default_max_total")]
    pub max_total: usize,

    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            min_idle: default_min_idle(),
            max_total: default_max_total(),
            check_interval_ms: default_check_interval(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

// Default value functions
fn default_web_port() -> u16 {
    8080
}
fn default_data_plane_port() -> u16 {
    9000
}
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}
fn default_local_api_port() -> u16 {
    8081
}
fn default_local_host() -> String {
    "127.0.0.1".to_string()
}
fn default_true() -> bool {
    true
}
fn default_min_idle() -> usize {
    2
}
fn default_max_total() -> usize {
    10
}
fn default_check_interval() -> u64 {
    1000
}
fn default_reconnect_delay() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Load / save / validate
// ---------------------------------------------------------------------------

/// Load the gateway config, creating a default file if none exists.
pub fn load_gateway_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    if !path.exists() {
        let config = GatewayConfig::default();
        save_gateway_config(path, &config)?;
        tracing::info!("Created default gateway config at {}", path.display());
        return Ok(config);
    }
    let content = fs::read_to_string(path)?;
    let config: GatewayConfig = serde_json::from_str(&content)?;
    validate_gateway_config(&config)?;
    Ok(config)
}

pub fn save_gateway_config(path: &Path, config: &GatewayConfig) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_agent_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    if !path.exists() {
        let config = AgentConfig::default();
        save_agent_config(path, &config)?;
        tracing::info!("Created default agent config at {}", path.display());
        return Ok(config);
    }
    let content = fs::read_to_string(path)?;
    let config: AgentConfig = serde_json::from_str(&content)?;
    validate_agent_config(&config)?;
    Ok(config)
}

pub fn save_agent_config(path: &Path, config: &AgentConfig) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

/// Rejected edits never reach disk; persisted state is always valid.
pub fn validate_gateway_config(config: &GatewayConfig) -> Result<(), ConfigError> {
    if config.server.web_port == 0 || config.server.data_plane_port == 0 {
        return Err(ConfigError::ValidationError(
            "Server ports must be non-zero".to_string(),
        ));
    }
    if config.server.web_port == config.server.data_plane_port {
        return Err(ConfigError::ValidationError(
            "Web port and data-plane port must differ".to_string(),
        ));
    }
    for range in &config.port_ranges {
        if range.start == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Port range {}-{} starts at 0",
                range.start, range.end
            )));
        }
        if range.start > range.end {
            return Err(ConfigError::ValidationError(format!(
                "Inverted port range {}-{}",
                range.start, range.end
            )));
        }
    }
    for spec in &config.specific_ports {
        if spec.port == 0 {
            return Err(ConfigError::ValidationError(
                "Specific port 0 is invalid".to_string(),
            ));
        }
    }
    Ok(())
}

pub fn validate_agent_config(config: &AgentConfig) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for mapping in &config.port_mappings {
        if !seen.insert(mapping.id) {
            return Err(ConfigError::ValidationError(format!(
                "Duplicate mapping id {}",
                mapping.id
            )));
        }
        if mapping.local_port == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Mapping '{}' has local port 0",
                mapping.name
            )));
        }
        if mapping.local_host.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Mapping '{}' has an empty local host",
                mapping.name
            )));
        }
    }
    if config.connection.min_idle > config.connection.max_total {
        return Err(ConfigError::ValidationError(format!(
            "min_idle {} exceeds max_total {}",
            config.connection.min_idle, config.connection.max_total
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_gateway() -> GatewayConfig {
        GatewayConfig {
            server: GatewayServerConfig {
                web_port: 8080,
                data_plane_port: 9000,
                bind_ip: "0.0.0.0".to_string(),
            },
            port_ranges: vec![PortRangeSpec {
                start: 30000,
                end: 30100,
                enabled: true,
                name: Some("bulk".to_string()),
            }],
            specific_ports: vec![SpecificPortSpec {
                port: 25565,
                enabled: true,
                name: None,
            }],
        }
    }

    #[test]
    fn test_gateway_config_roundtrip() {
        let dir = std::env::temp_dir().join(format!("burrow-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gateway.json");

        let config = sample_gateway();
        save_gateway_config(&path, &config).unwrap();
        let loaded = load_gateway_config(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut config = sample_gateway();
        config.port_ranges[0].start = 31000;
        config.port_ranges[0].end = 30000;
        assert!(matches!(
            validate_gateway_config(&config),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_colliding_server_ports_rejected() {
        let mut config = sample_gateway();
        config.server.data_plane_port = config.server.web_port;
        assert!(validate_gateway_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_mapping_ids_rejected() {
        let mapping = PortMapping {
            id: 1,
            name: "ssh".to_string(),
            local_host: "127.0.0.1".to_string(),
            local_port: 22,
            protocol: Protocol::Tcp,
            preferred_port: None,
            assigned_public_port: None,
            enabled: true,
            description: None,
            auto_reconnect: true,
            udp_flow_idle_ms: None,
        };
        let config = AgentConfig {
            server: AgentServerConfig::default(),
            port_mappings: vec![mapping.clone(), mapping],
            connection: ConnectionTuning::default(),
        };
        assert!(validate_agent_config(&config).is_err());
    }

    #[test]
    fn test_protocol_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Protocol::Both).unwrap(), "\"both\"");
        let p: Protocol = serde_json::from_str("\"udp\"").unwrap();
        assert_eq!(p, Protocol::Udp);
    }

    #[test]
    fn test_defaults_fill_in() {
        let config: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.connection.min_idle, 2);
        assert_eq!(config.connection.max_total, 10);

        let json = r#"{"port_mappings": [{"id": 1, "name": "game",
            "local_port": 27015, "protocol": "udp"}]}"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        let mapping = &config.port_mappings[0];
        assert_eq!(mapping.local_host, "127.0.0.1");
        assert!(mapping.enabled);
        assert_eq!(mapping.udp_flow_idle(), std::time::Duration::from_secs(30));
    }
}
