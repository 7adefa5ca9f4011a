use std::{fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Exposer,
    Accessor,
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exposer" => Ok(Role::Exposer),
            "accessor" => Ok(Role::Accessor),
            other => Err(ConfigError::InvalidRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "both" => Ok(Protocol::Both),
            other => Err(ConfigError::InvalidProtocol(other.to_string())),
        }
    }
}

impl Protocol {
    /// True if `self` (the configured protocol) accepts a peer negotiating `offered`.
    pub fn accepts(&self, offered: Protocol) -> bool {
        match self {
            Protocol::Both => matches!(offered, Protocol::Tcp | Protocol::Udp),
            _ => *self == offered,
        }
    }
}

/// Immutable process configuration (spec.md §3 "Configuration").
///
/// Field renames below match the config-file key names spec.md §6 lists
/// (`mode, bridgeId, exposedPort, listenPort, protocol, verbose, secret,
/// status, maxStreams, kbps, tcpRetries, tcpRetryDelayMs`); the CLI path
/// (`cli.rs`) builds this struct directly and never goes through serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "mode")]
    pub role: Role,
    #[serde(rename = "bridgeId")]
    pub bridge_id: String,
    pub protocol: Protocol,
    #[serde(rename = "exposedPort", default = "default_expose_port")]
    pub exposed_port: u16,
    #[serde(rename = "listenPort", default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub secret: String,
    #[serde(rename = "maxStreams", default = "default_max_streams")]
    pub max_streams: usize,
    #[serde(default)]
    pub kbps: u64,
    #[serde(rename = "tcpRetries", default = "default_tcp_retries")]
    pub tcp_connect_retries: u32,
    #[serde(rename = "tcpRetryDelayMs", default = "default_tcp_retry_delay_ms")]
    pub tcp_retry_delay_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub expected_warnings: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub json: bool,
    #[serde(rename = "status", default)]
    pub status_port: u16,
}

fn default_expose_port() -> u16 {
    8080
}
fn default_listen_port() -> u16 {
    5000
}
fn default_max_streams() -> usize {
    256
}
fn default_tcp_retries() -> u32 {
    5
}
fn default_tcp_retry_delay_ms() -> u64 {
    500
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}

impl Config {
    /// Validates cross-field invariants that neither clap nor serde enforce
    /// on their own (spec.md §3, §6 "accessor + protocol=both is rejected").
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.role == Role::Accessor && self.protocol == Protocol::Both {
            return Err(ConfigError::AccessorProtocolBoth);
        }
        if self.max_streams == 0 {
            return Err(ConfigError::InvalidMaxStreams);
        }
        if self.bridge_id.is_empty() {
            return Err(ConfigError::EmptyBridgeId);
        }
        Ok(())
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path_ref.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_accessor_with_protocol_both() {
        let config = Config {
            role: Role::Accessor,
            bridge_id: "x".into(),
            protocol: Protocol::Both,
            exposed_port: 8080,
            listen_port: 5000,
            secret: String::new(),
            max_streams: 10,
            kbps: 0,
            tcp_connect_retries: 5,
            tcp_retry_delay_ms: 500,
            handshake_timeout_ms: 10_000,
            expected_warnings: false,
            verbose: false,
            json: false,
            status_port: 0,
        };
        assert!(matches!(config.validate(), Err(ConfigError::AccessorProtocolBoth)));
    }

    #[test]
    fn protocol_both_accepts_either() {
        assert!(Protocol::Both.accepts(Protocol::Tcp));
        assert!(Protocol::Both.accepts(Protocol::Udp));
        assert!(!Protocol::Tcp.accepts(Protocol::Udp));
    }

    #[test]
    fn deserializes_spec_shaped_config_file_keys() {
        let json = r#"{
            "mode": "exposer",
            "bridgeId": "alpha123",
            "protocol": "tcp",
            "exposedPort": 7001,
            "listenPort": 17001,
            "secret": "s3cret",
            "maxStreams": 64,
            "kbps": 100,
            "tcpRetries": 3,
            "tcpRetryDelayMs": 250,
            "status": 8090
        }"#;
        let config: Config = serde_json::from_str(json).expect("spec-shaped config parses");
        assert_eq!(config.role, Role::Exposer);
        assert_eq!(config.bridge_id, "alpha123");
        assert_eq!(config.exposed_port, 7001);
        assert_eq!(config.listen_port, 17001);
        assert_eq!(config.max_streams, 64);
        assert_eq!(config.tcp_connect_retries, 3);
        assert_eq!(config.tcp_retry_delay_ms, 250);
        assert_eq!(config.status_port, 8090);
    }
}
