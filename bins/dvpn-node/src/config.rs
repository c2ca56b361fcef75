//! Node configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dvpn_network::ip::DEFAULT_IP_ECHO_URL;
use dvpn_network::stun::DEFAULT_STUN_SERVERS;
use dvpn_network::PingConfig;
use dvpn_p2p::P2PConfig;
use serde::{Deserialize, Serialize};

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity and service
    pub node: NodeSection,
    /// Broker used for the config exchange
    pub broker: BrokerSection,
    /// Ports and addresses
    pub network: NetworkSection,
    /// Hole punching timing
    #[serde(default)]
    pub ping: PingConfig,
    /// Channel and handshake settings
    #[serde(default)]
    pub p2p: P2PConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Secret seed of the node identity, relative to the config file
    pub identity_file: PathBuf,
    /// Service type offered or requested
    pub service_type: String,
}

/// Broker transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Nats,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    pub kind: BrokerKind,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// First port handed out for channels
    pub port_range_start: u16,
    /// Last port handed out for channels
    pub port_range_end: u16,
    /// Skip IP echo lookups when set
    pub public_ip: Option<String>,
    /// Service answering with the caller's public IP
    pub ip_echo_url: String,
    /// Map ports on the gateway with UPnP
    pub upnp: bool,
    /// Hand service sockets to a local service on this port
    pub service_port: Option<u16>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection {
                identity_file: PathBuf::from("identity.key"),
                service_type: "wireguard".to_string(),
            },
            broker: BrokerSection {
                kind: BrokerKind::Nats,
                addresses: vec!["nats://broker.dvpn.network:4222".to_string()],
            },
            network: NetworkSection {
                port_range_start: 40000,
                port_range_end: 50000,
                public_ip: None,
                ip_echo_url: DEFAULT_IP_ECHO_URL.to_string(),
                upnp: true,
                service_port: None,
            },
            ping: PingConfig::default(),
            p2p: P2PConfig {
                stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
                ..P2PConfig::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Identity file path, resolved against the config file's directory
    pub fn identity_path(&self, config_path: &Path) -> PathBuf {
        if self.node.identity_file.is_absolute() {
            return self.node.identity_file.clone();
        }
        config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&self.node.identity_file)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.network.port_range_start == 0
            || self.network.port_range_start > self.network.port_range_end
        {
            anyhow::bail!("port range must be a non-empty range of non-zero ports");
        }
        if self.broker.addresses.is_empty() {
            anyhow::bail!("at least one broker address is required");
        }
        if self.node.service_type.is_empty() || self.node.service_type.contains(['.', ' ']) {
            anyhow::bail!("service type must be a single subject token");
        }
        if let Some(ip) = &self.network.public_ip {
            ip.parse::<std::net::IpAddr>()
                .with_context(|| format!("invalid public IP {:?}", ip))?;
        }
        self.ping.validate().map_err(anyhow::Error::msg)?;
        self.p2p.validate()?;
        Ok(())
    }

    /// Per-request timeout for the config exchange
    pub fn exchange_timeout(&self) -> Duration {
        self.p2p.send_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let config = NodeConfig::default();
        config.validate().unwrap();

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.broker.kind, BrokerKind::Nats);
        assert_eq!(parsed.network.port_range_end, 50000);
        assert_eq!(parsed.p2p.stun_servers, config.p2p.stun_servers);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = NodeConfig::default();
        config.network.port_range_start = 50001;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.node.service_type = "wire.guard".to_string();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.network.public_ip = Some("nowhere".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identity_path() {
        let config = NodeConfig::default();
        assert_eq!(
            config.identity_path(Path::new("/etc/dvpn/config.toml")),
            PathBuf::from("/etc/dvpn/identity.key")
        );
    }
}
