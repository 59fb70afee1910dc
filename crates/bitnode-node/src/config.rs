//! Node configuration.

use crate::Args;
use anyhow::{bail, Context, Result};
use bitnode_network::{
    ConnectionConfig, NetworkConfig, DEFAULT_PORT, MAINNET_MAGIC, MAX_INBOUND, MAX_OUTBOUND,
    NODE_NETWORK, PROTOCOL_VERSION, TESTNET_MAGIC, TESTNET_PORT, USER_AGENT,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network (mainnet, testnet).
    pub network: String,
    /// P2P configuration.
    #[serde(default)]
    pub p2p: P2pConfig,
    /// Run the interactive console.
    #[serde(default = "default_true")]
    pub console: bool,
}

fn default_true() -> bool {
    true
}

/// P2P configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// P2P bind address.
    pub bind_address: String,
    /// Accept inbound connections and announce our address.
    #[serde(default)]
    pub listen: bool,
    /// Known peers.
    #[serde(default)]
    pub known_peers: Vec<String>,
    /// Maximum inbound connections.
    pub max_inbound: usize,
    /// Maximum outbound connections.
    pub max_outbound: usize,
    /// User agent announced to peers.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Seconds without data before a peer is dropped.
    #[serde(default = "default_no_data_timeout")]
    pub no_data_timeout_secs: u64,
}

fn default_user_agent() -> String {
    USER_AGENT.to_string()
}

fn default_no_data_timeout() -> u64 {
    60
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", DEFAULT_PORT),
            listen: false,
            known_peers: Vec::new(),
            max_inbound: MAX_INBOUND,
            max_outbound: MAX_OUTBOUND,
            user_agent: default_user_agent(),
            no_data_timeout_secs: default_no_data_timeout(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default_for_network(&args.network)
        };

        // Override with CLI args
        config.network = args.network.clone();

        if let Some(ref p2p_bind) = args.p2p_bind {
            config.p2p.bind_address = p2p_bind.clone();
        }
        if args.listen {
            config.p2p.listen = true;
        }
        config.p2p.known_peers.extend(args.connect.iter().cloned());
        if let Some(max) = args.max_inbound {
            config.p2p.max_inbound = max;
        }
        if let Some(max) = args.max_outbound {
            config.p2p.max_outbound = max;
        }
        if args.no_console {
            config.console = false;
        }

        Ok(config)
    }

    /// Create default config for a network.
    pub fn default_for_network(network: &str) -> Self {
        let port = match network {
            "testnet" => TESTNET_PORT,
            _ => DEFAULT_PORT,
        };

        Self {
            network: network.to_string(),
            p2p: P2pConfig {
                bind_address: format!("0.0.0.0:{}", port),
                ..Default::default()
            },
            console: true,
        }
    }

    /// Network magic for the configured network.
    pub fn magic(&self) -> Result<[u8; 4]> {
        match self.network.as_str() {
            "mainnet" => Ok(MAINNET_MAGIC),
            "testnet" => Ok(TESTNET_MAGIC),
            other => bail!("Unknown network '{}'", other),
        }
    }

    /// Library-level network configuration.
    pub fn network_config(&self) -> Result<NetworkConfig> {
        let listen_addr: SocketAddr = self
            .p2p
            .bind_address
            .parse()
            .with_context(|| format!("Invalid P2P bind address '{}'", self.p2p.bind_address))?;

        Ok(NetworkConfig {
            listen_addr,
            server: self.p2p.listen,
            magic: self.magic()?,
            protocol_version: PROTOCOL_VERSION,
            user_agent: self.p2p.user_agent.clone(),
            services: NODE_NETWORK,
            max_inbound: self.p2p.max_inbound,
            max_outbound: self.p2p.max_outbound,
            connection: ConnectionConfig {
                no_data_timeout: Duration::from_secs(self.p2p.no_data_timeout_secs),
                ..Default::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["bitnode"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default_for_network("mainnet");
        assert_eq!(config.network, "mainnet");
        assert_eq!(config.p2p.bind_address, "0.0.0.0:8333");
        assert_eq!(config.magic().unwrap(), MAINNET_MAGIC);
        assert!(config.console);
    }

    #[test]
    fn test_testnet_config() {
        let config = NodeConfig::default_for_network("testnet");
        assert_eq!(config.p2p.bind_address, "0.0.0.0:18333");
        assert_eq!(config.magic().unwrap(), TESTNET_MAGIC);
    }

    #[test]
    fn test_unknown_network_rejected() {
        let config = NodeConfig::default_for_network("regtest");
        assert!(config.magic().is_err());
        assert!(config.network_config().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let args = args(&[
            "--listen",
            "--p2p-bind",
            "127.0.0.1:9999",
            "--connect",
            "10.0.0.1:8333",
            "--max-outbound",
            "2",
            "--no-console",
        ]);

        let config = NodeConfig::load(&missing, &args).unwrap();
        assert!(config.p2p.listen);
        assert!(!config.console);
        assert_eq!(config.p2p.known_peers, vec!["10.0.0.1:8333".to_string()]);

        let net = config.network_config().unwrap();
        assert_eq!(net.listen_addr, "127.0.0.1:9999".parse().unwrap());
        assert!(net.server);
        assert_eq!(net.max_outbound, 2);
        assert_eq!(net.max_inbound, MAX_INBOUND);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bitnode.toml");
        std::fs::write(
            &path,
            r#"
network = "testnet"

[p2p]
bind_address = "0.0.0.0:18444"
known_peers = ["192.0.2.1:18333"]
max_inbound = 4
max_outbound = 3
no_data_timeout_secs = 90
"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path, &args(&["--network", "testnet"])).unwrap();
        assert_eq!(config.p2p.max_inbound, 4);
        assert_eq!(config.p2p.user_agent, USER_AGENT);
        assert!(config.console);

        let net = config.network_config().unwrap();
        assert_eq!(net.magic, TESTNET_MAGIC);
        assert_eq!(net.connection.no_data_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = NodeConfig::default_for_network("mainnet");
        config.p2p.known_peers.push("192.0.2.9:8333".to_string());
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = NodeConfig::load(&path, &args(&[])).unwrap();
        assert_eq!(loaded.p2p.known_peers, config.p2p.known_peers);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "network = [").unwrap();
        assert!(NodeConfig::load(&path, &args(&[])).is_err());
    }
}
