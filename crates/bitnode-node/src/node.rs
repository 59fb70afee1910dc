//! Node implementation.

use crate::config::NodeConfig;
use anyhow::{Context, Result};
use bitnode_network::{
    hash_to_hex, Backends, ChainIndex, Hash256, MemoryChain, MemoryTxPool, NetworkHandle,
    NetworkService, PeerBook, PeerBookConfig,
};
use bytes::Bytes;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Interval for periodic peer book maintenance (expired bans).
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Mainnet genesis block header.
const MAINNET_GENESIS: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

/// Testnet genesis block header.
const TESTNET_GENESIS: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff001d1aa4ae18";

/// The main node struct wiring the network engine to its collaborators.
pub struct Node {
    /// Node configuration.
    config: NodeConfig,
    /// Peer address book.
    peers: Arc<PeerBook>,
    /// Block tree.
    chain: Arc<MemoryChain>,
    /// Network service, taken by `run`.
    service: NetworkService,
}

impl Node {
    /// Create a new node.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let network_config = config.network_config()?;

        let peers = Arc::new(PeerBook::new(PeerBookConfig::default()));
        for peer in &config.p2p.known_peers {
            match resolve(peer) {
                Some(addr) => {
                    peers.add_peer(addr);
                }
                None => warn!(peer = %peer, "Ignoring unresolvable peer address"),
            }
        }
        info!("Known peers: {}", peers.len());

        let genesis_hex = match config.network.as_str() {
            "testnet" => TESTNET_GENESIS,
            _ => MAINNET_GENESIS,
        };
        let genesis = hex::decode(genesis_hex).context("Invalid genesis block")?;
        let chain = Arc::new(
            MemoryChain::with_genesis(Bytes::from(genesis)).context("Invalid genesis block")?,
        );
        info!("Genesis: {}", hash_to_hex(&chain.tip()));

        let backends = Backends::in_memory(peers.clone(), chain.clone(), Arc::new(MemoryTxPool::new()));
        let mut service = NetworkService::new(network_config, backends);
        if config.p2p.listen {
            service
                .bind()
                .await
                .with_context(|| format!("Failed to bind {}", config.p2p.bind_address))?;
        }

        Ok(Self {
            config,
            peers,
            chain,
            service,
        })
    }

    /// Query and control handle for the network.
    pub fn network(&self) -> NetworkHandle {
        self.service.handle()
    }

    /// Whether the interactive console should run.
    pub fn console_enabled(&self) -> bool {
        self.config.console
    }

    /// Run until the network shuts down.
    pub async fn run(self) -> Result<()> {
        let peers = self.peers.clone();
        let maintenance = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                peers.cleanup_expired_bans();
            }
        });

        let result = self.service.run().await;
        maintenance.abort();

        let (height, tip) = chain_summary(&self.chain);
        info!(height, tip = %hash_to_hex(&tip), "Chain at shutdown");
        result.context("Network service failed")
    }
}

/// Best height and tip of the chain.
fn chain_summary(chain: &MemoryChain) -> (u32, Hash256) {
    (chain.best_height(), chain.tip())
}

/// Parse `host:port`, resolving names if needed.
fn resolve(peer: &str) -> Option<SocketAddr> {
    if let Ok(addr) = peer.parse() {
        return Some(addr);
    }
    peer.to_socket_addrs().ok()?.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_headers_parse() {
        for genesis in [MAINNET_GENESIS, TESTNET_GENESIS] {
            let raw = hex::decode(genesis).unwrap();
            assert_eq!(raw.len(), 80);
            let chain = MemoryChain::with_genesis(Bytes::from(raw)).unwrap();
            assert_eq!(chain.best_height(), 0);
        }
    }

    #[test]
    fn test_chain_summary_ignores_forks() {
        // [0] <- [1] <- [3]
        //     <- [2]
        let chain = MemoryChain::new([0; 32], Bytes::new());
        chain.insert([1; 32], [0; 32], Bytes::new());
        chain.insert([2; 32], [0; 32], Bytes::new());
        chain.insert([3; 32], [1; 32], Bytes::new());

        assert_eq!(chain.len(), 4);
        assert_eq!(chain_summary(&chain), (2, [3; 32]));
    }

    #[test]
    fn test_resolve_literal() {
        assert_eq!(
            resolve("192.0.2.1:8333"),
            Some("192.0.2.1:8333".parse().unwrap())
        );
        assert_eq!(resolve("not an address"), None);
    }

    #[tokio::test]
    async fn test_node_seeds_peers() {
        let mut config = NodeConfig::default_for_network("testnet");
        config.p2p.known_peers = vec!["192.0.2.1:18333".into(), "bogus".into()];
        let node = Node::new(config).await.unwrap();
        assert_eq!(node.peers.len(), 1);
        assert!(!node.network().is_server());
        assert!(node.network().connections().is_empty());
    }
}
