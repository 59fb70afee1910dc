//! Network service for managing P2P connections.
//!
//! This module provides:
//! - TCP listener for incoming connections
//! - Outbound dialer fed by the peer directory
//! - One worker task per connection
//! - A query and control handle for surrounding tooling

use crate::{
    Backends, Connection, ConnectionConfig, ConnectionDetail, ConnectionPool, ConnectionSummary,
    Direction, InvEntry, NetAddr, NetworkResult, PeerId, PoolLimits, DEFAULT_PORT,
    MAINNET_MAGIC, MAX_INBOUND, MAX_OUTBOUND, NODE_NETWORK, PROTOCOL_VERSION, USER_AGENT,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause before re-checking a full inbound pool or after an accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(250);

/// Pause between dialer passes.
const DIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Network service configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Listen address.
    pub listen_addr: SocketAddr,
    /// Accept inbound connections and announce our address.
    pub server: bool,
    /// Network magic bytes.
    pub magic: [u8; 4],
    /// Protocol version announced in `version`.
    pub protocol_version: u32,
    /// User agent announced in `version`.
    pub user_agent: String,
    /// Service bits we advertise.
    pub services: u64,
    /// Inbound connection ceiling.
    pub max_inbound: usize,
    /// Outbound connection ceiling.
    pub max_outbound: usize,
    /// Per-connection configuration.
    pub connection: ConnectionConfig,
}

impl NetworkConfig {
    /// Pool ceilings.
    pub fn limits(&self) -> PoolLimits {
        PoolLimits {
            max_inbound: self.max_inbound,
            max_outbound: self.max_outbound,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            server: false,
            magic: MAINNET_MAGIC,
            protocol_version: PROTOCOL_VERSION,
            user_agent: USER_AGENT.to_string(),
            services: NODE_NETWORK,
            max_inbound: MAX_INBOUND,
            max_outbound: MAX_OUTBOUND,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Process-wide diagnostic counters.
#[derive(Debug, Default)]
pub struct NetworkStats {
    invs_sent: AtomicU64,
    blocks_sent: AtomicU64,
    timeouts: AtomicU64,
}

impl NetworkStats {
    pub(crate) fn record_inv_sent(&self) {
        self.invs_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_block_sent(&self) {
        self.blocks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters plus pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// `inv` replies sent for `getblocks`.
    pub invs_sent: u64,
    /// Blocks served for `getdata`.
    pub blocks_sent: u64,
    /// Connections closed for silence.
    pub timeouts: u64,
    /// Live inbound connections.
    pub inbound: usize,
    /// Live or dialing outbound connections.
    pub outbound: usize,
}

/// State shared by the acceptor, the dialer and every connection worker.
pub struct NetworkContext {
    /// Configuration.
    pub config: NetworkConfig,
    /// Connection registry.
    pub pool: ConnectionPool,
    /// External collaborators.
    pub backends: Backends,
    /// Counters.
    pub stats: NetworkStats,
    external_addr: OnceLock<NetAddr>,
    shutdown: watch::Sender<bool>,
}

impl NetworkContext {
    /// Create a context with an empty pool.
    pub fn new(config: NetworkConfig, backends: Backends) -> Self {
        let pool = ConnectionPool::new(config.limits());
        Self {
            config,
            pool,
            backends,
            stats: NetworkStats::default(),
            external_addr: OnceLock::new(),
            shutdown: watch::channel(false).0,
        }
    }

    /// Our advertised address, once a peer has told us what it is.
    pub fn external_address(&self) -> Option<NetAddr> {
        self.external_addr.get().copied()
    }

    /// Record the address a peer saw us at. Only the first report sticks;
    /// the port is replaced by our listen port.
    pub fn learn_external_address(&self, seen: NetAddr) -> bool {
        if self.external_addr.get().is_some() {
            return false;
        }
        let ours = NetAddr {
            services: self.config.services,
            ip: seen.ip,
            port: self.config.listen_addr.port(),
        };
        if self.external_addr.set(ours).is_err() {
            return false;
        }
        // Trusted from a single peer without cross-checking.
        warn!(addr = %ours, "External address learned from peer version");
        true
    }

    /// Shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop the loops and flag every connection broken.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.pool.close_all();
    }

    fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Counters plus pool occupancy.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            invs_sent: self.stats.invs_sent.load(Ordering::Relaxed),
            blocks_sent: self.stats.blocks_sent.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            inbound: self.pool.count_inbound(),
            outbound: self.pool.count_outbound(),
        }
    }
}

/// Cloneable query and control surface.
#[derive(Clone)]
pub struct NetworkHandle {
    ctx: Arc<NetworkContext>,
}

impl NetworkHandle {
    /// Connection table, ordered by identity.
    pub fn connections(&self) -> Vec<ConnectionSummary> {
        self.ctx.pool.snapshot()
    }

    /// Detail for one connection.
    pub fn connection(&self, id: &PeerId) -> Option<ConnectionDetail> {
        self.ctx.pool.detail(id)
    }

    /// Drop every connection to an IP.
    pub fn drop_ip(&self, ip: IpAddr) -> bool {
        self.ctx.pool.drop_ip(ip)
    }

    /// Counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats_snapshot()
    }

    /// Our advertised address, if known.
    pub fn external_address(&self) -> Option<NetAddr> {
        self.ctx.external_address()
    }

    /// Running as a server.
    pub fn is_server(&self) -> bool {
        self.ctx.config.server
    }

    /// Queue an inventory entry for every connection except `exclude`.
    pub fn broadcast_inventory(&self, entry: InvEntry, exclude: Option<PeerId>) -> usize {
        self.ctx.pool.broadcast_inventory(entry, exclude)
    }

    /// Stop accepting, stop dialing and close every connection.
    pub fn shutdown(&self) {
        info!("Network shutdown requested");
        self.ctx.shutdown();
    }
}

/// Network service owning the listener and dialer loops.
pub struct NetworkService {
    ctx: Arc<NetworkContext>,
    listener: Option<TcpListener>,
}

impl NetworkService {
    /// Create a new network service.
    pub fn new(config: NetworkConfig, backends: Backends) -> Self {
        Self {
            ctx: Arc::new(NetworkContext::new(config, backends)),
            listener: None,
        }
    }

    /// Bind the listener now so the bound address is known before `run`.
    pub async fn bind(&mut self) -> NetworkResult<SocketAddr> {
        let listener = TcpListener::bind(self.ctx.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Network service listening");
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Query and control handle.
    pub fn handle(&self) -> NetworkHandle {
        NetworkHandle {
            ctx: self.ctx.clone(),
        }
    }

    /// Shared context.
    pub fn context(&self) -> Arc<NetworkContext> {
        self.ctx.clone()
    }

    /// Run the acceptor (server mode only) and the dialer until shutdown.
    pub async fn run(mut self) -> NetworkResult<()> {
        let acceptor = if self.ctx.config.server {
            let listener = match self.listener.take() {
                Some(listener) => listener,
                None => {
                    self.bind().await?;
                    match self.listener.take() {
                        Some(listener) => listener,
                        None => return Ok(()),
                    }
                }
            };
            Some(tokio::spawn(accept_loop(self.ctx.clone(), listener)))
        } else {
            None
        };

        let dialer = tokio::spawn(dial_loop(self.ctx.clone()));

        if let Some(acceptor) = acceptor {
            if let Err(e) = acceptor.await {
                error!(error = %e, "Acceptor task failed");
            }
        }
        if let Err(e) = dialer.await {
            error!(error = %e, "Dialer task failed");
        }
        info!("Network service stopped");
        Ok(())
    }
}

async fn accept_loop(ctx: Arc<NetworkContext>, listener: TcpListener) {
    let mut shutdown = ctx.subscribe_shutdown();
    loop {
        if *shutdown.borrow() {
            break;
        }

        if !ctx.pool.has_inbound_capacity() {
            tokio::select! {
                _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                _ = shutdown.changed() => break,
            }
        }

        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => handle_incoming(&ctx, stream, addr),
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    info!("Acceptor stopped");
}

fn handle_incoming(ctx: &Arc<NetworkContext>, stream: TcpStream, addr: SocketAddr) {
    let Some(id) = ctx.backends.peers.accept_incoming(addr) else {
        debug!(addr = %addr, "Peer directory refused inbound connection");
        return;
    };

    let shared = match ctx.pool.try_register(id, addr, Direction::Inbound) {
        Ok(shared) => shared,
        Err(e) => {
            debug!(addr = %addr, error = %e, "Refusing inbound connection");
            return;
        }
    };

    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Accepted socket unusable");
            ctx.pool.remove(&id);
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    info!(addr = %addr, "Incoming connection");
    let conn = Connection::new(stream, local, ctx.clone(), shared);
    tokio::spawn(run_worker(ctx.clone(), conn));
}

async fn dial_loop(ctx: Arc<NetworkContext>) {
    let mut shutdown = ctx.subscribe_shutdown();
    loop {
        if *shutdown.borrow() {
            break;
        }

        if ctx.pool.has_outbound_capacity() {
            let pool = &ctx.pool;
            if let Some(addr) = ctx.backends.peers.select_peer(&|id| pool.contains(id)) {
                dial(&ctx, addr);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(DIAL_INTERVAL) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("Dialer stopped");
}

/// Reserve the identity, then dial and run the worker on a new task.
fn dial(ctx: &Arc<NetworkContext>, addr: SocketAddr) {
    let id = PeerId::from_addr(&addr);
    let shared = match ctx.pool.try_register(id, addr, Direction::Outbound) {
        Ok(shared) => shared,
        Err(e) => {
            debug!(addr = %addr, error = %e, "Not dialing");
            return;
        }
    };

    let ctx = ctx.clone();
    tokio::spawn(async move {
        info!(addr = %addr, "Connecting to peer");
        match Connection::connect(ctx.clone(), shared).await {
            Ok(conn) => run_worker(ctx, conn).await,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Outgoing connection failed");
                ctx.pool.remove(&id);
                ctx.backends.peers.mark_dead(&id);
            }
        }
    });
}

/// Run one connection to completion inside its own span.
async fn run_worker<S>(ctx: Arc<NetworkContext>, conn: Connection<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = conn.peer_id;
    let direction = conn.direction;
    let span = info_span!("conn", peer = %id, addr = %conn.addr, dir = %direction);

    let reason = conn.run().instrument(span).await;
    if direction == Direction::Outbound && !reason.is_ban() {
        ctx.backends.peers.mark_dead(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryChain, MemoryTxPool, PeerBook};
    use bytes::Bytes;

    fn context(config: NetworkConfig) -> NetworkContext {
        let backends = Backends::in_memory(
            Arc::new(PeerBook::default()),
            Arc::new(MemoryChain::new([1; 32], Bytes::new())),
            Arc::new(MemoryTxPool::new()),
        );
        NetworkContext::new(config, backends)
    }

    #[test]
    fn test_network_config_default() {
        let config = NetworkConfig::default();
        assert_eq!(config.listen_addr.port(), 8333);
        assert_eq!(config.magic, MAINNET_MAGIC);
        assert_eq!(config.limits(), PoolLimits::default());
        assert!(!config.server);
    }

    #[test]
    fn test_external_address_first_report_wins() {
        let ctx = context(NetworkConfig {
            listen_addr: "0.0.0.0:18333".parse().unwrap(),
            ..Default::default()
        });
        assert!(ctx.external_address().is_none());

        let first = NetAddr::new("203.0.113.7:50123".parse().unwrap(), 0);
        let second = NetAddr::new("198.51.100.1:8333".parse().unwrap(), 0);
        assert!(ctx.learn_external_address(first));
        assert!(!ctx.learn_external_address(second));

        let ours = ctx.external_address().unwrap();
        assert_eq!(ours.socket_addr(), "203.0.113.7:18333".parse().unwrap());
        assert_eq!(ours.services, NODE_NETWORK);
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let ctx = context(NetworkConfig::default());
        let addr: SocketAddr = "10.0.0.1:8333".parse().unwrap();
        let shared = ctx
            .pool
            .try_register(PeerId::from_addr(&addr), addr, Direction::Inbound)
            .unwrap();

        assert!(!ctx.is_shutting_down());
        ctx.shutdown();
        assert!(ctx.is_shutting_down());
        assert!(shared.is_broken());
    }

    #[test]
    fn test_stats_snapshot() {
        let ctx = context(NetworkConfig::default());
        ctx.stats.record_inv_sent();
        ctx.stats.record_block_sent();
        ctx.stats.record_block_sent();
        let stats = ctx.stats_snapshot();
        assert_eq!(stats.invs_sent, 1);
        assert_eq!(stats.blocks_sent, 2);
        assert_eq!(stats.timeouts, 0);
    }
}
