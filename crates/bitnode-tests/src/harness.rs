//! Test harness for integration tests.
//!
//! Runs real [`Connection`] workers over in-memory duplex pipes. The test
//! drives the remote end through a `Framed` codec, speaking exactly what a
//! peer on the wire would.

use crate::generators::genesis_chain;
use bitnode_network::{
    decode_inv_list, Backends, Command, Connection, ConnectionShared, Direction, DisconnectReason,
    InvEntry, MemoryChain, MemoryTxPool, MessageCodec, NetAddr, NetworkConfig, NetworkContext,
    PeerDirectory, PeerId, RawMessage, TimestampedAddr, VersionMessage, MAINNET_MAGIC,
    NODE_NETWORK, PROTOCOL_VERSION,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// How long `recv` waits for a message before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Duplex pipe capacity per direction.
pub const PIPE_CAPACITY: usize = 256 * 1024;

/// Source of distinct remote ports.
static NEXT_PORT: AtomicU16 = AtomicU16::new(20_000);

/// Peer directory that records every call.
#[derive(Default)]
pub struct RecordingDirectory {
    candidates: Mutex<VecDeque<SocketAddr>>,
    alive: Mutex<Vec<PeerId>>,
    dead: Mutex<Vec<PeerId>>,
    banned: Mutex<Vec<PeerId>>,
    addresses: Mutex<Vec<TimestampedAddr>>,
}

impl RecordingDirectory {
    /// Queue an address for `select_peer`.
    pub fn push_candidate(&self, addr: SocketAddr) {
        self.candidates.lock().push_back(addr);
    }

    /// Identities passed to `ban`.
    pub fn banned(&self) -> Vec<PeerId> {
        self.banned.lock().clone()
    }

    /// Identities passed to `mark_dead`.
    pub fn dead(&self) -> Vec<PeerId> {
        self.dead.lock().clone()
    }

    /// Number of `mark_alive` calls for an identity.
    pub fn alive_count(&self, id: &PeerId) -> usize {
        self.alive.lock().iter().filter(|a| *a == id).count()
    }

    /// Addresses passed to `add_addresses`.
    pub fn addresses(&self) -> Vec<TimestampedAddr> {
        self.addresses.lock().clone()
    }
}

impl PeerDirectory for RecordingDirectory {
    fn select_peer(&self, skip: &dyn Fn(&PeerId) -> bool) -> Option<SocketAddr> {
        let mut candidates = self.candidates.lock();
        let pos = candidates
            .iter()
            .position(|a| !skip(&PeerId::from_addr(a)))?;
        candidates.remove(pos)
    }

    fn accept_incoming(&self, addr: SocketAddr) -> Option<PeerId> {
        let id = PeerId::from_addr(&addr);
        if self.banned.lock().contains(&id) {
            return None;
        }
        Some(id)
    }

    fn mark_alive(&self, id: &PeerId) {
        self.alive.lock().push(*id);
    }

    fn mark_dead(&self, id: &PeerId) {
        self.dead.lock().push(*id);
    }

    fn ban(&self, id: &PeerId) {
        self.banned.lock().push(*id);
    }

    fn add_addresses(&self, addrs: &[TimestampedAddr]) {
        self.addresses.lock().extend_from_slice(addrs);
    }
}

/// Network configuration used by the harness: mainnet magic, no server mode.
pub fn test_config() -> NetworkConfig {
    NetworkConfig {
        listen_addr: "127.0.0.1:8333".parse().expect("Valid listen address"),
        ..Default::default()
    }
}

/// Shared context plus handles on every collaborator.
pub struct TestNetwork {
    pub ctx: Arc<NetworkContext>,
    pub directory: Arc<RecordingDirectory>,
    pub chain: Arc<MemoryChain>,
    pub txs: Arc<MemoryTxPool>,
}

impl TestNetwork {
    /// Default config over a chain holding only a genesis header.
    pub fn new() -> Self {
        Self::with_chain(test_config(), genesis_chain())
    }

    /// Custom config and chain.
    pub fn with_chain(config: NetworkConfig, chain: MemoryChain) -> Self {
        let directory = Arc::new(RecordingDirectory::default());
        let chain = Arc::new(chain);
        let txs = Arc::new(MemoryTxPool::new());
        let backends = Backends::in_memory(directory.clone(), chain.clone(), txs.clone());
        Self {
            ctx: Arc::new(NetworkContext::new(config, backends)),
            directory,
            chain,
            txs,
        }
    }

    /// Register and start a connection, returning its remote end.
    pub fn connect(&self, direction: Direction) -> TestPeer {
        let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
        let addr = SocketAddr::from(([10, 0, 0, 1], port));
        let id = PeerId::from_addr(&addr);
        let shared = self
            .ctx
            .pool
            .try_register(id, addr, direction)
            .expect("Fresh identity registers");

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let conn = Connection::new(
            local,
            SocketAddr::from(([127, 0, 0, 1], 8333)),
            self.ctx.clone(),
            shared.clone(),
        );
        let task = tokio::spawn(conn.run());

        TestPeer {
            id,
            addr,
            shared,
            remote: Framed::new(remote, MessageCodec::with_magic(self.ctx.config.magic)),
            task,
        }
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// The far end of a running connection.
pub struct TestPeer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub shared: Arc<ConnectionShared>,
    pub remote: Framed<DuplexStream, MessageCodec>,
    task: JoinHandle<DisconnectReason>,
}

impl TestPeer {
    /// Send one framed message.
    pub async fn send(&mut self, command: Command, payload: impl Into<Bytes>) {
        self.remote
            .send(RawMessage::with_command(command, payload))
            .await
            .expect("Remote send");
    }

    /// Write raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.remote.get_mut();
        stream.write_all(bytes).await.expect("Remote raw write");
        stream.flush().await.expect("Remote flush");
    }

    /// Next message, or `None` on close, decode error or timeout.
    pub async fn recv(&mut self) -> Option<RawMessage> {
        match tokio::time::timeout(RECV_TIMEOUT, self.remote.next()).await {
            Ok(Some(Ok(message))) => Some(message),
            _ => None,
        }
    }

    /// Next message, which must be `command`.
    pub async fn expect(&mut self, command: Command) -> RawMessage {
        let message = self.recv().await.expect("Message before timeout");
        assert_eq!(message.kind(), command, "unexpected {}", message.command);
        message
    }

    /// Skip messages until one is `command`.
    pub async fn recv_until(&mut self, command: Command) -> RawMessage {
        loop {
            let message = self.recv().await.expect("Message before timeout");
            if message.kind() == command {
                return message;
            }
        }
    }

    /// Everything received within `window`.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<RawMessage> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(Ok(message))) =
            tokio::time::timeout_at(deadline, self.remote.next()).await
        {
            out.push(message);
        }
        out
    }

    /// Send our `version` as the peer would.
    pub async fn send_version(&mut self) {
        let version = VersionMessage::ours(
            PROTOCOL_VERSION,
            NODE_NETWORK,
            1_700_000_000,
            "198.51.100.20:8333".parse().expect("Valid address"),
            self.addr,
            42,
            "/remote:1.0/",
            0,
        );
        self.send(Command::Version, version.encode()).await;
    }

    /// Complete the handshake from the remote side.
    pub async fn handshake(&mut self, direction: Direction) {
        match direction {
            Direction::Outbound => {
                self.expect(Command::Version).await;
                self.send_version().await;
                self.expect(Command::Verack).await;
                self.send(Command::Verack, Bytes::new()).await;
            }
            Direction::Inbound => {
                self.send_version().await;
                self.expect(Command::Verack).await;
                self.expect(Command::Version).await;
                self.send(Command::Verack, Bytes::new()).await;
            }
        }
    }

    /// Worker has not exited yet.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait for the worker to exit.
    pub async fn finish(self) -> DisconnectReason {
        let TestPeer { remote, task, .. } = self;
        let reason = task.await.expect("Worker does not panic");
        drop(remote);
        reason
    }
}

/// Decode an `inv`/`getdata` payload, panicking on error.
pub fn inv_entries(message: &RawMessage) -> Vec<InvEntry> {
    decode_inv_list(&message.command, &message.payload).expect("Valid inventory list")
}

/// A frame for `command` with one payload byte flipped after the checksum.
pub fn tampered_frame(command: Command, payload: &[u8]) -> Vec<u8> {
    let mut frame = MessageCodec::with_magic(MAINNET_MAGIC)
        .frame(RawMessage::with_command(command, Bytes::copy_from_slice(payload)))
        .expect("Frame encodes")
        .to_vec();
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    frame
}

/// Own-address entry as announced in `addr`.
pub fn announced(ip: [u8; 4], port: u16) -> NetAddr {
    NetAddr::new(SocketAddr::from((ip, port)), NODE_NETWORK)
}
