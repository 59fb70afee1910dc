//! Connection handling.
//!
//! A [`Connection`] owns one socket and runs its whole lifecycle on a single
//! task: a short timed read, dispatch of any complete frame, otherwise one
//! housekeeping tick. Protocol handlers and the tick live in `sync`.

use crate::message::{decode_addr_list, Command, RawMessage, VersionMessage};
use crate::pool::ConnectionShared;
use crate::service::NetworkContext;
use crate::{MessageCodec, NetworkError, NetworkResult, PeerId, SendBuffer};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, info, instrument, trace, warn};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Dial timeout.
    pub connect_timeout: Duration,
    /// How long one read attempt may wait before the worker ticks instead.
    pub read_timeout: Duration,
    /// Disconnect after this long without receiving anything.
    pub no_data_timeout: Duration,
    /// Spacing of own-address announcements.
    pub announce_interval: Duration,
    /// Delay before the first own-address announcement.
    pub first_announce_delay: Duration,
    /// Maximum frame payload size.
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_millis(1),
            no_data_timeout: Duration::from_secs(60),
            announce_interval: Duration::from_secs(15 * 60),
            first_announce_delay: Duration::from_secs(10),
            max_message_size: crate::MAX_MESSAGE_SIZE,
        }
    }
}

/// Who opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("in"),
            Direction::Outbound => f.write_str("out"),
        }
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered; socket not yet running.
    Connecting,
    /// Waiting for the peer's `version`.
    AwaitingVersion,
    /// Our `version` is out; theirs has not arrived.
    VersionSent,
    /// Their `version` arrived; waiting for their `verack`.
    AwaitingVerAck,
    /// Both sides done.
    Established,
    /// Terminal.
    Broken,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingVersion => "awaiting-version",
            ConnectionState::VersionSent => "version-sent",
            ConnectionState::AwaitingVerAck => "awaiting-verack",
            ConnectionState::Established => "established",
            ConnectionState::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Remote closed the socket.
    ClosedByPeer,
    /// Read or write failure, or an oversized frame.
    Io,
    /// Magic bytes did not match.
    Desync,
    /// Checksum mismatch; the peer is banned.
    ProtocolViolation,
    /// A message body could not be understood.
    Malformed,
    /// Nothing received for too long.
    Timeout,
    /// Dropped on request.
    Dropped,
    /// Service is shutting down.
    Shutdown,
}

impl DisconnectReason {
    /// Whether the peer is banned for this.
    pub fn is_ban(&self) -> bool {
        matches!(self, DisconnectReason::ProtocolViolation)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::ClosedByPeer => "closed by peer",
            DisconnectReason::Io => "i/o error",
            DisconnectReason::Desync => "stream desync",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::Malformed => "malformed message",
            DisconnectReason::Timeout => "no data timeout",
            DisconnectReason::Dropped => "dropped",
            DisconnectReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// What the peer told us in its `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerVersion {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub user_agent: Option<String>,
    pub start_height: Option<u32>,
}

impl From<&VersionMessage> for PeerVersion {
    fn from(msg: &VersionMessage) -> Self {
        Self {
            version: msg.version,
            services: msg.services,
            timestamp: msg.timestamp,
            user_agent: msg.user_agent.clone(),
            start_height: msg.start_height,
        }
    }
}

/// Seconds since the unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A P2P connection.
pub struct Connection<S> {
    /// Peer ID.
    pub peer_id: PeerId,
    /// Remote address.
    pub addr: SocketAddr,
    /// Our end of the socket.
    pub(crate) local: SocketAddr,
    pub(crate) direction: Direction,
    stream: S,
    codec: MessageCodec,
    /// Partial header / payload accumulated so far.
    read_buf: BytesMut,
    pub(crate) send_buf: SendBuffer,
    pub(crate) ctx: Arc<NetworkContext>,
    pub(crate) shared: Arc<ConnectionShared>,
    pub(crate) peer: Option<PeerVersion>,
    pub(crate) verack_received: bool,
    pub(crate) version_sent: bool,
    ban: bool,
    last_data: Instant,
    pub(crate) next_addr_announce: Instant,
}

impl Connection<TcpStream> {
    /// Dial the address reserved in `shared`.
    #[instrument(skip_all, fields(peer = %shared.addr))]
    pub async fn connect(
        ctx: Arc<NetworkContext>,
        shared: Arc<ConnectionShared>,
    ) -> NetworkResult<Self> {
        let stream = tokio::time::timeout(
            ctx.config.connection.connect_timeout,
            TcpStream::connect(shared.addr),
        )
        .await
        .map_err(|_| NetworkError::Timeout("Connection timeout".to_string()))?
        .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;

        debug!("Connected");

        Ok(Self::new(stream, local, ctx, shared))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established socket.
    pub fn new(
        stream: S,
        local: SocketAddr,
        ctx: Arc<NetworkContext>,
        shared: Arc<ConnectionShared>,
    ) -> Self {
        let codec = MessageCodec::with_magic(ctx.config.magic)
            .with_max_size(ctx.config.connection.max_message_size);
        let now = Instant::now();
        let next_addr_announce = now + ctx.config.connection.first_announce_delay;
        shared.set_next_announce(next_addr_announce);
        Self {
            peer_id: shared.id,
            addr: shared.addr,
            local,
            direction: shared.direction,
            stream,
            codec,
            read_buf: BytesMut::with_capacity(1024),
            send_buf: SendBuffer::new(),
            ctx,
            shared,
            peer: None,
            verack_received: false,
            version_sent: false,
            ban: false,
            last_data: now,
            next_addr_announce,
        }
    }

    /// Both their `version` and their `verack` have arrived.
    pub(crate) fn handshake_complete(&self) -> bool {
        self.verack_received && self.peer.is_some()
    }

    /// Current handshake state.
    pub fn state(&self) -> ConnectionState {
        if self.shared.is_broken() {
            ConnectionState::Broken
        } else if self.handshake_complete() {
            ConnectionState::Established
        } else if self.peer.is_some() {
            ConnectionState::AwaitingVerAck
        } else if self.version_sent {
            ConnectionState::VersionSent
        } else {
            ConnectionState::AwaitingVersion
        }
    }

    pub(crate) fn refresh_state(&self) {
        self.shared.set_state(self.state());
    }

    /// Run until the connection ends, then tear it down.
    ///
    /// Errors never escape: they are mapped to a [`DisconnectReason`].
    pub async fn run(mut self) -> DisconnectReason {
        let reason = self.run_loop().await;
        self.teardown(reason).await;
        reason
    }

    async fn run_loop(&mut self) -> DisconnectReason {
        if self.direction == Direction::Outbound {
            self.send_version();
        }
        self.refresh_state();

        loop {
            if self.shared.is_broken() {
                return if self.ctx.is_shutting_down() {
                    DisconnectReason::Shutdown
                } else {
                    DisconnectReason::Dropped
                };
            }
            self.shared.record_loop();

            match self.fetch_message().await {
                Ok(Some(message)) => {
                    self.last_data = Instant::now();
                    if let Err(e) = self.dispatch(message) {
                        return self.fail(e);
                    }
                }
                Ok(None) => {
                    if self.last_data.elapsed() > self.ctx.config.connection.no_data_timeout {
                        self.ctx.stats.record_timeout();
                        debug!(
                            peer = %self.addr,
                            idle_secs = self.last_data.elapsed().as_secs(),
                            "No data, disconnecting"
                        );
                        self.shared.mark_broken();
                        return DisconnectReason::Timeout;
                    }
                    if let Err(e) = self.tick() {
                        return self.fail(e);
                    }
                }
                Err(e) => return self.fail(e),
            }
        }
    }

    /// Next complete frame, or `None` if the read attempt timed out first.
    async fn fetch_message(&mut self) -> NetworkResult<Option<RawMessage>> {
        if let Some(message) = self.codec.decode(&mut self.read_buf)? {
            return Ok(Some(message));
        }

        let read = tokio::time::timeout(
            self.ctx.config.connection.read_timeout,
            self.stream.read_buf(&mut self.read_buf),
        )
        .await;

        match read {
            Err(_elapsed) => Ok(None),
            Ok(Ok(0)) => Err(NetworkError::ConnectionClosed),
            Ok(Ok(n)) => {
                self.last_data = Instant::now();
                self.shared.record_received(n);
                self.codec.decode(&mut self.read_buf)
            }
            Ok(Err(e)) => {
                let e = NetworkError::Io(e);
                if e.is_transient() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Map a terminal error to its reason and drop all buffered state.
    fn fail(&mut self, e: NetworkError) -> DisconnectReason {
        let reason = if e.is_protocol_violation() {
            self.ban = true;
            DisconnectReason::ProtocolViolation
        } else {
            match &e {
                NetworkError::ConnectionClosed => DisconnectReason::ClosedByPeer,
                NetworkError::MagicMismatch { .. } => DisconnectReason::Desync,
                NetworkError::Malformed { .. } => DisconnectReason::Malformed,
                _ => DisconnectReason::Io,
            }
        };
        match reason {
            DisconnectReason::ClosedByPeer => debug!(peer = %self.addr, "Closed by peer"),
            _ => warn!(peer = %self.addr, error = %e, "Connection error"),
        }
        self.read_buf.clear();
        self.send_buf.clear();
        self.shared.set_send_pending(0);
        self.shared.mark_broken();
        reason
    }

    async fn teardown(&mut self, reason: DisconnectReason) {
        self.shared.mark_broken();
        self.shared.set_state(ConnectionState::Broken);
        if self.ban {
            self.ctx.backends.peers.ban(&self.peer_id);
        }
        let _ = self.stream.shutdown().await;
        self.ctx.pool.remove(&self.peer_id);
        info!(
            peer = %self.addr,
            direction = %self.direction,
            reason = %reason,
            sent = self.shared.bytes_sent(),
            received = self.shared.bytes_received(),
            "Disconnected"
        );
    }

    /// Route one complete message.
    fn dispatch(&mut self, message: RawMessage) -> NetworkResult<()> {
        let command = message.kind();
        trace!(peer = %self.addr, command = %command, len = message.payload.len(), "Received");
        self.shared.set_last_command(&message.command);
        self.ctx.backends.peers.mark_alive(&self.peer_id);

        match command {
            Command::Version => self.on_version(&message.payload)?,
            Command::Verack => {
                self.verack_received = true;
                self.refresh_state();
            }
            Command::Inv | Command::GetBlocks | Command::GetData | Command::GetAddr
                if !self.handshake_complete() =>
            {
                debug!(
                    peer = %self.addr,
                    command = %message.command,
                    "Ignoring request before handshake"
                );
            }
            Command::Inv => self.on_inv(&message.payload)?,
            Command::GetBlocks => self.on_getblocks(&message.payload)?,
            Command::GetData => self.on_getdata(&message.payload)?,
            Command::GetAddr => self.on_getaddr(),
            Command::Addr => {
                let addrs = decode_addr_list(&message.payload)?;
                self.ctx.backends.peers.add_addresses(&addrs);
            }
            Command::Block => self.on_block(message.payload),
            Command::Tx => self
                .ctx
                .backends
                .pending_tx
                .tx_received(&self.peer_id, message.payload),
            Command::Alert => {}
            Command::Unknown(name) => {
                debug!(peer = %self.addr, command = %name, "Ignoring unknown command");
            }
        }
        Ok(())
    }

    fn on_version(&mut self, payload: &[u8]) -> NetworkResult<()> {
        let version = VersionMessage::parse(payload)?;
        self.ctx.learn_external_address(version.addr_recv);

        let peer = PeerVersion::from(&version);
        info!(
            peer = %self.addr,
            version = peer.version,
            agent = peer.user_agent.as_deref().unwrap_or("?"),
            height = peer.start_height.unwrap_or_default(),
            "Peer version"
        );
        self.shared.set_version(peer.clone());
        self.peer = Some(peer);

        self.send(Command::Verack, Bytes::new());
        if self.direction == Direction::Inbound && !self.version_sent {
            self.send_version();
        }
        self.refresh_state();
        Ok(())
    }

    pub(crate) fn send_version(&mut self) {
        let config = &self.ctx.config;
        let from = self
            .ctx
            .external_address()
            .map(|a| a.socket_addr())
            .unwrap_or(self.local);
        let msg = VersionMessage::ours(
            config.protocol_version,
            config.services,
            unix_now(),
            self.addr,
            from,
            rand::random(),
            &config.user_agent,
            self.ctx.backends.chain.best_height(),
        );
        self.send(Command::Version, msg.encode());
        self.version_sent = true;
    }

    /// Frame and queue a message. A full buffer drops it.
    pub(crate) fn send(&mut self, command: Command, payload: Bytes) {
        let frame = match self.codec.frame(RawMessage::with_command(command, payload)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %self.addr, error = %e, "Cannot frame message");
                return;
            }
        };
        if self.send_buf.enqueue(&frame).is_ok() {
            trace!(peer = %self.addr, bytes = frame.len(), "Queued");
        }
        self.shared.set_send_pending(self.send_buf.pending());
    }

    /// One non-blocking write from the send buffer.
    pub(crate) fn drain(&mut self) -> NetworkResult<usize> {
        let written = self.send_buf.drain_once(&mut self.stream)?;
        self.shared.record_sent(written);
        self.shared.set_send_pending(self.send_buf.pending());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_millis(1));
        assert_eq!(config.no_data_timeout, Duration::from_secs(60));
        assert_eq!(config.announce_interval, Duration::from_secs(900));
        assert_eq!(config.max_message_size, 32 * 1024 * 1024);
    }

    #[test]
    fn test_only_checksum_bans() {
        assert!(DisconnectReason::ProtocolViolation.is_ban());
        for reason in [
            DisconnectReason::ClosedByPeer,
            DisconnectReason::Io,
            DisconnectReason::Desync,
            DisconnectReason::Malformed,
            DisconnectReason::Timeout,
        ] {
            assert!(!reason.is_ban(), "{reason}");
        }
    }

    #[test]
    fn test_peer_version_from_message() {
        let msg = VersionMessage::ours(
            70001,
            1,
            5,
            "1.1.1.1:8333".parse().unwrap(),
            "2.2.2.2:8333".parse().unwrap(),
            7,
            "/x/",
            99,
        );
        let peer = PeerVersion::from(&msg);
        assert_eq!(peer.user_agent.as_deref(), Some("/x/"));
        assert_eq!(peer.start_height, Some(99));
    }
}
