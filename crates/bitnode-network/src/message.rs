//! P2P protocol messages.

use crate::codec::{read_compact_size, write_compact_size};
use crate::{NetworkError, NetworkResult, NODE_NETWORK};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// 32-byte block or transaction hash, in wire (internal) byte order.
pub type Hash256 = [u8; 32];

/// Display a hash the way block explorers do (byte-reversed hex).
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Command names understood by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Inv,
    GetBlocks,
    GetData,
    GetAddr,
    Addr,
    Block,
    Tx,
    Alert,
    /// Anything else; logged and ignored.
    Unknown(String),
}

impl Command {
    /// Wire name of the command.
    pub fn as_str(&self) -> &str {
        match self {
            Command::Version => "version",
            Command::Verack => "verack",
            Command::Inv => "inv",
            Command::GetBlocks => "getblocks",
            Command::GetData => "getdata",
            Command::GetAddr => "getaddr",
            Command::Addr => "addr",
            Command::Block => "block",
            Command::Tx => "tx",
            Command::Alert => "alert",
            Command::Unknown(name) => name,
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Self {
        match name {
            "version" => Command::Version,
            "verack" => Command::Verack,
            "inv" => Command::Inv,
            "getblocks" => Command::GetBlocks,
            "getdata" => Command::GetData,
            "getaddr" => Command::GetAddr,
            "addr" => Command::Addr,
            "block" => Command::Block,
            "tx" => Command::Tx,
            "alert" => Command::Alert,
            other => Command::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded frame: command name plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Command name (at most 12 bytes on the wire).
    pub command: String,
    /// Raw payload.
    pub payload: Bytes,
}

impl RawMessage {
    /// Create a message from a command name and payload.
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Create a message for a known command.
    pub fn with_command(command: Command, payload: impl Into<Bytes>) -> Self {
        Self::new(command.as_str(), payload)
    }

    /// Parsed command.
    pub fn kind(&self) -> Command {
        Command::parse(&self.command)
    }
}

/// Inventory type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InvType {
    /// Transaction.
    Tx = 1,
    /// Block.
    Block = 2,
}

impl TryFrom<u32> for InvType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(InvType::Tx),
            2 => Ok(InvType::Block),
            other => Err(other),
        }
    }
}

/// 36-byte inventory entry: type code (LE) + hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvEntry {
    /// Raw type code; unknown codes are preserved so they can be reported.
    pub kind: u32,
    /// Object hash.
    pub hash: Hash256,
}

impl InvEntry {
    /// Encoded size.
    pub const SIZE: usize = 36;

    /// Block entry.
    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvType::Block as u32,
            hash,
        }
    }

    /// Transaction entry.
    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvType::Tx as u32,
            hash,
        }
    }

    /// Known type, if any.
    pub fn inv_type(&self) -> Option<InvType> {
        InvType::try_from(self.kind).ok()
    }

    /// Append the 36-byte encoding.
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.kind);
        buf.put_slice(&self.hash);
    }

    /// Read one entry; the caller guarantees 36 bytes remain.
    fn read<B: Buf>(buf: &mut B) -> Self {
        let kind = buf.get_u32_le();
        let mut hash = [0u8; 32];
        buf.copy_to_slice(&mut hash);
        Self { kind, hash }
    }
}

/// Encode a count-prefixed inventory list (`inv` / `getdata` payload).
pub fn encode_inv_list(entries: &[InvEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(9 + entries.len() * InvEntry::SIZE);
    write_compact_size(&mut buf, entries.len() as u64);
    for entry in entries {
        entry.write(&mut buf);
    }
    buf.freeze()
}

/// Decode a count-prefixed inventory list.
///
/// The declared count must fit in the payload; surplus trailing bytes are
/// ignored.
pub fn decode_inv_list(command: &str, payload: &[u8]) -> NetworkResult<Vec<InvEntry>> {
    let mut buf = payload;
    let count = read_compact_size(&mut buf)
        .map_err(|_| NetworkError::malformed(command, "missing entry count"))?;
    let needed = (count as usize).checked_mul(InvEntry::SIZE);
    if needed.map_or(true, |n| n > buf.remaining()) {
        return Err(NetworkError::malformed(
            command,
            format!("{} entries declared, {} bytes present", count, buf.remaining()),
        ));
    }
    Ok((0..count).map(|_| InvEntry::read(&mut buf)).collect())
}

/// Network address as carried in `version` and `addr`:
/// services (8, LE) + IPv6 or IPv4-mapped address (16) + port (2, BE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    /// Service bits.
    pub services: u64,
    /// IP address.
    pub ip: IpAddr,
    /// TCP port.
    pub port: u16,
}

impl NetAddr {
    /// Encoded size.
    pub const SIZE: usize = 26;

    /// Create from a socket address.
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        Self {
            services,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    /// Socket address form.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Append the 26-byte encoding.
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.services);
        let v6 = match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        buf.put_slice(&v6.octets());
        buf.put_u16(self.port);
    }

    /// Read a 26-byte address.
    pub fn read<B: Buf>(buf: &mut B) -> NetworkResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(NetworkError::malformed("addr", "network address truncated"));
        }
        let services = buf.get_u64_le();
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        let port = buf.get_u16();
        Ok(Self { services, ip, port })
    }
}

impl Default for NetAddr {
    fn default() -> Self {
        Self {
            services: 0,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// `addr` entry: last-seen time plus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampedAddr {
    /// Unix seconds.
    pub timestamp: u32,
    /// Address.
    pub addr: NetAddr,
}

/// Encode an `addr` payload.
pub fn encode_addr_list(addrs: &[TimestampedAddr]) -> Bytes {
    let mut buf = BytesMut::with_capacity(9 + addrs.len() * (4 + NetAddr::SIZE));
    write_compact_size(&mut buf, addrs.len() as u64);
    for entry in addrs {
        buf.put_u32_le(entry.timestamp);
        entry.addr.write(&mut buf);
    }
    buf.freeze()
}

/// Decode an `addr` payload.
pub fn decode_addr_list(payload: &[u8]) -> NetworkResult<Vec<TimestampedAddr>> {
    const ENTRY_SIZE: usize = 4 + NetAddr::SIZE;

    let mut buf = payload;
    let count = read_compact_size(&mut buf)
        .map_err(|_| NetworkError::malformed("addr", "missing entry count"))?;
    let needed = (count as usize).checked_mul(ENTRY_SIZE);
    if needed.map_or(true, |n| n > buf.remaining()) {
        return Err(NetworkError::malformed(
            "addr",
            format!("{} entries declared, {} bytes present", count, buf.remaining()),
        ));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let timestamp = buf.get_u32_le();
        let addr = NetAddr::read(&mut buf)?;
        out.push(TimestampedAddr { timestamp, addr });
    }
    Ok(out)
}

/// `version` message.
///
/// ```text
/// u32      version
/// u64      services
/// u64      timestamp
/// net_addr addr_recv        <- 46 bytes: minimum accepted
/// net_addr addr_from
/// u64      nonce
/// var_str  user_agent       <- present from 86 bytes on
/// u32      start_height
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Protocol version.
    pub version: u32,
    /// Service bits.
    pub services: u64,
    /// Sender's clock, unix seconds.
    pub timestamp: u64,
    /// How the sender sees us.
    pub addr_recv: NetAddr,
    /// Sender's own address.
    pub addr_from: Option<NetAddr>,
    /// Connection nonce.
    pub nonce: Option<u64>,
    /// User agent.
    pub user_agent: Option<String>,
    /// Sender's best block height.
    pub start_height: Option<u32>,
}

impl VersionMessage {
    /// Shortest payload we accept.
    pub const MIN_SIZE: usize = 46;

    /// Payload size from which the agent string is present.
    const EXTENDED_SIZE: usize = 86;

    /// Build our own `version`.
    #[allow(clippy::too_many_arguments)]
    pub fn ours(
        version: u32,
        services: u64,
        timestamp: u64,
        remote: SocketAddr,
        local: SocketAddr,
        nonce: u64,
        user_agent: &str,
        start_height: u32,
    ) -> Self {
        Self {
            version,
            services,
            timestamp,
            addr_recv: NetAddr::new(remote, NODE_NETWORK),
            addr_from: Some(NetAddr::new(local, services)),
            nonce: Some(nonce),
            user_agent: Some(user_agent.to_string()),
            start_height: Some(start_height),
        }
    }

    /// Encode the full payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.services);
        buf.put_u64_le(self.timestamp);
        self.addr_recv.write(&mut buf);
        self.addr_from.unwrap_or_default().write(&mut buf);
        buf.put_u64_le(self.nonce.unwrap_or_default());
        let agent = self.user_agent.as_deref().unwrap_or_default().as_bytes();
        write_compact_size(&mut buf, agent.len() as u64);
        buf.put_slice(agent);
        buf.put_u32_le(self.start_height.unwrap_or_default());
        buf.freeze()
    }

    /// Parse a payload.
    ///
    /// Fewer than 46 bytes is malformed. Optional trailing fields that are
    /// truncated are left as `None`.
    pub fn parse(payload: &[u8]) -> NetworkResult<Self> {
        if payload.len() < Self::MIN_SIZE {
            return Err(NetworkError::malformed(
                "version",
                format!("{} bytes, need at least {}", payload.len(), Self::MIN_SIZE),
            ));
        }

        let mut buf = payload;
        let version = buf.get_u32_le();
        let services = buf.get_u64_le();
        let timestamp = buf.get_u64_le();
        let addr_recv = NetAddr::read(&mut buf)?;

        let mut msg = Self {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from: None,
            nonce: None,
            user_agent: None,
            start_height: None,
        };

        if payload.len() < Self::EXTENDED_SIZE {
            return Ok(msg);
        }

        msg.addr_from = Some(NetAddr::read(&mut buf)?);
        msg.nonce = Some(buf.get_u64_le());

        let Ok(len) = read_compact_size(&mut buf) else {
            return Ok(msg);
        };
        if (len as usize) > buf.remaining() {
            return Ok(msg);
        }
        let agent = buf.copy_to_bytes(len as usize);
        msg.user_agent = Some(String::from_utf8_lossy(&agent).into_owned());

        if buf.remaining() >= 4 {
            msg.start_height = Some(buf.get_u32_le());
        }
        Ok(msg)
    }
}

/// `getblocks` request: version + locator hashes + stop hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocks {
    /// Protocol version.
    pub version: u32,
    /// Known block hashes, newest first.
    pub locator: Vec<Hash256>,
    /// Stop hash; all zeros means "as many as allowed".
    pub stop: Hash256,
}

impl GetBlocks {
    /// Single-locator request with an open-ended stop.
    pub fn from_tip(version: u32, tip: Hash256) -> Self {
        Self {
            version,
            locator: vec![tip],
            stop: [0u8; 32],
        }
    }

    /// Encode the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 9 + 32 * (self.locator.len() + 1));
        buf.put_u32_le(self.version);
        write_compact_size(&mut buf, self.locator.len() as u64);
        for hash in &self.locator {
            buf.put_slice(hash);
        }
        buf.put_slice(&self.stop);
        buf.freeze()
    }

    /// Parse a payload.
    pub fn parse(payload: &[u8]) -> NetworkResult<Self> {
        let mut buf = payload;
        if buf.remaining() < 4 {
            return Err(NetworkError::malformed("getblocks", "missing version"));
        }
        let version = buf.get_u32_le();
        let count = read_compact_size(&mut buf)
            .map_err(|_| NetworkError::malformed("getblocks", "missing locator count"))?;
        let needed = (count as usize).checked_add(1).and_then(|n| n.checked_mul(32));
        if needed.map_or(true, |n| n > buf.remaining()) {
            return Err(NetworkError::malformed(
                "getblocks",
                format!("{} locators declared, {} bytes present", count, buf.remaining()),
            ));
        }
        let mut locator = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut hash = [0u8; 32];
            buf.copy_to_slice(&mut hash);
            locator.push(hash);
        }
        let mut stop = [0u8; 32];
        buf.copy_to_slice(&mut stop);
        Ok(Self {
            version,
            locator,
            stop,
        })
    }
}
