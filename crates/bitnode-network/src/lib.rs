//! # bitnode-network
//!
//! P2P connection engine for a Bitcoin-style full node.
//!
//! This crate provides:
//! - Wire framing (magic, command, length, checksum) and compact-size integers
//! - Per-connection handshake and command dispatch
//! - Inventory / getblocks / getdata synchronization
//! - Bounded, non-blocking outbound send buffering
//! - A concurrency-safe connection pool with inbound/outbound ceilings
//! - The listener and dialer loops that feed the pool

pub mod chain;
mod codec;
mod connection;
mod error;
mod message;
mod peer;
mod pool;
mod send_buffer;
mod service;
mod sync;

pub use chain::{
    Backends, BlockNode, BlockStore, ChainIndex, MemoryChain, MemoryTxPool, PendingTxPool,
    DEFAULT_MAX_DATA_REQUESTS, DEFAULT_MAX_ORPHANS, DEFAULT_MAX_POOL_TXS,
};
pub use codec::{checksum, read_compact_size, sha256d, write_compact_size, MessageCodec};
pub use connection::{
    Connection, ConnectionConfig, ConnectionState, Direction, DisconnectReason, PeerVersion,
};
pub use error::{NetworkError, NetworkResult};
pub use message::{
    decode_addr_list, decode_inv_list, encode_addr_list, encode_inv_list, hash_to_hex, Command,
    GetBlocks, Hash256, InvEntry, InvType, NetAddr, RawMessage, TimestampedAddr, VersionMessage,
};
pub use peer::{PeerBook, PeerBookConfig, PeerDirectory, PeerId, PeerInfo, PeerState};
pub use pool::{
    ConnectionDetail, ConnectionPool, ConnectionShared, ConnectionSummary, PoolLimits,
};
pub use send_buffer::SendBuffer;
pub use service::{
    NetworkConfig, NetworkContext, NetworkHandle, NetworkService, NetworkStats, StatsSnapshot,
};
pub use sync::{collect_descendants, select_blocks, InvScan};

/// Default P2P port (mainnet).
pub const DEFAULT_PORT: u16 = 8333;

/// Default P2P port (testnet).
pub const TESTNET_PORT: u16 = 18333;

/// Protocol magic bytes for mainnet.
pub const MAINNET_MAGIC: [u8; 4] = [0xF9, 0xBE, 0xB4, 0xD9];

/// Protocol magic bytes for testnet.
pub const TESTNET_MAGIC: [u8; 4] = [0x0B, 0x11, 0x09, 0x07];

/// Protocol version announced in `version`.
pub const PROTOCOL_VERSION: u32 = 70001;

/// User agent announced in `version`.
pub const USER_AGENT: &str = "/bitnode:0.1.0/";

/// Service bits: full network node.
pub const NODE_NETWORK: u64 = 0x1;

/// Maximum frame payload size.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024; // 32 MB

/// Maximum number of inventory entries queued for, or returned to, one peer.
pub const MAX_INV_ENTRIES: usize = 500;

/// Default inbound connection ceiling.
pub const MAX_INBOUND: usize = 8;

/// Default outbound connection ceiling.
pub const MAX_OUTBOUND: usize = 8;

/// Pending outbound bytes above which new response work is shed.
pub const MAX_BYTES_IN_SEND_BUFFER: usize = 16 * 1024;
