//! Peer identity and the peer directory.
//!
//! The connection engine only talks to the directory through
//! [`PeerDirectory`]; [`PeerBook`] is the in-memory implementation used by
//! the node binary and the tests.

use crate::message::TimestampedAddr;
use dashmap::DashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Unique peer identifier, derived from the socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Create from socket address.
    ///
    /// IPv4 peers map to `ip << 16 | port`. IPv6 peers fold the address
    /// halves together, mix in the port and set the top bit, which no IPv4
    /// identity has.
    pub fn from_addr(addr: &SocketAddr) -> Self {
        let port = addr.port() as u64;
        match addr.ip() {
            IpAddr::V4(v4) => Self::from_v4(u32::from(v4), port),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Self::from_v4(u32::from(v4), port),
                None => {
                    let bits = u128::from(v6);
                    let folded = (bits >> 64) as u64 ^ bits as u64;
                    Self((folded.rotate_left(16) ^ port) | (1 << 63))
                }
            },
        }
    }

    fn from_v4(ip: u32, port: u64) -> Self {
        Self(((ip as u64) << 16) | port)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim_start_matches("0x"), 16).map(PeerId)
    }
}

/// The external peer directory: address book, selection, liveness and bans.
pub trait PeerDirectory: Send + Sync {
    /// Best next peer to dial, skipping identities the caller reports as connected.
    fn select_peer(&self, skip: &dyn Fn(&PeerId) -> bool) -> Option<SocketAddr>;

    /// Resolve an inbound socket to an identity; `None` refuses it.
    fn accept_incoming(&self, addr: SocketAddr) -> Option<PeerId>;

    /// A message arrived from this peer.
    fn mark_alive(&self, id: &PeerId);

    /// This peer could not be reached or its session ended.
    fn mark_dead(&self, id: &PeerId);

    /// This peer violated the protocol.
    fn ban(&self, id: &PeerId);

    /// Addresses learned from an `addr` message.
    fn add_addresses(&self, addrs: &[TimestampedAddr]);
}

/// Peer liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Known but never heard from.
    Unknown,
    /// Sent us a message recently.
    Alive,
    /// Last dial or session failed.
    Dead,
    /// Banned.
    Banned,
}

/// Peer information.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer identifier.
    pub id: PeerId,
    /// Socket address.
    pub addr: SocketAddr,
    /// Current state.
    pub state: PeerState,
    /// Last time a message arrived.
    pub last_seen: Option<Instant>,
    /// Last time we picked it for dialing.
    pub last_attempt: Option<Instant>,
    /// Consecutive failures.
    pub failures: u32,
    /// Recorded from an accepted connection rather than gossip or seeds.
    pub inbound: bool,
}

impl PeerInfo {
    /// Create new peer info.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            id: PeerId::from_addr(&addr),
            addr,
            state: PeerState::Unknown,
            last_seen: None,
            last_attempt: None,
            failures: 0,
            inbound: false,
        }
    }
}

/// Peer book configuration.
#[derive(Debug, Clone)]
pub struct PeerBookConfig {
    /// Ban duration.
    pub ban_duration: Duration,
    /// Minimum delay before re-dialing the same peer.
    pub retry_delay: Duration,
    /// Maximum number of addresses kept, inbound sessions included.
    pub max_peers: usize,
}

impl Default for PeerBookConfig {
    fn default() -> Self {
        Self {
            ban_duration: Duration::from_secs(3600), // 1 hour
            retry_delay: Duration::from_secs(60),
            max_peers: 5000,
        }
    }
}

/// In-memory peer directory.
pub struct PeerBook {
    /// Configuration.
    config: PeerBookConfig,
    /// Known peers.
    peers: DashMap<PeerId, PeerInfo>,
    /// Banned addresses (ip -> unban time).
    banned: DashMap<IpAddr, Instant>,
}

impl PeerBook {
    /// Create a new peer book.
    pub fn new(config: PeerBookConfig) -> Self {
        Self {
            config,
            peers: DashMap::new(),
            banned: DashMap::new(),
        }
    }

    /// Add a known address. Returns false if it was already known or the book is full.
    pub fn add_peer(&self, addr: SocketAddr) -> bool {
        let id = PeerId::from_addr(&addr);
        if self.peers.contains_key(&id) || self.peers.len() >= self.config.max_peers {
            return false;
        }
        self.peers.insert(id, PeerInfo::new(addr));
        true
    }

    /// Get peer info.
    pub fn get_peer(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.get(id).map(|r| r.clone())
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// No known peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Check if address is banned.
    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        if let Some(unban_time) = self.banned.get(ip).map(|t| *t) {
            if Instant::now() < unban_time {
                return true;
            }
            self.banned.remove(ip);
        }
        false
    }

    /// Unban an address.
    pub fn unban(&self, ip: &IpAddr) {
        self.banned.remove(ip);
        for mut peer in self.peers.iter_mut() {
            if peer.addr.ip() == *ip && peer.state == PeerState::Banned {
                peer.state = PeerState::Unknown;
                peer.failures = 0;
            }
        }
        info!(ip = %ip, "Unbanned peer");
    }

    /// Drop expired bans.
    pub fn cleanup_expired_bans(&self) {
        let now = Instant::now();
        self.banned.retain(|_, unban| *unban > now);
    }

    /// Evict one entry when the book is full: inbound entries first, then
    /// the least recently seen.
    fn make_room(&self) {
        if self.peers.len() < self.config.max_peers {
            return;
        }
        let victim = self
            .peers
            .iter()
            .min_by_key(|r| (!r.inbound, r.last_seen))
            .map(|r| r.id);
        if let Some(id) = victim {
            self.peers.remove(&id);
            debug!(peer = %id, "Peer book full, evicted entry");
        }
    }

    fn retry_allowed(&self, info: &PeerInfo, now: Instant) -> bool {
        info.last_attempt
            .map_or(true, |t| now.duration_since(t) >= self.config.retry_delay)
    }
}

impl Default for PeerBook {
    fn default() -> Self {
        Self::new(PeerBookConfig::default())
    }
}

impl PeerDirectory for PeerBook {
    fn select_peer(&self, skip: &dyn Fn(&PeerId) -> bool) -> Option<SocketAddr> {
        let now = Instant::now();
        let best = self
            .peers
            .iter()
            .filter(|r| r.state != PeerState::Banned)
            .filter(|r| !skip(&r.id))
            .filter(|r| !self.is_banned(&r.addr.ip()))
            .filter(|r| self.retry_allowed(r, now))
            .min_by_key(|r| (r.failures, std::cmp::Reverse(r.last_seen)))
            .map(|r| r.id)?;

        let mut peer = self.peers.get_mut(&best)?;
        peer.last_attempt = Some(now);
        Some(peer.addr)
    }

    fn accept_incoming(&self, addr: SocketAddr) -> Option<PeerId> {
        if self.is_banned(&addr.ip()) {
            debug!(addr = %addr, "Refusing banned peer");
            return None;
        }
        let id = PeerId::from_addr(&addr);
        if !self.peers.contains_key(&id) {
            self.make_room();
            let mut info = PeerInfo::new(addr);
            info.inbound = true;
            self.peers.insert(id, info);
        }
        Some(id)
    }

    fn mark_alive(&self, id: &PeerId) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            peer.state = PeerState::Alive;
            peer.last_seen = Some(Instant::now());
            peer.failures = 0;
        }
    }

    fn mark_dead(&self, id: &PeerId) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            if peer.state != PeerState::Banned {
                peer.state = PeerState::Dead;
            }
            peer.failures = peer.failures.saturating_add(1);
        }
    }

    fn ban(&self, id: &PeerId) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            warn!(peer = %id, addr = %peer.addr, "Banning peer");
            peer.state = PeerState::Banned;
            self.banned
                .insert(peer.addr.ip(), Instant::now() + self.config.ban_duration);
        }
    }

    fn add_addresses(&self, addrs: &[TimestampedAddr]) {
        let added = addrs
            .iter()
            .filter(|a| !a.addr.ip.is_unspecified() && a.addr.port != 0)
            .filter(|a| self.add_peer(a.addr.socket_addr()))
            .count();
        if added > 0 {
            debug!(added, known = self.peers.len(), "Learned new addresses");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NetAddr;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_peer_id_from_addr() {
        let a = PeerId::from_addr(&test_addr(8333));
        let b = PeerId::from_addr(&test_addr(8334));
        assert_ne!(a, b);
        assert_eq!(a, PeerId::from_addr(&test_addr(8333)));

        let v6: SocketAddr = "[2001:db8::1]:8333".parse().unwrap();
        assert_ne!(PeerId::from_addr(&v6), a);

        let mapped: SocketAddr = "[::ffff:127.0.0.1]:8333".parse().unwrap();
        assert_eq!(PeerId::from_addr(&mapped), a);
    }

    #[test]
    fn test_ipv6_id_never_matches_ipv4() {
        // Folds to 0x8000; a marker rotated into bit 15 would be cancelled by the port
        let v6: SocketAddr = "[::8000]:32768".parse().unwrap();
        let v4: SocketAddr = "0.0.128.0:0".parse().unwrap();
        assert_ne!(PeerId::from_addr(&v6), PeerId::from_addr(&v4));
        assert_ne!(PeerId::from_addr(&v6).0 >> 63, 0);

        for port in [0u16, 1, 8333, u16::MAX] {
            let v4 = SocketAddr::from(([255, 255, 255, 255], port));
            assert_eq!(PeerId::from_addr(&v4).0 >> 63, 0);
        }
    }

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PeerId::from_addr(&test_addr(8333));
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_select_skips_connected() {
        let book = PeerBook::default();
        book.add_peer(test_addr(1));
        book.add_peer(test_addr(2));

        let first = book.select_peer(&|_| false).unwrap();
        let first_id = PeerId::from_addr(&first);
        let second = book.select_peer(&|id| *id == first_id).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_select_respects_retry_delay() {
        let book = PeerBook::default();
        book.add_peer(test_addr(1));

        assert!(book.select_peer(&|_| false).is_some());
        // Just attempted: not offered again until the retry delay passes
        assert!(book.select_peer(&|_| false).is_none());
    }

    #[test]
    fn test_select_prefers_fewer_failures() {
        let book = PeerBook::new(PeerBookConfig {
            retry_delay: Duration::ZERO,
            ..Default::default()
        });
        let bad = test_addr(1);
        let good = test_addr(2);
        book.add_peer(bad);
        book.add_peer(good);
        book.mark_dead(&PeerId::from_addr(&bad));

        assert_eq!(book.select_peer(&|_| false), Some(good));
    }

    #[test]
    fn test_ban_and_unban() {
        let book = PeerBook::default();
        let addr = test_addr(9000);
        let id = book.accept_incoming(addr).unwrap();

        book.ban(&id);
        assert!(book.is_banned(&addr.ip()));
        assert!(book.accept_incoming(addr).is_none());
        assert!(book.select_peer(&|_| false).is_none());

        book.unban(&addr.ip());
        assert!(!book.is_banned(&addr.ip()));
        assert_eq!(book.get_peer(&id).unwrap().state, PeerState::Unknown);
    }

    #[test]
    fn test_inbound_entries_respect_max_peers() {
        let book = PeerBook::new(PeerBookConfig {
            max_peers: 3,
            ..Default::default()
        });
        let seeds = [test_addr(1), test_addr(2)];
        for addr in seeds {
            assert!(book.add_peer(addr));
        }

        let mut last = None;
        for port in 40_000..40_050 {
            last = book.accept_incoming(test_addr(port));
        }
        assert_eq!(book.len(), 3);
        for addr in seeds {
            assert!(book.get_peer(&PeerId::from_addr(&addr)).is_some());
        }

        // The latest session is recorded and can still be banned
        let last = last.unwrap();
        assert!(book.get_peer(&last).unwrap().inbound);
        book.ban(&last);
        assert!(book.is_banned(&test_addr(40_049).ip()));
    }

    #[test]
    fn test_alive_resets_failures() {
        let book = PeerBook::default();
        let addr = test_addr(9000);
        book.add_peer(addr);
        let id = PeerId::from_addr(&addr);

        book.mark_dead(&id);
        book.mark_dead(&id);
        assert_eq!(book.get_peer(&id).unwrap().failures, 2);

        book.mark_alive(&id);
        let info = book.get_peer(&id).unwrap();
        assert_eq!(info.failures, 0);
        assert_eq!(info.state, PeerState::Alive);
    }

    #[test]
    fn test_add_addresses_filters_unroutable() {
        let book = PeerBook::default();
        let entries = [
            TimestampedAddr {
                timestamp: 0,
                addr: NetAddr::new(test_addr(8333), 1),
            },
            TimestampedAddr {
                timestamp: 0,
                addr: NetAddr::default(),
            },
        ];
        book.add_addresses(&entries);
        assert_eq!(book.len(), 1);

        // Known addresses are not duplicated
        book.add_addresses(&entries);
        assert_eq!(book.len(), 1);
    }
}
