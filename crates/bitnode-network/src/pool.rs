//! Process-wide connection registry.
//!
//! One mutex guards every entry. Critical sections are map lookups, short
//! copies and queue appends; no socket I/O ever happens under the lock.

use crate::connection::{ConnectionState, Direction, PeerVersion};
use crate::message::InvEntry;
use crate::peer::PeerId;
use crate::{NetworkError, NetworkResult, MAX_INBOUND, MAX_INV_ENTRIES, MAX_OUTBOUND};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Inbound and outbound ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Maximum accepted connections.
    pub max_inbound: usize,
    /// Maximum dialed connections.
    pub max_outbound: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_inbound: MAX_INBOUND,
            max_outbound: MAX_OUTBOUND,
        }
    }
}

/// Connection state visible outside its worker.
///
/// The worker owns the socket; everything here is either atomic or behind a
/// short-lived lock so the console can read it while the worker runs.
#[derive(Debug)]
pub struct ConnectionShared {
    /// Peer identity.
    pub id: PeerId,
    /// Remote address.
    pub addr: SocketAddr,
    /// Who opened the socket.
    pub direction: Direction,
    connected_at: Instant,
    broken: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_pending: AtomicUsize,
    ticks: AtomicU64,
    loops: AtomicU64,
    state: Mutex<ConnectionState>,
    last_command: Mutex<String>,
    version: Mutex<Option<PeerVersion>>,
    next_announce: Mutex<Option<Instant>>,
}

impl ConnectionShared {
    fn new(id: PeerId, addr: SocketAddr, direction: Direction) -> Self {
        Self {
            id,
            addr,
            direction,
            connected_at: Instant::now(),
            broken: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            send_pending: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            loops: AtomicU64::new(0),
            state: Mutex::new(ConnectionState::Connecting),
            last_command: Mutex::new(String::new()),
            version: Mutex::new(None),
            next_announce: Mutex::new(None),
        }
    }

    /// Ask the worker to stop at its next loop iteration.
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Worker has been asked to stop, or stopped on its own.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub(crate) fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_send_pending(&self, n: usize) {
        self.send_pending.store(n, Ordering::Relaxed);
    }

    pub(crate) fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_loop(&self) {
        self.loops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn set_last_command(&self, command: &str) {
        let mut last = self.last_command.lock();
        last.clear();
        last.push_str(command);
    }

    pub(crate) fn set_version(&self, version: PeerVersion) {
        *self.version.lock() = Some(version);
    }

    pub(crate) fn set_next_announce(&self, at: Instant) {
        *self.next_announce.lock() = Some(at);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Total bytes written to the socket.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes read from the socket.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Bytes queued but not yet written.
    pub fn send_pending(&self) -> usize {
        self.send_pending.load(Ordering::Relaxed)
    }

    /// Peer's `version` fields, once received.
    pub fn version(&self) -> Option<PeerVersion> {
        self.version.lock().clone()
    }

    /// Name of the last command received.
    pub fn last_command(&self) -> String {
        self.last_command.lock().clone()
    }
}

/// One row of the connection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub id: PeerId,
    pub direction: Direction,
    pub addr: SocketAddr,
    pub state: ConnectionState,
    pub last_command: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_pending: usize,
    pub inventory_pending: usize,
}

/// Full view of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionDetail {
    pub summary: ConnectionSummary,
    /// Time since the socket was registered.
    pub connected_for: Duration,
    /// Peer's `version` fields.
    pub version: Option<PeerVersion>,
    /// Worker ticks so far.
    pub ticks: u64,
    /// Worker loop iterations so far.
    pub loops: u64,
    /// Time until the next own-address announcement.
    pub next_announce_in: Option<Duration>,
}

struct PoolEntry {
    shared: Arc<ConnectionShared>,
    inventory: Vec<InvEntry>,
}

impl PoolEntry {
    fn summary(&self) -> ConnectionSummary {
        let shared = &self.shared;
        ConnectionSummary {
            id: shared.id,
            direction: shared.direction,
            addr: shared.addr,
            state: shared.state(),
            last_command: shared.last_command(),
            bytes_sent: shared.bytes_sent(),
            bytes_received: shared.bytes_received(),
            send_pending: shared.send_pending(),
            inventory_pending: self.inventory.len(),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<PeerId, PoolEntry>,
    inbound: usize,
    outbound: usize,
}

/// Registry of live and reserved connections.
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    limits: PoolLimits,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            limits,
        }
    }

    /// Configured ceilings.
    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// Register an identity. Fails if it is already present or its direction is full.
    pub fn try_register(
        &self,
        id: PeerId,
        addr: SocketAddr,
        direction: Direction,
    ) -> NetworkResult<Arc<ConnectionShared>> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&id) {
            return Err(NetworkError::DuplicatePeer(id.to_string()));
        }
        let (count, max) = match direction {
            Direction::Inbound => (inner.inbound, self.limits.max_inbound),
            Direction::Outbound => (inner.outbound, self.limits.max_outbound),
        };
        if count >= max {
            return Err(NetworkError::TooManyConnections { count, max });
        }

        let shared = Arc::new(ConnectionShared::new(id, addr, direction));
        inner.entries.insert(
            id,
            PoolEntry {
                shared: shared.clone(),
                inventory: Vec::new(),
            },
        );
        match direction {
            Direction::Inbound => inner.inbound += 1,
            Direction::Outbound => inner.outbound += 1,
        }
        debug!(peer = %id, addr = %addr, direction = %direction, "Registered connection");
        Ok(shared)
    }

    /// Remove an identity. Returns false if it was not registered.
    pub fn remove(&self, id: &PeerId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.remove(id) else {
            return false;
        };
        match entry.shared.direction {
            Direction::Inbound => inner.inbound -= 1,
            Direction::Outbound => inner.outbound -= 1,
        }
        true
    }

    /// Identity is registered.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Total registered connections.
    pub fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Registered inbound connections.
    pub fn count_inbound(&self) -> usize {
        self.inner.lock().inbound
    }

    /// Registered outbound connections, reservations included.
    pub fn count_outbound(&self) -> usize {
        self.inner.lock().outbound
    }

    /// Acceptor may take another socket.
    pub fn has_inbound_capacity(&self) -> bool {
        self.count_inbound() < self.limits.max_inbound
    }

    /// Dialer may start another dial.
    pub fn has_outbound_capacity(&self) -> bool {
        self.count_outbound() < self.limits.max_outbound
    }

    /// Queue an inventory entry for every live connection except `exclude`.
    ///
    /// Queues are capped at [`MAX_INV_ENTRIES`]; a full queue silently skips
    /// the entry. Returns the number of connections that took it.
    pub fn broadcast_inventory(&self, entry: InvEntry, exclude: Option<PeerId>) -> usize {
        let mut inner = self.inner.lock();
        let mut notified = 0;
        for (id, conn) in inner.entries.iter_mut() {
            if Some(*id) == exclude || conn.shared.is_broken() {
                continue;
            }
            if conn.inventory.len() < MAX_INV_ENTRIES {
                conn.inventory.push(entry);
                notified += 1;
            }
        }
        notified
    }

    /// Take everything queued for one connection.
    pub fn take_inventory(&self, id: &PeerId) -> Vec<InvEntry> {
        self.inner
            .lock()
            .entries
            .get_mut(id)
            .map(|e| std::mem::take(&mut e.inventory))
            .unwrap_or_default()
    }

    /// All connections, ordered by identity.
    pub fn snapshot(&self) -> Vec<ConnectionSummary> {
        let mut rows: Vec<_> = self
            .inner
            .lock()
            .entries
            .values()
            .map(PoolEntry::summary)
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    /// Detail for one connection.
    pub fn detail(&self, id: &PeerId) -> Option<ConnectionDetail> {
        let (summary, shared) = {
            let inner = self.inner.lock();
            let entry = inner.entries.get(id)?;
            (entry.summary(), entry.shared.clone())
        };
        let now = Instant::now();
        let next_announce_in = shared
            .next_announce
            .lock()
            .map(|at| at.saturating_duration_since(now));
        Some(ConnectionDetail {
            summary,
            connected_for: now.duration_since(shared.connected_at),
            version: shared.version(),
            ticks: shared.ticks.load(Ordering::Relaxed),
            loops: shared.loops.load(Ordering::Relaxed),
            next_announce_in,
        })
    }

    /// Flag every connection to this IP broken. Returns whether any matched.
    pub fn drop_ip(&self, ip: IpAddr) -> bool {
        let inner = self.inner.lock();
        let mut found = false;
        for entry in inner.entries.values() {
            if entry.shared.addr.ip() == ip {
                entry.shared.mark_broken();
                found = true;
            }
        }
        if found {
            info!(ip = %ip, "Dropping connection on request");
        }
        found
    }

    /// Flag every connection broken.
    pub fn close_all(&self) {
        for entry in self.inner.lock().entries.values() {
            entry.shared.mark_broken();
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolLimits::default())
    }
}
