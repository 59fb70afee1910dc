//! Chain, block and transaction collaborators.
//!
//! The connection engine never owns blocks or transactions. It asks these
//! traits what it should request, what it can serve, and hands over what
//! it receives. [`MemoryChain`] and [`MemoryTxPool`] are small in-memory
//! implementations used by the node binary and the tests.

use crate::codec::sha256d;
use crate::message::{hash_to_hex, Hash256};
use crate::peer::{PeerDirectory, PeerId};
use crate::{NetworkError, NetworkResult};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Size of a serialized block header.
const HEADER_SIZE: usize = 80;

/// Default minimum spacing between `getblocks` anchors.
const DEFAULT_LOCATOR_INTERVAL: Duration = Duration::from_secs(30);

/// Default ceiling on blocks held while their parent is missing.
pub const DEFAULT_MAX_ORPHANS: usize = 1024;

/// Default ceiling on queued block-data requests.
pub const DEFAULT_MAX_DATA_REQUESTS: usize = 1024;

/// Default ceiling on transactions held by [`MemoryTxPool`].
pub const DEFAULT_MAX_POOL_TXS: usize = 5000;

/// One node of the block tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockNode {
    /// Block hash.
    pub hash: Hash256,
    /// Height above genesis.
    pub height: u32,
    /// Known children, in arrival order.
    pub children: Vec<Hash256>,
}

/// Block tree index and sync predicates.
pub trait ChainIndex: Send + Sync {
    /// Tree node for a hash.
    fn lookup(&self, hash: &Hash256) -> Option<BlockNode>;

    /// Height of the best known block.
    fn best_height(&self) -> u32;

    /// Whether an announced block should be fetched.
    fn wants_block(&self, hash: &Hash256) -> bool;

    /// Anchor for a `getblocks` request, if the chain wants more blocks now.
    fn next_locator(&self) -> Option<Hash256>;

    /// A specific block whose data is still missing.
    fn next_block_data(&self) -> Option<Hash256>;

    /// Ingest a `block` payload. Returns the hashes newly connected to the tree.
    fn block_received(&self, peer: &PeerId, raw: Bytes) -> Vec<Hash256>;
}

/// Raw block storage.
pub trait BlockStore: Send + Sync {
    /// Serialized block.
    fn get(&self, hash: &Hash256) -> Option<Bytes>;
}

/// Outgoing transaction pool.
pub trait PendingTxPool: Send + Sync {
    /// Serialized transaction.
    fn lookup(&self, hash: &Hash256) -> Option<Bytes>;

    /// Ingest a `tx` payload.
    fn tx_received(&self, peer: &PeerId, raw: Bytes);
}

/// Everything a connection worker needs from outside the network layer.
#[derive(Clone)]
pub struct Backends {
    /// Peer directory.
    pub peers: Arc<dyn PeerDirectory>,
    /// Chain index.
    pub chain: Arc<dyn ChainIndex>,
    /// Block storage.
    pub blocks: Arc<dyn BlockStore>,
    /// Transaction pool.
    pub pending_tx: Arc<dyn PendingTxPool>,
}

impl Backends {
    /// Bundle arbitrary collaborators.
    pub fn new(
        peers: Arc<dyn PeerDirectory>,
        chain: Arc<dyn ChainIndex>,
        blocks: Arc<dyn BlockStore>,
        pending_tx: Arc<dyn PendingTxPool>,
    ) -> Self {
        Self {
            peers,
            chain,
            blocks,
            pending_tx,
        }
    }

    /// Bundle the in-memory chain (serving as both index and store) with a peer directory.
    pub fn in_memory(
        peers: Arc<dyn PeerDirectory>,
        chain: Arc<MemoryChain>,
        pending_tx: Arc<MemoryTxPool>,
    ) -> Self {
        Self {
            peers,
            chain: chain.clone(),
            blocks: chain,
            pending_tx,
        }
    }
}

struct StoredBlock {
    node: BlockNode,
    raw: Bytes,
}

struct Orphan {
    hash: Hash256,
    raw: Bytes,
}

#[derive(Default)]
struct ChainInner {
    blocks: HashMap<Hash256, StoredBlock>,
    tip: Hash256,
    tip_height: u32,
    /// Orphans keyed by the parent they wait for.
    orphans: HashMap<Hash256, Vec<Orphan>>,
    orphan_hashes: HashSet<Hash256>,
    /// `(hash, parent)` of every held orphan, oldest first.
    orphan_order: VecDeque<(Hash256, Hash256)>,
    /// Blocks whose data we still need, oldest request first.
    data_needed: VecDeque<Hash256>,
    data_needed_set: HashSet<Hash256>,
    last_locator: Option<Instant>,
}

impl ChainInner {
    /// Link a block under a known parent. Returns false if the parent is missing
    /// or the block is already present.
    fn link(&mut self, hash: Hash256, parent: &Hash256, raw: Bytes) -> bool {
        if self.blocks.contains_key(&hash) {
            return false;
        }
        let Some(parent_block) = self.blocks.get_mut(parent) else {
            return false;
        };
        parent_block.node.children.push(hash);
        let height = parent_block.node.height + 1;
        self.blocks.insert(
            hash,
            StoredBlock {
                node: BlockNode {
                    hash,
                    height,
                    children: Vec::new(),
                },
                raw,
            },
        );
        if height > self.tip_height {
            self.tip = hash;
            self.tip_height = height;
        }
        true
    }

    /// Link a block and every orphan waiting on it, transitively.
    fn connect(&mut self, hash: Hash256, parent: Hash256, raw: Bytes) -> Vec<Hash256> {
        let mut connected = Vec::new();
        if !self.link(hash, &parent, raw) {
            return connected;
        }
        connected.push(hash);

        let mut queue = VecDeque::from([hash]);
        while let Some(parent) = queue.pop_front() {
            for orphan in self.orphans.remove(&parent).unwrap_or_default() {
                self.orphan_hashes.remove(&orphan.hash);
                if self.link(orphan.hash, &parent, orphan.raw) {
                    connected.push(orphan.hash);
                    queue.push_back(orphan.hash);
                }
            }
        }
        if connected.len() > 1 {
            let live = &self.orphan_hashes;
            self.orphan_order.retain(|(hash, _)| live.contains(hash));
        }
        connected
    }

    /// Hold a block until its parent arrives, evicting the oldest orphans
    /// over `limit`. Returns the evicted hashes.
    fn add_orphan(
        &mut self,
        hash: Hash256,
        parent: Hash256,
        raw: Bytes,
        limit: usize,
    ) -> Vec<Hash256> {
        let mut evicted = Vec::new();
        while self.orphan_order.len() >= limit {
            let Some((old, old_parent)) = self.orphan_order.pop_front() else {
                break;
            };
            self.orphan_hashes.remove(&old);
            if let Some(waiting) = self.orphans.get_mut(&old_parent) {
                waiting.retain(|o| o.hash != old);
                if waiting.is_empty() {
                    self.orphans.remove(&old_parent);
                }
            }
            evicted.push(old);
        }
        self.orphan_hashes.insert(hash);
        self.orphan_order.push_back((hash, parent));
        self.orphans.entry(parent).or_default().push(Orphan { hash, raw });
        evicted
    }

    /// Queue a block-data request, dropping the oldest requests over `limit`.
    fn need_data(&mut self, hash: Hash256, limit: usize) {
        if self.blocks.contains_key(&hash) || !self.data_needed_set.insert(hash) {
            return;
        }
        self.data_needed.push_back(hash);
        while self.data_needed.len() > limit {
            if let Some(old) = self.data_needed.pop_front() {
                self.data_needed_set.remove(&old);
            }
        }
    }

    fn pop_needed(&mut self) -> Option<Hash256> {
        while let Some(hash) = self.data_needed.pop_front() {
            self.data_needed_set.remove(&hash);
            if !self.blocks.contains_key(&hash) {
                return Some(hash);
            }
        }
        None
    }
}

/// In-memory block tree rooted at a genesis block.
///
/// Block hash is the double SHA-256 of the 80-byte header; the parent hash
/// sits at header bytes 4..36. Orphans and pending data requests are bounded;
/// the oldest entries give way first.
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
    locator_interval: Duration,
    max_orphans: usize,
    max_data_requests: usize,
}

impl MemoryChain {
    /// Create a chain from a genesis hash and its raw bytes.
    pub fn new(genesis: Hash256, raw: Bytes) -> Self {
        let mut inner = ChainInner {
            tip: genesis,
            ..Default::default()
        };
        inner.blocks.insert(
            genesis,
            StoredBlock {
                node: BlockNode {
                    hash: genesis,
                    height: 0,
                    children: Vec::new(),
                },
                raw,
            },
        );
        Self {
            inner: RwLock::new(inner),
            locator_interval: DEFAULT_LOCATOR_INTERVAL,
            max_orphans: DEFAULT_MAX_ORPHANS,
            max_data_requests: DEFAULT_MAX_DATA_REQUESTS,
        }
    }

    /// Create a chain from a serialized genesis block.
    pub fn with_genesis(raw: Bytes) -> NetworkResult<Self> {
        let (hash, _) = parse_header(&raw)?;
        Ok(Self::new(hash, raw))
    }

    /// Set the minimum spacing between `getblocks` anchors.
    pub fn with_locator_interval(mut self, interval: Duration) -> Self {
        self.locator_interval = interval;
        self
    }

    /// Set how many orphans are held at once (at least one).
    pub fn with_orphan_limit(mut self, limit: usize) -> Self {
        self.max_orphans = limit.max(1);
        self
    }

    /// Set how many block-data requests may be queued (at least one).
    pub fn with_data_request_limit(mut self, limit: usize) -> Self {
        self.max_data_requests = limit.max(1);
        self
    }

    /// Insert a block under a known parent without parsing it.
    pub fn insert(&self, hash: Hash256, parent: Hash256, raw: Bytes) -> bool {
        !self.inner.write().connect(hash, parent, raw).is_empty()
    }

    /// Ask for a specific block's data.
    pub fn request_block(&self, hash: Hash256) {
        self.inner.write().need_data(hash, self.max_data_requests);
    }

    /// Best block hash.
    pub fn tip(&self) -> Hash256 {
        self.inner.read().tip
    }

    /// Number of blocks in the tree.
    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    /// Never true; the genesis block is always present.
    pub fn is_empty(&self) -> bool {
        self.inner.read().blocks.is_empty()
    }

    /// Number of blocks waiting for their parent.
    pub fn orphan_count(&self) -> usize {
        self.inner.read().orphan_hashes.len()
    }
}

/// Hash and parent of a serialized block.
fn parse_header(raw: &[u8]) -> NetworkResult<(Hash256, Hash256)> {
    if raw.len() < HEADER_SIZE {
        return Err(NetworkError::malformed(
            "block",
            format!("{} bytes, header needs {}", raw.len(), HEADER_SIZE),
        ));
    }
    let hash = sha256d(&raw[..HEADER_SIZE]);
    let mut parent = [0u8; 32];
    parent.copy_from_slice(&raw[4..36]);
    Ok((hash, parent))
}

impl ChainIndex for MemoryChain {
    fn lookup(&self, hash: &Hash256) -> Option<BlockNode> {
        self.inner.read().blocks.get(hash).map(|b| b.node.clone())
    }

    fn best_height(&self) -> u32 {
        self.inner.read().tip_height
    }

    fn wants_block(&self, hash: &Hash256) -> bool {
        let inner = self.inner.read();
        !inner.blocks.contains_key(hash) && !inner.orphan_hashes.contains(hash)
    }

    fn next_locator(&self) -> Option<Hash256> {
        let mut inner = self.inner.write();
        let now = Instant::now();
        let due = inner
            .last_locator
            .map_or(true, |last| now.duration_since(last) >= self.locator_interval);
        if !due {
            return None;
        }
        inner.last_locator = Some(now);
        Some(inner.tip)
    }

    fn next_block_data(&self) -> Option<Hash256> {
        self.inner.write().pop_needed()
    }

    fn block_received(&self, peer: &PeerId, raw: Bytes) -> Vec<Hash256> {
        let (hash, parent) = match parse_header(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Ignoring block");
                return Vec::new();
            }
        };

        let mut inner = self.inner.write();
        if inner.blocks.contains_key(&hash) || inner.orphan_hashes.contains(&hash) {
            return Vec::new();
        }

        if !inner.blocks.contains_key(&parent) {
            debug!(
                peer = %peer,
                block = %hash_to_hex(&hash),
                parent = %hash_to_hex(&parent),
                "Orphan block"
            );
            let evicted = inner.add_orphan(hash, parent, raw, self.max_orphans);
            if !evicted.is_empty() {
                debug!(
                    evicted = evicted.len(),
                    held = inner.orphan_hashes.len(),
                    "Orphan pool full"
                );
            }
            if !inner.orphan_hashes.contains(&parent) {
                inner.need_data(parent, self.max_data_requests);
            }
            return Vec::new();
        }

        let connected = inner.connect(hash, parent, raw);
        if !connected.is_empty() {
            info!(
                peer = %peer,
                connected = connected.len(),
                height = inner.tip_height,
                tip = %hash_to_hex(&inner.tip),
                "Chain extended"
            );
        }
        connected
    }
}

impl BlockStore for MemoryChain {
    fn get(&self, hash: &Hash256) -> Option<Bytes> {
        self.inner.read().blocks.get(hash).map(|b| b.raw.clone())
    }
}

#[derive(Default)]
struct TxPoolInner {
    txs: HashMap<Hash256, Bytes>,
    /// Insertion order, oldest first.
    order: VecDeque<Hash256>,
}

/// In-memory transaction pool keyed by double SHA-256 of the raw transaction.
///
/// Holds at most `max_txs` transactions; the oldest is dropped to make room.
pub struct MemoryTxPool {
    inner: RwLock<TxPoolInner>,
    max_txs: usize,
}

impl Default for MemoryTxPool {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_POOL_TXS)
    }
}

impl MemoryTxPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty pool holding at most `max_txs` transactions.
    pub fn with_limit(max_txs: usize) -> Self {
        Self {
            inner: RwLock::new(TxPoolInner::default()),
            max_txs: max_txs.max(1),
        }
    }

    /// Add a transaction, returning its hash.
    pub fn insert(&self, raw: Bytes) -> Hash256 {
        let hash = sha256d(&raw);
        let mut inner = self.inner.write();
        if inner.txs.contains_key(&hash) {
            return hash;
        }
        while inner.order.len() >= self.max_txs {
            if let Some(old) = inner.order.pop_front() {
                inner.txs.remove(&old);
            }
        }
        inner.txs.insert(hash, raw);
        inner.order.push_back(hash);
        hash
    }

    /// Number of transactions held.
    pub fn len(&self) -> usize {
        self.inner.read().txs.len()
    }

    /// Pool is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().txs.is_empty()
    }
}

impl PendingTxPool for MemoryTxPool {
    fn lookup(&self, hash: &Hash256) -> Option<Bytes> {
        self.inner.read().txs.get(hash).cloned()
    }

    fn tx_received(&self, peer: &PeerId, raw: Bytes) {
        let hash = self.insert(raw);
        debug!(peer = %peer, tx = %hash_to_hex(&hash), "Transaction received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId(1)
    }

    /// 80-byte header with the given parent; `nonce` makes it unique.
    fn header(parent: &Hash256, nonce: u32) -> Bytes {
        let mut raw = vec![0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&1u32.to_le_bytes());
        raw[4..36].copy_from_slice(parent);
        raw[76..80].copy_from_slice(&nonce.to_le_bytes());
        Bytes::from(raw)
    }

    fn genesis_chain() -> (MemoryChain, Hash256) {
        let chain = MemoryChain::with_genesis(header(&[0u8; 32], 0)).unwrap();
        let tip = chain.tip();
        (chain, tip)
    }

    #[test]
    fn test_genesis() {
        let (chain, genesis) = genesis_chain();
        assert_eq!(genesis, sha256d(&header(&[0u8; 32], 0)));
        assert_eq!(chain.best_height(), 0);
        assert_eq!(chain.lookup(&genesis).unwrap().height, 0);
        assert!(chain.get(&genesis).is_some());
        assert!(MemoryChain::with_genesis(Bytes::from_static(&[0u8; 10])).is_err());
    }

    #[test]
    fn test_block_received_extends_tip() {
        let (chain, genesis) = genesis_chain();
        let b1 = header(&genesis, 1);
        let h1 = sha256d(&b1);

        assert!(chain.wants_block(&h1));
        assert_eq!(chain.block_received(&peer(), b1.clone()), vec![h1]);
        assert_eq!(chain.tip(), h1);
        assert_eq!(chain.best_height(), 1);
        assert!(!chain.wants_block(&h1));
        assert_eq!(chain.lookup(&genesis).unwrap().children, vec![h1]);

        // Duplicate is ignored
        assert!(chain.block_received(&peer(), b1).is_empty());
    }

    #[test]
    fn test_orphan_requests_parent_then_connects() {
        let (chain, genesis) = genesis_chain();
        let b1 = header(&genesis, 1);
        let h1 = sha256d(&b1);
        let b2 = header(&h1, 2);
        let h2 = sha256d(&b2);

        assert!(chain.block_received(&peer(), b2).is_empty());
        assert_eq!(chain.orphan_count(), 1);
        assert!(!chain.wants_block(&h2));
        assert_eq!(chain.next_block_data(), Some(h1));
        assert_eq!(chain.next_block_data(), None);

        assert_eq!(chain.block_received(&peer(), b1), vec![h1, h2]);
        assert_eq!(chain.orphan_count(), 0);
        assert_eq!(chain.best_height(), 2);
    }

    #[test]
    fn test_orphan_pool_evicts_oldest() {
        let (chain, _) = genesis_chain();
        let chain = chain.with_orphan_limit(3).with_data_request_limit(2);

        let orphans: Vec<Bytes> = (1..=5u8).map(|i| header(&[i; 32], i as u32)).collect();
        for raw in &orphans {
            assert!(chain.block_received(&peer(), raw.clone()).is_empty());
        }

        assert_eq!(chain.orphan_count(), 3);
        let hashes: Vec<Hash256> = orphans.iter().map(|raw| sha256d(raw)).collect();
        assert!(chain.wants_block(&hashes[0]));
        assert!(chain.wants_block(&hashes[1]));
        assert!(!chain.wants_block(&hashes[4]));

        // Only the newest parent requests survive
        assert_eq!(chain.next_block_data(), Some([4; 32]));
        assert_eq!(chain.next_block_data(), Some([5; 32]));
        assert_eq!(chain.next_block_data(), None);
    }

    #[test]
    fn test_evicted_orphan_is_not_connected() {
        let (chain, genesis) = genesis_chain();
        let chain = chain.with_orphan_limit(1);
        let b1 = header(&genesis, 1);
        let h1 = sha256d(&b1);

        chain.block_received(&peer(), header(&h1, 2));
        chain.block_received(&peer(), header(&[9; 32], 3));
        assert_eq!(chain.orphan_count(), 1);

        assert_eq!(chain.block_received(&peer(), b1), vec![h1]);
        assert_eq!(chain.best_height(), 1);
        assert_eq!(chain.orphan_count(), 1);
    }

    #[test]
    fn test_connected_orphans_leave_the_pool() {
        let (chain, genesis) = genesis_chain();
        let chain = chain.with_orphan_limit(2);
        let b1 = header(&genesis, 1);
        let h1 = sha256d(&b1);
        let b2 = header(&h1, 2);
        let h2 = sha256d(&b2);

        chain.block_received(&peer(), b2);
        assert_eq!(chain.block_received(&peer(), b1), vec![h1, h2]);

        // Two fresh orphans fit without evicting anything
        let x = header(&[7; 32], 3);
        let y = header(&[8; 32], 4);
        chain.block_received(&peer(), x.clone());
        chain.block_received(&peer(), y.clone());
        assert_eq!(chain.orphan_count(), 2);
        assert!(!chain.wants_block(&sha256d(&x)));
        assert!(!chain.wants_block(&sha256d(&y)));
    }

    #[test]
    fn test_short_block_ignored() {
        let (chain, _) = genesis_chain();
        assert!(chain
            .block_received(&peer(), Bytes::from_static(&[1, 2, 3]))
            .is_empty());
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_request_block_skips_known() {
        let (chain, genesis) = genesis_chain();
        chain.request_block(genesis);
        chain.request_block([7; 32]);
        chain.request_block([7; 32]);
        assert_eq!(chain.next_block_data(), Some([7; 32]));
        assert_eq!(chain.next_block_data(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_locator_is_rate_limited() {
        let (chain, genesis) = genesis_chain();
        assert_eq!(chain.next_locator(), Some(genesis));
        assert_eq!(chain.next_locator(), None);

        tokio::time::advance(DEFAULT_LOCATOR_INTERVAL).await;
        assert_eq!(chain.next_locator(), Some(genesis));
    }

    #[test]
    fn test_insert_builds_tree() {
        let chain = MemoryChain::new([0; 32], Bytes::new());
        assert!(chain.insert([1; 32], [0; 32], Bytes::new()));
        assert!(chain.insert([2; 32], [0; 32], Bytes::new()));
        assert!(!chain.insert([3; 32], [9; 32], Bytes::new()));
        assert_eq!(chain.lookup(&[0; 32]).unwrap().children, vec![[1; 32], [2; 32]]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_tx_pool() {
        let pool = MemoryTxPool::new();
        let raw = Bytes::from_static(b"tx-bytes");
        pool.tx_received(&peer(), raw.clone());
        assert_eq!(pool.lookup(&sha256d(&raw)), Some(raw));
        assert_eq!(pool.len(), 1);
        assert!(pool.lookup(&[0; 32]).is_none());
    }

    #[test]
    fn test_tx_pool_drops_oldest_at_limit() {
        let pool = MemoryTxPool::with_limit(2);
        let first = pool.insert(Bytes::from_static(b"tx-1"));
        let second = pool.insert(Bytes::from_static(b"tx-2"));

        // Re-inserting a held transaction does not evict anything
        pool.insert(Bytes::from_static(b"tx-1"));
        assert_eq!(pool.len(), 2);

        let third = pool.insert(Bytes::from_static(b"tx-3"));
        assert_eq!(pool.len(), 2);
        assert!(pool.lookup(&first).is_none());
        assert!(pool.lookup(&second).is_some());
        assert!(pool.lookup(&third).is_some());
    }
}
