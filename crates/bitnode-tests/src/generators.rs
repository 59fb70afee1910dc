//! Test data generators for integration tests.
//!
//! Provides hashes, block headers, prebuilt block trees and proptest
//! strategies for wire-level data.

use bitnode_network::{sha256d, Hash256, InvEntry, MemoryChain};
use bytes::Bytes;
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

/// Global counter for unique hash generation
static HASH_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Deterministic hash from a seed. Never all zeros.
pub fn test_hash(seed: u32) -> Hash256 {
    let mut hash = [0u8; 32];
    hash[0..4].copy_from_slice(&seed.to_le_bytes());
    hash[31] = 0xA5;
    hash
}

/// Hash not returned by any earlier call.
pub fn unique_hash() -> Hash256 {
    let mut hash = test_hash(HASH_COUNTER.fetch_add(1, Ordering::SeqCst));
    hash[30] = 0x5A;
    hash
}

/// 80-byte block header on top of `parent`; `nonce` makes it unique.
pub fn block_header(parent: &Hash256, nonce: u32) -> Bytes {
    let mut raw = vec![0u8; 80];
    raw[0..4].copy_from_slice(&1u32.to_le_bytes());
    raw[4..36].copy_from_slice(parent);
    raw[68..72].copy_from_slice(&1_231_006_505u32.to_le_bytes());
    raw[76..80].copy_from_slice(&nonce.to_le_bytes());
    Bytes::from(raw)
}

/// Hash of a serialized block.
pub fn block_hash(raw: &[u8]) -> Hash256 {
    sha256d(&raw[..80])
}

/// Chain with only a parsed genesis header.
pub fn genesis_chain() -> MemoryChain {
    MemoryChain::with_genesis(block_header(&[0u8; 32], 0)).expect("Fixed header parses")
}

/// Genesis plus `len` real headers on top of it, and the headers in order.
pub fn header_chain(len: u32) -> (MemoryChain, Vec<Bytes>) {
    let chain = genesis_chain();
    let mut parent = chain.tip();
    let mut headers = Vec::new();
    for nonce in 1..=len {
        let raw = block_header(&parent, nonce);
        let hash = block_hash(&raw);
        chain.insert(hash, parent, raw.clone());
        headers.push(raw);
        parent = hash;
    }
    (chain, headers)
}

/// Straight chain of synthetic blocks: `test_hash(0)` is genesis and
/// `test_hash(i)` sits on `test_hash(i - 1)`. Each block's bytes are
/// `block_size` copies of its low seed byte.
pub fn linear_chain(len: u32, block_size: usize) -> MemoryChain {
    let chain = MemoryChain::new(test_hash(0), Bytes::from(vec![0u8; block_size]));
    for i in 1..len {
        chain.insert(
            test_hash(i),
            test_hash(i - 1),
            Bytes::from(vec![i as u8; block_size]),
        );
    }
    chain
}

/// Genesis with `width` direct children, each with one child of its own.
pub fn wide_tree(width: u32) -> MemoryChain {
    let chain = MemoryChain::new(test_hash(0), Bytes::new());
    for i in 1..=width {
        chain.insert(test_hash(i), test_hash(0), Bytes::new());
        chain.insert(test_hash(10_000 + i), test_hash(i), Bytes::new());
    }
    chain
}

// ============================================================================
// Proptest strategies
// ============================================================================

/// Arbitrary 32-byte hash.
pub fn arb_hash() -> impl Strategy<Value = Hash256> {
    prop::array::uniform32(any::<u8>())
}

/// Inventory entry of type block, transaction, or something else.
pub fn arb_inv_entry() -> impl Strategy<Value = InvEntry> {
    (prop_oneof![Just(1u32), Just(2u32), 3u32..10], arb_hash())
        .prop_map(|(kind, hash)| InvEntry { kind, hash })
}

/// Up to `max` inventory entries.
pub fn arb_inv_list(max: usize) -> impl Strategy<Value = Vec<InvEntry>> {
    prop::collection::vec(arb_inv_entry(), 0..=max)
}

/// Printable command name that fits the header field.
pub fn arb_command() -> impl Strategy<Value = String> {
    "[a-z]{1,12}"
}

/// Payload of up to `max` bytes.
pub fn arb_payload(max: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_network::{BlockStore, ChainIndex};

    #[test]
    fn test_unique_hashes() {
        assert_ne!(unique_hash(), unique_hash());
        assert_ne!(test_hash(0), [0u8; 32]);
    }

    #[test]
    fn test_linear_chain() {
        let chain = linear_chain(10, 4);
        assert_eq!(chain.best_height(), 9);
        assert_eq!(chain.get(&test_hash(3)).unwrap(), Bytes::from(vec![3u8; 4]));
    }

    #[test]
    fn test_wide_tree() {
        let chain = wide_tree(3);
        assert_eq!(chain.len(), 7);
        assert_eq!(chain.lookup(&test_hash(0)).unwrap().children.len(), 3);
    }

    #[test]
    fn test_header_chain() {
        let (chain, headers) = header_chain(4);
        assert_eq!(chain.best_height(), 4);
        assert_eq!(chain.tip(), block_hash(&headers[3]));
    }

    #[test]
    fn test_header_hash() {
        let raw = block_header(&test_hash(1), 7);
        assert_eq!(raw.len(), 80);
        assert_eq!(block_hash(&raw), sha256d(&raw));
    }
}
