//! Block and inventory synchronization.
//!
//! Message handlers for `inv`, `getblocks`, `getdata` and `getaddr`, plus the
//! per-turn housekeeping tick that decides what, if anything, to ask a peer
//! for next.

use crate::chain::ChainIndex;
use crate::connection::{unix_now, Connection};
use crate::message::{
    decode_inv_list, encode_addr_list, encode_inv_list, hash_to_hex, Command, GetBlocks, Hash256,
    InvEntry, InvType, TimestampedAddr,
};
use crate::{NetworkResult, MAX_BYTES_IN_SEND_BUFFER, MAX_INV_ENTRIES};
use bytes::Bytes;
use std::collections::HashSet;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Result of scanning an `inv` announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvScan {
    /// Announced blocks the chain wants, in announcement order.
    pub blocks: Vec<Hash256>,
    /// Transaction entries seen.
    pub transactions: usize,
    /// Entries of any other type.
    pub unknown: usize,
}

/// Pick the announced blocks worth fetching.
pub fn select_blocks(entries: &[InvEntry], chain: &dyn ChainIndex) -> InvScan {
    let mut scan = InvScan::default();
    for entry in entries {
        match entry.inv_type() {
            Some(InvType::Block) => {
                if chain.wants_block(&entry.hash) {
                    scan.blocks.push(entry.hash);
                }
            }
            Some(InvType::Tx) => scan.transactions += 1,
            None => scan.unknown += 1,
        }
    }
    scan
}

/// Every known locator and its descendants, for a `getblocks` reply.
///
/// Each locator's subtree is walked depth first starting at the locator,
/// children in the order the chain reports them. A branch stops at the stop
/// hash (exclusive) and the whole walk stops at [`MAX_INV_ENTRIES`]. Unknown
/// locators contribute nothing.
pub fn collect_descendants(chain: &dyn ChainIndex, request: &GetBlocks) -> Vec<Hash256> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for locator in &request.locator {
        if out.len() >= MAX_INV_ENTRIES {
            break;
        }
        if chain.lookup(locator).is_none() {
            continue;
        }
        let mut stack = vec![*locator];
        while let Some(hash) = stack.pop() {
            if out.len() >= MAX_INV_ENTRIES {
                break;
            }
            if hash == request.stop || !seen.insert(hash) {
                continue;
            }
            out.push(hash);
            if let Some(node) = chain.lookup(&hash) {
                stack.extend(node.children.iter().rev());
            }
        }
    }
    out
}

fn block_inv(hashes: &[Hash256]) -> Bytes {
    let entries: Vec<InvEntry> = hashes.iter().copied().map(InvEntry::block).collect();
    encode_inv_list(&entries)
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Over the backpressure ceiling: new response work is shed.
    fn send_buffer_full(&self) -> bool {
        self.send_buf.pending() >= MAX_BYTES_IN_SEND_BUFFER
    }

    pub(crate) fn on_inv(&mut self, payload: &[u8]) -> NetworkResult<()> {
        let entries = decode_inv_list("inv", payload)?;
        let scan = select_blocks(&entries, self.ctx.backends.chain.as_ref());
        trace!(
            peer = %self.addr,
            entries = entries.len(),
            txs = scan.transactions,
            unknown = scan.unknown,
            wanted = scan.blocks.len(),
            "Inventory"
        );
        if !scan.blocks.is_empty() {
            debug!(peer = %self.addr, blocks = scan.blocks.len(), "Requesting announced blocks");
            self.send(Command::GetData, block_inv(&scan.blocks));
        }
        Ok(())
    }

    pub(crate) fn on_getblocks(&mut self, payload: &[u8]) -> NetworkResult<()> {
        if self.send_buffer_full() {
            debug!(peer = %self.addr, pending = self.send_buf.pending(), "Shedding getblocks");
            return Ok(());
        }
        let request = GetBlocks::parse(payload)?;
        let hashes = collect_descendants(self.ctx.backends.chain.as_ref(), &request);
        if hashes.is_empty() {
            trace!(peer = %self.addr, locators = request.locator.len(), "No known locator");
            return Ok(());
        }
        debug!(peer = %self.addr, locators = request.locator.len(), invs = hashes.len(), "Answering getblocks");
        self.ctx.stats.record_inv_sent();
        self.send(Command::Inv, block_inv(&hashes));
        Ok(())
    }

    pub(crate) fn on_getdata(&mut self, payload: &[u8]) -> NetworkResult<()> {
        if self.send_buffer_full() {
            debug!(peer = %self.addr, pending = self.send_buf.pending(), "Shedding getdata");
            return Ok(());
        }
        let entries = decode_inv_list("getdata", payload)?;
        for (served, entry) in entries.iter().enumerate() {
            match entry.inv_type() {
                Some(InvType::Block) => match self.ctx.backends.blocks.get(&entry.hash) {
                    Some(raw) => {
                        self.ctx.stats.record_block_sent();
                        self.send(Command::Block, raw);
                    }
                    None => trace!(block = %hash_to_hex(&entry.hash), "Requested block not stored"),
                },
                Some(InvType::Tx) => {
                    if let Some(raw) = self.ctx.backends.pending_tx.lookup(&entry.hash) {
                        debug!(peer = %self.addr, tx = %hash_to_hex(&entry.hash), "Sending transaction");
                        self.send(Command::Tx, raw);
                    }
                }
                None => debug!(peer = %self.addr, kind = entry.kind, "getdata for unsupported type"),
            }

            if self.send_buffer_full() {
                debug!(
                    peer = %self.addr,
                    served = served + 1,
                    skipped = entries.len() - served - 1,
                    "Send buffer full, stopping getdata"
                );
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn on_getaddr(&mut self) {
        if self.send_buffer_full() {
            debug!(peer = %self.addr, "Shedding getaddr");
            return;
        }
        self.announce_own_address();
    }

    pub(crate) fn on_block(&mut self, payload: Bytes) {
        let connected = self
            .ctx
            .backends
            .chain
            .block_received(&self.peer_id, payload);
        for hash in connected {
            let notified = self
                .ctx
                .pool
                .broadcast_inventory(InvEntry::block(hash), Some(self.peer_id));
            trace!(block = %hash_to_hex(&hash), notified, "Relaying block inventory");
        }
    }

    /// Ask for addresses and advertise ours, if we know it.
    pub(crate) fn announce_own_address(&mut self) {
        self.send(Command::GetAddr, Bytes::new());
        if let Some(addr) = self.ctx.external_address() {
            let entry = TimestampedAddr {
                timestamp: unix_now() as u32,
                addr,
            };
            trace!(peer = %self.addr, own = %addr, "Announcing own address");
            self.send(Command::Addr, encode_addr_list(&[entry]));
        }
        self.next_addr_announce = Instant::now() + self.ctx.config.connection.announce_interval;
        self.shared.set_next_announce(self.next_addr_announce);
    }

    /// Housekeeping for a turn with no message. At most one action fires.
    pub(crate) fn tick(&mut self) -> NetworkResult<()> {
        self.shared.record_tick();

        if !self.send_buf.is_empty() {
            self.drain()?;
            return Ok(());
        }

        if !self.handshake_complete() {
            return Ok(());
        }

        let chain = self.ctx.backends.chain.clone();
        if let Some(anchor) = chain.next_locator() {
            trace!(peer = %self.addr, anchor = %hash_to_hex(&anchor), "getblocks");
            let request = GetBlocks::from_tip(self.ctx.config.protocol_version, anchor);
            self.send(Command::GetBlocks, request.encode());
            return Ok(());
        }

        if let Some(hash) = chain.next_block_data() {
            trace!(peer = %self.addr, block = %hash_to_hex(&hash), "getdata");
            self.send(Command::GetData, block_inv(&[hash]));
            return Ok(());
        }

        let inventory = self.ctx.pool.take_inventory(&self.peer_id);
        if !inventory.is_empty() {
            trace!(peer = %self.addr, entries = inventory.len(), "Flushing inventory");
            self.send(Command::Inv, encode_inv_list(&inventory));
            return Ok(());
        }

        if self.ctx.config.server && Instant::now() >= self.next_addr_announce {
            self.announce_own_address();
        }
        Ok(())
    }
}
