//! RAII block handles and the block-cache collaborator interface (§4.1, §6.3).
//!
//! Grounded in the original `Block.h`: a tiny RAII wrapper around a pinned
//! cache entry, `Put()` on drop if not already released, `TransferFrom` for
//! moving a held pin across call frames without an intermediate put/get. The
//! original hands back a raw pointer directly into the cache; this crate
//! instead copies the block into an owned buffer and writes mutations back
//! explicitly on `put`/drop, since aliasing a cache-owned buffer through a
//! raw pointer has no safe Rust equivalent and the copy is a page (4 KiB) at
//! most — cheap relative to the device I/O it rides along with.

use std::sync::Arc;

use crate::error::CsfsResult;
use crate::layout::{BlockIndex, BLOCK_SIZE};

/// Identifies one in-flight cache transaction (§6.3 `start_transaction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

/// The block-cache collaborator CSFS consumes (§6.3). An external,
/// buffered, transactional block-I/O provider; CSFS only pins/unpins blocks
/// and never manages the cache's own memory.
pub trait BlockCache: Send + Sync {
    fn total_blocks(&self) -> u64;

    /// Reads a block for read-only access.
    fn get(&self, index: BlockIndex) -> CsfsResult<Vec<u8>>;

    /// Reads a block for read-write access within `tx`.
    fn get_writable(&self, index: BlockIndex, tx: TransactionId) -> CsfsResult<Vec<u8>>;

    /// Returns a zero-initialized, writable block within `tx`, without
    /// reading the old contents (the caller promises to overwrite them).
    fn get_empty(&self, index: BlockIndex, tx: TransactionId) -> CsfsResult<Vec<u8>>;

    /// Writes `data` back to `index`'s cache entry. Called by `Block::put`
    /// for any handle that was writable and was mutated.
    fn write_back(&self, index: BlockIndex, data: &[u8], tx: TransactionId) -> CsfsResult<()>;

    /// Unpins a previously-pinned block.
    fn put(&self, index: BlockIndex);

    /// Unpins `count` blocks starting at `index`, telling the cache to
    /// forget their contents entirely (used when handing data blocks over
    /// to the file-cache, §3.3/§4.5).
    fn discard(&self, index: BlockIndex, count: u64);

    fn start_transaction(&self) -> CsfsResult<TransactionId>;
    fn end_transaction(&self, tx: TransactionId) -> CsfsResult<()>;
    fn abort_transaction(&self, tx: TransactionId) -> CsfsResult<()>;

    /// Synchronously flushes the *previously committed* transaction's data
    /// to stable storage. Never the transaction currently being committed
    /// (see `Transaction::commit`, §4.2).
    fn sync(&self) -> CsfsResult<()>;
}

/// An RAII handle on one cached block, mirroring `Block` (§4.1).
pub struct Block {
    cache: Option<Arc<dyn BlockCache>>,
    index: BlockIndex,
    data: Vec<u8>,
    writable: bool,
    dirty: bool,
    tx: Option<TransactionId>,
}

impl Block {
    /// An unbound handle, matching the original's default constructor; used
    /// as a placeholder slot before `get_readable`/`get_writable`/`get_zero`.
    pub fn new() -> Self {
        Block {
            cache: None,
            index: 0,
            data: Vec::new(),
            writable: false,
            dirty: false,
            tx: None,
        }
    }

    pub fn get_readable(&mut self, cache: &Arc<dyn BlockCache>, index: BlockIndex) -> CsfsResult<()> {
        self.put();
        let data = cache.get(index)?;
        *self = Block {
            cache: Some(cache.clone()),
            index,
            data,
            writable: false,
            dirty: false,
            tx: None,
        };
        Ok(())
    }

    pub fn get_writable(
        &mut self,
        cache: &Arc<dyn BlockCache>,
        index: BlockIndex,
        tx: TransactionId,
    ) -> CsfsResult<()> {
        self.put();
        let data = cache.get_writable(index, tx)?;
        *self = Block {
            cache: Some(cache.clone()),
            index,
            data,
            writable: true,
            dirty: false,
            tx: Some(tx),
        };
        Ok(())
    }

    pub fn get_zero(
        &mut self,
        cache: &Arc<dyn BlockCache>,
        index: BlockIndex,
        tx: TransactionId,
    ) -> CsfsResult<()> {
        self.put();
        let data = cache.get_empty(index, tx)?;
        *self = Block {
            cache: Some(cache.clone()),
            index,
            data,
            writable: true,
            dirty: true,
            tx: Some(tx),
        };
        Ok(())
    }

    /// Upgrades an already-pinned readable handle to writable.
    pub fn make_writable(&mut self, tx: TransactionId) -> CsfsResult<()> {
        if self.writable {
            return Ok(());
        }
        let cache = self.cache.clone().expect("make_writable on unbound block");
        let data = cache.get_writable(self.index, tx)?;
        self.data = data;
        self.writable = true;
        self.tx = Some(tx);
        Ok(())
    }

    pub fn index(&self) -> BlockIndex {
        self.index
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access. Marks the block dirty: the buffer is written back to
    /// the cache on `put`/drop.
    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.writable, "data_mut on a read-only block handle");
        self.dirty = true;
        &mut self.data
    }

    /// Explicit release. Flushes a dirty writable buffer back to the cache
    /// first.
    pub fn put(&mut self) {
        if let Some(cache) = self.cache.take() {
            if self.writable && self.dirty {
                let tx = self.tx.expect("writable block without a transaction id");
                // Best-effort: Drop/`put` cannot propagate errors; callers
                // that need the result call `flush_writes` explicitly before
                // releasing.
                let _ = cache.write_back(self.index, &self.data, tx);
            }
            cache.put(self.index);
        }
    }

    /// Like `put`, but tells the cache to forget the block's contents
    /// rather than persist them (§4.5's "tell the block cache to forget"
    /// data blocks handed to the file-cache).
    pub fn discard(&mut self) {
        if let Some(cache) = self.cache.take() {
            cache.discard(self.index, 1);
        }
    }

    /// Flushes a dirty writable buffer back to the cache without releasing
    /// the pin, surfacing any I/O error to the caller.
    pub fn flush_writes(&mut self) -> CsfsResult<()> {
        if self.writable && self.dirty {
            if let Some(cache) = &self.cache {
                let tx = self.tx.expect("writable block without a transaction id");
                cache.write_back(self.index, &self.data, tx)?;
                self.dirty = false;
            }
        }
        Ok(())
    }

    /// Move semantics for passing a held handle across call frames (the
    /// original's `TransferFrom`). `other` becomes unbound.
    pub fn transfer_from(&mut self, other: &mut Block) {
        self.put();
        *self = std::mem::replace(other, Block::new());
    }

    pub fn is_bound(&self) -> bool {
        self.cache.is_some()
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.put();
    }
}
