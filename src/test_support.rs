//! In-memory test doubles for `BlockCache` and `CheckSumDevice`.
//!
//! Grounded in the teacher's pattern of small test-only helper structs
//! colocated with the code under test (SPEC_FULL.md §B); these back every
//! `#[cfg(test)]` module in this crate instead of a real block device.

#![cfg(test)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::block::{BlockCache, TransactionId};
use crate::device::CheckSumDevice;
use crate::error::{CsfsError, CsfsResult};
use crate::layout::{BlockIndex, CheckSum, BLOCK_SIZE, ZERO_CHECK_SUM};

/// A flat `Vec<Vec<u8>>`-backed block cache. No real pinning/buffering:
/// transactions are tracked only well enough to hand out distinct ids and
/// reject operations on an unknown or already-ended one. Each transaction's
/// first write to a block snapshots the prior contents, so `abort_transaction`
/// can actually restore them rather than being a no-op.
pub struct MemoryBlockCache {
    blocks: Mutex<Vec<Vec<u8>>>,
    next_tx: AtomicU64,
    active_tx: Mutex<Vec<TransactionId>>,
    snapshots: Mutex<HashMap<TransactionId, HashMap<usize, Vec<u8>>>>,
}

impl MemoryBlockCache {
    pub fn new(total_blocks: u64) -> Self {
        MemoryBlockCache {
            blocks: Mutex::new(vec![vec![0u8; BLOCK_SIZE]; total_blocks as usize]),
            next_tx: AtomicU64::new(1),
            active_tx: Mutex::new(Vec::new()),
            snapshots: Mutex::new(HashMap::new()),
        }
    }
}

impl BlockCache for MemoryBlockCache {
    fn total_blocks(&self) -> u64 {
        self.blocks.lock().unwrap().len() as u64
    }

    fn get(&self, index: BlockIndex) -> CsfsResult<Vec<u8>> {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .get(index as usize)
            .cloned()
            .ok_or(CsfsError::InvalidArgument("block index out of range"))
    }

    fn get_writable(&self, index: BlockIndex, _tx: TransactionId) -> CsfsResult<Vec<u8>> {
        self.get(index)
    }

    fn get_empty(&self, index: BlockIndex, _tx: TransactionId) -> CsfsResult<Vec<u8>> {
        if (index as usize) >= self.blocks.lock().unwrap().len() {
            return Err(CsfsError::InvalidArgument("block index out of range"));
        }
        Ok(vec![0u8; BLOCK_SIZE])
    }

    fn write_back(&self, index: BlockIndex, data: &[u8], tx: TransactionId) -> CsfsResult<()> {
        let mut blocks = self.blocks.lock().unwrap();
        let idx = index as usize;
        if idx >= blocks.len() {
            return Err(CsfsError::InvalidArgument("block index out of range"));
        }
        self.snapshots
            .lock()
            .unwrap()
            .entry(tx)
            .or_default()
            .entry(idx)
            .or_insert_with(|| blocks[idx].clone());
        blocks[idx].copy_from_slice(data);
        Ok(())
    }

    fn put(&self, _index: BlockIndex) {}

    fn discard(&self, _index: BlockIndex, _count: u64) {}

    fn start_transaction(&self) -> CsfsResult<TransactionId> {
        let id = TransactionId(self.next_tx.fetch_add(1, Ordering::SeqCst));
        self.active_tx.lock().unwrap().push(id);
        Ok(id)
    }

    fn end_transaction(&self, tx: TransactionId) -> CsfsResult<()> {
        let mut active = self.active_tx.lock().unwrap();
        active.retain(|&id| id != tx);
        drop(active);
        self.snapshots.lock().unwrap().remove(&tx);
        Ok(())
    }

    fn abort_transaction(&self, tx: TransactionId) -> CsfsResult<()> {
        let mut active = self.active_tx.lock().unwrap();
        active.retain(|&id| id != tx);
        drop(active);

        if let Some(snapshot) = self.snapshots.lock().unwrap().remove(&tx) {
            let mut blocks = self.blocks.lock().unwrap();
            for (idx, data) in snapshot {
                if let Some(slot) = blocks.get_mut(idx) {
                    *slot = data;
                }
            }
        }
        Ok(())
    }

    fn sync(&self) -> CsfsResult<()> {
        Ok(())
    }
}

/// A `HashMap<BlockIndex, CheckSum>`-backed checksum device. Unset blocks
/// read back as all-zero (meaning "skip verification", §6.2).
pub struct MemoryCheckSumDevice {
    sums: Mutex<hashbrown::HashMap<BlockIndex, CheckSum>>,
}

impl MemoryCheckSumDevice {
    pub fn new() -> Self {
        MemoryCheckSumDevice {
            sums: Mutex::new(hashbrown::HashMap::new()),
        }
    }
}

impl Default for MemoryCheckSumDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckSumDevice for MemoryCheckSumDevice {
    fn get_check_sum(&self, block_index: BlockIndex) -> CsfsResult<CheckSum> {
        Ok(self
            .sums
            .lock()
            .unwrap()
            .get(&block_index)
            .copied()
            .unwrap_or(ZERO_CHECK_SUM))
    }

    fn set_check_sum(&self, block_index: BlockIndex, check_sum: CheckSum) -> CsfsResult<()> {
        self.sums.lock().unwrap().insert(block_index, check_sum);
        Ok(())
    }
}
