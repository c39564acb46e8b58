//! The set of blocks written during the currently-active transaction (§4.2).
//!
//! `Transaction::register_block`/`put_block` describe the logical operation
//! (pin a block's old checksum, mark it dirty once written); this is where
//! that bookkeeping actually lives so every collaborator that writes a
//! metadata block — the allocator, the directory tree, node flushes, the
//! super block — can reach it without threading a `&mut Transaction` through
//! every recursive call. Volume transactions are serialized (§5), so at most
//! one transaction's worth of entries is ever live here at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::CheckSumDevice;
use crate::error::CsfsResult;
use crate::layout::{BlockIndex, CheckSum};

pub(crate) struct DirtyEntry {
    pub old_check_sum: CheckSum,
    pub dirty: bool,
}

/// Tracks, for the life of one transaction, every block that was written and
/// the checksum it carried beforehand.
pub(crate) struct DirtyBlocks {
    device: Arc<dyn CheckSumDevice>,
    table: Mutex<HashMap<BlockIndex, DirtyEntry>>,
}

impl DirtyBlocks {
    pub fn new(device: Arc<dyn CheckSumDevice>) -> Self {
        DirtyBlocks {
            device,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `index` was written. The first call for a given block
    /// within a transaction snapshots its pre-write checksum for `abort`.
    pub fn note_dirty(&self, index: BlockIndex) -> CsfsResult<()> {
        let mut table = self.table.lock().unwrap();
        if let Some(entry) = table.get_mut(&index) {
            entry.dirty = true;
            return Ok(());
        }
        let old_check_sum = self.device.get_check_sum(index)?;
        table.insert(index, DirtyEntry { old_check_sum, dirty: true });
        Ok(())
    }

    /// A read-only copy of the current table, for `commit`/`abort` to act on
    /// without racing a concurrent clear.
    pub fn snapshot(&self) -> Vec<(BlockIndex, CheckSum, bool)> {
        self.table
            .lock()
            .unwrap()
            .iter()
            .map(|(&index, entry)| (index, entry.old_check_sum, entry.dirty))
            .collect()
    }

    /// Resets the table for the next transaction.
    pub fn clear(&self) {
        self.table.lock().unwrap().clear();
    }
}
