//! Symbolic links: target path stored inline in the node's own block (§4.6).
//!
//! Grounded in `SymLink.h`: `ReadSymLink`/`WriteSymLink`, trivial because
//! the target is small enough to always fit in the space left after the
//! node header within one block.

use std::sync::Arc;

use crate::block::{Block, BlockCache, TransactionId};
use crate::device::CheckSumDevice;
use crate::error::{CsfsError, CsfsResult};
use crate::layout::BlockIndex;
use crate::node::{self, Node};
use crate::volume::Volume;

/// Reads the stored target path out of the node's block.
pub fn read_target<D: CheckSumDevice>(volume: &Volume<D>, node: &Node) -> CsfsResult<Vec<u8>> {
    let len = node.size() as usize;
    let mut block = Block::new();
    block.get_readable(volume.block_cache(), node.block_index())?;

    let start = node::payload_offset();
    let max = node::payload_len();
    if len > max {
        return Err(CsfsError::BadData("symlink target exceeds payload region"));
    }
    Ok(block.data()[start..start + len].to_vec())
}

/// Writes `target` into the node's block, inline after the header, and
/// updates the node's recorded size. Fails with `NameTooLong` if the target
/// does not fit alongside the header in one block.
pub fn write_target<D: CheckSumDevice>(
    volume: &Volume<D>,
    node: &Node,
    block_index: BlockIndex,
    target: &[u8],
    tx: TransactionId,
) -> CsfsResult<()> {
    let max = node::payload_len();
    if target.is_empty() || target.len() > max {
        return Err(CsfsError::NameTooLong);
    }

    let cache: &Arc<dyn BlockCache> = volume.block_cache();
    let mut block = Block::new();
    block.get_writable(cache, block_index, tx)?;

    let start = node::payload_offset();
    let data = block.data_mut();
    data[start..start + target.len()].copy_from_slice(target);
    block.flush_writes()?;
    volume.note_block_dirty(block_index)?;

    node.set_size(target.len() as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::mode;
    use crate::node::NodeHeader;
    use crate::test_support::{MemoryBlockCache, MemoryCheckSumDevice};

    #[test]
    fn write_then_read_round_trips() {
        let cache: Arc<dyn BlockCache> = Arc::new(MemoryBlockCache::new(64));
        let device = Arc::new(MemoryCheckSumDevice::new());
        let volume = Volume::for_tests(cache.clone(), device, 64);

        let header = NodeHeader::new(mode::S_IFLNK | 0o777, 18, 0);
        let node = Node::from_header(20, header);

        let tx = cache.start_transaction().unwrap();
        write_target(&volume, &node, 20, b"../target/path", tx).unwrap();
        cache.end_transaction(tx).unwrap();

        let target = read_target(&volume, &node).unwrap();
        assert_eq!(target, b"../target/path");
    }

    #[test]
    fn rejects_oversized_target() {
        let cache: Arc<dyn BlockCache> = Arc::new(MemoryBlockCache::new(64));
        let device = Arc::new(MemoryCheckSumDevice::new());
        let volume = Volume::for_tests(cache.clone(), device, 64);

        let header = NodeHeader::new(mode::S_IFLNK | 0o777, 18, 0);
        let node = Node::from_header(20, header);
        let huge = vec![b'a'; node::payload_len() + 1];

        let tx = cache.start_transaction().unwrap();
        let err = write_target(&volume, &node, 20, &huge, tx).unwrap_err();
        assert!(matches!(err, CsfsError::NameTooLong));
    }
}
