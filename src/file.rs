//! File content: a fixed-fanout block tree addressing a file's data blocks
//! by logical offset (§3.3, §4.5).
//!
//! Grounded in `File.cpp`. The node's own block holds a `depth: u16` field
//! followed by a root pointer array sized to whatever space remains after
//! the node header (`F_root`); every other level is a full-block array of
//! `F = BLOCK_SIZE / 8` pointers. `depth == 0` means the file holds no
//! blocks; `depth == 1` means the root's pointers address data blocks
//! directly; `depth > 1` means the root addresses interior pointer blocks,
//! nested `depth - 1` levels deep, with data blocks only at the leaves.
//!
//! Interior/leaf pointer blocks are tree *metadata* and go through the same
//! deferred, transactional checksum path as directory and allocator blocks
//! (`Volume::note_block_dirty`). Data blocks are the one place the "no
//! journaling of data blocks" Non-goal actually changes the write path:
//! their checksums are computed and stored immediately, bypassing the
//! transaction's dirty-block table entirely, documented in `DESIGN.md`.

use crate::block::{Block, TransactionId};
use crate::device::{compute_check_sum, CheckSumDevice};
use crate::error::{CsfsError, CsfsResult};
use crate::layout::{BlockIndex, NodeHeaderRaw, BLOCK_SIZE};
use crate::node::Node;
use crate::transaction::Transaction;
use crate::volume::Volume;

/// Pointers held by one full, non-root tree block.
const FANOUT: usize = BLOCK_SIZE / 8;
const DEPTH_FIELD_LEN: usize = 2;

fn root_fanout() -> usize {
    (BLOCK_SIZE - NodeHeaderRaw::SIZE - DEPTH_FIELD_LEN) / 8
}

fn decode_pointers(data: &[u8], count: usize) -> Vec<u64> {
    (0..count)
        .map(|i| {
            let off = i * 8;
            u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
        })
        .collect()
}

fn encode_pointers(data: &mut [u8], pointers: &[u64]) {
    for (i, &p) in pointers.iter().enumerate() {
        let off = i * 8;
        data[off..off + 8].copy_from_slice(&p.to_le_bytes());
    }
}

/// How many full-block levels a file of `block_count` blocks needs, `0` for
/// an empty file (`_DepthForBlockCount`, §C).
fn depth_for_block_count(block_count: u64) -> u16 {
    if block_count == 0 {
        return 0;
    }
    let mut depth = 1u16;
    let mut addressable = root_fanout() as u64;
    while block_count > addressable {
        addressable *= FANOUT as u64;
        depth += 1;
    }
    depth
}

fn block_count_for_size(size: u64) -> u64 {
    (size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
}

/// Decomposes `logical` into a per-level slot index, root first, leaf last.
fn path_for(logical: u64, depth: u16) -> Vec<usize> {
    let depth = depth as usize;
    let mut spans = Vec::with_capacity(depth);
    for k in 0..depth {
        let mut span = 1u64;
        for _ in 0..(depth - 1 - k) {
            span *= FANOUT as u64;
        }
        spans.push(span);
    }
    let mut remaining = logical;
    let mut path = Vec::with_capacity(depth);
    for span in spans {
        path.push((remaining / span) as usize);
        remaining %= span;
    }
    path
}

/// A file's block tree, rooted at `node`'s own block.
pub struct FileBlockTree<'a, D: CheckSumDevice> {
    volume: &'a Volume<D>,
    node: &'a Node,
}

impl<'a, D: CheckSumDevice> FileBlockTree<'a, D> {
    pub fn new(volume: &'a Volume<D>, node: &'a Node) -> Self {
        FileBlockTree { volume, node }
    }

    fn load_root_pointers(&self) -> CsfsResult<(u16, Vec<u64>)> {
        let mut block = Block::new();
        block.get_readable(self.volume.block_cache(), self.node.block_index())?;
        let depth_off = NodeHeaderRaw::SIZE;
        let depth = u16::from_le_bytes(block.data()[depth_off..depth_off + 2].try_into().unwrap());
        let start = depth_off + DEPTH_FIELD_LEN;
        let pointers = decode_pointers(&block.data()[start..start + root_fanout() * 8], root_fanout());
        Ok((depth, pointers))
    }

    fn store_root_pointers(&self, tx: TransactionId, depth: u16, pointers: &[u64]) -> CsfsResult<()> {
        let mut block = Block::new();
        block.get_writable(self.volume.block_cache(), self.node.block_index(), tx)?;
        let depth_off = NodeHeaderRaw::SIZE;
        block.data_mut()[depth_off..depth_off + 2].copy_from_slice(&depth.to_le_bytes());
        let start = depth_off + DEPTH_FIELD_LEN;
        encode_pointers(&mut block.data_mut()[start..start + root_fanout() * 8], pointers);
        block.flush_writes()?;
        self.volume.note_block_dirty(self.node.block_index())
    }

    fn load_pointers(&self, block_index: BlockIndex) -> CsfsResult<Vec<u64>> {
        let mut block = Block::new();
        block.get_readable(self.volume.block_cache(), block_index)?;
        Ok(decode_pointers(block.data(), FANOUT))
    }

    fn store_pointers(&self, tx: TransactionId, block_index: BlockIndex, pointers: &[u64]) -> CsfsResult<()> {
        let mut block = Block::new();
        block.get_writable(self.volume.block_cache(), block_index, tx)?;
        encode_pointers(block.data_mut(), pointers);
        block.flush_writes()?;
        self.volume.note_block_dirty(block_index)
    }

    fn allocate_block(&self, tx: TransactionId) -> CsfsResult<BlockIndex> {
        let (base, count) = self.volume.allocator().allocate(0, 1, tx)?;
        debug_assert_eq!(count, 1);
        Ok(base)
    }

    fn allocate_zero_interior_block(&self, tx: TransactionId) -> CsfsResult<BlockIndex> {
        let index = self.allocate_block(tx)?;
        let mut block = Block::new();
        block.get_zero(self.volume.block_cache(), index, tx)?;
        block.flush_writes()?;
        self.volume.note_block_dirty(index)?;
        Ok(index)
    }

    /// Allocates a zero-filled data block and hands it straight to the block
    /// cache as discardable, storing its checksum directly rather than
    /// through the transaction's deferred table (no journaling of data
    /// blocks).
    fn allocate_zero_data_block(&self, tx: TransactionId) -> CsfsResult<BlockIndex> {
        let index = self.allocate_block(tx)?;
        let mut block = Block::new();
        block.get_zero(self.volume.block_cache(), index, tx)?;
        block.flush_writes()?;
        let data = self.volume.block_cache().get(index)?;
        self.volume.device().set_check_sum(index, compute_check_sum(&data))?;
        block.discard();
        Ok(index)
    }

    fn physical_for(&self, logical: u64) -> CsfsResult<Option<BlockIndex>> {
        let (depth, root_pointers) = self.load_root_pointers()?;
        if depth == 0 {
            return Ok(None);
        }
        let path = path_for(logical, depth);
        let mut current = root_pointers[path[0]];
        if current == 0 {
            return Ok(None);
        }
        for &slot in &path[1..] {
            let pointers = self.load_pointers(current)?;
            current = pointers[slot];
            if current == 0 {
                return Ok(None);
            }
        }
        Ok(Some(current))
    }

    /// Prepends one level: the current root's pointers are copied verbatim
    /// into a freshly allocated block, the root becomes a single-entry
    /// interior level pointing at it, `depth` increases by one.
    fn prepend_level(&self, tx: TransactionId, old_depth: u16) -> CsfsResult<()> {
        if old_depth == 0 {
            self.store_root_pointers(tx, 1, &vec![0u64; root_fanout()])?;
            return Ok(());
        }
        let (_, root_pointers) = self.load_root_pointers()?;
        let new_block = self.allocate_zero_interior_block(tx)?;
        let mut contents = vec![0u64; FANOUT];
        contents[..root_pointers.len()].copy_from_slice(&root_pointers);
        self.store_pointers(tx, new_block, &contents)?;

        let mut new_root = vec![0u64; root_fanout()];
        new_root[0] = new_block;
        self.store_root_pointers(tx, old_depth + 1, &new_root)?;
        Ok(())
    }

    /// Walks down allocating any missing interior/leaf block on the path to
    /// `logical`, returning the data block's index.
    fn ensure_leaf_allocated(&self, tx: TransactionId, depth: u16, logical: u64) -> CsfsResult<BlockIndex> {
        let path = path_for(logical, depth);
        let (_, mut root_pointers) = self.load_root_pointers()?;

        if depth == 1 {
            if root_pointers[path[0]] == 0 {
                let idx = self.allocate_zero_data_block(tx)?;
                root_pointers[path[0]] = idx;
                self.store_root_pointers(tx, depth, &root_pointers)?;
            }
            return Ok(root_pointers[path[0]]);
        }

        let mut current = root_pointers[path[0]];
        if current == 0 {
            current = self.allocate_zero_interior_block(tx)?;
            root_pointers[path[0]] = current;
            self.store_root_pointers(tx, depth, &root_pointers)?;
        }

        let inner = &path[1..];
        for (i, &slot) in inner.iter().enumerate() {
            let is_leaf_level = i == inner.len() - 1;
            let mut pointers = self.load_pointers(current)?;
            if pointers[slot] == 0 {
                let new_block = if is_leaf_level {
                    self.allocate_zero_data_block(tx)?
                } else {
                    self.allocate_zero_interior_block(tx)?
                };
                pointers[slot] = new_block;
                self.store_pointers(tx, current, &pointers)?;
            }
            current = pointers[slot];
        }
        Ok(current)
    }

    fn grow_tree(&self, tx: TransactionId, target_count: u64) -> CsfsResult<()> {
        let (mut depth, _) = self.load_root_pointers()?;
        let new_depth = depth_for_block_count(target_count);
        while depth < new_depth {
            self.prepend_level(tx, depth)?;
            depth += 1;
        }

        let old_count = block_count_for_size(self.node.size());
        for logical in old_count..target_count {
            self.ensure_leaf_allocated(tx, depth, logical)?;
        }
        Ok(())
    }

    /// Frees the data block at `logical`, then walks back up freeing any
    /// interior block that the removal left empty, propagating the clear
    /// into its own parent (§C's "popping upward when a level empties").
    fn free_logical_block(&self, tx: TransactionId, depth: u16, logical: u64) -> CsfsResult<()> {
        let path = path_for(logical, depth);
        let (_, root_pointers) = self.load_root_pointers()?;

        if depth == 1 {
            let idx = root_pointers[path[0]];
            if idx != 0 {
                self.volume.allocator().free(idx, 1, tx)?;
                let mut updated = root_pointers;
                updated[path[0]] = 0;
                self.store_root_pointers(tx, depth, &updated)?;
            }
            return Ok(());
        }

        // frames[i] = (owning block, its pointer array, the slot used to
        // reach the next level down); the root frame's owner is `None`.
        let mut frames: Vec<(Option<BlockIndex>, Vec<u64>, usize)> = Vec::with_capacity(depth as usize);
        frames.push((None, root_pointers, path[0]));
        let mut current = frames[0].1[path[0]];
        for &slot in &path[1..] {
            let pointers = self.load_pointers(current)?;
            let owner = current;
            current = pointers[slot];
            frames.push((Some(owner), pointers, slot));
        }

        if current != 0 {
            self.volume.allocator().free(current, 1, tx)?;
        }

        let mut propagate = true;
        for i in (0..frames.len()).rev() {
            if !propagate {
                break;
            }
            let (owner, mut pointers, slot) = frames[i].clone();
            pointers[slot] = 0;
            let all_empty = pointers.iter().all(|&p| p == 0);
            match owner {
                None => {
                    self.store_root_pointers(tx, depth, &pointers)?;
                    propagate = false;
                }
                Some(block_index) => {
                    if all_empty {
                        self.volume.allocator().free(block_index, 1, tx)?;
                    } else {
                        self.store_pointers(tx, block_index, &pointers)?;
                        propagate = false;
                    }
                }
            }
        }
        Ok(())
    }

    /// Collapses the root down one level once its only remaining child
    /// (slot 0) is the sole surviving interior block (§C).
    fn collapse_level(&self, tx: TransactionId) -> CsfsResult<()> {
        let (depth, root_pointers) = self.load_root_pointers()?;
        if depth <= 1 {
            return Ok(());
        }
        let child = root_pointers[0];
        let new_root = if child == 0 {
            vec![0u64; root_fanout()]
        } else {
            let child_pointers = self.load_pointers(child)?;
            self.volume.allocator().free(child, 1, tx)?;
            child_pointers[..root_fanout()].to_vec()
        };
        self.store_root_pointers(tx, depth - 1, &new_root)
    }

    fn shrink_tree(&self, tx: TransactionId, target_count: u64) -> CsfsResult<()> {
        let (depth, _) = self.load_root_pointers()?;
        if depth == 0 {
            return Ok(());
        }
        let old_count = block_count_for_size(self.node.size());
        for logical in (target_count..old_count).rev() {
            self.free_logical_block(tx, depth, logical)?;
        }

        let new_depth = depth_for_block_count(target_count);
        loop {
            let (cur_depth, _) = self.load_root_pointers()?;
            if cur_depth <= new_depth || cur_depth <= 1 {
                break;
            }
            self.collapse_level(tx)?;
        }
        if target_count == 0 {
            let (cur_depth, _) = self.load_root_pointers()?;
            if cur_depth != 0 {
                self.store_root_pointers(tx, 0, &vec![0u64; root_fanout()])?;
            }
        }
        Ok(())
    }

    /// Grows or shrinks the tree to match `new_size`, updating the node's
    /// recorded size (§4.5).
    pub fn resize(&self, tx: &mut Transaction<'_, D>, new_size: u64) -> CsfsResult<()> {
        let old_count = block_count_for_size(self.node.size());
        let new_count = block_count_for_size(new_size);

        if new_count > old_count {
            self.grow_tree(tx.id(), new_count)?;
        } else if new_count < old_count {
            self.shrink_tree(tx.id(), new_count)?;
        }
        self.node.set_size(new_size);
        Ok(())
    }

    /// Reads up to `len` bytes starting at `offset`, clamped to the file's
    /// current size; unallocated (sparse) blocks read back as zero.
    pub fn read(&self, offset: u64, len: usize) -> CsfsResult<Vec<u8>> {
        let size = self.node.size();
        let avail = size.saturating_sub(offset) as usize;
        let len = len.min(avail);
        let mut out = Vec::with_capacity(len);
        if len == 0 {
            return Ok(out);
        }

        let block_size = BLOCK_SIZE as u64;
        let mut remaining = len;
        let mut logical = offset / block_size;
        let mut block_offset = (offset % block_size) as usize;
        while remaining > 0 {
            let take = (BLOCK_SIZE - block_offset).min(remaining);
            match self.physical_for(logical)? {
                Some(idx) => {
                    let data = self.volume.block_cache().get(idx)?;
                    out.extend_from_slice(&data[block_offset..block_offset + take]);
                }
                None => out.extend(std::iter::repeat(0u8).take(take)),
            }
            remaining -= take;
            logical += 1;
            block_offset = 0;
        }
        Ok(out)
    }

    /// Writes `data` at `offset`, growing the file first if the write
    /// extends past its current size. Every affected block's checksum is
    /// recomputed directly from its post-write contents, zero-padding a
    /// short post-write read of a partial block before hashing (§4.5).
    pub fn write(&self, tx: &mut Transaction<'_, D>, offset: u64, data: &[u8]) -> CsfsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        if end > self.node.size() {
            self.resize(tx, end)?;
        }

        let block_size = BLOCK_SIZE as u64;
        let mut written = 0usize;
        let mut logical = offset / block_size;
        let mut block_offset = (offset % block_size) as usize;
        while written < data.len() {
            let physical = self
                .physical_for(logical)?
                .ok_or(CsfsError::BadData("file block tree missing block for in-range offset"))?;
            let take = (BLOCK_SIZE - block_offset).min(data.len() - written);

            // Disable verification before touching the block's contents: an
            // all-zero stored checksum tells the device to skip the check,
            // closing the race between the page writer publishing partly-new
            // data and this function's later real checksum write (§4.5 step 2).
            self.volume.device().set_check_sum(physical, crate::layout::ZERO_CHECK_SUM)?;

            let mut block = Block::new();
            block.get_writable(self.volume.block_cache(), physical, tx.id())?;
            block.data_mut()[block_offset..block_offset + take].copy_from_slice(&data[written..written + take]);
            block.flush_writes()?;
            drop(block);

            let mut full = self.volume.block_cache().get(physical)?;
            if full.len() < BLOCK_SIZE {
                full.resize(BLOCK_SIZE, 0);
            }
            self.volume.device().set_check_sum(physical, compute_check_sum(&full))?;

            written += take;
            logical += 1;
            block_offset = 0;
        }

        self.node.set_size(self.node.size().max(end));
        Ok(())
    }

    /// Coalesces the physical blocks backing `[offset, offset + len)` into
    /// `(device_offset, length)` runs, skipping unallocated ranges.
    pub fn get_file_vecs(&self, offset: u64, len: usize) -> CsfsResult<Vec<(u64, u64)>> {
        let size = self.node.size();
        let avail = size.saturating_sub(offset) as usize;
        let len = len.min(avail);
        let mut vecs: Vec<(u64, u64)> = Vec::new();
        if len == 0 {
            return Ok(vecs);
        }

        let block_size = BLOCK_SIZE as u64;
        let mut remaining = len as u64;
        let mut logical = offset / block_size;
        let mut block_offset = offset % block_size;
        while remaining > 0 {
            let take = (block_size - block_offset).min(remaining);
            if let Some(physical) = self.physical_for(logical)? {
                let dev_offset = physical * block_size + block_offset;
                match vecs.last_mut() {
                    Some((last_off, last_len)) if *last_off + *last_len == dev_offset => *last_len += take,
                    _ => vecs.push((dev_offset, take)),
                }
            }
            remaining -= take;
            logical += 1;
            block_offset = 0;
        }
        Ok(vecs)
    }

    /// Flushes the underlying block cache. Data blocks already carry their
    /// own checksums written in lockstep with `write`, so there is nothing
    /// file-tree-specific left to do beyond the cache's own sync.
    pub fn sync(&self) -> CsfsResult<()> {
        self.volume.block_cache().sync()
    }
}

/// Frees every block in the file's tree — data, leaf and interior pointer
/// blocks alike — by resizing down to zero. The node's own block is freed
/// by the caller (§4.6's `deleting` dispatch).
pub fn free_contents<D: CheckSumDevice>(
    volume: &Volume<D>,
    node: &Node,
    tx: &mut Transaction<'_, D>,
) -> CsfsResult<()> {
    let tree = FileBlockTree::new(volume, node);
    tree.resize(tx, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockCache;
    use crate::test_support::{MemoryBlockCache, MemoryCheckSumDevice};
    use std::sync::Arc;

    fn fresh_volume(total_blocks: u64) -> Volume<MemoryCheckSumDevice> {
        let cache: Arc<dyn BlockCache> = Arc::new(MemoryBlockCache::new(total_blocks));
        let device = Arc::new(MemoryCheckSumDevice::new());
        Volume::format(cache, device, b"filetest").unwrap()
    }

    #[test]
    fn write_then_read_within_one_block() {
        let volume = fresh_volume(4096);
        let mut tx = volume.begin_transaction().unwrap();
        let node = volume.create_file(&mut tx, volume.root_dir()).unwrap();
        let tree = FileBlockTree::new(&volume, &node);
        tree.write(&mut tx, 10, b"hello world").unwrap();
        tx.commit(&[]).unwrap();

        assert_eq!(node.size(), 21);
        let data = tree.read(10, 11).unwrap();
        assert_eq!(data, b"hello world");
        let zeros = tree.read(0, 10).unwrap();
        assert_eq!(zeros, vec![0u8; 10]);
    }

    #[test]
    fn write_spanning_multiple_blocks_round_trips() {
        let volume = fresh_volume(8192);
        let mut tx = volume.begin_transaction().unwrap();
        let node = volume.create_file(&mut tx, volume.root_dir()).unwrap();
        let tree = FileBlockTree::new(&volume, &node);

        let payload: Vec<u8> = (0..(BLOCK_SIZE * 3 + 123)).map(|i| (i % 251) as u8).collect();
        tree.write(&mut tx, 0, &payload).unwrap();
        tx.commit(&[]).unwrap();

        let read_back = tree.read(0, payload.len()).unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn grow_past_root_fanout_increases_depth() {
        let total = root_fanout() as u64 + 16;
        let volume = fresh_volume(total + 64);
        let mut tx = volume.begin_transaction().unwrap();
        let node = volume.create_file(&mut tx, volume.root_dir()).unwrap();
        let tree = FileBlockTree::new(&volume, &node);

        tree.resize(&mut tx, (total) * BLOCK_SIZE as u64).unwrap();
        tx.commit(&[]).unwrap();

        let (depth, _) = tree.load_root_pointers().unwrap();
        assert!(depth > 1, "tree should have grown past the root level");
    }

    #[test]
    fn shrink_frees_blocks_and_collapses_depth() {
        let total = root_fanout() as u64 + 16;
        let volume = fresh_volume(total + 64);
        let mut tx = volume.begin_transaction().unwrap();
        let node = volume.create_file(&mut tx, volume.root_dir()).unwrap();
        let tree = FileBlockTree::new(&volume, &node);
        tree.resize(&mut tx, total * BLOCK_SIZE as u64).unwrap();
        tx.commit(&[]).unwrap();

        let before_free = volume.allocator().free_blocks();

        let mut tx = volume.begin_transaction().unwrap();
        tree.resize(&mut tx, BLOCK_SIZE as u64).unwrap();
        tx.commit(&[]).unwrap();

        assert!(volume.allocator().free_blocks() > before_free);
        let (depth, _) = tree.load_root_pointers().unwrap();
        assert_eq!(depth, 1);
    }

    #[test]
    fn delete_file_frees_all_its_blocks() {
        let volume = fresh_volume(8192);
        let mut tx = volume.begin_transaction().unwrap();
        let node = volume.create_file(&mut tx, volume.root_dir()).unwrap();
        let payload = vec![7u8; BLOCK_SIZE * 2 + 50];
        {
            let tree = FileBlockTree::new(&volume, &node);
            tree.write(&mut tx, 0, &payload).unwrap();
        }
        tx.commit(&[]).unwrap();

        let before = volume.allocator().free_blocks();
        let mut tx = volume.begin_transaction().unwrap();
        volume.delete_node(&mut tx, &node).unwrap();
        tx.commit(&[]).unwrap();
        assert!(volume.allocator().free_blocks() > before);
    }
}
