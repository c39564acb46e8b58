//! A mounted CSFS volume: the root object tying together the block cache,
//! checksum device, allocator, and the live node cache (§4.6, §6.1).
//!
//! Grounded in `Volume.h`: fd/device handle, mount flags, block cache,
//! `total_blocks`, name, `BlockAllocator`, root directory block index, and a
//! transaction-serializing lock. `Volume` here is generic over the checksum
//! device collaborator (`D: CheckSumDevice`, SPEC_FULL.md §C) so tests can
//! supply an in-memory fake without touching any real I/O path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::allocator::BlockAllocator;
use crate::block::BlockCache;
use crate::device::CheckSumDevice;
use crate::dirty::DirtyBlocks;
use crate::error::{CsfsError, CsfsResult};
use crate::layout::{mode, BlockIndex, BLOCK_SIZE, SUPER_BLOCK_INDEX};
use crate::node::{Node, NodeHeader};
use crate::superblock::SuperBlock;
use crate::transaction::Transaction;

/// First bitmap block follows the super block and one group-summary block
/// (§6.1's reserved-layout prefix: block 0 is reserved, the super block
/// sits at block 16, a single group-summary block at 17, bitmap blocks
/// starting at 18 for any volume small enough to need only one group).
const GROUP_BLOCK_INDEX: BlockIndex = SUPER_BLOCK_INDEX + 1;
const FIRST_BITMAP_BLOCK: BlockIndex = GROUP_BLOCK_INDEX + 1;

pub struct Volume<D: CheckSumDevice> {
    cache: Arc<dyn BlockCache>,
    device: Arc<D>,
    total_blocks: u64,
    name: Mutex<Vec<u8>>,
    allocator: BlockAllocator,
    root_dir: Mutex<BlockIndex>,
    tx_serializer: Mutex<()>,
    nodes: Mutex<HashMap<BlockIndex, Arc<Node>>>,
    removed: Mutex<HashSet<BlockIndex>>,
    dirty: Arc<DirtyBlocks>,
    read_only: bool,
}

impl<D: CheckSumDevice> Volume<D> {
    pub fn block_cache(&self) -> &Arc<dyn BlockCache> {
        &self.cache
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn name(&self) -> Vec<u8> {
        self.name.lock().unwrap().clone()
    }

    pub fn root_dir(&self) -> BlockIndex {
        *self.root_dir.lock().unwrap()
    }

    pub(crate) fn set_root_dir(&self, index: BlockIndex) {
        *self.root_dir.lock().unwrap() = index;
    }

    /// Acquires the volume-wide transaction serialization lock (§5:
    /// "transactions are serialized against each other"). Held by a
    /// `Transaction` for its whole lifetime.
    pub(crate) fn lock_transactions(&self) -> MutexGuard<'_, ()> {
        self.tx_serializer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn mark_node_removed(&self, block_index: BlockIndex) {
        self.removed.lock().unwrap().insert(block_index);
        self.nodes.lock().unwrap().remove(&block_index);
    }

    pub(crate) fn mark_node_present(&self, block_index: BlockIndex) {
        self.removed.lock().unwrap().remove(&block_index);
    }

    pub fn is_removed(&self, block_index: BlockIndex) -> bool {
        self.removed.lock().unwrap().contains(&block_index)
    }

    pub(crate) fn dirty_blocks(&self) -> &DirtyBlocks {
        &self.dirty
    }

    /// Marks `index` dirty for the active transaction, so its checksum is
    /// recomputed on commit (§4.2).
    pub(crate) fn note_block_dirty(&self, index: BlockIndex) -> CsfsResult<()> {
        self.dirty.note_dirty(index)
    }

    /// Starts a new transaction against this volume (§4.2).
    pub fn begin_transaction(&self) -> CsfsResult<Transaction<'_, D>> {
        let mut tx = Transaction::new(self);
        tx.start()?;
        Ok(tx)
    }

    /// Returns the cached `Node` for `block_index`, loading its header from
    /// disk on first access.
    pub fn get_node(&self, block_index: BlockIndex) -> CsfsResult<Arc<Node>> {
        if let Some(node) = self.nodes.lock().unwrap().get(&block_index) {
            return Ok(node.clone());
        }

        let data = self.cache.get(block_index)?;
        let raw: &crate::layout::NodeHeaderRaw =
            bytemuck::from_bytes(&data[..crate::layout::NodeHeaderRaw::SIZE]);
        let header: NodeHeader = (*raw).into();
        let node = Arc::new(Node::from_header(block_index, header));

        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.entry(block_index).or_insert_with(|| node).clone();
        Ok(node)
    }

    fn insert_node(&self, node: Arc<Node>) {
        self.nodes.lock().unwrap().insert(node.block_index(), node);
    }

    fn forget_node(&self, block_index: BlockIndex) {
        self.nodes.lock().unwrap().remove(&block_index);
    }

    /// Allocates a fresh block and installs a new node header on it within
    /// `tx`, without linking it into any directory yet (§4.6).
    pub fn create_node(
        &self,
        tx: &mut Transaction<'_, D>,
        mode_bits: u32,
        parent_directory: BlockIndex,
    ) -> CsfsResult<Arc<Node>> {
        let (base, count) = self.allocator.allocate(0, 1, tx.id())?;
        debug_assert_eq!(count, 1);

        let mut block = crate::block::Block::new();
        block.get_zero(&self.cache, base, tx.id())?;

        let header = NodeHeader::new(mode_bits, parent_directory, crate::node::now_ns());
        let raw: crate::layout::NodeHeaderRaw = header.into();
        block.data_mut()[..crate::layout::NodeHeaderRaw::SIZE].copy_from_slice(bytemuck::bytes_of(&raw));
        block.flush_writes()?;
        self.note_block_dirty(base)?;

        let node = Arc::new(Node::from_header(base, header));
        self.insert_node(node.clone());
        tx.add_node(&node, crate::transaction::node_flags::NONE)?;
        Ok(node)
    }

    pub fn create_directory(&self, tx: &mut Transaction<'_, D>, parent_directory: BlockIndex) -> CsfsResult<Arc<Node>> {
        let node = self.create_node(tx, mode::S_IFDIR | 0o755, parent_directory)?;
        crate::directory::initialize_tree(self, &node, tx.id())?;
        Ok(node)
    }

    pub fn create_file(&self, tx: &mut Transaction<'_, D>, parent_directory: BlockIndex) -> CsfsResult<Arc<Node>> {
        self.create_node(tx, mode::S_IFREG | 0o644, parent_directory)
    }

    pub fn create_symlink(
        &self,
        tx: &mut Transaction<'_, D>,
        parent_directory: BlockIndex,
        target: &[u8],
    ) -> CsfsResult<Arc<Node>> {
        let node = self.create_node(tx, mode::S_IFLNK | 0o777, parent_directory)?;
        crate::symlink::write_target(self, &node, node.block_index(), target, tx.id())?;
        Ok(node)
    }

    /// Tears down a node's payload (directory tree / file blocks) then frees
    /// its own block, all within `tx` (§4.2, §4.6).
    pub fn delete_node(&self, tx: &mut Transaction<'_, D>, node: &Arc<Node>) -> CsfsResult<()> {
        if self.read_only {
            return Err(CsfsError::ReadOnly);
        }
        tx.add_node(node, crate::transaction::node_flags::DELETE_ON_ABORT)?;
        crate::node::deleting(node, self, tx)?;
        self.allocator.free(node.block_index(), 1, tx.id())?;
        self.forget_node(node.block_index());
        Ok(())
    }

    /// Renames the volume and persists the new super block within `tx`
    /// (§6.1).
    pub fn set_name(&self, tx: &mut Transaction<'_, D>, name: &[u8]) -> CsfsResult<()> {
        let sb = SuperBlock::initialize(self.total_blocks, self.root_dir(), FIRST_BITMAP_BLOCK, name)
            .map_err(|_| CsfsError::NameTooLong)?;
        let mut sb = sb;
        sb.free_blocks = self.allocator.free_blocks();
        sb.write(&self.cache, tx.id())?;
        self.note_block_dirty(SUPER_BLOCK_INDEX)?;
        *self.name.lock().unwrap() = name.to_vec();
        Ok(())
    }

    /// Formats a fresh volume: zeroes the bitmap, reserves metadata blocks,
    /// creates an empty root directory, and writes the super block (§6.1).
    ///
    /// The bootstrap writes below happen before a `Volume` (and so a
    /// `Transaction`) exists, so they can't route through
    /// `note_block_dirty`/`Transaction::commit`; instead this function
    /// computes and stores their checksums directly once each bootstrap
    /// cache transaction ends, draining the same `DirtyBlocks` table that
    /// the allocator already populates internally.
    pub fn format(cache: Arc<dyn BlockCache>, device: Arc<D>, name: &[u8]) -> CsfsResult<Self> {
        let total_blocks = cache.total_blocks();
        if name.is_empty() || name.len() > crate::layout::MAX_NAME_LENGTH {
            return Err(CsfsError::NameTooLong);
        }

        let device_dyn: Arc<dyn CheckSumDevice> = device.clone();
        let dirty = Arc::new(DirtyBlocks::new(device_dyn));
        let allocator = BlockAllocator::new(cache.clone(), FIRST_BITMAP_BLOCK, total_blocks, dirty.clone());
        let tx_id = cache.start_transaction()?;
        allocator.initialize(tx_id)?;

        // Root directory block: allocated right after the metadata prefix.
        let (root_dir, count) = allocator.allocate(0, 1, tx_id)?;
        debug_assert_eq!(count, 1);

        let mut block = crate::block::Block::new();
        block.get_zero(&cache, root_dir, tx_id)?;
        let header = NodeHeader::new(mode::S_IFDIR | 0o755, root_dir, crate::node::now_ns());
        let raw: crate::layout::NodeHeaderRaw = header.into();
        block.data_mut()[..crate::layout::NodeHeaderRaw::SIZE].copy_from_slice(bytemuck::bytes_of(&raw));
        block.flush_writes()?;
        dirty.note_dirty(root_dir)?;

        let mut sb = SuperBlock::initialize(total_blocks, root_dir, FIRST_BITMAP_BLOCK, name)?;
        sb.free_blocks = allocator.free_blocks();
        sb.write(&cache, tx_id)?;
        dirty.note_dirty(SUPER_BLOCK_INDEX)?;

        cache.end_transaction(tx_id)?;
        apply_bootstrap_checksums(&cache, &device, &dirty)?;

        let volume = Volume {
            cache,
            device,
            total_blocks,
            name: Mutex::new(name.to_vec()),
            allocator,
            root_dir: Mutex::new(root_dir),
            tx_serializer: Mutex::new(()),
            nodes: Mutex::new(HashMap::new()),
            removed: Mutex::new(HashSet::new()),
            dirty,
            read_only: false,
        };

        let root_node = Arc::new(Node::from_header(root_dir, header));
        // The root directory is its own parent and always has one hard link
        // (§6.1/scenario 1: "root directory exists with hardLinks == 1").
        root_node.set_hard_links(1);
        volume.insert_node(root_node.clone());
        let root_tx_id = volume.block_cache().start_transaction()?;
        root_node.flush(&volume, root_tx_id)?;
        crate::directory::initialize_tree(&volume, &root_node, root_tx_id)?;
        volume.block_cache().end_transaction(root_tx_id)?;
        apply_bootstrap_checksums(&volume.cache, &volume.device, &volume.dirty)?;

        Ok(volume)
    }

    /// Mounts an existing, formatted volume: reads and validates the super
    /// block, restores the allocator's free-block count (§6.1).
    pub fn mount(cache: Arc<dyn BlockCache>, device: Arc<D>, read_only: bool) -> CsfsResult<Self> {
        let sb = SuperBlock::read(&cache)?;
        let device_dyn: Arc<dyn CheckSumDevice> = device.clone();
        let dirty = Arc::new(DirtyBlocks::new(device_dyn));
        let allocator = BlockAllocator::new(cache.clone(), sb.block_bitmap, sb.total_blocks, dirty.clone());
        allocator.set_free_blocks(sb.free_blocks);

        Ok(Volume {
            cache,
            device,
            total_blocks: sb.total_blocks,
            name: Mutex::new(sb.name),
            allocator,
            root_dir: Mutex::new(sb.root_dir),
            tx_serializer: Mutex::new(()),
            nodes: Mutex::new(HashMap::new()),
            removed: Mutex::new(HashSet::new()),
            dirty,
            read_only,
        })
    }

    /// A minimal volume for unit tests that only exercise a single module in
    /// isolation (e.g. `symlink`), skipping the full `format` dance.
    #[cfg(test)]
    pub fn for_tests(cache: Arc<dyn BlockCache>, device: Arc<D>, total_blocks: u64) -> Self {
        let device_dyn: Arc<dyn CheckSumDevice> = device.clone();
        let dirty = Arc::new(DirtyBlocks::new(device_dyn));
        let allocator = BlockAllocator::new(cache.clone(), FIRST_BITMAP_BLOCK, total_blocks, dirty.clone());
        allocator.set_free_blocks(total_blocks);
        Volume {
            cache,
            device,
            total_blocks,
            name: Mutex::new(b"test".to_vec()),
            allocator,
            root_dir: Mutex::new(0),
            tx_serializer: Mutex::new(()),
            nodes: Mutex::new(HashMap::new()),
            removed: Mutex::new(HashSet::new()),
            dirty,
            read_only: false,
        }
    }
}

/// Computes and stores checksums for every block `dirty` has accumulated,
/// then clears it. Used only during `format`'s bootstrap, before a `Volume`
/// (and so a `Transaction`) exists to do this at commit time.
fn apply_bootstrap_checksums<D: CheckSumDevice>(
    cache: &Arc<dyn BlockCache>,
    device: &Arc<D>,
    dirty: &DirtyBlocks,
) -> CsfsResult<()> {
    for (index, _old, is_dirty) in dirty.snapshot() {
        if is_dirty {
            let data = cache.get(index)?;
            device.set_check_sum(index, crate::device::compute_check_sum(&data))?;
        }
    }
    dirty.clear();
    Ok(())
}

#[allow(dead_code)]
const ASSERT_GROUP_BLOCK_FITS: () = {
    assert!(BLOCK_SIZE >= 2);
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryBlockCache, MemoryCheckSumDevice};

    #[test]
    fn format_then_mount_round_trips_name_and_root() {
        let cache: Arc<dyn BlockCache> = Arc::new(MemoryBlockCache::new(4096));
        let device = Arc::new(MemoryCheckSumDevice::new());
        let volume = Volume::format(cache.clone(), device.clone(), b"myvolume").unwrap();
        let root = volume.root_dir();

        let mounted = Volume::mount(cache, device, false).unwrap();
        assert_eq!(mounted.name(), b"myvolume");
        assert_eq!(mounted.root_dir(), root);
    }

    #[test]
    fn create_and_delete_file_roundtrip_free_blocks() {
        let cache: Arc<dyn BlockCache> = Arc::new(MemoryBlockCache::new(4096));
        let device = Arc::new(MemoryCheckSumDevice::new());
        let volume = Volume::format(cache, device, b"v").unwrap();

        let before = volume.allocator().free_blocks();
        let mut tx = volume.begin_transaction().unwrap();
        let file = volume.create_file(&mut tx, volume.root_dir()).unwrap();
        tx.commit(&[]).unwrap();
        assert_eq!(volume.allocator().free_blocks(), before - 1);

        let mut tx = volume.begin_transaction().unwrap();
        volume.delete_node(&mut tx, &file).unwrap();
        tx.commit(&[]).unwrap();
        assert_eq!(volume.allocator().free_blocks(), before);
    }
}
