//! The volume super block (§3.1, §6.1).
//!
//! Grounded in `SuperBlock.h`/`SuperBlock.cpp`: a thin wrapper around
//! `checksumfs_super_block` with a `Check`/`Initialize` pair and plain
//! field accessors.

use crate::block::{Block, BlockCache, TransactionId};
use crate::error::{CsfsError, CsfsResult};
use crate::layout::{
    BlockIndex, SuperBlockRaw, CURRENT_VERSION, MAX_NAME_LENGTH, MIN_VOLUME_BLOCKS,
    SIGNATURE_1, SIGNATURE_2, SUPER_BLOCK_INDEX,
};

/// In-memory, host-endian view of the on-disk super block.
#[derive(Debug, Clone)]
pub struct SuperBlock {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub root_dir: BlockIndex,
    pub block_bitmap: BlockIndex,
    pub name: Vec<u8>,
}

impl SuperBlock {
    /// Validates the on-disk signatures, version, volume-size bound, and
    /// name length (§6.1's "mount checks").
    pub fn check(raw: &SuperBlockRaw, device_total_blocks: u64) -> CsfsResult<SuperBlock> {
        if &raw.signature1 != SIGNATURE_1 || &raw.signature2 != SIGNATURE_2 {
            return Err(CsfsError::BadData("super block signature mismatch"));
        }
        if raw.version != CURRENT_VERSION {
            return Err(CsfsError::BadData("unsupported super block version"));
        }
        if raw.total_blocks < MIN_VOLUME_BLOCKS || raw.total_blocks > device_total_blocks {
            return Err(CsfsError::BadData("super block total_blocks out of range"));
        }
        if raw.root_dir <= SUPER_BLOCK_INDEX || raw.root_dir >= raw.total_blocks {
            return Err(CsfsError::BadData("super block root_dir out of range"));
        }
        if raw.block_bitmap <= SUPER_BLOCK_INDEX {
            return Err(CsfsError::BadData("super block block_bitmap out of range"));
        }

        let name_len = raw.name.iter().position(|&b| b == 0).unwrap_or(raw.name.len());
        if name_len > MAX_NAME_LENGTH {
            return Err(CsfsError::NameTooLong);
        }

        Ok(SuperBlock {
            total_blocks: raw.total_blocks,
            free_blocks: raw.free_blocks,
            root_dir: raw.root_dir,
            block_bitmap: raw.block_bitmap,
            name: raw.name[..name_len].to_vec(),
        })
    }

    /// Builds the initial super block for a freshly-formatted volume
    /// (§6.1).
    pub fn initialize(
        total_blocks: u64,
        root_dir: BlockIndex,
        block_bitmap: BlockIndex,
        name: &[u8],
    ) -> CsfsResult<SuperBlock> {
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return Err(CsfsError::NameTooLong);
        }
        if total_blocks < MIN_VOLUME_BLOCKS {
            return Err(CsfsError::InvalidArgument("volume too small"));
        }

        Ok(SuperBlock {
            total_blocks,
            free_blocks: total_blocks,
            root_dir,
            block_bitmap,
            name: name.to_vec(),
        })
    }

    pub fn to_raw(&self) -> SuperBlockRaw {
        let mut name = [0u8; 256];
        name[..self.name.len()].copy_from_slice(&self.name);
        SuperBlockRaw {
            signature1: *SIGNATURE_1,
            version: CURRENT_VERSION,
            pad1: 0,
            total_blocks: self.total_blocks,
            free_blocks: self.free_blocks,
            root_dir: self.root_dir,
            block_bitmap: self.block_bitmap,
            name,
            signature2: *SIGNATURE_2,
        }
    }

    /// Reads and validates the super block from its fixed block index.
    pub fn read(cache: &std::sync::Arc<dyn BlockCache>) -> CsfsResult<SuperBlock> {
        let mut block = Block::new();
        block.get_readable(cache, SUPER_BLOCK_INDEX)?;
        let raw: &SuperBlockRaw = bytemuck::from_bytes(&block.data()[..SuperBlockRaw::SIZE]);
        SuperBlock::check(raw, cache.total_blocks())
    }

    /// Writes this super block to its fixed block index within `tx`.
    pub fn write(&self, cache: &std::sync::Arc<dyn BlockCache>, tx: TransactionId) -> CsfsResult<()> {
        let mut block = Block::new();
        block.get_writable(cache, SUPER_BLOCK_INDEX, tx)?;
        let raw = self.to_raw();
        block.data_mut()[..SuperBlockRaw::SIZE].copy_from_slice(bytemuck::bytes_of(&raw));
        block.flush_writes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryBlockCache;
    use std::sync::Arc;

    #[test]
    fn initialize_then_round_trip() {
        let sb = SuperBlock::initialize(1024, 18, 17, b"testvol").unwrap();
        let cache: Arc<dyn BlockCache> = Arc::new(MemoryBlockCache::new(1024));
        let tx = cache.start_transaction().unwrap();
        sb.write(&cache, tx).unwrap();
        cache.end_transaction(tx).unwrap();

        let read_back = SuperBlock::read(&cache).unwrap();
        assert_eq!(read_back.total_blocks, 1024);
        assert_eq!(read_back.root_dir, 18);
        assert_eq!(read_back.name, b"testvol");
    }

    #[test]
    fn rejects_bad_signature() {
        let mut raw = SuperBlock::initialize(1024, 18, 17, b"x").unwrap().to_raw();
        raw.signature1[0] = 0;
        assert!(SuperBlock::check(&raw, 1024).is_err());
    }

    #[test]
    fn rejects_name_too_long() {
        let name = vec![b'a'; 300];
        assert!(matches!(
            SuperBlock::initialize(1024, 18, 17, &name),
            Err(CsfsError::NameTooLong)
        ));
    }
}
