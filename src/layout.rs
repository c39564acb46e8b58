//! On-disk size constants and the raw super-block/node-header layouts.
//!
//! Field order and constant values are grounded in the original
//! `checksumfs.h` (`examples/original_source/.../checksumfs.h`): two bracketing
//! signatures, version 1, and a `checksumfs_node` header with the exact field
//! order reproduced below. Structs are `bytemuck::Pod`/`Zeroable` newtypes in
//! the teacher's style (`fs/ext4/sb.rs`, `fs/ext4/inode.rs`), little-endian by
//! construction since every field is a plain integer with no host-order
//! dependent bit tricks.

use bytemuck::{Pod, Zeroable};

/// Size in bytes of one filesystem block.
pub const BLOCK_SIZE: usize = 4096;

/// Block index type. Plain `u64`: unlike an inode number, a block index
/// carries no reserved-value semantics beyond "0 is never allocatable",
/// which every allocator path already enforces explicitly.
pub type BlockIndex = u64;

/// Byte length of a stored SHA-256 checksum.
pub const CHECK_SUM_LENGTH: usize = 32;

/// A stored checksum. All-zero means "skip verification" (§6.2).
pub type CheckSum = [u8; CHECK_SUM_LENGTH];

pub const ZERO_CHECK_SUM: CheckSum = [0u8; CHECK_SUM_LENGTH];

/// Block holding the super block.
pub const SUPER_BLOCK_INDEX: BlockIndex = 16;

/// Byte offset of the super block within its block (here, block size ==
/// offset so the super block occupies the whole of block 16).
pub const SUPER_BLOCK_OFFSET: u64 = SUPER_BLOCK_INDEX * BLOCK_SIZE as u64;

/// Minimum volume size, in blocks: `kCheckSumFSSuperBlockOffset +
/// 16 * B`, i.e. 32 blocks (§6.1).
pub const MIN_VOLUME_BLOCKS: u64 = SUPER_BLOCK_INDEX + 16;

pub const SIGNATURE_LENGTH: usize = 16;
pub const SIGNATURE_1: &[u8; SIGNATURE_LENGTH] = b"_1!cHEcKsUmfS!1_";
pub const SIGNATURE_2: &[u8; SIGNATURE_LENGTH] = b"-2@ChECkSumFs@2-";

pub const CURRENT_VERSION: u32 = 1;

/// Maximum length of a volume name or an entry name, in bytes (§6.6). The
/// distilled spec is authoritative here over the original's looser
/// `kCheckSumFSNameLength == 256` bound (see SPEC_FULL.md §C).
pub const MAX_NAME_LENGTH: usize = 255;

pub const MAX_DIR_ENTRY_TREE_DEPTH: u16 = 24;

/// Raw, on-disk super block layout (`checksumfs_super_block`). 128 bytes.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct SuperBlockRaw {
    pub signature1: [u8; SIGNATURE_LENGTH],
    pub version: u32,
    pub pad1: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub root_dir: u64,
    pub block_bitmap: u64,
    pub name: [u8; 256],
    pub signature2: [u8; SIGNATURE_LENGTH],
}

impl SuperBlockRaw {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Raw, on-disk node header (`checksumfs_node`). Field order matches the
/// original exactly; every field is naturally 8-byte aligned in this order,
/// so no explicit padding is required besides the leading `u32`s.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct NodeHeaderRaw {
    pub mode: u32,
    pub attribute_type: u32,
    pub uid: u32,
    pub gid: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub change_time: u64,
    pub hard_links: u64,
    pub size: u64,
    pub parent_directory: u64,
    pub attribute_directory: u64,
}

impl NodeHeaderRaw {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// POSIX mode bits used for the node "type" portion (the permission bits are
/// opaque to CSFS and passed through unchanged).
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFLNK: u32 = 0o120000;

    pub fn is_dir(mode: u32) -> bool {
        mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(mode: u32) -> bool {
        mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(mode: u32) -> bool {
        mode & S_IFMT == S_IFLNK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_struct_sizes_fit_one_block() {
        assert!(SuperBlockRaw::SIZE <= BLOCK_SIZE);
        assert!(NodeHeaderRaw::SIZE < BLOCK_SIZE);
    }
}
