//! The in-memory node image shared by files, directories and symlinks (§4.6).
//!
//! Grounded in `Node.h`/`Node.cpp`: an `rw_lock`, a back-reference to the
//! owning volume, the on-disk header, a dirty flag, and a non-persisted
//! `accessedTime`. The original's single-inheritance `Node -> File /
//! Directory / SymLink` hierarchy is replaced per §9's redesign note with a
//! `NodeKind` tag derived from the mode bits and `match`-based dispatch in
//! `deleting` — `File`/`Directory`/`SymLink` carry no extra persisted state of
//! their own (their logic lives in `file`/`directory`/`symlink`, operating on
//! a `Node` plus a `Volume` reference), so a payload-carrying sum type would
//! only add indirection; the tag is enough to dispatch.

use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::{Block, TransactionId};
use crate::device::CheckSumDevice;
use crate::error::CsfsResult;
use crate::layout::{self, mode, BlockIndex, NodeHeaderRaw};
use crate::transaction::Transaction;
use crate::volume::Volume;

/// Which timestamp(s) `touched` should bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchMode {
    Accessed,
    Modified,
    StatChanged,
}

/// The node's type, derived from `mode`'s type bits. Dispatch target for
/// `deleting`/`resize`/`read`/`write`/`sync` (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    SymLink,
    Other,
}

impl NodeKind {
    pub fn from_mode(raw_mode: u32) -> NodeKind {
        if mode::is_dir(raw_mode) {
            NodeKind::Directory
        } else if mode::is_file(raw_mode) {
            NodeKind::File
        } else if mode::is_symlink(raw_mode) {
            NodeKind::SymLink
        } else {
            NodeKind::Other
        }
    }
}

/// The logical (host-endian) view of `checksumfs_node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub mode: u32,
    pub attribute_type: u32,
    pub uid: u32,
    pub gid: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    pub change_time: u64,
    pub hard_links: u64,
    pub size: u64,
    pub parent_directory: BlockIndex,
    pub attribute_directory: BlockIndex,
}

impl From<NodeHeaderRaw> for NodeHeader {
    fn from(raw: NodeHeaderRaw) -> Self {
        NodeHeader {
            mode: raw.mode,
            attribute_type: raw.attribute_type,
            uid: raw.uid,
            gid: raw.gid,
            creation_time: raw.creation_time,
            modification_time: raw.modification_time,
            change_time: raw.change_time,
            hard_links: raw.hard_links,
            size: raw.size,
            parent_directory: raw.parent_directory,
            attribute_directory: raw.attribute_directory,
        }
    }
}

impl From<NodeHeader> for NodeHeaderRaw {
    fn from(header: NodeHeader) -> Self {
        NodeHeaderRaw {
            mode: header.mode,
            attribute_type: header.attribute_type,
            uid: header.uid,
            gid: header.gid,
            creation_time: header.creation_time,
            modification_time: header.modification_time,
            change_time: header.change_time,
            hard_links: header.hard_links,
            size: header.size,
            parent_directory: header.parent_directory,
            attribute_directory: header.attribute_directory,
        }
    }
}

impl NodeHeader {
    pub fn new(mode: u32, parent_directory: BlockIndex, now_ns: u64) -> Self {
        NodeHeader {
            mode,
            attribute_type: 0,
            uid: 0,
            gid: 0,
            creation_time: now_ns,
            modification_time: now_ns,
            change_time: now_ns,
            hard_links: 0,
            size: 0,
            parent_directory,
            attribute_directory: 0,
        }
    }

    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mode(self.mode)
    }
}

/// Current time in nanoseconds since the epoch (§3.2's "nanoseconds since
/// the epoch").
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

struct NodeState {
    header: NodeHeader,
    dirty: bool,
    accessed_time: u64,
}

/// The in-memory image of one on-disk node block (§4.6).
pub struct Node {
    block_index: BlockIndex,
    state: RwLock<NodeState>,
}

impl Node {
    pub fn from_header(block_index: BlockIndex, header: NodeHeader) -> Self {
        let accessed_time = header.modification_time;
        Node {
            block_index,
            state: RwLock::new(NodeState {
                header,
                dirty: false,
                accessed_time,
            }),
        }
    }

    pub fn block_index(&self) -> BlockIndex {
        self.block_index
    }

    pub fn header(&self) -> NodeHeader {
        self.state.read().unwrap().header
    }

    pub fn kind(&self) -> NodeKind {
        self.header().kind()
    }

    pub fn size(&self) -> u64 {
        self.state.read().unwrap().header.size
    }

    pub fn set_size(&self, size: u64) {
        let mut state = self.state.write().unwrap();
        state.header.size = size;
        state.dirty = true;
    }

    pub fn set_hard_links(&self, count: u64) {
        let mut state = self.state.write().unwrap();
        state.header.hard_links = count;
        state.dirty = true;
    }

    /// Updates the node's accessed/modified/stat-changed timestamp(s) to
    /// now. `Accessed` only updates the non-persisted `accessed_time`;
    /// `Modified` and `StatChanged` bump the on-disk header and mark it
    /// dirty.
    pub fn touched(&self, touch: TouchMode) {
        let now = now_ns();
        let mut state = self.state.write().unwrap();
        match touch {
            TouchMode::Accessed => state.accessed_time = now,
            TouchMode::Modified => {
                state.header.modification_time = now;
                state.header.change_time = now;
                state.dirty = true;
            }
            TouchMode::StatChanged => {
                state.header.change_time = now;
                state.dirty = true;
            }
        }
    }

    pub fn accessed_time(&self) -> u64 {
        self.state.read().unwrap().accessed_time
    }

    /// Snapshots the header for `Transaction::add_node`.
    pub fn snapshot(&self) -> NodeHeader {
        self.state.read().unwrap().header
    }

    /// Restores the header from a snapshot (`Transaction::abort`, §4.2).
    pub fn revert(&self, snapshot: NodeHeader) {
        let mut state = self.state.write().unwrap();
        state.header = snapshot;
        state.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().unwrap().dirty
    }

    /// Writes the header into its block if dirty, then clears the flag.
    pub fn flush<D: CheckSumDevice>(&self, volume: &Volume<D>, tx: TransactionId) -> CsfsResult<()> {
        let mut state = self.state.write().unwrap();
        if !state.dirty {
            return Ok(());
        }

        let mut block = Block::new();
        block.get_writable(volume.block_cache(), self.block_index, tx)?;
        let raw: NodeHeaderRaw = state.header.into();
        block.data_mut()[..NodeHeaderRaw::SIZE].copy_from_slice(bytemuck::bytes_of(&raw));
        block.flush_writes()?;
        volume.note_block_dirty(self.block_index)?;

        state.dirty = false;
        Ok(())
    }
}

/// Dispatches node deletion to the kind-specific payload teardown, then lets
/// the caller free the node's own block. Mirrors `File::DeletingNode` /
/// `Directory`'s (absent override, meaning "nothing to free beyond the
/// entry tree which lives in the node block") / `SymLink` (nothing to free:
/// inline payload).
pub fn deleting<D: CheckSumDevice>(
    node: &Node,
    volume: &Volume<D>,
    tx: &mut Transaction<'_, D>,
) -> CsfsResult<()> {
    match node.kind() {
        NodeKind::File => crate::file::free_contents(volume, node, tx),
        NodeKind::Directory => crate::directory::free_contents(volume, node, tx),
        NodeKind::SymLink | NodeKind::Other => Ok(()),
    }
}

pub(crate) fn payload_offset() -> usize {
    NodeHeaderRaw::SIZE
}

pub(crate) fn payload_len() -> usize {
    layout::BLOCK_SIZE - NodeHeaderRaw::SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_mode() {
        assert_eq!(NodeKind::from_mode(mode::S_IFDIR | 0o755), NodeKind::Directory);
        assert_eq!(NodeKind::from_mode(mode::S_IFREG | 0o644), NodeKind::File);
        assert_eq!(NodeKind::from_mode(mode::S_IFLNK | 0o777), NodeKind::SymLink);
    }

    #[test]
    fn touched_modified_marks_dirty() {
        let header = NodeHeader::new(mode::S_IFREG, 16, 0);
        let node = Node::from_header(100, header);
        assert!(!node.is_dirty());
        node.touched(TouchMode::Modified);
        assert!(node.is_dirty());
    }
}
