//! CSFS: a block-based, checksum-verified filesystem core (§1).
//!
//! Every filesystem block carries a stored SHA-256 checksum in a side
//! channel (the `CheckSumDevice` collaborator) kept in lockstep with the
//! block's contents by `Transaction`'s commit/abort protocol. Metadata
//! (allocator bitmaps, directory entry trees, node headers, file-tree
//! interior/leaf blocks) is mutated only within a `Transaction`, whose
//! commit order is this crate's core correctness rule (§4.2). File data
//! blocks are the one exception: per the "no journaling of data blocks"
//! Non-goal their checksums are written immediately, not deferred to commit
//! (`file::FileBlockTree::write`).
//!
//! `Volume<D>` is the entry point: `Volume::format` creates a fresh volume,
//! `Volume::mount` opens an existing one, and `Volume::begin_transaction`
//! starts a transaction against it. Everything else in this crate is a
//! collaborator `Volume` drives.

pub mod allocator;
pub mod block;
pub mod device;
pub mod directory;
pub(crate) mod dirty;
pub mod error;
pub mod file;
pub mod layout;
pub mod node;
pub mod notifications;
pub mod superblock;
pub mod symlink;
pub mod transaction;
pub mod volume;

#[cfg(test)]
mod test_support;

pub use error::{CsfsError, CsfsResult};
pub use volume::Volume;
