//! The checksum-verifying block device collaborator (§6.2).
//!
//! CSFS never talks to a disk directly; it assumes an external block device
//! that exposes block-granular I/O plus a per-block "stored checksum"
//! side-channel, consulted here only through `get_check_sum`/`set_check_sum`.
//! Reads failing when the live block hash disagrees with the stored
//! checksum (unless all-zero) is entirely the device's responsibility and out
//! of scope for this crate — CSFS only ever *writes* checksums, in lockstep
//! with the data they cover.

use crate::error::CsfsResult;
use crate::layout::{BlockIndex, CheckSum};

/// The `GET_CHECK_SUM` / `SET_CHECK_SUM` ioctl pair (§6.2).
pub trait CheckSumDevice: Send + Sync {
    /// Fetches the stored checksum for `block_index`.
    fn get_check_sum(&self, block_index: BlockIndex) -> CsfsResult<CheckSum>;

    /// Overwrites the stored checksum for `block_index`. A checksum of
    /// 32 zero bytes disables verification for that block.
    fn set_check_sum(&self, block_index: BlockIndex, check_sum: CheckSum) -> CsfsResult<()>;
}

/// Computes the checksum CSFS stores for a block's contents.
pub fn compute_check_sum(data: &[u8]) -> CheckSum {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
