//! Post-commit notifications fired by `Transaction::commit` (§4.2, §6.5).
//!
//! The original dispatches over a small fixed set of notification
//! subclasses via virtual `NotifyPostCommit()`. Per §9's redesign note, this
//! crate uses a plain enum carrying each variant's captured fields instead;
//! `fire` is the single dispatch point, fire-and-forget (§7: "Post-commit
//! notifications are fire-and-forget").

use crate::layout::BlockIndex;

#[derive(Debug, Clone)]
pub enum PostCommitNotification {
    EntryCreated {
        directory: BlockIndex,
        name: Vec<u8>,
        node: BlockIndex,
    },
    EntryRemoved {
        directory: BlockIndex,
        name: Vec<u8>,
        node: BlockIndex,
    },
    EntryMoved {
        old_directory: BlockIndex,
        old_name: Vec<u8>,
        new_directory: BlockIndex,
        new_name: Vec<u8>,
        node: BlockIndex,
    },
    StatChanged {
        node: BlockIndex,
    },
    AttributeChanged {
        node: BlockIndex,
        attribute: Vec<u8>,
    },
}

impl PostCommitNotification {
    /// Fires the notification. VFS dispatch itself is an external
    /// collaborator (§6.5); this crate's responsibility ends at logging the
    /// event so a caller-supplied VFS glue layer can be driven from it.
    pub fn fire(&self) {
        match self {
            PostCommitNotification::EntryCreated { directory, name, node } => {
                log::debug!(
                    target: "csfs::notifications",
                    "entry_created dir={directory} name={:?} node={node}",
                    String::from_utf8_lossy(name)
                );
            }
            PostCommitNotification::EntryRemoved { directory, name, node } => {
                log::debug!(
                    target: "csfs::notifications",
                    "entry_removed dir={directory} name={:?} node={node}",
                    String::from_utf8_lossy(name)
                );
            }
            PostCommitNotification::EntryMoved {
                old_directory,
                old_name,
                new_directory,
                new_name,
                node,
            } => {
                log::debug!(
                    target: "csfs::notifications",
                    "entry_moved {old_directory}/{:?} -> {new_directory}/{:?} node={node}",
                    String::from_utf8_lossy(old_name),
                    String::from_utf8_lossy(new_name)
                );
            }
            PostCommitNotification::StatChanged { node } => {
                log::debug!(target: "csfs::notifications", "stat_changed node={node}");
            }
            PostCommitNotification::AttributeChanged { node, attribute } => {
                log::debug!(
                    target: "csfs::notifications",
                    "attribute_changed node={node} attribute={:?}",
                    String::from_utf8_lossy(attribute)
                );
            }
        }
    }
}
