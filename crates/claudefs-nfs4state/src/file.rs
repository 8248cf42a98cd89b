//! Per-file state: aggregate share reservations and delegation info.

use crate::fs_store::FsStateStore;
use crate::registry::StateRegistry;
use crate::table::{Entry, EntryId, Keyed};
use crate::volume::FileHandle;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// OPEN4_SHARE_ACCESS_READ
pub const SHARE_ACCESS_READ: u32 = 0x1;
/// OPEN4_SHARE_ACCESS_WRITE
pub const SHARE_ACCESS_WRITE: u32 = 0x2;
/// OPEN4_SHARE_ACCESS_BOTH
pub const SHARE_ACCESS_BOTH: u32 = 0x3;
/// OPEN4_SHARE_DENY_NONE
pub const SHARE_DENY_NONE: u32 = 0x0;
/// OPEN4_SHARE_DENY_READ
pub const SHARE_DENY_READ: u32 = 0x1;
/// OPEN4_SHARE_DENY_WRITE
pub const SHARE_DENY_WRITE: u32 = 0x2;
/// OPEN4_SHARE_DENY_BOTH
pub const SHARE_DENY_BOTH: u32 = 0x3;

/// Delegation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DelegType {
    /// No delegation
    #[default]
    None,
    /// Read delegation
    Read,
    /// Write delegation
    Write,
}

/// Counts of opens holding each share bit on one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareCounts {
    /// Opens holding read access
    pub access_read: u32,
    /// Opens holding write access
    pub access_write: u32,
    /// Opens denying read
    pub deny_read: u32,
    /// Opens denying write
    pub deny_write: u32,
}

impl ShareCounts {
    /// Union of access bits across all opens.
    pub fn access(&self) -> u32 {
        let mut bits = 0;
        if self.access_read > 0 {
            bits |= SHARE_ACCESS_READ;
        }
        if self.access_write > 0 {
            bits |= SHARE_ACCESS_WRITE;
        }
        bits
    }

    /// Union of deny bits across all opens.
    pub fn deny(&self) -> u32 {
        let mut bits = 0;
        if self.deny_read > 0 {
            bits |= SHARE_DENY_READ;
        }
        if self.deny_write > 0 {
            bits |= SHARE_DENY_WRITE;
        }
        bits
    }

    /// True when an open with `access`/`deny` conflicts with the current
    /// reservations.
    pub fn conflicts(&self, access: u32, deny: u32) -> bool {
        (access & self.deny()) != 0 || (deny & self.access()) != 0
    }

    /// Conflict check for changing one open from `old` bits to `new` bits;
    /// the open's own reservation does not count against it.
    pub fn conflicts_on_change(&self, old: (u32, u32), new: (u32, u32)) -> bool {
        let mut others = *self;
        others.remove(old.0, old.1);
        others.conflicts(new.0, new.1)
    }

    /// Counts one open holding `access`/`deny`.
    pub fn add(&mut self, access: u32, deny: u32) {
        if access & SHARE_ACCESS_READ != 0 {
            self.access_read += 1;
        }
        if access & SHARE_ACCESS_WRITE != 0 {
            self.access_write += 1;
        }
        if deny & SHARE_DENY_READ != 0 {
            self.deny_read += 1;
        }
        if deny & SHARE_DENY_WRITE != 0 {
            self.deny_write += 1;
        }
    }

    /// Drops one open holding `access`/`deny`.
    pub fn remove(&mut self, access: u32, deny: u32) {
        if access & SHARE_ACCESS_READ != 0 {
            self.access_read = self.access_read.saturating_sub(1);
        }
        if access & SHARE_ACCESS_WRITE != 0 {
            self.access_write = self.access_write.saturating_sub(1);
        }
        if deny & SHARE_DENY_READ != 0 {
            self.deny_read = self.deny_read.saturating_sub(1);
        }
        if deny & SHARE_DENY_WRITE != 0 {
            self.deny_write = self.deny_write.saturating_sub(1);
        }
    }

    /// True when no open holds any bit.
    pub fn is_empty(&self) -> bool {
        *self == ShareCounts::default()
    }
}

/// Delegation descriptor kept on the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegInfo {
    /// Strongest delegation outstanding
    pub dtype: DelegType,
    /// Outstanding read delegations
    pub read_count: u32,
    /// Outstanding write delegations
    pub write_count: u32,
    /// Last grant
    pub time_granted: Option<u64>,
    /// Last recall
    pub time_recalled: Option<u64>,
    /// Last return
    pub time_returned: Option<u64>,
    /// Last WRITE under a write delegation
    pub time_lastwrite: Option<u64>,
    /// Recalls issued over the file's lifetime
    pub recall_count: u32,
}

impl DelegInfo {
    /// Recomputes the type from the counts.
    pub fn recompute(&mut self) {
        self.dtype = if self.write_count > 0 {
            DelegType::Write
        } else if self.read_count > 0 {
            DelegType::Read
        } else {
            DelegType::None
        };
    }
}

/// One backing storage object.
#[derive(Debug)]
pub struct File {
    /// Storage handle
    pub fh: FileHandle,
    /// Export the file was first opened through
    pub export_id: u32,
    /// Share reservations held by opens
    pub share: ShareCounts,
    /// Delegations outstanding
    pub deleg: DelegInfo,
    /// Delegation-state entries on this file
    pub(crate) delegations: Vec<EntryId>,
    /// Writers tear down every state on the file; readers are ordinary
    /// per-state operations.
    pub(crate) teardown: Arc<RwLock<()>>,
}

impl File {
    /// Fresh file with no opens or delegations.
    pub fn new(fh: FileHandle, export_id: u32) -> Self {
        Self {
            fh,
            export_id,
            share: ShareCounts::default(),
            deleg: DelegInfo::default(),
            delegations: Vec::new(),
            teardown: Arc::new(RwLock::new(())),
        }
    }

    /// True while any delegation-state references the file.
    pub fn has_delegations(&self) -> bool {
        !self.delegations.is_empty()
    }
}

impl Keyed for File {
    type Key = FileHandle;

    fn key(&self) -> FileHandle {
        self.fh.clone()
    }
}

impl StateRegistry {
    /// Idle files without opens or delegations go after a lease.
    pub(crate) fn file_expiry(&self, entry: &Entry<File>) -> bool {
        if entry.is_invalid() {
            return true;
        }
        let busy = {
            let f = entry.lock();
            f.has_delegations() || !f.share.is_empty()
        };
        !busy && self.now().saturating_sub(entry.time_rele()) > self.lease_secs()
    }

    pub(crate) fn file_destroy(&self, fs: &FsStateStore, entry: &Entry<File>) {
        let fh = entry.lock().fh.clone();
        fs.volume().release_object(&fh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_write_blocks_writer() {
        let mut counts = ShareCounts::default();
        counts.add(SHARE_ACCESS_READ, SHARE_DENY_WRITE);
        assert!(counts.conflicts(SHARE_ACCESS_WRITE, SHARE_DENY_NONE));
        assert!(!counts.conflicts(SHARE_ACCESS_READ, SHARE_DENY_NONE));
    }

    #[test]
    fn test_deny_conflicts_with_existing_access() {
        let mut counts = ShareCounts::default();
        counts.add(SHARE_ACCESS_BOTH, SHARE_DENY_NONE);
        assert!(counts.conflicts(SHARE_ACCESS_READ, SHARE_DENY_WRITE));
        assert!(counts.conflicts(SHARE_ACCESS_READ, SHARE_DENY_BOTH));
    }

    #[test]
    fn test_own_reservation_ignored_on_upgrade() {
        let mut counts = ShareCounts::default();
        counts.add(SHARE_ACCESS_READ, SHARE_DENY_WRITE);
        assert!(counts.conflicts(SHARE_ACCESS_WRITE, SHARE_DENY_WRITE));
        assert!(!counts.conflicts_on_change(
            (SHARE_ACCESS_READ, SHARE_DENY_WRITE),
            (SHARE_ACCESS_BOTH, SHARE_DENY_WRITE)
        ));
    }

    #[test]
    fn test_remove_restores_empty() {
        let mut counts = ShareCounts::default();
        counts.add(SHARE_ACCESS_BOTH, SHARE_DENY_BOTH);
        counts.remove(SHARE_ACCESS_BOTH, SHARE_DENY_BOTH);
        assert!(counts.is_empty());
        counts.remove(SHARE_ACCESS_READ, SHARE_DENY_NONE);
        assert!(counts.is_empty());
    }

    #[test]
    fn test_deleg_info_recompute() {
        let mut info = DelegInfo::default();
        info.read_count = 2;
        info.recompute();
        assert_eq!(info.dtype, DelegType::Read);
        info.read_count = 0;
        info.write_count = 1;
        info.recompute();
        assert_eq!(info.dtype, DelegType::Write);
        info.write_count = 0;
        info.recompute();
        assert_eq!(info.dtype, DelegType::None);
    }
}
