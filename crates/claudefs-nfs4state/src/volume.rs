//! Storage/volume layer seen by the state registry.
//!
//! The volume enforces share reservations and byte-range locks locally; the
//! registry only tells it when reservations and locks must be released.

use crate::error::{Result, StateError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Opaque storage handle of a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileHandle(pub Vec<u8>);

impl FileHandle {
    /// Wraps raw handle bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        FileHandle(bytes.into())
    }

    /// Raw handle bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Local lock-owner surrogate: a pid plus the client's lock-manager sysid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwnerKey {
    /// Lock-owner pid
    pub pid: u32,
    /// Client sysid
    pub sysid: u32,
}

/// Byte range of a lock request, passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRange {
    /// First byte
    pub offset: u64,
    /// Zero or all-ones means to end of file
    pub length: u64,
    /// Exclusive lock
    pub write: bool,
}

impl LockRange {
    fn end(&self) -> u64 {
        if self.length == 0 || self.length == u64::MAX {
            u64::MAX
        } else {
            self.offset.saturating_add(self.length)
        }
    }

    fn overlaps(&self, other: &LockRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Operations the registry needs from the storage layer.
pub trait Volume: Send + Sync {
    /// Records a share reservation for `owner`.
    fn share(&self, fh: &FileHandle, owner: LockOwnerKey, access: u32, deny: u32) -> Result<()>;

    /// Drops the share reservation of `owner`.
    fn unshare(&self, fh: &FileHandle, owner: LockOwnerKey) -> Result<()>;

    /// Acquires a byte-range lock.
    fn lock_range(&self, fh: &FileHandle, owner: LockOwnerKey, range: LockRange) -> Result<()>;

    /// First lock held by another owner that conflicts with `range`.
    fn conflicting_lock(
        &self,
        fh: &FileHandle,
        owner: LockOwnerKey,
        range: LockRange,
    ) -> Option<(LockOwnerKey, LockRange)>;

    /// Releases a byte-range lock.
    fn unlock_range(&self, fh: &FileHandle, owner: LockOwnerKey, range: LockRange) -> Result<()>;

    /// Releases every lock `pid`/`sysid` holds on one file.
    fn clean_locks(&self, fh: &FileHandle, owner: LockOwnerKey);

    /// Releases every lock held under `sysid` on any file.
    fn release_sysid(&self, sysid: u32);

    /// Drops the registry's interest in a file.
    fn release_object(&self, fh: &FileHandle);
}

fn conflicts(held_by: LockOwnerKey, held: &LockRange, owner: LockOwnerKey, range: &LockRange) -> bool {
    held_by != owner && held.overlaps(range) && (held.write || range.write)
}

/// Volume kept in memory, with call counters.
#[derive(Debug, Default)]
pub struct MemoryVolume {
    shares: Mutex<HashMap<(FileHandle, LockOwnerKey), (u32, u32)>>,
    locks: Mutex<HashMap<FileHandle, Vec<(LockOwnerKey, LockRange)>>>,
    clean_calls: AtomicUsize,
    sysid_calls: AtomicUsize,
    unshare_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl MemoryVolume {
    /// Empty volume.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `clean_locks` calls.
    pub fn clean_calls(&self) -> usize {
        self.clean_calls.load(Ordering::SeqCst)
    }

    /// Number of `release_sysid` calls.
    pub fn sysid_calls(&self) -> usize {
        self.sysid_calls.load(Ordering::SeqCst)
    }

    /// Number of `unshare` calls.
    pub fn unshare_calls(&self) -> usize {
        self.unshare_calls.load(Ordering::SeqCst)
    }

    /// Number of `release_object` calls.
    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Locks currently held on `fh`.
    pub fn locks_on(&self, fh: &FileHandle) -> usize {
        self.locks.lock().get(fh).map(Vec::len).unwrap_or(0)
    }

    /// Share reservation of `owner` on `fh`.
    pub fn share_of(&self, fh: &FileHandle, owner: LockOwnerKey) -> Option<(u32, u32)> {
        self.shares.lock().get(&(fh.clone(), owner)).copied()
    }
}

impl Volume for MemoryVolume {
    fn share(&self, fh: &FileHandle, owner: LockOwnerKey, access: u32, deny: u32) -> Result<()> {
        self.shares.lock().insert((fh.clone(), owner), (access, deny));
        Ok(())
    }

    fn unshare(&self, fh: &FileHandle, owner: LockOwnerKey) -> Result<()> {
        self.unshare_calls.fetch_add(1, Ordering::SeqCst);
        self.shares.lock().remove(&(fh.clone(), owner));
        Ok(())
    }

    fn lock_range(&self, fh: &FileHandle, owner: LockOwnerKey, range: LockRange) -> Result<()> {
        let mut locks = self.locks.lock();
        let held = locks.entry(fh.clone()).or_default();
        if held.iter().any(|(o, r)| conflicts(*o, r, owner, &range)) {
            return Err(StateError::Denied);
        }
        held.push((owner, range));
        Ok(())
    }

    fn conflicting_lock(
        &self,
        fh: &FileHandle,
        owner: LockOwnerKey,
        range: LockRange,
    ) -> Option<(LockOwnerKey, LockRange)> {
        self.locks
            .lock()
            .get(fh)?
            .iter()
            .find(|(o, r)| conflicts(*o, r, owner, &range))
            .copied()
    }

    fn unlock_range(&self, fh: &FileHandle, owner: LockOwnerKey, range: LockRange) -> Result<()> {
        let mut locks = self.locks.lock();
        if let Some(held) = locks.get_mut(fh) {
            held.retain(|(o, r)| !(*o == owner && r.offset == range.offset && r.length == range.length));
        }
        Ok(())
    }

    fn clean_locks(&self, fh: &FileHandle, owner: LockOwnerKey) {
        self.clean_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(held) = self.locks.lock().get_mut(fh) {
            held.retain(|(o, _)| *o != owner);
        }
    }

    fn release_sysid(&self, sysid: u32) {
        self.sysid_calls.fetch_add(1, Ordering::SeqCst);
        for held in self.locks.lock().values_mut() {
            held.retain(|(o, _)| o.sysid != sysid);
        }
        self.shares.lock().retain(|(_, o), _| o.sysid != sysid);
    }

    fn release_object(&self, fh: &FileHandle) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.locks.lock().remove(fh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(pid: u32) -> LockOwnerKey {
        LockOwnerKey { pid, sysid: 1 }
    }

    fn range(offset: u64, length: u64, write: bool) -> LockRange {
        LockRange {
            offset,
            length,
            write,
        }
    }

    #[test]
    fn test_conflicting_write_lock_denied() {
        let vol = MemoryVolume::new();
        let fh = FileHandle::new(b"f".to_vec());
        vol.lock_range(&fh, owner(1), range(0, 10, true)).unwrap();
        let err = vol.lock_range(&fh, owner(2), range(5, 10, false)).unwrap_err();
        assert!(matches!(err, StateError::Denied));
        vol.lock_range(&fh, owner(2), range(10, 10, false)).unwrap();
        let (holder, held) = vol.conflicting_lock(&fh, owner(2), range(0, 1, false)).unwrap();
        assert_eq!(holder, owner(1));
        assert_eq!(held.length, 10);
    }

    #[test]
    fn test_read_locks_share() {
        let vol = MemoryVolume::new();
        let fh = FileHandle::new(b"f".to_vec());
        vol.lock_range(&fh, owner(1), range(0, 0, false)).unwrap();
        vol.lock_range(&fh, owner(2), range(0, 0, false)).unwrap();
        assert_eq!(vol.locks_on(&fh), 2);
    }

    #[test]
    fn test_clean_locks_releases_owner_only() {
        let vol = MemoryVolume::new();
        let fh = FileHandle::new(b"f".to_vec());
        vol.lock_range(&fh, owner(1), range(0, 1, false)).unwrap();
        vol.lock_range(&fh, owner(2), range(0, 1, false)).unwrap();
        vol.clean_locks(&fh, owner(1));
        assert_eq!(vol.locks_on(&fh), 1);
        assert_eq!(vol.clean_calls(), 1);
    }

    #[test]
    fn test_release_sysid_drops_everything_for_client() {
        let vol = MemoryVolume::new();
        let fh = FileHandle::new(b"f".to_vec());
        vol.share(&fh, owner(1), 1, 0).unwrap();
        vol.lock_range(&fh, owner(1), range(0, 1, true)).unwrap();
        vol.release_sysid(1);
        assert_eq!(vol.locks_on(&fh), 0);
        assert!(vol.share_of(&fh, owner(1)).is_none());
    }
}
