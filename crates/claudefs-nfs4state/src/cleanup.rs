//! Bulk teardown: unexport, file removal and filesystem migration.

use crate::error::Result;
use crate::file::DelegType;
use crate::fs_store::{FsPhase, FsStateStore, Fsid};
use crate::registry::StateRegistry;
use crate::volume::FileHandle;
use std::collections::HashSet;
use tracing::info;

/// Entries torn down by [`StateRegistry::clean_state`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Lock-states invalidated
    pub lock_states: usize,
    /// Open-states closed, including those reached through their locks
    pub open_states: usize,
    /// Delegations returned
    pub delegations: usize,
    /// Files dropped
    pub files: usize,
}

impl StateRegistry {
    /// Closes and invalidates all state of one export, or of the whole
    /// filesystem when `export_id` is `None`.
    pub fn clean_state(&self, fsid: Fsid, export_id: Option<u32>) -> Result<CleanupStats> {
        let fs = self.filesystem(fsid)?;
        let stats = self.clean_store(&fs, export_id);
        info!(
            fsid = %fsid,
            export = ?export_id,
            lock_states = stats.lock_states,
            open_states = stats.open_states,
            delegations = stats.delegations,
            files = stats.files,
            "state cleaned"
        );
        Ok(stats)
    }

    fn clean_store(&self, fs: &FsStateStore, export_id: Option<u32>) -> CleanupStats {
        let matches = |e: u32| export_id.map_or(true, |x| x == e);
        let mut stats = CleanupStats::default();

        fs.lock_states.walk(|lsp| {
            let sp = lsp.lock().state.clone();
            if lsp.is_invalid() || !matches(sp.lock().export_id) {
                return;
            }
            self.state_close(fs, &sp, false);
            if !sp.is_invalid() {
                sp.invalidate();
                stats.open_states += 1;
            }
            lsp.invalidate();
            stats.lock_states += 1;
        });
        fs.states.walk(|sp| {
            if sp.is_invalid() || !matches(sp.lock().export_id) {
                return;
            }
            self.state_close(fs, sp, false);
            sp.invalidate();
            stats.open_states += 1;
        });
        fs.delegations.walk(|dsp| {
            if dsp.is_invalid() || !matches(dsp.lock().export_id) {
                return;
            }
            self.return_delegation(dsp);
            stats.delegations += 1;
        });
        fs.files.walk(|fp| {
            if fp.is_invalid() || !matches(fp.lock().export_id) {
                return;
            }
            fp.invalidate();
            stats.files += 1;
        });
        stats
    }

    /// Closes every open of a file that is being removed and takes back
    /// its delegations. Returns the number of opens closed.
    pub fn close_all_state(&self, fsid: Fsid, fh: &FileHandle) -> Result<usize> {
        let fs = self.admit_filesystem(fsid, false)?;
        let Some(fp) = fs.files.find(fh, |_| true) else {
            return Ok(0);
        };
        fp.invalidate();
        let (teardown, delegations) = {
            let f = fp.lock();
            (f.teardown.clone(), f.delegations.clone())
        };
        let _teardown = teardown.write();

        for id in delegations {
            if let Some(dsp) = fs.delegations.get_any(id) {
                if dsp.lock().dtype != DelegType::None {
                    self.return_delegation(&dsp);
                }
            }
        }

        let file_id = fp.id();
        let mut closed = 0;
        fs.states.walk(|sp| {
            if sp.lock().file_id == file_id && self.state_close(&fs, sp, false) {
                closed += 1;
            }
        });
        info!(fsid = %fsid, file = file_id, closed, "closed all state on file");
        Ok(closed)
    }

    /// Stops new state on a filesystem ahead of migration.
    pub fn freeze_filesystem(&self, fsid: Fsid) -> Result<()> {
        let fs = self.filesystem(fsid)?;
        fs.set_phase(FsPhase::Frozen);
        info!(fsid = %fsid, "filesystem frozen");
        Ok(())
    }

    /// Resumes a frozen filesystem.
    pub fn thaw_filesystem(&self, fsid: Fsid) -> Result<()> {
        let fs = self.filesystem(fsid)?;
        fs.set_phase(FsPhase::Active);
        info!(fsid = %fsid, "filesystem thawed");
        Ok(())
    }

    /// Marks a filesystem as moved away: every client with state on it
    /// gets a lease-moved marker, and the state is torn down. Returns the
    /// number of clients marked.
    pub fn filesystem_moved(&self, fsid: Fsid) -> Result<usize> {
        let fs = self.filesystem(fsid)?;
        fs.set_phase(FsPhase::Moved);

        let mut seen = HashSet::new();
        let mut clients = Vec::new();
        fs.states.walk(|sp| {
            let s = sp.lock();
            if !s.closed && seen.insert(s.clientid) {
                clients.push(s.client.clone());
            }
        });
        let now = self.now();
        for cp in &clients {
            cp.lock().lease_moved_at = Some(now);
        }

        self.clean_store(&fs, None);
        info!(fsid = %fsid, clients = clients.len(), "filesystem moved");
        Ok(clients.len())
    }
}
