//! Stateid checks for READ, WRITE and SETATTR.

use crate::error::{Result, StateError};
use crate::file::{DelegType, SHARE_ACCESS_READ, SHARE_ACCESS_WRITE, SHARE_DENY_BOTH, SHARE_DENY_READ};
use crate::fs_store::{FsStateStore, Fsid};
use crate::ids::{StateId4, StateKind};
use crate::registry::StateRegistry;
use crate::state::OpenState;
use crate::table::Held;
use crate::volume::{FileHandle, LockOwnerKey};

/// Direction of an I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// READ and friends
    Read,
    /// WRITE and SETATTR of size
    Write,
}

/// What an accepted stateid tells the I/O path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoGrant {
    /// Lock-owner to present to the lock manager, for lock stateids
    pub lock_owner: Option<LockOwnerKey>,
    /// The file is under a write delegation
    pub write_delegated: bool,
}

impl StateRegistry {
    /// Validates `stateid` for I/O of `mode` on `fh`.
    ///
    /// Special stateids bypass state but not delegations: a write, or any
    /// I/O against a write delegation, recalls the delegations and answers
    /// `Delay`. A lock stateid is checked and then stands in for its open.
    pub fn check_stateid(&self, fsid: Fsid, fh: &FileHandle, stateid: &StateId4, mode: IoMode) -> Result<IoGrant> {
        let fs = self.admit_filesystem(fsid, false)?;
        if stateid.is_special() {
            return self.check_special(&fs, fh, mode);
        }

        let decoded = stateid.decode();
        match decoded.kind() {
            Some(StateKind::Lock) => {
                let lsp = self.get_lock_state(&fs, stateid)?;
                let (current, sp, cp, lfh, owner) = {
                    let l = lsp.lock();
                    (l.stateid.seqid, l.state.clone(), l.client.clone(), l.fh.clone(), l.lock_owner)
                };
                if self.client_in_grace(&cp, &fs) {
                    return Err(StateError::Grace);
                }
                if current < stateid.seqid {
                    return Err(StateError::BadStateId);
                }
                if current > stateid.seqid {
                    return Err(StateError::OldStateId);
                }
                if lfh != *fh {
                    return Err(StateError::BadStateId);
                }
                let mut grant = self.check_open_access(&sp, fh, mode)?;
                grant.lock_owner = Some(owner);
                Ok(grant)
            }
            Some(StateKind::Open) => {
                let sp = self.get_open_state(&fs, stateid)?;
                let (current, cp) = {
                    let s = sp.lock();
                    (s.stateid.seqid, s.client.clone())
                };
                if self.client_in_grace(&cp, &fs) {
                    return Err(StateError::Grace);
                }
                if current < stateid.seqid {
                    return Err(StateError::BadStateId);
                }
                if current > stateid.seqid {
                    return Err(StateError::OldStateId);
                }
                self.check_open_access(&sp, fh, mode)
            }
            Some(StateKind::Deleg) => {
                let dsp = self.get_deleg_state(&fs, stateid)?;
                let (current, cp, dfh, dtype) = {
                    let d = dsp.lock();
                    (d.stateid.seqid, d.client.clone(), d.fh.clone(), d.dtype)
                };
                if self.client_in_grace(&cp, &fs) {
                    return Err(StateError::Grace);
                }
                if current != stateid.seqid || dfh != *fh {
                    return Err(StateError::BadStateId);
                }
                self.update_lease(&cp);
                Ok(IoGrant {
                    lock_owner: None,
                    write_delegated: dtype == DelegType::Write,
                })
            }
            None => Err(StateError::BadStateId),
        }
    }

    fn check_special(&self, fs: &FsStateStore, fh: &FileHandle, mode: IoMode) -> Result<IoGrant> {
        let Some(fp) = fs.files.find(fh, |_| true) else {
            return Ok(IoGrant::default());
        };
        let dtype = fp.lock().deleg.dtype;
        if dtype == DelegType::None {
            return Ok(IoGrant::default());
        }
        if mode == IoMode::Write || dtype == DelegType::Write {
            self.recall_conflicting(fs, &fp, None, SHARE_ACCESS_WRITE);
            return Err(StateError::Delay);
        }
        Ok(IoGrant::default())
    }

    /// Checks the open behind an I/O stateid and renews its lease.
    fn check_open_access(&self, sp: &Held<OpenState>, fh: &FileHandle, mode: IoMode) -> Result<IoGrant> {
        let (sfh, closed, oo, cp, file) = {
            let s = sp.lock();
            (s.fh.clone(), s.closed, s.owner.clone(), s.client.clone(), s.file.clone())
        };
        if sfh != *fh {
            return Err(StateError::BadStateId);
        }
        if oo.lock().need_confirm {
            return Err(StateError::Unconfirmed);
        }
        if closed {
            return Err(StateError::Closed);
        }
        self.state_has_access(sp, mode)?;

        let write_delegated = {
            let mut f = file.lock();
            let delegated = f.deleg.dtype == DelegType::Write;
            if delegated && mode == IoMode::Write {
                f.deleg.time_lastwrite = Some(self.now());
            }
            delegated
        };
        self.update_lease(&cp);
        Ok(IoGrant {
            lock_owner: None,
            write_delegated,
        })
    }

    /// Whether the open's share reservation permits `mode`.
    ///
    /// A read through an open without read access is still allowed unless
    /// some other open denies reads.
    pub(crate) fn state_has_access(&self, sp: &Held<OpenState>, mode: IoMode) -> Result<()> {
        let s = sp.lock();
        match mode {
            IoMode::Write if s.share_access & SHARE_ACCESS_WRITE == 0 => Err(StateError::OpenMode),
            IoMode::Write => Ok(()),
            IoMode::Read if s.share_access & SHARE_ACCESS_READ != 0 => Ok(()),
            IoMode::Read if s.share_deny == SHARE_DENY_BOTH => Ok(()),
            IoMode::Read => {
                let own = u32::from(s.share_deny & SHARE_DENY_READ != 0);
                if s.file.lock().share.deny_read > own {
                    Err(StateError::OpenMode)
                } else {
                    Ok(())
                }
            }
        }
    }
}
