//! Delegations: grant at OPEN, recall on conflicting access, return and
//! revocation.
//!
//! The registry does not drive the callback channel. A recall marks the
//! delegation and the file; the conflicting request gets `Delay` and the
//! client is expected to return the delegation before retrying succeeds.

use crate::client::{CallbackState, Client};
use crate::error::{Result, StateError};
use crate::file::{DelegInfo, DelegType, File, SHARE_ACCESS_WRITE};
use crate::fs_store::{FsStateStore, Fsid};
use crate::ids::{classify_stateid_miss, ClientId, StateId, StateId4, StateKind};
use crate::registry::StateRegistry;
use crate::reply::DelegationGrant;
use crate::state::OpenClaim;
use crate::table::{Entry, EntryId, Held, Keyed};
use crate::volume::FileHandle;
use tracing::{debug, info, warn};

/// One delegation held by one client on one file.
#[derive(Debug)]
pub struct DelegState {
    /// Stateid handed to the client
    pub stateid: StateId,
    pub(crate) client: Held<Client>,
    pub(crate) file: Held<File>,
    /// Client holding the delegation
    pub clientid: ClientId,
    /// Entry id of the delegated file
    pub file_id: EntryId,
    /// Filehandle of the delegated file
    pub fh: FileHandle,
    /// Export the file was reached through
    pub export_id: u32,
    /// `None` once returned or revoked
    pub dtype: DelegType,
    /// When the delegation was granted
    pub time_granted: u64,
    /// When a recall was issued, if ever
    pub time_recalled: Option<u64>,
}

impl Keyed for DelegState {
    type Key = (ClientId, EntryId);

    fn key(&self) -> (ClientId, EntryId) {
        (self.clientid, self.file_id)
    }
}

/// DELEGRETURN arguments.
#[derive(Debug, Clone)]
pub struct DelegReturnArgs {
    /// Filesystem of the file
    pub fsid: Fsid,
    /// Current filehandle
    pub fh: FileHandle,
    /// Delegation stateid being returned
    pub stateid: StateId4,
}

impl StateRegistry {
    /// Decides whether an OPEN gets a delegation and records it.
    ///
    /// A reclaim gets the type the client held, flagged for recall when the
    /// callback path is not known to work. An ordinary open gets one only
    /// with a working callback path, no delegation of another client in
    /// the way, and no other open that the delegation would hide.
    pub(crate) fn grant_delegation(
        &self,
        fs: &FsStateStore,
        cp: &Held<Client>,
        fp: &Held<File>,
        own: (u32, u32),
        claim: &OpenClaim,
        want: DelegType,
    ) -> Option<DelegationGrant> {
        let (clientid, cb_state) = {
            let c = cp.lock();
            (c.clientid, c.cb_state)
        };
        let (dtype, recall) = match claim {
            OpenClaim::DelegateCur(_) => return None,
            OpenClaim::Previous(DelegType::None) => return None,
            OpenClaim::Previous(held) => (*held, cb_state != CallbackState::Up),
            OpenClaim::Null => {
                if want == DelegType::None || cb_state != CallbackState::Up {
                    return None;
                }
                if !self.delegation_allowed(fs, fp, clientid, own, want) {
                    return None;
                }
                (want, false)
            }
        };

        let epoch = fs.epoch();
        let node = self.node;
        let now = self.now();
        let (fh, export_id) = {
            let f = fp.lock();
            (f.fh.clone(), f.export_id)
        };
        let found = fs.delegations.find_or_create(
            &(clientid, fp.id()),
            |d| d.dtype != DelegType::None,
            |id| {
                Some(DelegState {
                    stateid: StateId::new(StateKind::Deleg, epoch, id, &node),
                    client: cp.clone(),
                    file: fp.clone(),
                    clientid,
                    file_id: fp.id(),
                    fh,
                    export_id,
                    dtype,
                    time_granted: now,
                    time_recalled: None,
                })
            },
        );
        let (dsp, created) = match found {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "delegation not granted");
                return None;
            }
        };

        let grant = {
            let mut d = dsp.lock();
            if created {
                d.stateid.bump();
            }
            DelegationGrant {
                stateid: d.stateid.encode(),
                write: d.dtype == DelegType::Write,
                recall,
            }
        };
        if created {
            let mut f = fp.lock();
            f.delegations.push(dsp.id());
            match dtype {
                DelegType::Write => f.deleg.write_count += 1,
                DelegType::Read => f.deleg.read_count += 1,
                DelegType::None => {}
            }
            f.deleg.recompute();
            f.deleg.time_granted = Some(now);
            debug!(clientid = %clientid, deleg = dsp.id(), write = grant.write, "delegation granted");
        }
        Some(grant)
    }

    fn delegation_allowed(
        &self,
        fs: &FsStateStore,
        fp: &Held<File>,
        clientid: ClientId,
        own: (u32, u32),
        want: DelegType,
    ) -> bool {
        let (others, ids) = {
            let f = fp.lock();
            let mut others = f.share;
            others.remove(own.0, own.1);
            (others, f.delegations.clone())
        };
        for id in ids {
            let Some(dsp) = fs.delegations.get(id) else {
                continue;
            };
            let d = dsp.lock();
            if d.clientid == clientid || d.dtype == DelegType::None {
                continue;
            }
            if want == DelegType::Write || d.dtype == DelegType::Write {
                return false;
            }
        }
        match want {
            DelegType::Write => others.is_empty(),
            DelegType::Read => others.access_write == 0 && own.0 & SHARE_ACCESS_WRITE == 0,
            DelegType::None => false,
        }
    }

    /// Recalls delegations on `fp` that conflict with `access` by anyone
    /// other than `except`. Returns true when any such delegation is
    /// outstanding; the caller answers `Delay`.
    pub(crate) fn recall_conflicting(
        &self,
        fs: &FsStateStore,
        fp: &Held<File>,
        except: Option<ClientId>,
        access: u32,
    ) -> bool {
        let ids = fp.lock().delegations.clone();
        let now = self.now();
        let mut conflict = false;
        let mut recalled = 0;
        for id in ids {
            let Some(dsp) = fs.delegations.get(id) else {
                continue;
            };
            let mut d = dsp.lock();
            if Some(d.clientid) == except || d.dtype == DelegType::None {
                continue;
            }
            if d.dtype == DelegType::Write || access & SHARE_ACCESS_WRITE != 0 {
                conflict = true;
                if d.time_recalled.is_none() {
                    d.time_recalled = Some(now);
                    recalled += 1;
                }
            }
        }
        if recalled > 0 {
            let mut f = fp.lock();
            f.deleg.time_recalled = Some(now);
            f.deleg.recall_count += recalled;
            info!(file = fp.id(), recalled, "delegations recalled");
        }
        conflict
    }

    /// Recalls every delegation on a file, e.g. ahead of a REMOVE or RENAME.
    /// Returns true when any delegation is outstanding.
    pub fn recall_delegations(&self, fsid: Fsid, fh: &FileHandle) -> Result<bool> {
        let fs = self.admit_filesystem(fsid, false)?;
        Ok(match fs.files.find(fh, |_| true) {
            Some(fp) => self.recall_conflicting(&fs, &fp, None, SHARE_ACCESS_WRITE),
            None => false,
        })
    }

    /// Resolves a delegation stateid, classifying misses.
    pub(crate) fn get_deleg_state(&self, fs: &FsStateStore, presented: &StateId4) -> Result<Held<DelegState>> {
        let decoded = presented.decode();
        let found = if presented.is_special() || decoded.kind() != Some(StateKind::Deleg) {
            None
        } else {
            fs.delegations
                .get(decoded.ident)
                .filter(|dsp| dsp.lock().stateid.same_identity(&decoded))
        };
        found.ok_or_else(|| classify_stateid_miss(presented, StateKind::Deleg, fs.epoch(), &self.node))
    }

    /// DELEGRETURN.
    pub fn delegreturn(&self, args: &DelegReturnArgs) -> Result<()> {
        let fs = self.admit_filesystem(args.fsid, false)?;
        let dsp = self.get_deleg_state(&fs, &args.stateid)?;
        let (cp, fh, current) = {
            let d = dsp.lock();
            (d.client.clone(), d.fh.clone(), d.stateid.seqid)
        };
        if fh != args.fh {
            return Err(StateError::BadStateId);
        }
        if current < args.stateid.seqid {
            return Err(StateError::BadStateId);
        }
        if current > args.stateid.seqid {
            return Err(StateError::OldStateId);
        }
        self.return_delegation(&dsp);
        self.update_lease(&cp);
        debug!(deleg = dsp.id(), "delegation returned");
        Ok(())
    }

    /// Revokes a delegation without the client's cooperation.
    pub fn revoke_delegation(&self, fsid: Fsid, stateid: &StateId4) -> Result<()> {
        let fs = self.admit_filesystem(fsid, false)?;
        let dsp = self.get_deleg_state(&fs, stateid)?;
        self.return_delegation(&dsp);
        info!(deleg = dsp.id(), "delegation revoked");
        Ok(())
    }

    /// Delegation summary of a file.
    pub fn delegation_info(&self, fsid: Fsid, fh: &FileHandle) -> Result<Option<DelegInfo>> {
        let fs = self.admit_filesystem(fsid, false)?;
        Ok(fs.files.find(fh, |_| true).map(|fp| fp.lock().deleg))
    }

    /// Takes a delegation off its file. Idempotent.
    pub(crate) fn return_delegation(&self, entry: &Entry<DelegState>) {
        let (file, dtype) = {
            let mut d = entry.lock();
            let dtype = d.dtype;
            d.dtype = DelegType::None;
            (d.file.clone(), dtype)
        };
        entry.invalidate();
        if dtype == DelegType::None {
            return;
        }
        let id = entry.id();
        let mut f = file.lock();
        f.delegations.retain(|d| *d != id);
        match dtype {
            DelegType::Write => f.deleg.write_count = f.deleg.write_count.saturating_sub(1),
            DelegType::Read => f.deleg.read_count = f.deleg.read_count.saturating_sub(1),
            DelegType::None => {}
        }
        f.deleg.recompute();
        f.deleg.time_returned = Some(self.now());
    }

    /// Invalid, returned, held by a lapsed client, or recalled more than a
    /// lease ago without being returned.
    pub(crate) fn deleg_expiry(&self, entry: &Entry<DelegState>) -> bool {
        if entry.is_invalid() {
            return true;
        }
        let (dtype, recalled, client) = {
            let d = entry.lock();
            (d.dtype, d.time_recalled, d.client.clone())
        };
        if dtype == DelegType::None {
            return true;
        }
        let now = self.now();
        let lease = self.lease_secs();
        if let Some(at) = recalled {
            if now.saturating_sub(at) > lease {
                warn!(deleg = entry.id(), "recalled delegation not returned, revoking");
                return true;
            }
        }
        let lapsed = client.lock().lease.lapsed(now, lease);
        if lapsed {
            entry.invalidate();
        }
        lapsed
    }

    pub(crate) fn deleg_destroy(&self, entry: &Entry<DelegState>) {
        self.return_delegation(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{SHARE_ACCESS_BOTH, SHARE_ACCESS_READ, SHARE_DENY_NONE};
    use crate::registry::TableKind;
    use crate::test_support::{fh, Harness, FSID, LEASE};

    fn read_delegated(h: &Harness, clientid: ClientId, f: &FileHandle) -> DelegationGrant {
        let mut args = h.open_args(clientid, "deleg-owner", 0, f, SHARE_ACCESS_READ, SHARE_DENY_NONE);
        args.delegation = DelegType::Read;
        h.open(&args).unwrap().delegation.unwrap()
    }

    fn return_args(f: &FileHandle, stateid: StateId4) -> DelegReturnArgs {
        DelegReturnArgs {
            fsid: FSID,
            fh: f.clone(),
            stateid,
        }
    }

    #[test]
    fn test_read_delegation_granted_and_returned() {
        let h = Harness::new();
        let a = h.client("a");
        let f = fh("f");
        let grant = read_delegated(&h, a, &f);
        assert!(!grant.write);
        assert!(!grant.recall);

        let info = h.registry.delegation_info(FSID, &f).unwrap().unwrap();
        assert_eq!(info.dtype, DelegType::Read);
        assert_eq!(info.read_count, 1);

        h.registry.delegreturn(&return_args(&f, grant.stateid)).unwrap();
        let info = h.registry.delegation_info(FSID, &f).unwrap().unwrap();
        assert_eq!(info.dtype, DelegType::None);
        assert!(info.time_returned.is_some());

        let err = h.registry.delegreturn(&return_args(&f, grant.stateid)).unwrap_err();
        assert!(matches!(err, StateError::BadStateId));
    }

    #[test]
    fn test_conflicting_open_recalls_and_delays() {
        let h = Harness::new();
        let a = h.client("a");
        let b = h.client("b");
        let f = fh("f");
        let grant = read_delegated(&h, a, &f);

        let args = h.open_args(b, "writer", 0, &f, SHARE_ACCESS_BOTH, SHARE_DENY_NONE);
        assert!(matches!(h.open(&args), Err(StateError::Delay)));
        let info = h.registry.delegation_info(FSID, &f).unwrap().unwrap();
        assert_eq!(info.recall_count, 1);
        assert!(info.time_recalled.is_some());

        h.registry.delegreturn(&return_args(&f, grant.stateid)).unwrap();
        let reply = h.open(&args).unwrap();
        assert!(reply.delegation.is_none());
    }

    #[test]
    fn test_write_delegation_refused_with_other_opens() {
        let h = Harness::new();
        let a = h.client("a");
        let b = h.client("b");
        let f = fh("f");
        h.open_confirmed(a, "reader", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);

        let mut args = h.open_args(b, "writer", 0, &f, SHARE_ACCESS_BOTH, SHARE_DENY_NONE);
        args.delegation = DelegType::Write;
        assert!(h.open(&args).unwrap().delegation.is_none());
    }

    #[test]
    fn test_write_delegation_for_sole_opener() {
        let h = Harness::new();
        let a = h.client("a");
        let f = fh("f");
        let mut args = h.open_args(a, "writer", 0, &f, SHARE_ACCESS_BOTH, SHARE_DENY_NONE);
        args.delegation = DelegType::Write;
        let grant = h.open(&args).unwrap().delegation.unwrap();
        assert!(grant.write);
        let info = h.registry.delegation_info(FSID, &f).unwrap().unwrap();
        assert_eq!(info.dtype, DelegType::Write);
        assert_eq!(info.write_count, 1);
    }

    #[test]
    fn test_no_delegation_with_callback_down() {
        let h = Harness::new();
        let a = h.client("a");
        h.registry.mark_callback_down(a).unwrap();
        let f = fh("f");
        let mut args = h.open_args(a, "o", 0, &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);
        args.delegation = DelegType::Read;
        assert!(h.open(&args).unwrap().delegation.is_none());
    }

    #[test]
    fn test_delegreturn_checks_handle_and_sequence() {
        let h = Harness::new();
        let a = h.client("a");
        let f = fh("f");
        let grant = read_delegated(&h, a, &f);

        let err = h.registry.delegreturn(&return_args(&fh("other"), grant.stateid)).unwrap_err();
        assert!(matches!(err, StateError::BadStateId));

        let ahead = StateId4 {
            seqid: grant.stateid.seqid + 1,
            ..grant.stateid
        };
        let err = h.registry.delegreturn(&return_args(&f, ahead)).unwrap_err();
        assert!(matches!(err, StateError::BadStateId));

        let behind = StateId4 {
            seqid: grant.stateid.seqid - 1,
            ..grant.stateid
        };
        let err = h.registry.delegreturn(&return_args(&f, behind)).unwrap_err();
        assert!(matches!(err, StateError::OldStateId));
    }

    #[test]
    fn test_revoke_takes_delegation_back() {
        let h = Harness::new();
        let a = h.client("a");
        let f = fh("f");
        let grant = read_delegated(&h, a, &f);
        h.registry.revoke_delegation(FSID, &grant.stateid).unwrap();
        let info = h.registry.delegation_info(FSID, &f).unwrap().unwrap();
        assert_eq!(info.dtype, DelegType::None);
        assert_eq!(info.read_count, 0);
    }

    #[test]
    fn test_unreturned_recall_is_revoked_by_reaper() {
        let h = Harness::new();
        let a = h.client("a");
        let f = fh("f");
        read_delegated(&h, a, &f);
        assert!(h.registry.recall_delegations(FSID, &f).unwrap());

        assert_eq!(h.registry.reap_table(TableKind::Delegation), 0);
        h.clock.advance(LEASE + 1);
        assert_eq!(h.registry.reap_table(TableKind::Delegation), 1);
        let info = h.registry.delegation_info(FSID, &f).unwrap().unwrap();
        assert_eq!(info.dtype, DelegType::None);
    }
}
