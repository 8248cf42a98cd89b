//! Open and lock state.
//!
//! An open-state is one (open-owner, file) pair and carries the share
//! reservation. A lock-state is one (lock-owner, open-state) pair. Both are
//! named on the wire by stateids whose sequence advances with every change.
//!
//! Sequence-mutating operations run inside the owner's sequence window so
//! a retransmission sees either the old state or the cached reply, never a
//! half-applied change.

use crate::client::Client;
use crate::error::{Result, StateError};
use crate::file::{DelegType, File, SHARE_ACCESS_BOTH, SHARE_ACCESS_READ, SHARE_ACCESS_WRITE, SHARE_DENY_BOTH};
use crate::fs_store::{FsStateStore, Fsid};
use crate::ids::{classify_stateid_miss, ClientId, StateId, StateId4, StateKind};
use crate::owner::{advances_seqid, LockOwner, OpenOwner, StateRef};
use crate::registry::StateRegistry;
use crate::reply::{check_seqid, CachedReply, LockDenied, OpenReply, OwnerOp, SeqidCheck};
use crate::table::{Entry, EntryId, Held, Keyed};
use crate::volume::{FileHandle, LockOwnerKey, LockRange};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// OPEN4_RESULT_CONFIRM
pub const OPEN4_RESULT_CONFIRM: u32 = 0x2;
/// OPEN4_RESULT_LOCKTYPE_POSIX
pub const OPEN4_RESULT_LOCKTYPE_POSIX: u32 = 0x4;

/// Times OPEN retries after discarding an unconfirmed owner.
const OPEN_RETRIES: usize = 3;

/// How an OPEN names the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenClaim {
    /// Ordinary open
    Null,
    /// Reclaim after restart, with the delegation the client held
    Previous(DelegType),
    /// Open under a delegation the client currently holds
    DelegateCur(StateId4),
}

/// OPEN arguments, with the filehandle already resolved.
#[derive(Debug, Clone)]
pub struct OpenArgs {
    /// Client issuing the OPEN
    pub clientid: ClientId,
    /// Open-owner token
    pub owner: Vec<u8>,
    /// Open-owner sequence
    pub seqid: u32,
    /// Filesystem of the file
    pub fsid: Fsid,
    /// File being opened
    pub fh: FileHandle,
    /// Export the file was reached through
    pub export_id: u32,
    /// OPEN4_SHARE_ACCESS_* bits
    pub share_access: u32,
    /// OPEN4_SHARE_DENY_* bits
    pub share_deny: u32,
    /// What the open claims
    pub claim: OpenClaim,
    /// Delegation the client would like
    pub delegation: DelegType,
}

/// OPEN_CONFIRM and CLOSE arguments.
#[derive(Debug, Clone)]
pub struct StateOpArgs {
    /// Filesystem of the file
    pub fsid: Fsid,
    /// Current filehandle
    pub fh: FileHandle,
    /// Open stateid
    pub stateid: StateId4,
    /// Open-owner sequence
    pub seqid: u32,
}

/// OPEN_DOWNGRADE arguments.
#[derive(Debug, Clone)]
pub struct DowngradeArgs {
    /// Filesystem of the file
    pub fsid: Fsid,
    /// Current filehandle
    pub fh: FileHandle,
    /// Open stateid
    pub stateid: StateId4,
    /// Open-owner sequence
    pub seqid: u32,
    /// Access bits to keep
    pub share_access: u32,
    /// Deny bits to keep
    pub share_deny: u32,
}

/// Who is asking for a lock.
#[derive(Debug, Clone)]
pub enum Locker {
    /// First lock of a lock-owner under an open
    NewOwner {
        /// Open the lock is taken under
        open_stateid: StateId4,
        /// Open-owner sequence
        open_seqid: u32,
        /// Lock-owner token from the client
        lock_owner: Vec<u8>,
        /// First lock-owner sequence
        lock_seqid: u32,
    },
    /// Lock-owner that already holds a lock stateid
    Existing {
        /// Lock stateid of the owner
        lock_stateid: StateId4,
        /// Lock sequence
        lock_seqid: u32,
    },
}

/// LOCK arguments.
#[derive(Debug, Clone)]
pub struct LockArgs {
    /// Filesystem of the file
    pub fsid: Fsid,
    /// Current filehandle
    pub fh: FileHandle,
    /// Lock-owner and its sequence
    pub locker: Locker,
    /// Range to lock
    pub range: LockRange,
    /// Reclaim of a lock held before a restart
    pub reclaim: bool,
}

/// LOCKU arguments.
#[derive(Debug, Clone)]
pub struct LockuArgs {
    /// Filesystem of the file
    pub fsid: Fsid,
    /// Current filehandle
    pub fh: FileHandle,
    /// Lock stateid
    pub lock_stateid: StateId4,
    /// Lock sequence
    pub seqid: u32,
    /// Range to unlock
    pub range: LockRange,
}

/// Result of a LOCK that was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// Lock held; carries the lock stateid
    Granted(StateId4),
    /// Conflict with another owner
    Denied(LockDenied),
}

/// Result of a sequenced operation: freshly processed, or a retransmission
/// answered from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequenced<T> {
    /// Processed now
    Done(T),
    /// Answered from the replay cache
    Replay(CachedReply),
}

impl<T> Sequenced<T> {
    /// True when answered from the replay cache.
    pub fn is_replay(&self) -> bool {
        matches!(self, Sequenced::Replay(_))
    }
}

/// How a presented stateid relates to the state it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateIdCheck {
    /// Current and usable
    Okay,
    /// One behind: the retransmission of the last change
    Replay,
    /// Older than one behind
    Old,
    /// Ahead of the server
    Bad,
    /// Owner's lease lapsed
    Expired,
    /// Open not confirmed yet
    Unconfirmed,
    /// Open already closed
    Closed,
}

/// Classifies a presented stateid sequence against the current one.
///
/// Expiry wins over everything; then a sequence ahead of the server is bad,
/// exactly one behind is a replay and further behind is old. Only a current
/// sequence is subject to the confirmation and closed checks.
pub fn classify_stateid(
    current: u32,
    presented: u32,
    expired: bool,
    unconfirmed: bool,
    closed: bool,
) -> StateIdCheck {
    if expired {
        return StateIdCheck::Expired;
    }
    if current < presented {
        return StateIdCheck::Bad;
    }
    if current == presented.wrapping_add(1) {
        return StateIdCheck::Replay;
    }
    if current > presented {
        return StateIdCheck::Old;
    }
    if unconfirmed {
        return StateIdCheck::Unconfirmed;
    }
    if closed {
        return StateIdCheck::Closed;
    }
    StateIdCheck::Okay
}

/// Rejects share bits outside the protocol's range. Access must name at
/// least one mode.
pub fn validate_share(access: u32, deny: u32) -> Result<()> {
    if access & SHARE_ACCESS_BOTH == 0 || access & !SHARE_ACCESS_BOTH != 0 || deny & !SHARE_DENY_BOTH != 0 {
        return Err(StateError::Inval {
            reason: format!("share access {:#x} deny {:#x}", access, deny),
        });
    }
    Ok(())
}

/// One open of one file by one open-owner.
#[derive(Debug)]
pub struct OpenState {
    /// Current open stateid
    pub stateid: StateId,
    pub(crate) owner: Held<OpenOwner>,
    pub(crate) file: Held<File>,
    pub(crate) client: Held<Client>,
    /// Owning client
    pub clientid: ClientId,
    /// Entry id of the open-owner
    pub owner_id: EntryId,
    /// Entry id of the file
    pub file_id: EntryId,
    /// Opened file
    pub fh: FileHandle,
    /// Export the open came through
    pub export_id: u32,
    /// Access bits held
    pub share_access: u32,
    /// Deny bits held
    pub share_deny: u32,
    /// CLOSE processed or torn down
    pub closed: bool,
    pub(crate) lock_states: Vec<EntryId>,
    /// Owner of the share reservation at the volume
    pub share_owner: LockOwnerKey,
}

impl Keyed for OpenState {
    type Key = (EntryId, EntryId);

    fn key(&self) -> (EntryId, EntryId) {
        (self.owner_id, self.file_id)
    }
}

/// Locks of one lock-owner under one open.
#[derive(Debug)]
pub struct LockState {
    /// Current lock stateid
    pub stateid: StateId,
    pub(crate) state: Held<OpenState>,
    /// Keeps the lock-owner alive while it holds locks here
    pub locker: Held<LockOwner>,
    pub(crate) client: Held<Client>,
    /// Entry id of the open-state
    pub open_id: EntryId,
    /// Lock-owner pid
    pub pid: u32,
    /// Locked file
    pub fh: FileHandle,
    /// Last processed lock sequence
    pub lock_seqid: u32,
    /// Reply to the last LOCK or LOCKU, for replays
    pub reply: Option<CachedReply>,
    /// Locks were released at the volume already
    pub locks_cleaned: bool,
    /// The first LOCK of a new lock-owner established the sequence
    pub skip_seqid_check: bool,
    /// At least one LOCK under this state succeeded
    pub lock_completed: bool,
    /// Owner at the volume
    pub lock_owner: LockOwnerKey,
    pub(crate) sequence: Arc<Mutex<()>>,
}

impl Keyed for LockState {
    type Key = (u32, EntryId);

    fn key(&self) -> (u32, EntryId) {
        (self.pid, self.open_id)
    }
}

/// Point-in-time view of an open-state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenStateView {
    /// Current stateid
    pub stateid: StateId4,
    /// Access bits held
    pub share_access: u32,
    /// Deny bits held
    pub share_deny: u32,
    /// Open already closed
    pub closed: bool,
    /// Lock-states under the open
    pub lock_states: usize,
}

/// Outcome of the checks that gate OPEN_CONFIRM, OPEN_DOWNGRADE and CLOSE.
enum Admit {
    Proceed,
    Replay(CachedReply),
}

fn check_lock_seqid(l: &LockState, requested: u32, op: OwnerOp) -> SeqidCheck {
    if l.skip_seqid_check {
        return SeqidCheck::Okay;
    }
    check_seqid(l.lock_seqid, l.reply.as_ref(), requested, op)
}

fn lock_failure(err: &StateError) -> CachedReply {
    CachedReply::Failed {
        op: OwnerOp::Lock,
        status: err.nfs4_status(),
    }
}

impl StateRegistry {
    /// OPEN.
    pub fn open(&self, args: &OpenArgs) -> Result<Sequenced<OpenReply>> {
        let fs = self.admit_filesystem(args.fsid, true)?;
        let cp = self.active_client(args.clientid)?;

        for _ in 0..OPEN_RETRIES {
            let (oo, created) =
                self.find_or_create_open_owner(&cp, args.clientid, &args.owner, args.seqid)?;
            let sequence = oo.lock().sequence.clone();
            let _window = sequence.lock();
            if oo.is_invalid() {
                continue;
            }

            if !created {
                let (postpone, need_confirm, last) = {
                    let o = oo.lock();
                    (o.postpone_confirm, o.need_confirm, o.open_seqid)
                };
                if !postpone {
                    match self.check_open_seqid(&oo, args.seqid, OwnerOp::Open) {
                        SeqidCheck::Replay(reply) => return Ok(Sequenced::Replay(reply)),
                        SeqidCheck::Bad => {
                            if need_confirm && args.seqid > last {
                                self.free_opens(&oo, true, false);
                                continue;
                            }
                            return Err(StateError::BadSeqid);
                        }
                        SeqidCheck::Okay if need_confirm => {
                            // never confirmed; start over with a fresh owner
                            self.free_opens(&oo, true, false);
                            continue;
                        }
                        SeqidCheck::Okay => {}
                    }
                }
            }

            let result = self.process_open(&fs, &cp, &oo, args);
            self.finish_open(&cp, &oo, created, args, &result);
            return result.map(Sequenced::Done);
        }
        Err(StateError::Delay)
    }

    fn finish_open(
        &self,
        cp: &Held<Client>,
        oo: &Held<OpenOwner>,
        created: bool,
        args: &OpenArgs,
        result: &Result<OpenReply>,
    ) {
        let reply = match result {
            Ok(r) => CachedReply::Open(r.clone()),
            Err(e) if advances_seqid(e) => CachedReply::Failed {
                op: OwnerOp::Open,
                status: e.nfs4_status(),
            },
            Err(_) => return,
        };
        self.update_lease(cp);
        let mut o = oo.lock();
        o.reply = Some(reply);
        o.reply_fh = args.fh.0.clone();
        if !created {
            o.open_seqid = o.open_seqid.wrapping_add(1);
        }
        match result {
            Err(_) if o.need_confirm => o.postpone_confirm = true,
            Ok(_) if o.postpone_confirm => {
                o.postpone_confirm = false;
                o.open_seqid = args.seqid;
            }
            _ => {}
        }
    }

    fn process_open(
        &self,
        fs: &FsStateStore,
        cp: &Held<Client>,
        oo: &Held<OpenOwner>,
        args: &OpenArgs,
    ) -> Result<OpenReply> {
        let in_grace = self.client_in_grace(cp, fs);
        let can_reclaim = cp.lock().can_reclaim;
        match args.claim {
            OpenClaim::Null | OpenClaim::DelegateCur(_) if in_grace => return Err(StateError::Grace),
            OpenClaim::Previous(_) if !in_grace || !can_reclaim => return Err(StateError::NoGrace),
            _ => {}
        }
        if self.lease_moved(cp) {
            return Err(StateError::LeaseMoved);
        }

        let mut rflags = OPEN4_RESULT_LOCKTYPE_POSIX;
        {
            let mut o = oo.lock();
            if o.need_confirm {
                if matches!(args.claim, OpenClaim::Previous(_)) {
                    o.need_confirm = false;
                } else {
                    rflags |= OPEN4_RESULT_CONFIRM;
                }
            }
        }
        validate_share(args.share_access, args.share_deny)?;

        if let OpenClaim::DelegateCur(ref dstateid) = args.claim {
            let dsp = self.get_deleg_state(fs, dstateid)?;
            if dsp.lock().fh != args.fh {
                return Err(StateError::BadStateId);
            }
        }

        let (stateid, fp, bits) = self.do_open(fs, cp, oo, args)?;
        let delegation = self.grant_delegation(fs, cp, &fp, bits, &args.claim, args.delegation);
        Ok(OpenReply {
            stateid,
            rflags,
            delegation,
            fh: args.fh.0.clone(),
        })
    }

    /// Finds or creates the open-state and merges the requested share bits
    /// into its reservation.
    fn do_open(
        &self,
        fs: &FsStateStore,
        cp: &Held<Client>,
        oo: &Held<OpenOwner>,
        args: &OpenArgs,
    ) -> Result<(StateId4, Held<File>, (u32, u32))> {
        let (fp, _) = fs.files.find_or_create(
            &args.fh,
            |_| true,
            |_| Some(File::new(args.fh.clone(), args.export_id)),
        )?;
        let teardown = fp.lock().teardown.clone();
        let _teardown = teardown.read();
        if fp.is_invalid() {
            return Err(StateError::Delay);
        }

        let sysid = cp.lock().sysid;
        let owner_id = oo.id();
        let file_id = fp.id();
        let epoch = fs.epoch();
        let node = self.node;
        let (sp, screate) = fs.states.find_or_create(
            &(owner_id, file_id),
            |s| !s.closed,
            |id| {
                Some(OpenState {
                    stateid: StateId::new(StateKind::Open, epoch, id, &node),
                    owner: oo.clone(),
                    file: fp.clone(),
                    client: cp.clone(),
                    clientid: args.clientid,
                    owner_id,
                    file_id,
                    fh: args.fh.clone(),
                    export_id: args.export_id,
                    share_access: 0,
                    share_deny: 0,
                    closed: false,
                    lock_states: Vec::new(),
                    share_owner: LockOwnerKey {
                        pid: owner_id,
                        sysid,
                    },
                })
            },
        )?;
        if screate {
            oo.lock().states.push(StateRef {
                fsid: fs.fsid(),
                id: sp.id(),
            });
        }

        let old = {
            let s = sp.lock();
            (s.share_access, s.share_deny)
        };
        let new = (old.0 | args.share_access, old.1 | args.share_deny);

        if fp.lock().share.conflicts_on_change(old, new) {
            if screate {
                discard_state(&sp);
            }
            return Err(StateError::ShareDenied);
        }
        if self.recall_conflicting(fs, &fp, Some(args.clientid), args.share_access) {
            if screate {
                discard_state(&sp);
            }
            return Err(StateError::Delay);
        }

        let stateid = {
            let mut s = sp.lock();
            let mut f = fp.lock();
            if f.share.conflicts_on_change(old, new) {
                drop(f);
                drop(s);
                if screate {
                    discard_state(&sp);
                }
                return Err(StateError::ShareDenied);
            }
            fs.volume().share(&s.fh, s.share_owner, new.0, new.1)?;
            f.share.remove(old.0, old.1);
            f.share.add(new.0, new.1);
            s.share_access = new.0;
            s.share_deny = new.1;
            s.stateid.bump();
            s.stateid.encode()
        };
        debug!(
            state = sp.id(),
            access = new.0,
            deny = new.1,
            created = screate,
            "open"
        );
        Ok((stateid, fp, new))
    }

    /// Resolves an open stateid, classifying misses.
    pub(crate) fn get_open_state(&self, fs: &FsStateStore, presented: &StateId4) -> Result<Held<OpenState>> {
        let decoded = presented.decode();
        let found = if presented.is_special() || decoded.kind() != Some(StateKind::Open) {
            None
        } else {
            fs.states
                .get(decoded.ident)
                .filter(|sp| sp.lock().stateid.same_identity(&decoded))
        };
        let sp = found
            .ok_or_else(|| classify_stateid_miss(presented, StateKind::Open, fs.epoch(), &self.node))?;
        let cp = sp.lock().client.clone();
        if self.client_expired(&cp) {
            return Err(StateError::Expired);
        }
        Ok(sp)
    }

    /// Resolves a lock stateid, classifying misses.
    pub(crate) fn get_lock_state(&self, fs: &FsStateStore, presented: &StateId4) -> Result<Held<LockState>> {
        let decoded = presented.decode();
        let found = if presented.is_special() || decoded.kind() != Some(StateKind::Lock) {
            None
        } else {
            fs.lock_states
                .find(&(decoded.pid, decoded.ident), |l| l.stateid.same_identity(&decoded))
        };
        let lsp = found
            .ok_or_else(|| classify_stateid_miss(presented, StateKind::Lock, fs.epoch(), &self.node))?;
        let cp = lsp.lock().client.clone();
        if self.client_expired(&cp) {
            return Err(StateError::Expired);
        }
        Ok(lsp)
    }

    fn open_stateid_check(&self, sp: &Held<OpenState>, presented: &StateId4) -> StateIdCheck {
        let (current, closed, oo, cp) = {
            let s = sp.lock();
            (s.stateid.seqid, s.closed, s.owner.clone(), s.client.clone())
        };
        let expired = self.client_expired(&cp);
        let need_confirm = oo.lock().need_confirm;
        classify_stateid(current, presented.seqid, expired, need_confirm, closed)
    }

    fn lock_stateid_check(&self, lsp: &Held<LockState>, presented: &StateId4) -> StateIdCheck {
        let (current, sp, cp) = {
            let l = lsp.lock();
            (l.stateid.seqid, l.state.clone(), l.client.clone())
        };
        let expired = self.client_expired(&cp);
        let closed = sp.lock().closed;
        classify_stateid(current, presented.seqid, expired, false, closed)
    }

    /// Stateid and owner sequence checks shared by OPEN_CONFIRM,
    /// OPEN_DOWNGRADE and CLOSE.
    fn admit_open_op(
        &self,
        sp: &Held<OpenState>,
        oo: &Held<OpenOwner>,
        cp: &Held<Client>,
        presented: &StateId4,
        seqid: u32,
        op: OwnerOp,
    ) -> Result<Admit> {
        match self.open_stateid_check(sp, presented) {
            StateIdCheck::Okay => {
                let rc = self.check_open_seqid(oo, seqid, op);
                if rc != SeqidCheck::Okay {
                    return Err(StateError::BadSeqid);
                }
                if op == OwnerOp::OpenConfirm {
                    // already confirmed
                    return Err(StateError::BadStateId);
                }
                Ok(Admit::Proceed)
            }
            StateIdCheck::Unconfirmed if op == OwnerOp::OpenConfirm => {
                match self.check_open_seqid(oo, seqid, op) {
                    SeqidCheck::Okay => Ok(Admit::Proceed),
                    _ => Err(StateError::BadSeqid),
                }
            }
            StateIdCheck::Unconfirmed => Err(StateError::BadStateId),
            StateIdCheck::Replay => match self.check_open_seqid(oo, seqid, op) {
                SeqidCheck::Replay(reply) => {
                    self.update_lease(cp);
                    Ok(Admit::Replay(reply))
                }
                _ => Err(StateError::BadSeqid),
            },
            StateIdCheck::Old => Err(StateError::OldStateId),
            StateIdCheck::Bad => Err(StateError::BadStateId),
            StateIdCheck::Expired => Err(StateError::Expired),
            StateIdCheck::Closed => Err(StateError::Closed),
        }
    }

    /// Resolves the open-state of a stateid-bearing owner operation and
    /// enters its owner's sequence window.
    fn open_op_state(
        &self,
        fs: &FsStateStore,
        fh: &FileHandle,
        stateid: &StateId4,
    ) -> Result<(Held<OpenState>, Held<OpenOwner>, Held<Client>)> {
        let sp = self.get_open_state(fs, stateid)?;
        let (oo, cp, sfh) = {
            let s = sp.lock();
            (s.owner.clone(), s.client.clone(), s.fh.clone())
        };
        if sfh != *fh {
            return Err(StateError::BadStateId);
        }
        Ok((sp, oo, cp))
    }

    /// OPEN_CONFIRM.
    pub fn open_confirm(&self, args: &StateOpArgs) -> Result<Sequenced<StateId4>> {
        let fs = self.admit_filesystem(args.fsid, true)?;
        let (sp, oo, cp) = self.open_op_state(&fs, &args.fh, &args.stateid)?;
        let sequence = oo.lock().sequence.clone();
        let _window = sequence.lock();

        match self.admit_open_op(&sp, &oo, &cp, &args.stateid, args.seqid, OwnerOp::OpenConfirm)? {
            Admit::Replay(reply) => return Ok(Sequenced::Replay(reply)),
            Admit::Proceed => {}
        }
        if self.lease_moved(&cp) {
            self.fail_open_sequence(&oo, OwnerOp::OpenConfirm, &StateError::LeaseMoved);
            return Err(StateError::LeaseMoved);
        }

        let stateid = {
            let mut s = sp.lock();
            s.stateid.bump();
            s.stateid.encode()
        };
        oo.lock().need_confirm = false;
        self.update_lease(&cp);
        self.update_open_sequence(&oo, CachedReply::OpenConfirm { stateid });
        debug!(state = sp.id(), "open confirmed");
        Ok(Sequenced::Done(stateid))
    }

    /// OPEN_DOWNGRADE.
    pub fn open_downgrade(&self, args: &DowngradeArgs) -> Result<Sequenced<StateId4>> {
        let fs = self.admit_filesystem(args.fsid, true)?;
        let (sp, oo, cp) = self.open_op_state(&fs, &args.fh, &args.stateid)?;
        let sequence = oo.lock().sequence.clone();
        let _window = sequence.lock();

        match self.admit_open_op(&sp, &oo, &cp, &args.stateid, args.seqid, OwnerOp::OpenDowngrade)? {
            Admit::Replay(reply) => return Ok(Sequenced::Replay(reply)),
            Admit::Proceed => {}
        }
        if self.lease_moved(&cp) {
            self.fail_open_sequence(&oo, OwnerOp::OpenDowngrade, &StateError::LeaseMoved);
            return Err(StateError::LeaseMoved);
        }

        match self.downgrade(&fs, &sp, args.share_access, args.share_deny) {
            Ok(stateid) => {
                self.update_lease(&cp);
                self.update_open_sequence(&oo, CachedReply::OpenDowngrade { stateid });
                Ok(Sequenced::Done(stateid))
            }
            Err(e) => {
                self.fail_open_sequence(&oo, OwnerOp::OpenDowngrade, &e);
                Err(e)
            }
        }
    }

    fn downgrade(&self, fs: &FsStateStore, sp: &Held<OpenState>, access: u32, deny: u32) -> Result<StateId4> {
        let mut s = sp.lock();
        let (cur_access, cur_deny) = (s.share_access, s.share_deny);
        if access == 0 || access & !cur_access != 0 || deny & !cur_deny != 0 {
            return Err(StateError::Inval {
                reason: format!(
                    "downgrade to access {:#x} deny {:#x} from {:#x}/{:#x}",
                    access, deny, cur_access, cur_deny
                ),
            });
        }
        let volume = fs.volume();
        if let Err(e) = volume.unshare(&s.fh, s.share_owner) {
            warn!(state = sp.id(), error = %e, "unshare failed during downgrade");
        }
        volume.share(&s.fh, s.share_owner, access, deny)?;
        {
            let mut f = s.file.lock();
            f.share.remove(cur_access, cur_deny);
            f.share.add(access, deny);
        }
        s.share_access = access;
        s.share_deny = deny;
        s.stateid.bump();
        Ok(s.stateid.encode())
    }

    /// CLOSE.
    pub fn close(&self, args: &StateOpArgs) -> Result<Sequenced<StateId4>> {
        let fs = self.admit_filesystem(args.fsid, false)?;
        let (sp, oo, cp) = self.open_op_state(&fs, &args.fh, &args.stateid)?;
        let sequence = oo.lock().sequence.clone();
        let _window = sequence.lock();

        match self.admit_open_op(&sp, &oo, &cp, &args.stateid, args.seqid, OwnerOp::Close)? {
            Admit::Replay(reply) => return Ok(Sequenced::Replay(reply)),
            Admit::Proceed => {}
        }
        if self.lease_moved(&cp) {
            self.fail_open_sequence(&oo, OwnerOp::Close, &StateError::LeaseMoved);
            return Err(StateError::LeaseMoved);
        }

        let stateid = {
            let mut s = sp.lock();
            s.stateid.bump();
            s.stateid.encode()
        };
        self.update_lease(&cp);
        self.update_open_sequence(&oo, CachedReply::Close { stateid });
        self.state_close(&fs, &sp, false);
        debug!(state = sp.id(), "closed");
        Ok(Sequenced::Done(stateid))
    }

    fn fail_open_sequence(&self, oo: &Held<OpenOwner>, op: OwnerOp, err: &StateError) {
        self.update_open_sequence(
            oo,
            CachedReply::Failed {
                op,
                status: err.nfs4_status(),
            },
        );
    }

    /// LOCK.
    pub fn lock(&self, args: &LockArgs) -> Result<Sequenced<LockOutcome>> {
        let fs = self.admit_filesystem(args.fsid, true)?;
        match &args.locker {
            Locker::NewOwner {
                open_stateid,
                open_seqid,
                lock_owner,
                lock_seqid,
            } => self.lock_new_owner(&fs, args, open_stateid, *open_seqid, lock_owner, *lock_seqid),
            Locker::Existing {
                lock_stateid,
                lock_seqid,
            } => self.lock_existing(&fs, args, lock_stateid, *lock_seqid),
        }
    }

    fn lock_new_owner(
        &self,
        fs: &FsStateStore,
        args: &LockArgs,
        open_stateid: &StateId4,
        open_seqid: u32,
        lock_owner: &[u8],
        lock_seqid: u32,
    ) -> Result<Sequenced<LockOutcome>> {
        let (sp, oo, cp) = self.open_op_state(fs, &args.fh, open_stateid)?;
        let sequence = oo.lock().sequence.clone();
        let _window = sequence.lock();

        let sid = self.open_stateid_check(&sp, open_stateid);
        match sid {
            StateIdCheck::Old => return Err(StateError::OldStateId),
            StateIdCheck::Bad => return Err(StateError::BadStateId),
            StateIdCheck::Expired => return Err(StateError::Expired),
            StateIdCheck::Unconfirmed => return Err(StateError::BadStateId),
            StateIdCheck::Closed => return Err(StateError::Closed),
            StateIdCheck::Okay | StateIdCheck::Replay => {}
        }

        let dup = match self.check_open_seqid(&oo, open_seqid, OwnerOp::Lock) {
            SeqidCheck::Okay if sid == StateIdCheck::Replay => return Err(StateError::BadSeqid),
            SeqidCheck::Okay => false,
            SeqidCheck::Bad => return Err(StateError::BadSeqid),
            SeqidCheck::Replay(_) => true,
        };

        let clientid = sp.lock().clientid;
        let (lo, _) = self.find_or_create_lock_owner(&cp, clientid, lock_owner)?;
        let pid = lo.lock().pid;
        let key = (pid, sp.id());

        let (lsp, lcreated) = if dup {
            match fs.lock_states.find(&key, |_| true) {
                Some(lsp) => (lsp, false),
                None => {
                    self.update_lease(&cp);
                    return Err(StateError::BadSeqid);
                }
            }
        } else {
            self.find_or_create_lock_state(fs, &sp, &lo, &cp, pid)?
        };
        let lsequence = lsp.lock().sequence.clone();
        let _lwindow = lsequence.lock();

        if !dup && !lcreated && lsp.lock().lock_completed {
            return Err(StateError::BadSeqid);
        }

        self.update_lease(&cp);
        if !dup {
            let mut o = oo.lock();
            o.open_seqid = o.open_seqid.wrapping_add(1);
        }

        if dup {
            let l = lsp.lock();
            return match (&l.reply, l.lock_seqid == lock_seqid) {
                (Some(reply), true) => Ok(Sequenced::Replay(reply.clone())),
                _ => Err(StateError::BadSeqid),
            };
        }

        {
            let mut l = lsp.lock();
            l.lock_seqid = lock_seqid;
            l.skip_seqid_check = true;
        }

        let result = self.finish_lock(fs, &sp, &lsp, &cp, args);
        let reply = self.record_lock_result(&lsp, &result);
        self.update_open_reply(&oo, reply);
        result.map(Sequenced::Done)
    }

    fn find_or_create_lock_state(
        &self,
        fs: &FsStateStore,
        sp: &Held<OpenState>,
        lo: &Held<LockOwner>,
        cp: &Held<Client>,
        pid: u32,
    ) -> Result<(Held<LockState>, bool)> {
        let (open_stateid, fh) = {
            let s = sp.lock();
            (s.stateid, s.fh.clone())
        };
        let sysid = cp.lock().sysid;
        let open_id = sp.id();
        let (lsp, created) = fs.lock_states.find_or_create(
            &(pid, open_id),
            |_| true,
            |_| {
                Some(LockState {
                    stateid: open_stateid
                        .with_kind(StateKind::Lock)
                        .with_pid(pid)
                        .with_seqid(0),
                    state: sp.clone(),
                    locker: lo.clone(),
                    client: cp.clone(),
                    open_id,
                    pid,
                    fh,
                    lock_seqid: 0,
                    reply: None,
                    locks_cleaned: false,
                    skip_seqid_check: false,
                    lock_completed: false,
                    lock_owner: LockOwnerKey { pid, sysid },
                    sequence: Arc::new(Mutex::new(())),
                })
            },
        )?;
        if created {
            sp.lock().lock_states.push(lsp.id());
        }
        Ok((lsp, created))
    }

    fn lock_existing(
        &self,
        fs: &FsStateStore,
        args: &LockArgs,
        lock_stateid: &StateId4,
        lock_seqid: u32,
    ) -> Result<Sequenced<LockOutcome>> {
        let lsp = self.get_lock_state(fs, lock_stateid)?;
        let (sp, cp, fh, lsequence) = {
            let l = lsp.lock();
            (l.state.clone(), l.client.clone(), l.fh.clone(), l.sequence.clone())
        };
        if fh != args.fh {
            return Err(StateError::BadStateId);
        }
        let _lwindow = lsequence.lock();

        match self.lock_stateid_check(&lsp, lock_stateid) {
            StateIdCheck::Okay => {
                let rc = check_lock_seqid(&lsp.lock(), lock_seqid, OwnerOp::Lock);
                match rc {
                    SeqidCheck::Okay => {}
                    SeqidCheck::Replay(reply) if reply.status() != crate::error::NFS4_OK => {
                        return Ok(Sequenced::Replay(reply));
                    }
                    _ => return Err(StateError::BadSeqid),
                }
            }
            StateIdCheck::Replay => {
                let rc = check_lock_seqid(&lsp.lock(), lock_seqid, OwnerOp::Lock);
                return match rc {
                    SeqidCheck::Replay(reply) => {
                        self.update_lease(&cp);
                        Ok(Sequenced::Replay(reply))
                    }
                    _ => Err(StateError::BadSeqid),
                };
            }
            StateIdCheck::Old => return Err(StateError::OldStateId),
            StateIdCheck::Bad | StateIdCheck::Unconfirmed => return Err(StateError::BadStateId),
            StateIdCheck::Expired => return Err(StateError::Expired),
            StateIdCheck::Closed => return Err(StateError::Closed),
        }

        {
            let mut l = lsp.lock();
            if !l.skip_seqid_check {
                l.lock_seqid = l.lock_seqid.wrapping_add(1);
            }
        }
        self.update_lease(&cp);

        let result = self.finish_lock(fs, &sp, &lsp, &cp, args);
        self.record_lock_result(&lsp, &result);
        result.map(Sequenced::Done)
    }

    /// Grace and migration checks, then the lock itself.
    fn finish_lock(
        &self,
        fs: &FsStateStore,
        sp: &Held<OpenState>,
        lsp: &Held<LockState>,
        cp: &Held<Client>,
        args: &LockArgs,
    ) -> Result<LockOutcome> {
        let in_grace = self.client_in_grace(cp, fs);
        if in_grace && !args.reclaim {
            return Err(StateError::Grace);
        }
        if in_grace && args.reclaim && !cp.lock().can_reclaim {
            return Err(StateError::NoGrace);
        }
        if !in_grace && args.reclaim {
            return Err(StateError::NoGrace);
        }
        if self.lease_moved(cp) {
            return Err(StateError::LeaseMoved);
        }
        self.do_lock(fs, sp, lsp, cp, args.range)
    }

    fn do_lock(
        &self,
        fs: &FsStateStore,
        sp: &Held<OpenState>,
        lsp: &Held<LockState>,
        cp: &Held<Client>,
        range: LockRange,
    ) -> Result<LockOutcome> {
        if self.client_expired(cp) {
            return Err(StateError::Expired);
        }
        if range.length == 0 {
            return Err(StateError::Inval {
                reason: "zero-length lock".to_string(),
            });
        }
        if range.length != u64::MAX && range.offset.checked_add(range.length).is_none() {
            return Err(StateError::Inval {
                reason: format!("lock range {}+{} overflows", range.offset, range.length),
            });
        }
        let (closed, access) = {
            let s = sp.lock();
            (s.closed, s.share_access)
        };
        if closed {
            return Err(StateError::OldStateId);
        }
        let needed = if range.write { SHARE_ACCESS_WRITE } else { SHARE_ACCESS_READ };
        if access & needed == 0 {
            return Err(StateError::OpenMode);
        }

        let (fh, owner) = {
            let l = lsp.lock();
            (l.fh.clone(), l.lock_owner)
        };
        let volume = fs.volume();
        match volume.lock_range(&fh, owner, range) {
            Ok(()) => {
                let mut l = lsp.lock();
                l.stateid.bump();
                Ok(LockOutcome::Granted(l.stateid.encode()))
            }
            Err(StateError::Denied) => {
                let denied = match volume.conflicting_lock(&fh, owner, range) {
                    Some((holder, held)) => LockDenied {
                        offset: held.offset,
                        length: held.length,
                        write: held.write,
                        owner: self
                            .find_lock_owner_by_pid(holder.pid)
                            .map(|lo| lo.lock().owner.clone())
                            .unwrap_or_default(),
                    },
                    None => LockDenied {
                        offset: range.offset,
                        length: range.length,
                        write: range.write,
                        owner: Vec::new(),
                    },
                };
                debug!(pid = owner.pid, offset = range.offset, "lock denied");
                Ok(LockOutcome::Denied(denied))
            }
            Err(e) => Err(e),
        }
    }

    /// Caches the LOCK outcome on the lock-state and returns the cached form.
    fn record_lock_result(&self, lsp: &Held<LockState>, result: &Result<LockOutcome>) -> CachedReply {
        let reply = match result {
            Ok(LockOutcome::Granted(stateid)) => CachedReply::Lock { stateid: *stateid },
            Ok(LockOutcome::Denied(denied)) => CachedReply::LockDenied(denied.clone()),
            Err(e) => lock_failure(e),
        };
        let mut l = lsp.lock();
        l.skip_seqid_check = false;
        if matches!(result, Ok(LockOutcome::Granted(_))) {
            l.lock_completed = true;
        }
        l.reply = Some(reply.clone());
        reply
    }

    /// LOCKU.
    pub fn locku(&self, args: &LockuArgs) -> Result<Sequenced<StateId4>> {
        let fs = self.admit_filesystem(args.fsid, false)?;
        let lsp = self.get_lock_state(&fs, &args.lock_stateid)?;
        let (cp, fh, lsequence) = {
            let l = lsp.lock();
            (l.client.clone(), l.fh.clone(), l.sequence.clone())
        };
        if fh != args.fh {
            return Err(StateError::BadStateId);
        }
        let _lwindow = lsequence.lock();

        match self.lock_stateid_check(&lsp, &args.lock_stateid) {
            StateIdCheck::Okay => {
                let rc = check_lock_seqid(&lsp.lock(), args.seqid, OwnerOp::LockU);
                match rc {
                    SeqidCheck::Okay => {}
                    SeqidCheck::Replay(reply) => return Ok(Sequenced::Replay(reply)),
                    SeqidCheck::Bad => return Err(StateError::BadSeqid),
                }
            }
            StateIdCheck::Replay => {
                let rc = check_lock_seqid(&lsp.lock(), args.seqid, OwnerOp::LockU);
                return match rc {
                    SeqidCheck::Replay(reply) => {
                        self.update_lease(&cp);
                        Ok(Sequenced::Replay(reply))
                    }
                    _ => Err(StateError::BadSeqid),
                };
            }
            StateIdCheck::Old => return Err(StateError::OldStateId),
            StateIdCheck::Bad | StateIdCheck::Unconfirmed => return Err(StateError::BadStateId),
            StateIdCheck::Expired => return Err(StateError::Expired),
            StateIdCheck::Closed => return Err(StateError::Closed),
        }

        {
            let mut l = lsp.lock();
            l.lock_seqid = l.lock_seqid.wrapping_add(1);
        }
        self.update_lease(&cp);

        let result = self.do_unlock(&fs, &lsp, &cp, &fh, args.range);
        let reply = match &result {
            Ok(stateid) => CachedReply::LockU { stateid: *stateid },
            Err(e) => CachedReply::Failed {
                op: OwnerOp::LockU,
                status: e.nfs4_status(),
            },
        };
        lsp.lock().reply = Some(reply);
        result.map(Sequenced::Done)
    }

    fn do_unlock(
        &self,
        fs: &FsStateStore,
        lsp: &Held<LockState>,
        cp: &Held<Client>,
        fh: &FileHandle,
        range: LockRange,
    ) -> Result<StateId4> {
        if self.client_in_grace(cp, fs) {
            return Err(StateError::Grace);
        }
        if range.length == 0 {
            return Err(StateError::Inval {
                reason: "zero-length unlock".to_string(),
            });
        }
        let owner = lsp.lock().lock_owner;
        fs.volume().unlock_range(fh, owner, range)?;
        let mut l = lsp.lock();
        l.stateid.bump();
        Ok(l.stateid.encode())
    }

    /// Current share bits and status of an open stateid.
    pub fn open_state_view(&self, fsid: Fsid, stateid: &StateId4) -> Result<OpenStateView> {
        let fs = self.admit_filesystem(fsid, false)?;
        let sp = self.get_open_state(&fs, stateid)?;
        let s = sp.lock();
        Ok(OpenStateView {
            stateid: s.stateid.encode(),
            share_access: s.share_access,
            share_deny: s.share_deny,
            closed: s.closed,
            lock_states: s.lock_states.len(),
        })
    }

    /// Closes an open: releases its locks and share reservation and takes
    /// its bits out of the file's counts. Returns false if it was closed
    /// already.
    ///
    /// With `close_of_client` every lock of the client is released at once
    /// through its sysid instead of per lock-owner.
    pub(crate) fn state_close(&self, fs: &FsStateStore, sp: &Entry<OpenState>, close_of_client: bool) -> bool {
        let client = sp.lock().client.clone();
        let mut c = client.lock();
        let mut s = sp.lock();
        if s.closed {
            return false;
        }
        let volume = fs.volume();
        if close_of_client && !c.unlksys_completed && !s.lock_states.is_empty() {
            volume.release_sysid(c.sysid);
            c.unlksys_completed = true;
        }
        for id in &s.lock_states {
            let Some(lsp) = fs.lock_states.get_any(*id) else {
                continue;
            };
            let mut l = lsp.lock();
            l.locks_cleaned = true;
            if !close_of_client {
                volume.clean_locks(&s.fh, l.lock_owner);
            }
        }
        if let Err(e) = volume.unshare(&s.fh, s.share_owner) {
            warn!(state = sp.id(), error = %e, "unshare failed");
        }
        let (access, deny) = (s.share_access, s.share_deny);
        s.file.lock().share.remove(access, deny);
        s.closed = true;
        true
    }

    /// Closes every open of an owner, optionally invalidating the states,
    /// then invalidates the owner.
    pub(crate) fn free_opens(&self, oo: &Held<OpenOwner>, invalidate: bool, close_of_client: bool) {
        let states = oo.lock().states.clone();
        for r in states {
            let Some(fs) = self.store(r.fsid) else {
                continue;
            };
            if let Some(sp) = fs.states.get_any(r.id) {
                self.state_close(&fs, &sp, close_of_client);
                if invalidate {
                    sp.invalidate();
                }
            }
        }
        oo.invalidate();
    }

    pub(crate) fn open_state_expiry(&self, entry: &Entry<OpenState>) -> bool {
        if entry.is_invalid() {
            return true;
        }
        let (closed, client) = {
            let s = entry.lock();
            (s.closed, s.client.clone())
        };
        let now = self.now();
        if closed && now.saturating_sub(entry.time_rele()) > self.lease_secs() {
            return true;
        }
        let lapsed = client.lock().lease.lapsed(now, self.lease_secs());
        lapsed
    }

    pub(crate) fn open_state_destroy(&self, fs: &FsStateStore, entry: &Entry<OpenState>) {
        self.state_close(fs, entry, false);
        let owner = entry.lock().owner.clone();
        let (fsid, id) = (fs.fsid(), entry.id());
        owner.lock().states.retain(|r| !(r.fsid == fsid && r.id == id));
    }

    pub(crate) fn lock_state_expiry(&self, entry: &Entry<LockState>) -> bool {
        if entry.is_invalid() {
            return true;
        }
        let (state, client) = {
            let l = entry.lock();
            (l.state.clone(), l.client.clone())
        };
        if state.lock().closed {
            return true;
        }
        let lapsed = client.lock().lease.lapsed(self.now(), self.lease_secs());
        lapsed
    }

    pub(crate) fn lock_state_destroy(&self, fs: &FsStateStore, entry: &Entry<LockState>) {
        let (state, cleaned, fh, owner) = {
            let mut l = entry.lock();
            let cleaned = l.locks_cleaned;
            l.locks_cleaned = true;
            (l.state.clone(), cleaned, l.fh.clone(), l.lock_owner)
        };
        let id = entry.id();
        state.lock().lock_states.retain(|l| *l != id);
        if !cleaned {
            fs.volume().clean_locks(&fh, owner);
        }
    }
}

/// Drops a state created by an OPEN that failed before it took effect.
fn discard_state(sp: &Held<OpenState>) {
    sp.lock().closed = true;
    sp.invalidate();
}
