//! Open-owners and lock-owners.

use crate::client::Client;
use crate::error::{Result, StateError};
use crate::fs_store::Fsid;
use crate::ids::{ClientId, PID_MASK};
use crate::registry::StateRegistry;
use crate::reply::{check_seqid, CachedReply, OwnerOp, SeqidCheck};
use crate::table::{Entry, EntryId, Held, Keyed};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Handle of an open-state in its filesystem's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateRef {
    /// Filesystem holding the state
    pub fsid: Fsid,
    /// Entry id in that filesystem's open-state table
    pub id: EntryId,
}

/// One (client, open-owner token) pair.
#[derive(Debug)]
pub struct OpenOwner {
    /// Owning client
    pub clientid: ClientId,
    /// Opaque owner token from the client
    pub owner: Vec<u8>,
    pub(crate) client: Held<Client>,
    /// Last processed sequence
    pub open_seqid: u32,
    /// First OPEN not confirmed yet
    pub need_confirm: bool,
    /// Skip the next sequence check; the client never learned the
    /// stateid it would have confirmed
    pub postpone_confirm: bool,
    /// Reply to the last sequenced operation, for replays
    pub reply: Option<CachedReply>,
    /// Filehandle of the last OPEN, restored on replay
    pub reply_fh: Vec<u8>,
    pub(crate) states: Vec<StateRef>,
    /// Serializes sequence-mutating operations of this owner
    pub(crate) sequence: Arc<Mutex<()>>,
}

impl Keyed for OpenOwner {
    type Key = (ClientId, Vec<u8>);

    fn key(&self) -> (ClientId, Vec<u8>) {
        (self.clientid, self.owner.clone())
    }
}

/// One (client, lock-owner token) pair. Its entry id doubles as the pid
/// presented to the local lock manager.
#[derive(Debug)]
pub struct LockOwner {
    /// Owning client
    pub clientid: ClientId,
    /// Opaque owner token from the client
    pub owner: Vec<u8>,
    pub(crate) client: Held<Client>,
    /// Pid presented to the lock manager
    pub pid: u32,
}

impl Keyed for LockOwner {
    type Key = (ClientId, Vec<u8>);

    fn key(&self) -> (ClientId, Vec<u8>) {
        (self.clientid, self.owner.clone())
    }
}

/// Whether a failed sequenced operation still consumes the owner's seqid.
///
/// Stale identifiers, bad stateids, bad seqids and resource exhaustion
/// leave the sequence alone; every other outcome advances it and is cached.
pub fn advances_seqid(err: &StateError) -> bool {
    !matches!(
        err,
        StateError::BadSeqid
            | StateError::BadStateId
            | StateError::Unconfirmed
            | StateError::StaleClientId
            | StateError::StaleStateId
            | StateError::Resource { .. }
    )
}

impl StateRegistry {
    /// Finds or creates the open-owner `owner` of `client`. A new owner
    /// starts unconfirmed with `seqid` as its last processed sequence.
    pub(crate) fn find_or_create_open_owner(
        &self,
        client: &Held<Client>,
        clientid: ClientId,
        owner: &[u8],
        seqid: u32,
    ) -> Result<(Held<OpenOwner>, bool)> {
        let key = (clientid, owner.to_vec());
        let (oo, created) = self.open_owners.find_or_create(&key, |_| true, |_| {
            Some(OpenOwner {
                clientid,
                owner: owner.to_vec(),
                client: client.clone(),
                open_seqid: seqid,
                need_confirm: true,
                postpone_confirm: false,
                reply: None,
                reply_fh: Vec::new(),
                states: Vec::new(),
                sequence: Arc::new(Mutex::new(())),
            })
        })?;
        if created {
            client.lock().open_owners.push(oo.id());
            debug!(clientid = %clientid, owner = oo.id(), "open-owner created");
        }
        Ok((oo, created))
    }

    /// Looks up an existing open-owner.
    pub fn find_open_owner(&self, clientid: ClientId, owner: &[u8]) -> Option<Held<OpenOwner>> {
        self.open_owners
            .find(&(clientid, owner.to_vec()), |_| true)
    }

    /// Checks `seqid` against the owner's last processed sequence and
    /// renews the client's lease when it is the next one.
    pub fn check_open_seqid(&self, oo: &Held<OpenOwner>, seqid: u32, op: OwnerOp) -> SeqidCheck {
        let (rc, client) = {
            let o = oo.lock();
            (
                check_seqid(o.open_seqid, o.reply.as_ref(), seqid, op),
                o.client.clone(),
            )
        };
        if rc == SeqidCheck::Okay {
            self.update_lease(&client);
        }
        rc
    }

    /// Advances the owner's sequence and caches `reply` for replays.
    pub fn update_open_sequence(&self, oo: &Held<OpenOwner>, reply: CachedReply) {
        let mut o = oo.lock();
        o.open_seqid = o.open_seqid.wrapping_add(1);
        o.reply = Some(reply);
    }

    /// Caches `reply` without advancing the sequence.
    pub(crate) fn update_open_reply(&self, oo: &Held<OpenOwner>, reply: CachedReply) {
        oo.lock().reply = Some(reply);
    }

    pub(crate) fn owner_client(&self, oo: &Held<OpenOwner>) -> Held<Client> {
        oo.lock().client.clone()
    }

    /// Finds or creates the lock-owner `owner` of `client`.
    pub(crate) fn find_or_create_lock_owner(
        &self,
        client: &Held<Client>,
        clientid: ClientId,
        owner: &[u8],
    ) -> Result<(Held<LockOwner>, bool)> {
        let key = (clientid, owner.to_vec());
        self.lock_owners.find_or_create(&key, |_| true, |id| {
            Some(LockOwner {
                clientid,
                owner: owner.to_vec(),
                client: client.clone(),
                pid: id & PID_MASK,
            })
        })
    }

    /// Looks up a lock-owner by the pid handed to the lock manager.
    pub fn find_lock_owner_by_pid(&self, pid: u32) -> Option<Held<LockOwner>> {
        self.lock_owners.get(pid)
    }

    /// Looks up an existing lock-owner.
    pub fn find_lock_owner(&self, clientid: ClientId, owner: &[u8]) -> Option<Held<LockOwner>> {
        self.lock_owners
            .find(&(clientid, owner.to_vec()), |_| true)
    }

    pub(crate) fn open_owner_expiry(&self, entry: &Entry<OpenOwner>) -> bool {
        if entry.is_invalid() {
            return true;
        }
        let idle = self.now().saturating_sub(entry.time_rele());
        idle > self.lease_secs().saturating_add(self.grace_period_secs())
    }

    pub(crate) fn open_owner_destroy(&self, entry: &Entry<OpenOwner>) {
        let client = entry.lock().client.clone();
        let id = entry.id();
        client.lock().open_owners.retain(|o| *o != id);
    }

    /// Lock-owners carry no replay cache, so they are freed as soon as
    /// nothing references them.
    pub(crate) fn lock_owner_expiry(&self, _entry: &Entry<LockOwner>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_do_not_advance() {
        assert!(!advances_seqid(&StateError::BadSeqid));
        assert!(!advances_seqid(&StateError::BadStateId));
        assert!(!advances_seqid(&StateError::StaleStateId));
        assert!(!advances_seqid(&StateError::StaleClientId));
    }

    #[test]
    fn test_operation_failures_advance() {
        assert!(advances_seqid(&StateError::ShareDenied));
        assert!(advances_seqid(&StateError::Denied));
        assert!(advances_seqid(&StateError::Grace));
        assert!(advances_seqid(&StateError::Expired));
        assert!(advances_seqid(&StateError::OldStateId));
    }

    #[test]
    fn test_unreferenced_lock_owner_freed_before_open_owner() {
        use crate::file::{SHARE_ACCESS_READ, SHARE_DENY_NONE};
        use crate::registry::TableKind;
        use crate::state::{LockArgs, LockOutcome, Locker, Sequenced};
        use crate::test_support::{fh, Harness, FSID};
        use crate::volume::LockRange;

        let h = Harness::new();
        let a = h.client("a");
        let f = fh("f");
        let sid = h.open_confirmed(a, "o", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);
        let outcome = h
            .registry
            .lock(&LockArgs {
                fsid: FSID,
                fh: f.clone(),
                locker: Locker::NewOwner {
                    open_stateid: sid,
                    open_seqid: 2,
                    lock_owner: b"lo".to_vec(),
                    lock_seqid: 0,
                },
                range: LockRange {
                    offset: 0,
                    length: 10,
                    write: false,
                },
                reclaim: false,
            })
            .unwrap();
        assert!(matches!(outcome, Sequenced::Done(LockOutcome::Granted(_))));
        assert_eq!(h.registry.lock_owner_count(), 1);
        // held by its lock-state
        assert_eq!(h.registry.reap_table(TableKind::LockOwner), 0);

        h.registry.clean_state(FSID, None).unwrap();
        assert_eq!(h.registry.reap_table(TableKind::LockState), 1);
        assert_eq!(h.registry.reap_table(TableKind::LockOwner), 1);
        assert_eq!(h.registry.lock_owner_count(), 0);

        assert_eq!(h.registry.reap_table(TableKind::OpenState), 1);
        assert_eq!(h.registry.reap_table(TableKind::OpenOwner), 0);
        assert_eq!(h.registry.open_owner_count(), 1);
    }
}
