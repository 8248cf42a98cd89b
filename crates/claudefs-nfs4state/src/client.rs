//! Clients: registration, confirmation, lease renewal and teardown.

use crate::error::{Result, StateError};
use crate::grace::GraceGeneration;
use crate::ids::{ClientId, ConfirmVerifier, Verifier};
use crate::lease::Lease;
use crate::registry::StateRegistry;
use crate::stable::{leaf_name, ClientRecord, StableDir};
use crate::table::{Entry, EntryId, Held, Keyed};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// SETCLIENTID attempts before asking the client to retry.
const SETCLIENTID_RETRIES: usize = 8;

/// Long-form client identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsClientId {
    /// Boot verifier; changes when the client reboots
    pub verifier: Verifier,
    /// Opaque client-chosen identity string
    pub id: Vec<u8>,
}

/// Callback channel the client asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackInfo {
    /// RPC program number to call back on
    pub program: u32,
    /// Transport netid, e.g. "tcp"
    pub netid: String,
    /// Universal address of the callback service
    pub addr: String,
    /// Callback identifier echoed in CB requests
    pub ident: u32,
}

/// Health of the callback channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallbackState {
    /// Not checked yet
    #[default]
    Unknown,
    /// Last callback check answered
    Up,
    /// Last callback check failed
    Down,
}

/// SETCLIENTID arguments.
#[derive(Debug, Clone)]
pub struct SetClientIdArgs {
    /// Long-form identity of the caller
    pub client: NfsClientId,
    /// Requested callback channel
    pub callback: CallbackInfo,
    /// Authenticated principal of the caller
    pub principal: String,
    /// Caller's network address
    pub addr: SocketAddr,
    /// Whether the client can follow filesystem referrals
    pub supports_referrals: bool,
}

/// SETCLIENTID result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetClientIdReply {
    /// Short-hand clientid for the registration
    pub clientid: ClientId,
    /// Verifier the client must echo in SETCLIENTID_CONFIRM
    pub confirm: Verifier,
}

/// A client registration.
#[derive(Debug)]
pub struct Client {
    /// Short-hand id handed to the client
    pub clientid: ClientId,
    /// Long-form identity this record was created for
    pub nfs_client: NfsClientId,
    /// Principal that registered the client
    pub principal: String,
    /// Address the registration came from
    pub addr: SocketAddr,
    /// Still waiting for SETCLIENTID_CONFIRM
    pub need_confirm: bool,
    /// Verifier expected by SETCLIENTID_CONFIRM
    pub confirm_verf: ConfirmVerifier,
    /// Confirmed record this unconfirmed one replaces on confirmation
    pub(crate) cp_confirmed: Option<Held<Client>>,
    /// Lease renewed by every stateful operation
    pub lease: Lease,
    /// Stable-storage leaf written for this client
    pub ss_leaf: Option<String>,
    /// Delete the stable-storage record when the client is destroyed
    pub ss_remove: bool,
    pub(crate) open_owners: Vec<EntryId>,
    /// Recovered from stable storage; may reclaim during grace
    pub can_reclaim: bool,
    /// Callback channel in use
    pub callback: CallbackInfo,
    /// Last known health of the callback channel
    pub cb_state: CallbackState,
    /// Callback path went down and RENEW has not reported it yet
    pub cb_down_unreported: bool,
    pub(crate) grace: Arc<GraceGeneration>,
    /// Lock-manager system id of this client
    pub sysid: u32,
    /// Every lock of this client has been released at once
    pub unlksys_completed: bool,
    /// When a filesystem holding this client's state moved away
    pub lease_moved_at: Option<u64>,
    /// Lease sweep already removed this client's state
    pub state_removed: bool,
}

impl Client {
    /// True once SETCLIENTID_CONFIRM succeeded.
    pub fn is_confirmed(&self) -> bool {
        !self.need_confirm
    }

    /// Generation this client belongs to.
    pub fn grace_generation(&self) -> u32 {
        self.grace.id()
    }
}

impl Keyed for Client {
    type Key = Vec<u8>;

    fn key(&self) -> Vec<u8> {
        self.nfs_client.id.clone()
    }
}

/// Address of clients that cannot follow referrals.
#[derive(Debug, Clone)]
pub struct ClientIp {
    /// Client address
    pub addr: IpAddr,
}

impl Keyed for ClientIp {
    type Key = IpAddr;

    fn key(&self) -> IpAddr {
        self.addr
    }
}

impl StateRegistry {
    /// SETCLIENTID.
    pub fn set_client_id(&self, args: &SetClientIdArgs) -> Result<SetClientIdReply> {
        self.track_client_ip(args.addr.ip(), args.supports_referrals)?;

        for _ in 0..SETCLIENTID_RETRIES {
            let (cp, created) = self.find_client(args, true, None)?.ok_or_else(|| {
                StateError::ServerFault {
                    reason: "client lookup failed".to_string(),
                }
            })?;

            if created {
                let mut c = cp.lock();
                c.callback = args.callback.clone();
                info!(clientid = %c.clientid, addr = %c.addr, "client registered");
                return Ok(SetClientIdReply {
                    clientid: c.clientid,
                    confirm: c.confirm_verf.to_bytes(),
                });
            }

            if self.client_expired(&cp) {
                self.client_close(&cp);
                continue;
            }

            let (need_confirm, principal, verifier) = {
                let c = cp.lock();
                (c.need_confirm, c.principal.clone(), c.nfs_client.verifier)
            };

            let confirmed = if need_confirm {
                if !Self::retire_unconfirmed(&cp) {
                    continue;
                }
                None
            } else {
                if principal != args.principal {
                    return Err(StateError::ClidInUse);
                }
                if verifier == args.client.verifier {
                    return Ok(Self::update_callback(&cp, args));
                }
                if let Some((unconfirmed, _)) = self.find_client(args, false, Some(&cp))? {
                    if !Self::retire_unconfirmed(&unconfirmed) {
                        continue;
                    }
                }
                Some(cp)
            };

            let Some((newcp, created)) = self.find_client(args, true, confirmed.as_ref())? else {
                continue;
            };
            if !created {
                continue;
            }
            let mut c = newcp.lock();
            c.callback = args.callback.clone();
            c.cp_confirmed = confirmed;
            info!(clientid = %c.clientid, addr = %c.addr, "client re-registered, awaiting confirm");
            return Ok(SetClientIdReply {
                clientid: c.clientid,
                confirm: c.confirm_verf.to_bytes(),
            });
        }
        Err(StateError::Delay)
    }

    /// Invalidates an unconfirmed record; false if it got confirmed
    /// meanwhile.
    fn retire_unconfirmed(cp: &Held<Client>) -> bool {
        let c = cp.lock();
        if !c.need_confirm {
            return false;
        }
        cp.invalidate();
        true
    }

    fn update_callback(cp: &Held<Client>, args: &SetClientIdArgs) -> SetClientIdReply {
        let mut c = cp.lock();
        c.callback = args.callback.clone();
        c.cb_state = CallbackState::Unknown;
        c.confirm_verf = c.confirm_verf.next();
        debug!(clientid = %c.clientid, "callback update");
        SetClientIdReply {
            clientid: c.clientid,
            confirm: c.confirm_verf.to_bytes(),
        }
    }

    /// SETCLIENTID_CONFIRM.
    pub fn confirm_client_id(
        &self,
        clientid: ClientId,
        confirm: Verifier,
        principal: &str,
    ) -> Result<()> {
        let cp = match self.find_client_by_id(clientid, true) {
            Some(cp) => cp,
            None => return Err(self.check_clientid(clientid, true)),
        };

        let current = self.grace.current();
        let (to_close, leaf, record) = {
            let mut c = cp.lock();
            if c.principal != principal {
                return Err(StateError::ClidInUse);
            }
            if c.confirm_verf.to_bytes() != confirm {
                return Err(StateError::StaleClientId);
            }
            c.need_confirm = false;
            let to_close = c.cp_confirmed.take();
            if !Arc::ptr_eq(&c.grace, &current) {
                c.grace = current;
            }
            let leaf = leaf_name(c.addr.ip(), c.clientid);
            c.ss_leaf = Some(leaf.clone());
            let record = ClientRecord {
                verifier: c.nfs_client.verifier,
                id: c.nfs_client.id.clone(),
            };
            (to_close, leaf, record)
        };

        let paths = self.grace.all_paths();
        if self.storage.write_record(&paths, &leaf, &record) == 0 && !paths.is_empty() {
            warn!(clientid = %clientid, "client record not persisted; reclaim after restart will fail");
        }

        if let Some(old) = to_close {
            old.lock().ss_remove = true;
            self.client_close(&old);
        }

        let can_reclaim = self
            .grace
            .check_reclaim(&record.id, self.now(), &self.storage);
        {
            let mut c = cp.lock();
            c.lease.renew(self.now());
            c.can_reclaim = can_reclaim;
        }
        info!(clientid = %clientid, can_reclaim, "client confirmed");
        Ok(())
    }

    /// RENEW.
    pub fn renew(&self, clientid: ClientId) -> Result<()> {
        let cp = match self.find_client_by_id(clientid, false) {
            Some(cp) => cp,
            None => return Err(self.check_clientid(clientid, false)),
        };
        if self.client_expired(&cp) {
            return Err(StateError::Expired);
        }
        let moved = self.lease_moved(&cp);
        let now = self.now();
        let mut c = cp.lock();
        c.lease.renew(now);
        if moved {
            return Err(StateError::LeaseMoved);
        }
        if c.cb_state == CallbackState::Down && c.cb_down_unreported {
            c.cb_down_unreported = false;
            return Err(StateError::CbPathDown);
        }
        Ok(())
    }

    /// Finds the record for `args`' long-form id, optionally creating it.
    /// With `hide`, that record is hidden for the duration of the search
    /// so a second record for the same id can be found or created.
    pub(crate) fn find_client(
        &self,
        args: &SetClientIdArgs,
        create: bool,
        hide: Option<&Held<Client>>,
    ) -> Result<Option<(Held<Client>, bool)>> {
        match hide {
            Some(old) => {
                let _w = self.findclient.write();
                old.hide();
                let res = self.lookup_client(args, create);
                old.unhide();
                res
            }
            None => {
                let _r = self.findclient.read();
                self.lookup_client(args, create)
            }
        }
    }

    fn lookup_client(
        &self,
        args: &SetClientIdArgs,
        create: bool,
    ) -> Result<Option<(Held<Client>, bool)>> {
        let key = args.client.id.clone();
        if !create {
            return Ok(self.clients.find(&key, |_| true).map(|h| (h, false)));
        }
        let now = self.now();
        let grace = self.grace.current();
        let start = self.start_time;
        let node = self.node;
        self.clients
            .find_or_create(&key, |_| true, |id| {
                Some(Client {
                    clientid: ClientId::pack(start, &node, id),
                    nfs_client: args.client.clone(),
                    principal: args.principal.clone(),
                    addr: args.addr,
                    need_confirm: true,
                    confirm_verf: ConfirmVerifier::new(id),
                    cp_confirmed: None,
                    lease: Lease::new(now),
                    ss_leaf: None,
                    ss_remove: false,
                    open_owners: Vec::new(),
                    can_reclaim: false,
                    callback: CallbackInfo::default(),
                    cb_state: CallbackState::Unknown,
                    cb_down_unreported: false,
                    grace,
                    sysid: id,
                    unlksys_completed: false,
                    lease_moved_at: None,
                    state_removed: false,
                })
            })
            .map(Some)
    }

    /// Resolves a short-form clientid. Unconfirmed records are returned
    /// only when `find_unconfirmed` is set.
    pub fn find_client_by_id(&self, clientid: ClientId, find_unconfirmed: bool) -> Option<Held<Client>> {
        let _r = self.findclient.read();
        let cp = self.clients.get(clientid.counter())?;
        let ok = {
            let c = cp.lock();
            c.clientid == clientid && (find_unconfirmed || !c.need_confirm)
        };
        ok.then_some(cp)
    }

    /// Classifies a clientid that did not resolve.
    pub fn check_clientid(&self, clientid: ClientId, confirming: bool) -> StateError {
        if self.grace.current().in_grace(self.now()) {
            return StateError::StaleClientId;
        }
        let known = self
            .mc_verifiers
            .contains(clientid.node_id(), clientid.start_time());
        if !confirming && known {
            StateError::Expired
        } else {
            StateError::StaleClientId
        }
    }

    /// Resolves a clientid presented with a state-creating request,
    /// closing the client if its lease lapsed.
    pub(crate) fn active_client(&self, clientid: ClientId) -> Result<Held<Client>> {
        let cp = match self.find_client_by_id(clientid, false) {
            Some(cp) => cp,
            None => return Err(self.check_clientid(clientid, false)),
        };
        if self.client_expired(&cp) {
            self.client_close(&cp);
            return Err(StateError::Expired);
        }
        Ok(cp)
    }

    pub(crate) fn client_expired(&self, cp: &Held<Client>) -> bool {
        let now = self.now();
        cp.lock().lease.is_expired(now, self.lease_secs())
    }

    pub(crate) fn update_lease(&self, cp: &Held<Client>) {
        let now = self.now();
        cp.lock().lease.renew(now);
    }

    /// True while a lease-moved marker is outstanding. Markers lapse after
    /// two lease periods.
    pub(crate) fn lease_moved(&self, cp: &Held<Client>) -> bool {
        let now = self.now();
        let limit = self.lease_secs().saturating_mul(2);
        let mut c = cp.lock();
        match c.lease_moved_at {
            Some(at) if now.saturating_sub(at) <= limit => true,
            Some(_) => {
                c.lease_moved_at = None;
                false
            }
            None => false,
        }
    }

    /// Clears a client's lease-moved marker.
    pub fn ack_lease_moved(&self, clientid: ClientId) -> Result<()> {
        let cp = self
            .find_client_by_id(clientid, false)
            .ok_or_else(|| self.check_clientid(clientid, false))?;
        cp.lock().lease_moved_at = None;
        Ok(())
    }

    /// Marks the client unfindable and closes all of its state.
    pub fn client_close(&self, cp: &Held<Client>) {
        cp.invalidate();
        self.client_state_remove(cp);
    }

    /// Closes every open of every open-owner of the client, releasing
    /// locks and share reservations.
    pub fn client_state_remove(&self, cp: &Held<Client>) {
        let owners = {
            let mut c = cp.lock();
            c.state_removed = true;
            c.open_owners.clone()
        };
        for id in owners {
            if let Some(oo) = self.open_owners.get_any(id) {
                self.free_opens(&oo, true, true);
            }
        }
    }

    /// Forces lease expiry of every client registered from `addr`.
    /// Returns how many clients were marked.
    pub fn clear_client_state(&self, addr: IpAddr) -> usize {
        let mut marked = 0;
        self.clients.walk(|cp| {
            let mut c = cp.lock();
            if c.addr.ip() == addr {
                c.lease.force_expire();
                marked += 1;
            }
        });
        info!(addr = %addr, marked, "cleared client state");
        marked
    }

    /// Forces lease expiry of one client.
    pub fn expire_client(&self, clientid: ClientId) -> Result<()> {
        let cp = self
            .find_client_by_id(clientid, true)
            .ok_or(StateError::StaleClientId)?;
        cp.lock().lease.force_expire();
        Ok(())
    }

    /// Records the callback channel as down; the next RENEW reports it.
    pub fn mark_callback_down(&self, clientid: ClientId) -> Result<()> {
        let cp = self
            .find_client_by_id(clientid, false)
            .ok_or_else(|| self.check_clientid(clientid, false))?;
        let mut c = cp.lock();
        if c.cb_state != CallbackState::Down {
            c.cb_state = CallbackState::Down;
            c.cb_down_unreported = true;
        }
        Ok(())
    }

    /// Records the callback channel as working.
    pub fn mark_callback_up(&self, clientid: ClientId) -> Result<()> {
        let cp = self
            .find_client_by_id(clientid, false)
            .ok_or_else(|| self.check_clientid(clientid, false))?;
        let mut c = cp.lock();
        c.cb_state = CallbackState::Up;
        c.cb_down_unreported = false;
        Ok(())
    }

    /// Whether the client at `addr` can follow referrals.
    pub fn client_supports_referrals(&self, addr: IpAddr) -> bool {
        self.client_ips.find(&addr, |_| true).is_none()
    }

    fn track_client_ip(&self, addr: IpAddr, supports_referrals: bool) -> Result<()> {
        if supports_referrals {
            if let Some(ci) = self.client_ips.find(&addr, |_| true) {
                ci.invalidate();
            }
        } else {
            self.client_ips
                .find_or_create(&addr, |_| true, |_| Some(ClientIp { addr }))?;
        }
        Ok(())
    }

    /// Expired clients whose state the lease sweep has not removed yet.
    pub(crate) fn sweep_expired_clients(&self) -> usize {
        let now = self.now();
        let lease = self.lease_secs();
        let mut expired = Vec::new();
        self.clients.walk(|cp| {
            let c = cp.lock();
            if !c.state_removed && !c.open_owners.is_empty() && c.lease.is_expired(now, lease) {
                expired.push(cp.clone());
            }
        });
        for cp in &expired {
            debug!(entry = cp.id(), "lease expired, removing client state");
            self.client_state_remove(cp);
        }
        expired.len()
    }

    pub(crate) fn client_expiry(&self, entry: &Entry<Client>) -> bool {
        let now = self.now();
        let lease = self.lease_secs();
        let mut c = entry.lock();
        if entry.is_invalid() {
            c.ss_remove = true;
            return true;
        }
        let expired = c.lease.is_expired(now, lease);
        if expired {
            c.ss_remove = true;
        }
        expired
    }

    pub(crate) fn client_destroy(&self, entry: &Entry<Client>) {
        let (clientid, leaf) = {
            let c = entry.lock();
            (c.clientid, if c.ss_remove { c.ss_leaf.clone() } else { None })
        };
        if let Some(leaf) = leaf {
            self.storage
                .remove_leaf(&self.grace.all_paths(), StableDir::State, &leaf);
        }
        info!(clientid = %clientid, "client destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stable::STATE_DIR;
    use crate::test_support::{setclientid_args, Harness, LEASE};

    #[test]
    fn test_confirm_persists_record() {
        let h = Harness::new();
        let reply = h.registry.set_client_id(&setclientid_args("a", 1)).unwrap();
        let leaf = leaf_name("10.0.0.1".parse().unwrap(), reply.clientid);
        let path = h.dir.path().join(STATE_DIR).join(&leaf);
        assert!(!path.exists());

        h.registry
            .confirm_client_id(reply.clientid, reply.confirm, "nfs")
            .unwrap();
        assert!(path.exists());
        assert!(h.registry.renew(reply.clientid).is_ok());
    }

    #[test]
    fn test_wrong_confirm_verifier_is_stale() {
        let h = Harness::new();
        let reply = h.registry.set_client_id(&setclientid_args("a", 1)).unwrap();
        let err = h
            .registry
            .confirm_client_id(reply.clientid, [9; 8], "nfs")
            .unwrap_err();
        assert!(matches!(err, StateError::StaleClientId));
    }

    #[test]
    fn test_other_principal_gets_clid_in_use() {
        let h = Harness::new();
        h.client("a");
        let mut args = setclientid_args("a", 2);
        args.principal = "intruder".to_string();
        assert!(matches!(h.registry.set_client_id(&args), Err(StateError::ClidInUse)));
    }

    #[test]
    fn test_same_verifier_is_callback_update() {
        let h = Harness::new();
        let clientid = h.client("a");
        let reply = h.registry.set_client_id(&setclientid_args("a", 1)).unwrap();
        assert_eq!(reply.clientid, clientid);
        h.registry
            .confirm_client_id(reply.clientid, reply.confirm, "nfs")
            .unwrap();
        assert_eq!(h.registry.client_count(), 1);
    }

    #[test]
    fn test_new_verifier_replaces_confirmed_client() {
        let h = Harness::new();
        let old = h.client("a");
        let reply = h.registry.set_client_id(&setclientid_args("a", 2)).unwrap();
        assert_ne!(reply.clientid, old);
        // the confirmed record keeps working until the replacement is confirmed
        assert!(h.registry.renew(old).is_ok());

        h.registry
            .confirm_client_id(reply.clientid, reply.confirm, "nfs")
            .unwrap();
        assert!(matches!(h.registry.renew(old), Err(StateError::Expired)));
        assert!(h.registry.renew(reply.clientid).is_ok());
    }

    #[test]
    fn test_lapsed_lease_is_expired() {
        let h = Harness::new();
        let clientid = h.client("a");
        h.clock.advance(LEASE + 1);
        assert!(matches!(h.registry.renew(clientid), Err(StateError::Expired)));
    }

    #[test]
    fn test_callback_down_reported_once() {
        let h = Harness::new();
        let clientid = h.client("a");
        h.registry.mark_callback_down(clientid).unwrap();
        assert!(matches!(h.registry.renew(clientid), Err(StateError::CbPathDown)));
        assert!(h.registry.renew(clientid).is_ok());
    }

    #[test]
    fn test_clear_client_state_by_address() {
        let h = Harness::new();
        let a = h.client("a");
        let b = h.client("b");
        assert_eq!(h.registry.clear_client_state("10.0.0.1".parse().unwrap()), 2);
        assert!(matches!(h.registry.renew(a), Err(StateError::Expired)));
        assert!(matches!(h.registry.renew(b), Err(StateError::Expired)));
    }

    #[test]
    fn test_unknown_clientid_classification() {
        let h = Harness::new();
        let start = h.registry.start_time();
        let node = h.registry.node();

        let foreign_epoch = ClientId::pack(start.wrapping_sub(1), &node, 77);
        assert!(matches!(h.registry.renew(foreign_epoch), Err(StateError::StaleClientId)));

        let this_epoch = ClientId::pack(start, &node, 77);
        assert!(matches!(h.registry.renew(this_epoch), Err(StateError::Expired)));
        assert!(matches!(
            h.registry.confirm_client_id(this_epoch, [0; 8], "nfs"),
            Err(StateError::StaleClientId)
        ));

        h.registry.start_grace();
        assert!(matches!(h.registry.renew(this_epoch), Err(StateError::StaleClientId)));
    }

    #[test]
    fn test_client_ip_tracks_referral_support() {
        let h = Harness::new();
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        let mut args = setclientid_args("a", 1);
        args.supports_referrals = false;
        h.registry.set_client_id(&args).unwrap();
        assert!(!h.registry.client_supports_referrals(addr));

        args.supports_referrals = true;
        h.registry.set_client_id(&args).unwrap();
        assert!(h.registry.client_supports_referrals(addr));
    }
}
