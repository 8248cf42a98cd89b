//! The state registry: owner of every state table and of the server's
//! grace generations.
//!
//! Client, client-ip and owner tables are global. Open, lock and delegation
//! states and files live in one [`FsStateStore`] per filesystem. Entry
//! points are spread over the per-entity modules as `impl StateRegistry`
//! blocks; this module holds construction, filesystem registration, grace
//! and recovery, and reaping.

use crate::client::{Client, ClientIp};
use crate::clock::Clock;
use crate::config::StateConfig;
use crate::error::{Result, StateError};
use crate::fs_store::{FsPhase, FsStateStore, Fsid, MAX_STATE_ID};
use crate::grace::{GraceChain, GraceGeneration};
use crate::ids::{id_time, MetaclusterVerifiers, NodeIdent, MAX_CLIENT_COUNTER, PID_MASK};
use crate::lock_order::LockRank;
use crate::owner::{LockOwner, OpenOwner};
use crate::stable::StableStorage;
use crate::table::{Held, Table};
use crate::volume::Volume;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The tables a reaper pass can sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    /// Client registrations
    Client,
    /// Addresses of clients without referral support
    ClientIp,
    /// Open-owners
    OpenOwner,
    /// Lock-owners
    LockOwner,
    /// Open-states of every filesystem
    OpenState,
    /// Lock-states of every filesystem
    LockState,
    /// Delegation-states of every filesystem
    Delegation,
    /// Files of every filesystem
    File,
}

impl TableKind {
    /// Every table, in the order a full pass reaps them: dependents before
    /// the entries they hold.
    pub const ALL: [TableKind; 8] = [
        TableKind::LockState,
        TableKind::OpenState,
        TableKind::Delegation,
        TableKind::File,
        TableKind::LockOwner,
        TableKind::OpenOwner,
        TableKind::Client,
        TableKind::ClientIp,
    ];

    /// Name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            TableKind::Client => "client",
            TableKind::ClientIp => "client_ip",
            TableKind::OpenOwner => "open_owner",
            TableKind::LockOwner => "lock_owner",
            TableKind::OpenState => "open_state",
            TableKind::LockState => "lock_state",
            TableKind::Delegation => "deleg_state",
            TableKind::File => "file",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Entries destroyed by one full reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapStats {
    /// Clients whose lapsed lease got their state removed
    pub leases_swept: usize,
    /// Lock-states destroyed
    pub lock_states: usize,
    /// Open-states destroyed
    pub open_states: usize,
    /// Delegation-states destroyed
    pub delegations: usize,
    /// Files destroyed
    pub files: usize,
    /// Lock-owners destroyed
    pub lock_owners: usize,
    /// Open-owners destroyed
    pub open_owners: usize,
    /// Clients destroyed
    pub clients: usize,
    /// Client addresses destroyed
    pub client_ips: usize,
}

impl ReapStats {
    /// Entries destroyed, not counting swept leases.
    pub fn total(&self) -> usize {
        self.lock_states
            + self.open_states
            + self.delegations
            + self.files
            + self.lock_owners
            + self.open_owners
            + self.clients
            + self.client_ips
    }
}

/// Server-wide NFSv4 state.
pub struct StateRegistry {
    config: StateConfig,
    clock: Arc<dyn Clock>,
    pub(crate) node: NodeIdent,
    /// Start time embedded in clientids, truncated to their 24-bit field
    pub(crate) start_time: u32,
    /// Full-width boot time; the epoch of every filesystem's stateids
    boot_epoch: u32,
    pub(crate) clients: Table<Client>,
    pub(crate) client_ips: Table<ClientIp>,
    pub(crate) open_owners: Table<OpenOwner>,
    pub(crate) lock_owners: Table<LockOwner>,
    filesystems: RwLock<HashMap<Fsid, Arc<FsStateStore>>>,
    pub(crate) grace: GraceChain,
    pub(crate) storage: StableStorage,
    pub(crate) mc_verifiers: MetaclusterVerifiers,
    /// Writers hide a confirmed client while its replacement is created
    pub(crate) findclient: RwLock<()>,
}

impl StateRegistry {
    /// Creates a registry for one server instance. Nothing is read from
    /// stable storage until [`StateRegistry::recover`].
    pub fn new(config: StateConfig, clock: Arc<dyn Clock>, storage: StableStorage) -> Self {
        let now = clock.now_secs();
        let start_time = id_time(now);
        let boot_epoch = u32::try_from(now).unwrap_or(u32::MAX);
        let node = NodeIdent::from_config(&config.node);
        let mc_verifiers = MetaclusterVerifiers::new();
        mc_verifiers.insert(node.node_id(), start_time);
        let grace = GraceChain::new(config.grace_period_secs(), config.all_dss_paths());

        info!(
            start_time,
            boot_epoch,
            node = node.node_id(),
            lease = config.lease_secs,
            "state registry created"
        );
        Self {
            clients: Table::new("client", LockRank::Client, clock.clone(), MAX_CLIENT_COUNTER),
            client_ips: Table::new("client_ip", LockRank::ClientIp, clock.clone(), MAX_STATE_ID),
            open_owners: Table::new("open_owner", LockRank::OpenOwner, clock.clone(), MAX_STATE_ID),
            lock_owners: Table::new("lock_owner", LockRank::LockOwner, clock.clone(), PID_MASK),
            filesystems: RwLock::new(HashMap::new()),
            grace,
            storage,
            mc_verifiers,
            findclient: RwLock::new(()),
            config,
            clock,
            node,
            start_time,
            boot_epoch,
        }
    }

    /// Configuration this registry was created with.
    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    /// Cluster identity stamped into every identifier.
    pub fn node(&self) -> NodeIdent {
        self.node
    }

    /// 24-bit start time embedded in clientids minted by this instance.
    pub fn start_time(&self) -> u32 {
        self.start_time
    }

    /// Epoch embedded in stateids minted by this instance. Unlike
    /// [`StateRegistry::start_time`] it is not truncated, so it grows
    /// across restarts.
    pub fn boot_epoch(&self) -> u32 {
        self.boot_epoch
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_secs()
    }

    /// Lease period in seconds.
    pub fn lease_secs(&self) -> u64 {
        self.config.lease_secs
    }

    /// Length of a grace window in seconds.
    pub fn grace_period_secs(&self) -> u64 {
        self.config.grace_period_secs()
    }

    // Filesystems

    /// Registers a filesystem and returns its state store. Re-adding a
    /// known filesystem returns the existing store.
    pub fn add_filesystem(&self, fsid: Fsid, volume: Arc<dyn Volume>) -> Arc<FsStateStore> {
        let mut filesystems = self.filesystems.write();
        filesystems
            .entry(fsid)
            .or_insert_with(|| {
                info!(fsid = %fsid, epoch = self.boot_epoch, "filesystem added");
                Arc::new(FsStateStore::new(fsid, self.boot_epoch, self.clock.clone(), volume))
            })
            .clone()
    }

    /// Drops a filesystem after closing all of its state.
    pub fn remove_filesystem(&self, fsid: Fsid) -> Result<()> {
        self.clean_state(fsid, None)?;
        self.filesystems.write().remove(&fsid);
        info!(fsid = %fsid, "filesystem removed");
        Ok(())
    }

    pub(crate) fn store(&self, fsid: Fsid) -> Option<Arc<FsStateStore>> {
        self.filesystems.read().get(&fsid).cloned()
    }

    /// The state store of `fsid`.
    pub fn filesystem(&self, fsid: Fsid) -> Result<Arc<FsStateStore>> {
        self.store(fsid)
            .ok_or(StateError::UnknownFilesystem { fsid: fsid.0 })
    }

    /// The state store of `fsid`, if requests may touch it. A moved
    /// filesystem refuses everything; a frozen one refuses new state.
    pub(crate) fn admit_filesystem(&self, fsid: Fsid, mutating: bool) -> Result<Arc<FsStateStore>> {
        let fs = self.filesystem(fsid)?;
        match fs.phase() {
            FsPhase::Moved => Err(StateError::Moved),
            FsPhase::Frozen if mutating => Err(StateError::Delay),
            _ => Ok(fs),
        }
    }

    fn stores(&self) -> Vec<Arc<FsStateStore>> {
        self.filesystems.read().values().cloned().collect()
    }

    /// Registered filesystems, sorted.
    pub fn filesystem_ids(&self) -> Vec<Fsid> {
        let mut ids: Vec<Fsid> = self.filesystems.read().keys().copied().collect();
        ids.sort();
        ids
    }

    // Grace and recovery

    /// Reads the client records of the current generation's paths into its
    /// old-state list. Returns the number of distinct clients found.
    pub fn recover(&self) -> usize {
        let current = self.grace.current();
        self.recover_into(&current)
    }

    fn recover_into(&self, generation: &GraceGeneration) -> usize {
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for path in generation.dss_paths() {
            if let Err(e) = self.storage.prepare(path) {
                warn!(path = %path.display(), error = %e, "stable storage unavailable");
                continue;
            }
            let found = self
                .storage
                .scan_old(path)
                .into_iter()
                .chain(self.storage.drain_current(path));
            for rec in found {
                if generation.oldstate_contains(&rec.record.id) {
                    continue;
                }
                if seen.insert(rec.record.id.clone()) {
                    records.push(rec);
                }
            }
        }
        let recovered = records.len();
        generation.add_oldstate(records);
        info!(generation = generation.id(), recovered, "recovered client records");
        recovered
    }

    /// Takes over the clients of a failed node: a new generation over
    /// `paths` is created, recovered and put in grace.
    pub fn failover(&self, paths: Vec<PathBuf>) -> usize {
        let generation = self.grace.new_generation(self.grace_period_secs(), paths);
        let recovered = self.recover_into(&generation);
        generation.start(self.now());
        info!(generation = generation.id(), recovered, "failover complete");
        recovered
    }

    /// Registers a start time of another node so its clientids count as
    /// expired rather than stale.
    pub fn import_verifier(&self, node_id: u16, start_time: u32) {
        self.mc_verifiers.insert(node_id, start_time);
        debug!(node_id, start_time, "imported node verifier");
    }

    /// Starts the grace window of every generation that never started.
    pub fn start_grace(&self) {
        self.grace.start_pending(self.now());
    }

    /// Restarts the grace window of every generation still in grace.
    pub fn reset_grace(&self) {
        self.grace.reset_in_grace(self.now());
    }

    /// True while the current generation is in grace.
    pub fn in_grace(&self) -> bool {
        self.grace.current().in_grace(self.now())
    }

    /// Puts one filesystem in grace, e.g. after it migrated in.
    pub fn fs_grace_start(&self, fsid: Fsid) -> Result<()> {
        let fs = self.filesystem(fsid)?;
        fs.grace_start(self.now(), self.grace_period_secs());
        info!(fsid = %fsid, "filesystem grace started");
        Ok(())
    }

    /// True while the filesystem-local grace window is open.
    pub fn fs_in_grace(&self, fsid: Fsid) -> Result<bool> {
        Ok(self.filesystem(fsid)?.in_grace(self.now()))
    }

    /// True when either the filesystem or the client's generation is in
    /// grace.
    pub(crate) fn client_in_grace(&self, cp: &Held<Client>, fs: &FsStateStore) -> bool {
        let now = self.now();
        if fs.in_grace(now) {
            return true;
        }
        let generation = cp.lock().grace.clone();
        generation.in_grace(now)
    }

    /// Number of generations, the current one included.
    pub fn generation_count(&self) -> usize {
        self.grace.len()
    }

    /// Clears every generation's old state.
    pub fn shutdown(&self) {
        self.grace.clear_all(&self.storage);
        info!("state registry shut down");
    }

    // Reaping

    /// Removes the state of every client whose lease lapsed.
    pub fn sweep_leases(&self) -> usize {
        self.sweep_expired_clients()
    }

    /// One reaper pass over one table. Per-filesystem tables are swept on
    /// every filesystem.
    pub fn reap_table(&self, kind: TableKind) -> usize {
        match kind {
            TableKind::Client => self
                .clients
                .reap(|e| self.client_expiry(e), |e| self.client_destroy(e)),
            TableKind::ClientIp => self.client_ips.reap(|_| false, |_| {}),
            TableKind::OpenOwner => self
                .open_owners
                .reap(|e| self.open_owner_expiry(e), |e| self.open_owner_destroy(e)),
            TableKind::LockOwner => self
                .lock_owners
                .reap(|e| self.lock_owner_expiry(e), |_| {}),
            TableKind::OpenState => self.reap_stores(|fs| {
                fs.states
                    .reap(|e| self.open_state_expiry(e), |e| self.open_state_destroy(fs, e))
            }),
            TableKind::LockState => self.reap_stores(|fs| {
                fs.lock_states
                    .reap(|e| self.lock_state_expiry(e), |e| self.lock_state_destroy(fs, e))
            }),
            TableKind::Delegation => self.reap_stores(|fs| {
                fs.delegations
                    .reap(|e| self.deleg_expiry(e), |e| self.deleg_destroy(e))
            }),
            TableKind::File => self.reap_stores(|fs| {
                fs.files
                    .reap(|e| self.file_expiry(e), |e| self.file_destroy(fs, e))
            }),
        }
    }

    fn reap_stores<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&FsStateStore) -> usize,
    {
        self.stores().iter().map(|fs| f(fs.as_ref())).sum()
    }

    /// Sweeps lapsed leases, then reaps every table once.
    pub fn reap_once(&self) -> ReapStats {
        let mut stats = ReapStats {
            leases_swept: self.sweep_leases(),
            ..ReapStats::default()
        };
        for kind in TableKind::ALL {
            let n = self.reap_table(kind);
            match kind {
                TableKind::LockState => stats.lock_states = n,
                TableKind::OpenState => stats.open_states = n,
                TableKind::Delegation => stats.delegations = n,
                TableKind::File => stats.files = n,
                TableKind::LockOwner => stats.lock_owners = n,
                TableKind::OpenOwner => stats.open_owners = n,
                TableKind::Client => stats.clients = n,
                TableKind::ClientIp => stats.client_ips = n,
            }
        }
        debug!(reaped = stats.total(), swept = stats.leases_swept, "reaper pass");
        stats
    }

    /// Reaper interval of `kind` in seconds.
    pub fn reap_interval_secs(&self, kind: TableKind) -> u64 {
        let t = &self.config.cache_times;
        let units = match kind {
            TableKind::Client | TableKind::ClientIp => t.client,
            TableKind::OpenOwner => t.open_owner,
            TableKind::LockOwner => t.lock_owner,
            TableKind::OpenState => t.open_state,
            TableKind::LockState => t.lock_state,
            TableKind::Delegation => t.delegation,
            TableKind::File => t.file,
        };
        self.lease_secs().saturating_mul(units.max(1))
    }

    // Counts, including entries awaiting the reaper

    /// Client entries, including unconfirmed and invalid ones.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Client address entries.
    pub fn client_ip_count(&self) -> usize {
        self.client_ips.len()
    }

    /// Open-owner entries, including invalid ones.
    pub fn open_owner_count(&self) -> usize {
        self.open_owners.len()
    }

    /// Lock-owner entries, including invalid ones.
    pub fn lock_owner_count(&self) -> usize {
        self.lock_owners.len()
    }
}

impl fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRegistry")
            .field("node", &self.node)
            .field("start_time", &self.start_time)
            .field("boot_epoch", &self.boot_epoch)
            .field("clients", &self.clients.len())
            .field("filesystems", &self.filesystems.read().len())
            .finish()
    }
}
