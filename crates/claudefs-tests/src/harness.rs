//! Test Harness - registry environment that survives simulated restarts
//!
//! A [`StateEnv`] owns the stable-storage directories and a manual clock, so
//! a test can drop the running registry, advance time and boot a new one over
//! the same records.

use anyhow::Context;
use claudefs_nfs4state::{
    CallbackInfo, ClientId, DelegType, FileHandle, Fsid, LockArgs, LockOutcome, LockRange, Locker,
    ManualClock, MemoryVolume, NfsClientId, OpenArgs, OpenClaim, OpenReply, Sequenced,
    SetClientIdArgs, StableStorage, StateConfig, StateId4, StateOpArgs, StateRegistry,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Filesystem every environment exports.
pub const FSID: Fsid = Fsid(1);

/// Lease used by every environment.
pub const LEASE_SECS: u64 = 10;

const CLOCK_START: u64 = 50_000;

/// Installs a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fh(name: &str) -> FileHandle {
    FileHandle::new(name.as_bytes().to_vec())
}

#[derive(Debug)]
pub struct StateEnv {
    dirs: Vec<TempDir>,
    clock: Arc<ManualClock>,
    volume: Arc<MemoryVolume>,
    registry: Arc<StateRegistry>,
}

impl StateEnv {
    /// One stable-storage path.
    pub fn new() -> Self {
        Self::with_paths(1)
    }

    /// `paths` replicated stable-storage paths; the first is the default.
    pub fn with_paths(paths: usize) -> Self {
        Self::try_with_paths(paths).expect("failed to build state environment")
    }

    /// One stable-storage path, clock starting at `secs`.
    pub fn starting_at(secs: u64) -> Self {
        Self::try_build(1, secs).expect("failed to build state environment")
    }

    pub fn try_with_paths(paths: usize) -> anyhow::Result<Self> {
        Self::try_build(paths, CLOCK_START)
    }

    fn try_build(paths: usize, clock_start: u64) -> anyhow::Result<Self> {
        init_tracing();
        let mut dirs = Vec::with_capacity(paths.max(1));
        for _ in 0..paths.max(1) {
            dirs.push(TempDir::new().context("creating stable-storage dir")?);
        }
        let clock = Arc::new(ManualClock::new(clock_start));
        let volume = Arc::new(MemoryVolume::new());
        let registry = Self::boot(&dirs, &clock, &volume);
        Ok(Self {
            dirs,
            clock,
            volume,
            registry,
        })
    }

    fn config(dirs: &[TempDir]) -> StateConfig {
        StateConfig {
            lease_secs: LEASE_SECS,
            dss_default_path: dirs[0].path().to_path_buf(),
            dss_paths: dirs[1..].iter().map(|d| d.path().to_path_buf()).collect(),
            ..StateConfig::default()
        }
    }

    fn boot(dirs: &[TempDir], clock: &Arc<ManualClock>, volume: &Arc<MemoryVolume>) -> Arc<StateRegistry> {
        let registry = StateRegistry::new(Self::config(dirs), clock.clone(), StableStorage::local(None));
        registry.add_filesystem(FSID, volume.clone());
        Arc::new(registry)
    }

    /// Replaces the registry with a fresh instance booted `downtime`
    /// seconds later over the same stable storage, recovers the persisted
    /// clients and opens the grace window. Returns the number recovered.
    pub fn restart(&mut self, downtime: u64) -> usize {
        self.clock.advance(downtime);
        self.volume = Arc::new(MemoryVolume::new());
        self.registry = Self::boot(&self.dirs, &self.clock, &self.volume);
        let recovered = self.registry.recover();
        self.registry.start_grace();
        recovered
    }

    pub fn registry(&self) -> &StateRegistry {
        &self.registry
    }

    /// Shared handle for the background reapers.
    pub fn shared(&self) -> Arc<StateRegistry> {
        self.registry.clone()
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn volume(&self) -> &MemoryVolume {
        &self.volume
    }

    pub fn path(&self, idx: usize) -> &Path {
        self.dirs[idx].path()
    }

    pub fn setclientid_args(&self, name: &str, verifier: u8) -> SetClientIdArgs {
        SetClientIdArgs {
            client: NfsClientId {
                verifier: [verifier; 8],
                id: name.as_bytes().to_vec(),
            },
            callback: CallbackInfo::default(),
            principal: "nfs".to_string(),
            addr: "192.168.7.20:801".parse::<SocketAddr>().unwrap(),
            supports_referrals: true,
        }
    }

    /// SETCLIENTID plus SETCLIENTID_CONFIRM, callback path marked up.
    pub fn client(&self, name: &str) -> ClientId {
        let reply = self
            .registry
            .set_client_id(&self.setclientid_args(name, 1))
            .unwrap();
        self.registry
            .confirm_client_id(reply.clientid, reply.confirm, "nfs")
            .unwrap();
        self.registry.mark_callback_up(reply.clientid).unwrap();
        reply.clientid
    }

    pub fn open_args(
        &self,
        clientid: ClientId,
        owner: &str,
        seqid: u32,
        file: &FileHandle,
        access: u32,
        deny: u32,
    ) -> OpenArgs {
        OpenArgs {
            clientid,
            owner: owner.as_bytes().to_vec(),
            seqid,
            fsid: FSID,
            fh: file.clone(),
            export_id: 1,
            share_access: access,
            share_deny: deny,
            claim: OpenClaim::Null,
            delegation: DelegType::None,
        }
    }

    /// OPEN that must be processed fresh.
    pub fn open(&self, args: &OpenArgs) -> claudefs_nfs4state::Result<OpenReply> {
        match self.registry.open(args)? {
            Sequenced::Done(reply) => Ok(reply),
            Sequenced::Replay(reply) => panic!("unexpected replay: {:?}", reply),
        }
    }

    /// First OPEN of a new owner (seqid 0) and its OPEN_CONFIRM (seqid 1).
    pub fn open_confirmed(&self, clientid: ClientId, owner: &str, file: &FileHandle, access: u32, deny: u32) -> StateId4 {
        let reply = self
            .open(&self.open_args(clientid, owner, 0, file, access, deny))
            .unwrap();
        match self
            .registry
            .open_confirm(&StateOpArgs {
                fsid: FSID,
                fh: file.clone(),
                stateid: reply.stateid,
                seqid: 1,
            })
            .unwrap()
        {
            Sequenced::Done(stateid) => stateid,
            Sequenced::Replay(reply) => panic!("unexpected replay: {:?}", reply),
        }
    }

    /// First LOCK of lock-owner `owner` under a confirmed open whose
    /// owner's next seqid is `open_seqid`.
    pub fn lock_new_owner(&self, file: &FileHandle, open_stateid: StateId4, open_seqid: u32, owner: &str) -> StateId4 {
        let outcome = self
            .registry
            .lock(&LockArgs {
                fsid: FSID,
                fh: file.clone(),
                locker: Locker::NewOwner {
                    open_stateid,
                    open_seqid,
                    lock_owner: owner.as_bytes().to_vec(),
                    lock_seqid: 0,
                },
                range: LockRange {
                    offset: 0,
                    length: 4096,
                    write: true,
                },
                reclaim: false,
            })
            .unwrap();
        match outcome {
            Sequenced::Done(LockOutcome::Granted(stateid)) => stateid,
            other => panic!("lock not granted: {:?}", other),
        }
    }
}

impl Default for StateEnv {
    fn default() -> Self {
        Self::new()
    }
}
