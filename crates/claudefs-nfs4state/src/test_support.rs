//! Registry fixture for unit tests.

use crate::client::{CallbackInfo, NfsClientId, SetClientIdArgs};
use crate::clock::ManualClock;
use crate::config::StateConfig;
use crate::error::Result;
use crate::file::DelegType;
use crate::fs_store::Fsid;
use crate::ids::{ClientId, StateId4};
use crate::registry::StateRegistry;
use crate::reply::OpenReply;
use crate::stable::StableStorage;
use crate::state::{OpenArgs, OpenClaim, Sequenced, StateOpArgs};
use crate::volume::{FileHandle, MemoryVolume};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;

pub(crate) const FSID: Fsid = Fsid(1);
pub(crate) const LEASE: u64 = 10;

pub(crate) struct Harness {
    pub clock: Arc<ManualClock>,
    pub volume: Arc<MemoryVolume>,
    pub registry: StateRegistry,
    pub dir: TempDir,
}

pub(crate) fn fh(name: &str) -> FileHandle {
    FileHandle::new(name.as_bytes().to_vec())
}

pub(crate) fn setclientid_args(name: &str, verifier: u8) -> SetClientIdArgs {
    SetClientIdArgs {
        client: NfsClientId {
            verifier: [verifier; 8],
            id: name.as_bytes().to_vec(),
        },
        callback: CallbackInfo::default(),
        principal: "nfs".to_string(),
        addr: "10.0.0.1:700".parse::<SocketAddr>().unwrap(),
        supports_referrals: true,
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::at(10_000)
    }

    /// Fixture whose clock starts at `secs`.
    pub fn at(secs: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(secs));
        let config = StateConfig {
            lease_secs: LEASE,
            dss_default_path: dir.path().to_path_buf(),
            ..StateConfig::default()
        };
        let registry = StateRegistry::new(config, clock.clone(), StableStorage::local(None));
        let volume = Arc::new(MemoryVolume::new());
        registry.add_filesystem(FSID, volume.clone());
        Self {
            clock,
            volume,
            registry,
            dir,
        }
    }

    /// Registers and confirms a client with a working callback path.
    pub fn client(&self, name: &str) -> ClientId {
        let args = setclientid_args(name, 1);
        let reply = self.registry.set_client_id(&args).unwrap();
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

    pub fn open(&self, args: &OpenArgs) -> Result<OpenReply> {
        match self.registry.open(args)? {
            Sequenced::Done(reply) => Ok(reply),
            Sequenced::Replay(reply) => panic!("unexpected replay {:?}", reply),
        }
    }

    /// OPEN_CONFIRM of a new owner's first open.
    pub fn confirm(&self, file: &FileHandle, stateid: StateId4) -> StateId4 {
        let confirmed = self
            .registry
            .open_confirm(&StateOpArgs {
                fsid: FSID,
                fh: file.clone(),
                stateid,
                seqid: 1,
            })
            .unwrap();
        match confirmed {
            Sequenced::Done(stateid) => stateid,
            Sequenced::Replay(reply) => panic!("unexpected replay {:?}", reply),
        }
    }

    /// OPEN with a new owner at seqid 0 followed by OPEN_CONFIRM at seqid 1.
    /// Returns the confirmed stateid.
    pub fn open_confirmed(
        &self,
        clientid: ClientId,
        owner: &str,
        file: &FileHandle,
        access: u32,
        deny: u32,
    ) -> StateId4 {
        let reply = self
            .open(&self.open_args(clientid, owner, 0, file, access, deny))
            .unwrap();
        self.confirm(file, reply.stateid)
    }
}
