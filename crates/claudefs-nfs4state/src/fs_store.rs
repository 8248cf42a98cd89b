//! Per-filesystem state store.
//!
//! Open, lock and delegation states and files are scoped to the filesystem
//! they live on, so unexport and migration can sweep one filesystem without
//! touching the others. Each store carries the epoch verifier embedded as
//! the boottime of every stateid minted under it.

use crate::clock::Clock;
use crate::deleg::DelegState;
use crate::file::File;
use crate::lock_order::LockRank;
use crate::state::{LockState, OpenState};
use crate::table::{EntryId, Table};
use crate::volume::Volume;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Largest entry id in per-filesystem tables.
pub const MAX_STATE_ID: EntryId = 0x7fff_ffff;

/// Filesystem identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fsid(pub u64);

impl fmt::Display for Fsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fs:{:x}", self.0)
    }
}

/// Migration phase of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsPhase {
    /// Serving normally
    Active,
    /// State frozen for migration; no new state
    Frozen,
    /// Filesystem has moved away; clients must follow
    Moved,
}

#[derive(Debug, Clone, Copy)]
struct FsGrace {
    start: u64,
    period: u64,
}

/// State tables and epoch of one filesystem.
pub struct FsStateStore {
    fsid: Fsid,
    epoch: u32,
    pub(crate) states: Table<OpenState>,
    pub(crate) lock_states: Table<LockState>,
    pub(crate) delegations: Table<DelegState>,
    pub(crate) files: Table<File>,
    grace: RwLock<Option<FsGrace>>,
    phase: RwLock<FsPhase>,
    volume: Arc<dyn Volume>,
}

impl FsStateStore {
    pub(crate) fn new(
        fsid: Fsid,
        epoch: u32,
        clock: Arc<dyn Clock>,
        volume: Arc<dyn Volume>,
    ) -> Self {
        Self {
            fsid,
            epoch,
            states: Table::new("open_state", LockRank::OpenState, clock.clone(), MAX_STATE_ID),
            lock_states: Table::new("lock_state", LockRank::LockState, clock.clone(), MAX_STATE_ID),
            delegations: Table::new("deleg_state", LockRank::Delegation, clock.clone(), MAX_STATE_ID),
            files: Table::new("file", LockRank::File, clock, MAX_STATE_ID),
            grace: RwLock::new(None),
            phase: RwLock::new(FsPhase::Active),
            volume,
        }
    }

    /// Filesystem this store belongs to.
    pub fn fsid(&self) -> Fsid {
        self.fsid
    }

    /// Epoch verifier embedded in stateids minted here.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Backing volume for shares and locks.
    pub fn volume(&self) -> &Arc<dyn Volume> {
        &self.volume
    }

    /// Opens a filesystem-local grace window.
    pub fn grace_start(&self, now: u64, period: u64) {
        *self.grace.write() = Some(FsGrace { start: now, period });
    }

    /// True while the filesystem-local grace window is open.
    pub fn in_grace(&self, now: u64) -> bool {
        match *self.grace.read() {
            Some(g) => now.saturating_sub(g.start) < g.period,
            None => false,
        }
    }

    /// Current migration phase.
    pub fn phase(&self) -> FsPhase {
        *self.phase.read()
    }

    pub(crate) fn set_phase(&self, phase: FsPhase) {
        *self.phase.write() = phase;
    }

    /// Open-states, including invalid ones.
    pub fn open_state_count(&self) -> usize {
        self.states.len()
    }

    /// Lock-states, including invalid ones.
    pub fn lock_state_count(&self) -> usize {
        self.lock_states.len()
    }

    /// Delegation-states, including invalid ones.
    pub fn delegation_count(&self) -> usize {
        self.delegations.len()
    }

    /// Files, including invalid ones.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

impl fmt::Debug for FsStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStateStore")
            .field("fsid", &self.fsid)
            .field("epoch", &self.epoch)
            .field("phase", &self.phase())
            .finish()
    }
}
