#![warn(missing_docs)]

//! ClaudeFS NFSv4 state registry: clients, open/lock owners, open, lock and
//! delegation states, leases, grace periods and stable-storage recovery.
//!
//! Request path: RPC dispatcher → [`StateRegistry`] entry point → entity
//! tables (per-entry locks, fixed lock order) → [`Volume`] for shares and
//! range locks.
//! Recovery: stable storage → grace generation old-state list → reclaim
//! checks during the grace window.

pub mod access;
pub mod cleanup;
pub mod client;
pub mod clock;
pub mod config;
pub mod deleg;
pub mod error;
pub mod file;
pub mod fs_store;
pub mod grace;
pub mod ids;
pub mod lease;
pub mod lock_order;
pub mod owner;
pub mod reaper;
pub mod registry;
pub mod reply;
pub mod stable;
pub mod state;
pub mod table;
pub mod volume;

#[cfg(test)]
mod test_support;

pub use access::{IoGrant, IoMode};
pub use cleanup::CleanupStats;
pub use client::{CallbackInfo, CallbackState, NfsClientId, SetClientIdArgs, SetClientIdReply};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheTimes, NodeConfig, RecordOwner, StateConfig};
pub use deleg::DelegReturnArgs;
pub use error::{Result, StateError};
pub use file::{DelegInfo, DelegType};
pub use fs_store::{FsPhase, FsStateStore, Fsid};
pub use ids::{ClientId, NodeIdent, StateId, StateId4, StateKind, Verifier};
pub use reaper::spawn_reapers;
pub use registry::{ReapStats, StateRegistry, TableKind};
pub use reply::{CachedReply, DelegationGrant, LockDenied, OpenReply, OwnerOp, SeqidCheck};
pub use stable::{ClientRecord, LocalFs, StableFs, StableStorage};
pub use state::{
    DowngradeArgs, LockArgs, LockOutcome, Locker, LockuArgs, OpenArgs, OpenClaim, OpenStateView,
    Sequenced, StateIdCheck, StateOpArgs,
};
pub use volume::{FileHandle, LockOwnerKey, LockRange, MemoryVolume, Volume};
