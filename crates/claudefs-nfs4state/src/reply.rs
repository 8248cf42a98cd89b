//! Cached replies for owner-sequenced operations.
//!
//! Open-owners and lock-states remember the reply to their last
//! sequence-mutating operation so a retransmission of that request gets the
//! same answer instead of being processed twice. Each variant owns its data;
//! `Clone` is the deep copy handed back on replay.

use crate::ids::StateId4;
use serde::{Deserialize, Serialize};

/// Operations that advance an owner's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerOp {
    /// OPEN
    Open,
    /// OPEN_CONFIRM
    OpenConfirm,
    /// OPEN_DOWNGRADE
    OpenDowngrade,
    /// CLOSE
    Close,
    /// LOCK
    Lock,
    /// LOCKU
    LockU,
}

/// Delegation handed out with an OPEN reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationGrant {
    /// Delegation stateid
    pub stateid: StateId4,
    /// Write delegation rather than read
    pub write: bool,
    /// Recall already pending
    pub recall: bool,
}

/// Successful OPEN result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenReply {
    /// Open stateid
    pub stateid: StateId4,
    /// OPEN4_RESULT_* flags
    pub rflags: u32,
    /// Delegation granted with the open, if any
    pub delegation: Option<DelegationGrant>,
    /// Filehandle the open was performed on, restored on replay
    pub fh: Vec<u8>,
}

/// Conflicting lock reported by a denied LOCK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDenied {
    /// Start of the conflicting range
    pub offset: u64,
    /// Length of the conflicting range
    pub length: u64,
    /// Conflicting lock is a write lock
    pub write: bool,
    /// Owner of the conflicting lock
    pub owner: Vec<u8>,
}

/// A remembered reply, tagged by operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachedReply {
    /// OPEN result
    Open(OpenReply),
    /// OPEN_CONFIRM result
    OpenConfirm {
        /// Stateid returned
        stateid: StateId4,
    },
    /// OPEN_DOWNGRADE result
    OpenDowngrade {
        /// Stateid returned
        stateid: StateId4,
    },
    /// CLOSE result
    Close {
        /// Stateid returned
        stateid: StateId4,
    },
    /// LOCK granted
    Lock {
        /// Stateid returned
        stateid: StateId4,
    },
    /// LOCK denied by a conflict
    LockDenied(LockDenied),
    /// LOCKU result
    LockU {
        /// Stateid returned
        stateid: StateId4,
    },
    /// Sequence-advancing failure; replays return the same status
    Failed {
        /// Operation that failed
        op: OwnerOp,
        /// NFS4 status it failed with
        status: u32,
    },
}

impl CachedReply {
    /// Operation this reply answers.
    pub fn op(&self) -> OwnerOp {
        match self {
            CachedReply::Open(_) => OwnerOp::Open,
            CachedReply::OpenConfirm { .. } => OwnerOp::OpenConfirm,
            CachedReply::OpenDowngrade { .. } => OwnerOp::OpenDowngrade,
            CachedReply::Close { .. } => OwnerOp::Close,
            CachedReply::Lock { .. } | CachedReply::LockDenied(_) => OwnerOp::Lock,
            CachedReply::LockU { .. } => OwnerOp::LockU,
            CachedReply::Failed { op, .. } => *op,
        }
    }

    /// NFSv4 status carried by the reply.
    pub fn status(&self) -> u32 {
        match self {
            CachedReply::LockDenied(_) => crate::error::NFS4ERR_DENIED,
            CachedReply::Failed { status, .. } => *status,
            _ => crate::error::NFS4_OK,
        }
    }

    /// Stateid returned by the reply, if any.
    pub fn stateid(&self) -> Option<StateId4> {
        match self {
            CachedReply::Open(r) => Some(r.stateid),
            CachedReply::OpenConfirm { stateid }
            | CachedReply::OpenDowngrade { stateid }
            | CachedReply::Close { stateid }
            | CachedReply::Lock { stateid }
            | CachedReply::LockU { stateid } => Some(*stateid),
            CachedReply::LockDenied(_) | CachedReply::Failed { .. } => None,
        }
    }
}

/// Outcome of an owner sequence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqidCheck {
    /// Next expected sequence
    Okay,
    /// Retransmission of the last request; answer with this reply
    Replay(CachedReply),
    /// Out of order
    Bad,
}

/// Checks a requested owner sequence against the last processed one.
///
/// Re-presenting `last` for the same operation is a replay and yields a copy
/// of the cached reply; `last + 1` is the next request; anything else is bad.
pub fn check_seqid(
    last: u32,
    cached: Option<&CachedReply>,
    requested: u32,
    op: OwnerOp,
) -> SeqidCheck {
    if requested == last {
        return match cached {
            Some(reply) if reply.op() == op => SeqidCheck::Replay(reply.clone()),
            _ => SeqidCheck::Bad,
        };
    }
    if requested != last.wrapping_add(1) {
        return SeqidCheck::Bad;
    }
    SeqidCheck::Okay
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_reply() -> CachedReply {
        CachedReply::Open(OpenReply {
            stateid: StateId4 {
                seqid: 1,
                other: [7; 12],
            },
            rflags: 2,
            delegation: None,
            fh: vec![1, 2, 3],
        })
    }

    #[test]
    fn test_replay_returns_copy_of_cached_reply() {
        let cached = open_reply();
        match check_seqid(4, Some(&cached), 4, OwnerOp::Open) {
            SeqidCheck::Replay(r) => assert_eq!(r, cached),
            other => panic!("expected replay, got {:?}", other),
        }
    }

    #[test]
    fn test_replay_with_other_op_is_bad() {
        let cached = open_reply();
        assert_eq!(
            check_seqid(4, Some(&cached), 4, OwnerOp::Close),
            SeqidCheck::Bad
        );
    }

    #[test]
    fn test_replay_without_cache_is_bad() {
        assert_eq!(check_seqid(4, None, 4, OwnerOp::Open), SeqidCheck::Bad);
    }

    #[test]
    fn test_next_seqid_is_okay() {
        assert_eq!(check_seqid(4, None, 5, OwnerOp::Open), SeqidCheck::Okay);
        assert_eq!(
            check_seqid(u32::MAX, None, 0, OwnerOp::Lock),
            SeqidCheck::Okay
        );
    }

    #[test]
    fn test_gap_is_bad() {
        assert_eq!(check_seqid(4, None, 6, OwnerOp::Open), SeqidCheck::Bad);
        assert_eq!(check_seqid(4, None, 3, OwnerOp::Open), SeqidCheck::Bad);
    }

    #[test]
    fn test_lock_denied_reply_answers_lock() {
        let r = CachedReply::LockDenied(LockDenied {
            offset: 0,
            length: 10,
            write: true,
            owner: b"o".to_vec(),
        });
        assert_eq!(r.op(), OwnerOp::Lock);
        assert_eq!(r.status(), crate::error::NFS4ERR_DENIED);
        assert!(r.stateid().is_none());
    }
}
