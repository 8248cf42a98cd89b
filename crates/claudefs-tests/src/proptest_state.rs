//! Property-Based Tests for stateid and owner sequence rules

use claudefs_nfs4state::ids::classify_stateid_miss;
use claudefs_nfs4state::reply::check_seqid;
use claudefs_nfs4state::state::classify_stateid;
use claudefs_nfs4state::{CachedReply, NodeIdent, OwnerOp, SeqidCheck, StateError, StateId, StateIdCheck, StateId4, StateKind};
use proptest::prelude::*;

/// Filesystem epochs are full 32-bit boot times.
pub fn arb_epoch() -> impl Strategy<Value = u32> {
    1u32..u32::MAX - 1000
}

pub fn arb_owner_op() -> impl Strategy<Value = OwnerOp> {
    prop_oneof![
        Just(OwnerOp::Open),
        Just(OwnerOp::OpenConfirm),
        Just(OwnerOp::OpenDowngrade),
        Just(OwnerOp::Close),
        Just(OwnerOp::Lock),
        Just(OwnerOp::LockU),
    ]
}

pub fn arb_kind() -> impl Strategy<Value = StateKind> {
    prop_oneof![Just(StateKind::Open), Just(StateKind::Lock), Just(StateKind::Deleg)]
}

fn minted(kind: StateKind, epoch: u32, ident: u32) -> StateId4 {
    StateId::new(kind, epoch, ident, &NodeIdent::clustered(3, 1)).encode()
}

fn cached_close() -> CachedReply {
    CachedReply::Close {
        stateid: StateId4 {
            seqid: 4,
            other: [7; 12],
        },
    }
}

proptest! {
    #[test]
    fn prop_one_behind_is_replay(current in 1u32..u32::MAX) {
        prop_assert_eq!(classify_stateid(current, current - 1, false, false, false), StateIdCheck::Replay);
    }

    #[test]
    fn prop_further_behind_is_old(current in 2u32..u32::MAX, gap in 2u32..1000) {
        let presented = current.saturating_sub(gap);
        prop_assume!(presented + 1 < current);
        prop_assert_eq!(classify_stateid(current, presented, false, false, false), StateIdCheck::Old);
    }

    #[test]
    fn prop_ahead_is_bad(current in 0u32..u32::MAX - 1000, ahead in 1u32..1000) {
        prop_assert_eq!(classify_stateid(current, current + ahead, false, false, false), StateIdCheck::Bad);
    }

    #[test]
    fn prop_current_is_okay_unless_flagged(current: u32, unconfirmed: bool, closed: bool) {
        let expected = if unconfirmed {
            StateIdCheck::Unconfirmed
        } else if closed {
            StateIdCheck::Closed
        } else {
            StateIdCheck::Okay
        };
        prop_assert_eq!(classify_stateid(current, current, false, unconfirmed, closed), expected);
    }

    #[test]
    fn prop_expiry_wins(current: u32, presented: u32, unconfirmed: bool, closed: bool) {
        prop_assert_eq!(classify_stateid(current, presented, true, unconfirmed, closed), StateIdCheck::Expired);
    }

    #[test]
    fn prop_owner_seqid_next_is_okay(last: u32, op in arb_owner_op()) {
        let cached = cached_close();
        prop_assert_eq!(check_seqid(last, Some(&cached), last.wrapping_add(1), op), SeqidCheck::Okay);
    }

    #[test]
    fn prop_owner_seqid_replay_needs_same_op(last: u32, op in arb_owner_op()) {
        let cached = cached_close();
        let rc = check_seqid(last, Some(&cached), last, op);
        if op == OwnerOp::Close {
            prop_assert_eq!(rc, SeqidCheck::Replay(cached));
        } else {
            prop_assert_eq!(rc, SeqidCheck::Bad);
        }
    }

    #[test]
    fn prop_owner_seqid_out_of_window_is_bad(last: u32, skip in 2u32..u32::MAX) {
        let requested = last.wrapping_add(skip);
        prop_assert_eq!(check_seqid(last, None, requested, OwnerOp::Open), SeqidCheck::Bad);
    }

    #[test]
    fn prop_earlier_epoch_is_stale(kind in arb_kind(), minted_at in arb_epoch(), later in 1u32..1000, ident in 1u32..100_000) {
        let stateid = minted(kind, minted_at, ident);
        let node = NodeIdent::clustered(3, 1);
        let err = classify_stateid_miss(&stateid, kind, minted_at + later, &node);
        prop_assert!(matches!(err, StateError::StaleStateId));
    }

    #[test]
    fn prop_same_epoch_miss_is_expired(kind in arb_kind(), epoch in arb_epoch(), ident in 1u32..100_000) {
        let stateid = minted(kind, epoch, ident);
        let node = NodeIdent::clustered(3, 1);
        let err = classify_stateid_miss(&stateid, kind, epoch, &node);
        match kind {
            StateKind::Deleg => prop_assert!(matches!(err, StateError::BadStateId)),
            _ => prop_assert!(matches!(err, StateError::Expired)),
        }
    }
}
