//! Client and open lifecycle scenarios: replay caching, open uniqueness,
//! stateid sequence checks and lease expiry.

#[cfg(test)]
mod tests {
    use crate::harness::{fh, StateEnv, FSID, LEASE_SECS};
    use claudefs_nfs4state::file::{SHARE_ACCESS_BOTH, SHARE_ACCESS_READ, SHARE_DENY_NONE};
    use claudefs_nfs4state::{
        CachedReply, IoMode, LockArgs, LockRange, Locker, Sequenced, StateError, StateId4, StateOpArgs,
    };

    fn close_args(file: &claudefs_nfs4state::FileHandle, stateid: StateId4, seqid: u32) -> StateOpArgs {
        StateOpArgs {
            fsid: FSID,
            fh: file.clone(),
            stateid,
            seqid,
        }
    }

    #[test]
    fn test_open_retransmission_returns_cached_reply() {
        let env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        let args = env.open_args(a, "owner", 0, &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);

        let first = env.open(&args).unwrap();
        match env.registry().open(&args).unwrap() {
            Sequenced::Replay(CachedReply::Open(again)) => assert_eq!(again, first),
            other => panic!("expected cached OPEN reply, got {:?}", other),
        }
    }

    #[test]
    fn test_second_open_of_same_file_reuses_state() {
        let env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        let sid = env.open_confirmed(a, "owner", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);

        let again = env
            .open(&env.open_args(a, "owner", 2, &f, SHARE_ACCESS_BOTH, SHARE_DENY_NONE))
            .unwrap();
        assert_eq!(again.stateid.other, sid.other);
        assert_eq!(again.stateid.seqid, sid.seqid + 1);

        let view = env.registry().open_state_view(FSID, &again.stateid).unwrap();
        assert_eq!(view.share_access, SHARE_ACCESS_BOTH);

        let other = env
            .open(&env.open_args(a, "owner", 3, &fh("G"), SHARE_ACCESS_READ, SHARE_DENY_NONE))
            .unwrap();
        assert_ne!(other.stateid.other, sid.other);
    }

    #[test]
    fn test_io_stateid_sequence_checks() {
        let env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        let sid = env.open_confirmed(a, "owner", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);
        let reg = env.registry();

        assert!(reg.check_stateid(FSID, &f, &sid, IoMode::Read).is_ok());

        let ahead = StateId4 {
            seqid: sid.seqid + 1,
            ..sid
        };
        assert!(matches!(
            reg.check_stateid(FSID, &f, &ahead, IoMode::Read),
            Err(StateError::BadStateId)
        ));

        let behind = StateId4 {
            seqid: sid.seqid - 2,
            ..sid
        };
        assert!(matches!(
            reg.check_stateid(FSID, &f, &behind, IoMode::Read),
            Err(StateError::OldStateId)
        ));
    }

    #[test]
    fn test_close_replay_and_bad_seqid() {
        let env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        let sid = env.open_confirmed(a, "owner", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);
        let reg = env.registry();

        assert!(matches!(reg.close(&close_args(&f, sid, 5)), Err(StateError::BadSeqid)));

        let closed = match reg.close(&close_args(&f, sid, 2)).unwrap() {
            Sequenced::Done(stateid) => stateid,
            other => panic!("close not processed: {:?}", other),
        };
        assert_eq!(closed.seqid, sid.seqid + 1);

        match reg.close(&close_args(&f, sid, 2)).unwrap() {
            Sequenced::Replay(CachedReply::Close { stateid }) => assert_eq!(stateid, closed),
            other => panic!("expected cached CLOSE reply, got {:?}", other),
        }
        assert_eq!(env.volume().unshare_calls(), 1);
    }

    #[test]
    fn test_lock_after_forced_expiry_is_expired() {
        let env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        let sid = env.open_confirmed(a, "owner", &f, SHARE_ACCESS_BOTH, SHARE_DENY_NONE);
        let lock_sid = env.lock_new_owner(&f, sid, 2, "lo");

        env.registry().expire_client(a).unwrap();

        let err = env
            .registry()
            .lock(&LockArgs {
                fsid: FSID,
                fh: f.clone(),
                locker: Locker::Existing {
                    lock_stateid: lock_sid,
                    lock_seqid: 1,
                },
                range: LockRange {
                    offset: 8192,
                    length: 10,
                    write: false,
                },
                reclaim: false,
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Expired));
        assert!(matches!(
            env.registry().check_stateid(FSID, &f, &sid, IoMode::Read),
            Err(StateError::Expired)
        ));
    }

    #[test]
    fn test_lapsed_lease_expires_open_stateid() {
        let env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        let sid = env.open_confirmed(a, "owner", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);

        env.clock().advance(LEASE_SECS / 2);
        assert!(env.registry().check_stateid(FSID, &f, &sid, IoMode::Read).is_ok());

        env.clock().advance(LEASE_SECS + 1);
        assert!(matches!(
            env.registry().check_stateid(FSID, &f, &sid, IoMode::Read),
            Err(StateError::Expired)
        ));
        assert!(matches!(env.registry().renew(a), Err(StateError::Expired)));
    }
}
