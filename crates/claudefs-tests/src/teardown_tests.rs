//! Teardown scenarios: client destruction through the reapers, unexport
//! cleanup and filesystem removal.

#[cfg(test)]
mod tests {
    use crate::harness::{fh, StateEnv, FSID, LEASE_SECS};
    use claudefs_nfs4state::file::{SHARE_ACCESS_BOTH, SHARE_ACCESS_READ, SHARE_DENY_NONE};
    use claudefs_nfs4state::{spawn_reapers, Fsid, IoMode, MemoryVolume, StateError, TableKind};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_client_destroy_closes_each_state_once() {
        let env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        let g = fh("G");
        let sf = env.open_confirmed(a, "o1", &f, SHARE_ACCESS_BOTH, SHARE_DENY_NONE);
        env.open_confirmed(a, "o2", &g, SHARE_ACCESS_READ, SHARE_DENY_NONE);
        env.lock_new_owner(&f, sf, 2, "lo");
        assert_eq!(env.volume().locks_on(&f), 1);

        env.registry().expire_client(a).unwrap();
        for _ in 0..3 {
            env.registry().reap_once();
        }

        let fs = env.registry().filesystem(FSID).unwrap();
        assert_eq!(fs.open_state_count(), 0);
        assert_eq!(fs.lock_state_count(), 0);
        assert_eq!(env.registry().client_count(), 0);
        assert_eq!(env.registry().open_owner_count(), 0);
        assert_eq!(env.volume().unshare_calls(), 2);
        assert_eq!(env.volume().sysid_calls(), 1);
        assert_eq!(env.volume().clean_calls(), 0);
        assert_eq!(env.volume().locks_on(&f), 0);
    }

    #[test]
    fn test_idle_client_survives_reap() {
        let env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        let sid = env.open_confirmed(a, "o", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);

        env.clock().advance(LEASE_SECS - 1);
        let stats = env.registry().reap_once();
        assert_eq!(stats.total(), 0);
        assert!(env.registry().check_stateid(FSID, &f, &sid, IoMode::Read).is_ok());
    }

    #[test]
    fn test_lapsed_lease_swept_then_reaped() {
        let env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        env.open_confirmed(a, "o", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);

        env.clock().advance(LEASE_SECS + 1);
        assert_eq!(env.registry().sweep_leases(), 1);
        assert_eq!(env.volume().unshare_calls(), 1);
        assert_eq!(env.registry().reap_table(TableKind::OpenState), 1);
        // the sweep only runs once per client
        assert_eq!(env.registry().sweep_leases(), 0);
    }

    #[test]
    fn test_unexport_leaves_other_filesystems() {
        let env = StateEnv::new();
        let other = Fsid(9);
        env.registry().add_filesystem(other, Arc::new(MemoryVolume::new()));
        let a = env.client("a");

        let f = fh("F");
        let gone = env.open_confirmed(a, "o", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);
        let mut args = env.open_args(a, "o", 2, &fh("H"), SHARE_ACCESS_READ, SHARE_DENY_NONE);
        args.fsid = other;
        let kept = env.open(&args).unwrap().stateid;

        let stats = env.registry().clean_state(FSID, None).unwrap();
        assert_eq!(stats.open_states, 1);
        assert_eq!(stats.files, 1);

        assert!(matches!(
            env.registry().check_stateid(FSID, &f, &gone, IoMode::Read),
            Err(StateError::Expired)
        ));
        assert!(env
            .registry()
            .check_stateid(other, &fh("H"), &kept, IoMode::Read)
            .is_ok());
        assert!(env.registry().renew(a).is_ok());
    }

    #[test]
    fn test_remove_filesystem_forgets_store() {
        let env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        let sid = env.open_confirmed(a, "o", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);

        env.registry().remove_filesystem(FSID).unwrap();
        assert!(matches!(
            env.registry().check_stateid(FSID, &f, &sid, IoMode::Read),
            Err(StateError::UnknownFilesystem { .. })
        ));
        assert_eq!(env.volume().unshare_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reapers_tear_down_expired_client() {
        let env = StateEnv::new();
        let a = env.client("a");
        env.open_confirmed(a, "o", &fh("F"), SHARE_ACCESS_READ, SHARE_DENY_NONE);
        env.registry().expire_client(a).unwrap();

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handles = spawn_reapers(env.shared(), rx);
        tokio::time::sleep(Duration::from_secs(2 * LEASE_SECS + 5)).await;

        let fs = env.registry().filesystem(FSID).unwrap();
        assert_eq!(fs.open_state_count(), 0);
        assert_eq!(env.volume().unshare_calls(), 1);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
