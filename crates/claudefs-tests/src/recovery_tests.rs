//! Restart and recovery scenarios: epoch change, reclaim during grace,
//! replicated stable storage and old-state garbage collection.

#[cfg(test)]
mod tests {
    use crate::harness::{fh, StateEnv, FSID};
    use claudefs_nfs4state::file::{SHARE_ACCESS_READ, SHARE_DENY_NONE};
    use claudefs_nfs4state::stable::OLDSTATE_DIR;
    use claudefs_nfs4state::{DelegType, IoMode, OpenClaim, StateError};
    use std::path::Path;

    fn oldstate_entries(path: &Path) -> usize {
        std::fs::read_dir(path.join(OLDSTATE_DIR))
            .map(|dir| dir.count())
            .unwrap_or(0)
    }

    #[test]
    fn test_restart_makes_stateids_stale() {
        let mut env = StateEnv::new();
        let a = env.client("a");
        let f = fh("F");
        let sid = env.open_confirmed(a, "o", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);

        assert_eq!(env.restart(100), 1);

        let err = env
            .registry()
            .check_stateid(FSID, &f, &sid, IoMode::Read)
            .unwrap_err();
        assert!(matches!(err, StateError::StaleStateId));
        assert!(matches!(env.registry().renew(a), Err(StateError::StaleClientId)));
    }

    #[test]
    fn test_restart_across_clientid_time_wrap_is_stale() {
        // the clientid keeps 24 bits of boot time; this restart wraps them
        let mut env = StateEnv::starting_at(0x00ff_fff0);
        let a = env.client("a");
        let f = fh("F");
        let sid = env.open_confirmed(a, "o", &f, SHARE_ACCESS_READ, SHARE_DENY_NONE);

        assert_eq!(env.restart(0x60), 1);
        assert!(env.registry().start_time() < 0x00ff_fff0);

        let err = env
            .registry()
            .check_stateid(FSID, &f, &sid, IoMode::Read)
            .unwrap_err();
        assert!(matches!(err, StateError::StaleStateId));
        assert!(matches!(env.registry().renew(a), Err(StateError::StaleClientId)));
    }

    #[test]
    fn test_reclaim_during_grace() {
        let mut env = StateEnv::new();
        let a = env.client("a");
        env.open_confirmed(a, "o", &fh("F"), SHARE_ACCESS_READ, SHARE_DENY_NONE);
        env.restart(100);
        assert!(env.registry().in_grace());

        let a = env.client("a");
        let mut reclaim = env.open_args(a, "o", 0, &fh("F"), SHARE_ACCESS_READ, SHARE_DENY_NONE);
        reclaim.claim = OpenClaim::Previous(DelegType::None);
        let reply = env.open(&reclaim).unwrap();
        // I/O waits for the window to close
        assert!(matches!(
            env.registry()
                .check_stateid(FSID, &fh("F"), &reply.stateid, IoMode::Read),
            Err(StateError::Grace)
        ));

        let fresh = env.open_args(a, "other", 0, &fh("G"), SHARE_ACCESS_READ, SHARE_DENY_NONE);
        assert!(matches!(env.registry().open(&fresh), Err(StateError::Grace)));

        let stranger = env.client("stranger");
        let mut bogus = env.open_args(stranger, "o", 0, &fh("F"), SHARE_ACCESS_READ, SHARE_DENY_NONE);
        bogus.claim = OpenClaim::Previous(DelegType::None);
        assert!(matches!(env.registry().open(&bogus), Err(StateError::NoGrace)));
    }

    #[test]
    fn test_recovery_survives_losing_one_path() {
        let mut env = StateEnv::with_paths(2);
        env.client("a");

        std::fs::remove_dir_all(env.path(0)).unwrap();
        assert_eq!(env.restart(100), 1);

        let a = env.client("a");
        let mut reclaim = env.open_args(a, "o", 0, &fh("F"), SHARE_ACCESS_READ, SHARE_DENY_NONE);
        reclaim.claim = OpenClaim::Previous(DelegType::None);
        assert!(env.open(&reclaim).is_ok());
    }

    #[test]
    fn test_collected_old_state_rejects_reclaim() {
        let mut env = StateEnv::new();
        env.client("a");
        assert_eq!(env.restart(100), 1);
        assert_eq!(oldstate_entries(env.path(0)), 1);

        // consulted once while the window is open
        env.client("b");

        let period = env.registry().grace_period_secs();
        env.clock().advance(period + 1);
        assert!(!env.registry().in_grace());

        let a = env.client("a");
        assert_eq!(oldstate_entries(env.path(0)), 0);

        let mut reclaim = env.open_args(a, "o", 0, &fh("F"), SHARE_ACCESS_READ, SHARE_DENY_NONE);
        reclaim.claim = OpenClaim::Previous(DelegType::None);
        assert!(matches!(env.registry().open(&reclaim), Err(StateError::NoGrace)));

        let normal = env.open_args(a, "o2", 0, &fh("F"), SHARE_ACCESS_READ, SHARE_DENY_NONE);
        assert!(env.open(&normal).is_ok());
    }

    #[test]
    fn test_second_restart_only_recovers_confirmed_clients() {
        let mut env = StateEnv::new();
        env.client("a");
        env.registry()
            .set_client_id(&env.setclientid_args("pending", 1))
            .unwrap();
        assert_eq!(env.restart(100), 1);
    }
}
