//! Client lease bookkeeping.

use serde::{Deserialize, Serialize};

/// Lease of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Last time the client presented valid state
    pub last_access: u64,
    /// Set administratively or on scrub; the lease can no longer be renewed
    pub forced_expire: bool,
}

impl Lease {
    /// Lease renewed at `now`.
    pub fn new(now: u64) -> Self {
        Self {
            last_access: now,
            forced_expire: false,
        }
    }

    /// Renews the lease unless it was forcibly expired.
    pub fn renew(&mut self, now: u64) {
        if !self.forced_expire {
            self.last_access = now;
        }
    }

    /// Marks the lease as expired regardless of its age.
    pub fn force_expire(&mut self) {
        self.forced_expire = true;
    }

    /// True when forced, or when more than `lease_secs` passed since the
    /// last renewal.
    pub fn is_expired(&self, now: u64, lease_secs: u64) -> bool {
        self.forced_expire || self.lapsed(now, lease_secs)
    }

    /// Time-based half of [`Lease::is_expired`].
    pub fn lapsed(&self, now: u64, lease_secs: u64) -> bool {
        now.saturating_sub(self.last_access) > lease_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_valid_within_duration() {
        let lease = Lease::new(100);
        assert!(!lease.is_expired(100, 90));
        assert!(!lease.is_expired(190, 90));
        assert!(lease.is_expired(191, 90));
    }

    #[test]
    fn test_renew_moves_window() {
        let mut lease = Lease::new(100);
        lease.renew(180);
        assert!(!lease.is_expired(260, 90));
    }

    #[test]
    fn test_forced_expire_blocks_renewal() {
        let mut lease = Lease::new(100);
        lease.force_expire();
        assert!(lease.is_expired(100, 90));
        lease.renew(150);
        assert_eq!(lease.last_access, 100);
        assert!(lease.is_expired(150, 90));
        assert!(!lease.lapsed(150, 90));
    }

    #[test]
    fn test_clock_behind_last_access_is_not_expired() {
        let lease = Lease::new(500);
        assert!(!lease.is_expired(400, 90));
    }
}
