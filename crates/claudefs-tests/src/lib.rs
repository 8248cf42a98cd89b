//! ClaudeFS NFSv4 State Validation
//!
//! Scenario tests that drive a [`claudefs_nfs4state::StateRegistry`] through
//! client lifecycles, server restarts, lease expiry and filesystem cleanup,
//! plus property tests over the sequence and identifier rules.

pub mod harness;
pub mod lifecycle_tests;
pub mod proptest_state;
pub mod recovery_tests;
pub mod teardown_tests;

pub use harness::{StateEnv, FSID, LEASE_SECS};
