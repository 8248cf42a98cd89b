//! Lock ranking for state entries.
//!
//! Entry locks must be taken in rank order within one thread. Debug builds
//! keep a per-thread stack of held ranks and assert on every acquisition;
//! release builds compile the checks away.

#[cfg(debug_assertions)]
use std::cell::RefCell;

/// Position of an entity type in the global lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    /// Taken first
    Client = 0,
    /// Open-owner entries
    OpenOwner = 1,
    /// Open-state entries
    OpenState = 2,
    /// Lock-state entries
    LockState = 3,
    /// Lock-owner entries
    LockOwner = 4,
    /// Delegation-state entries
    Delegation = 5,
    /// File entries
    File = 6,
    /// Taken last
    ClientIp = 7,
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

/// Proof that a rank was acquired in order; releases the rank on drop.
#[derive(Debug)]
#[must_use]
pub struct RankToken {
    #[cfg(debug_assertions)]
    rank: LockRank,
}

/// Records acquisition of `rank`, asserting order in debug builds.
pub fn acquire(rank: LockRank) -> RankToken {
    #[cfg(debug_assertions)]
    {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(top) = held.iter().max() {
                debug_assert!(
                    *top < rank,
                    "lock order violation: acquiring {:?} while holding {:?}",
                    rank,
                    *top
                );
            }
            held.push(rank);
        });
        RankToken { rank }
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = rank;
        RankToken {}
    }
}

/// Ranks currently held by this thread, in acquisition order.
#[cfg(debug_assertions)]
pub fn held_ranks() -> Vec<LockRank> {
    HELD.with(|held| held.borrow().clone())
}

impl Drop for RankToken {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|r| *r == self.rank) {
                held.remove(pos);
            }
        });
    }
}
