//! Server instances (grace generations) and reclaim eligibility.
//!
//! A generation is created at startup and on every cluster failover. Its
//! grace window length is fixed when the generation is created. Clients
//! whose identity appears in some generation's old-state list may reclaim
//! while that generation is in grace.

use crate::stable::{OldStateRecord, StableDir, StableStorage};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One server instance.
#[derive(Debug)]
pub struct GraceGeneration {
    id: u32,
    period: u64,
    start: RwLock<Option<u64>>,
    dss_paths: Vec<PathBuf>,
    oldstate: RwLock<Vec<OldStateRecord>>,
}

impl GraceGeneration {
    /// Generation `id` with a closed window.
    pub fn new(id: u32, period: u64, dss_paths: Vec<PathBuf>) -> Self {
        Self {
            id,
            period,
            start: RwLock::new(None),
            dss_paths,
            oldstate: RwLock::new(Vec::new()),
        }
    }

    /// Generation number, starting at zero.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Grace window length, snapshotted at creation.
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Stable-storage paths this generation recovered from.
    pub fn dss_paths(&self) -> &[PathBuf] {
        &self.dss_paths
    }

    /// True once the window has been opened.
    pub fn is_started(&self) -> bool {
        self.start.read().is_some()
    }

    /// Opens the grace window at `now`.
    pub fn start(&self, now: u64) {
        *self.start.write() = Some(now);
    }

    /// True while the window is open.
    pub fn in_grace(&self, now: u64) -> bool {
        match *self.start.read() {
            Some(start) => now.saturating_sub(start) < self.period,
            None => false,
        }
    }

    /// End of the window, if started.
    pub fn grace_end(&self) -> Option<u64> {
        self.start.read().map(|s| s.saturating_add(self.period))
    }

    /// Appends records that may be reclaimed in this generation.
    pub fn add_oldstate(&self, records: Vec<OldStateRecord>) {
        if records.is_empty() {
            return;
        }
        self.oldstate.write().extend(records);
    }

    /// Records still reclaimable.
    pub fn oldstate_len(&self) -> usize {
        self.oldstate.read().len()
    }

    /// True when a record for client id `id` is in the old-state list.
    pub fn oldstate_contains(&self, id: &[u8]) -> bool {
        self.oldstate.read().iter().any(|r| r.record.id == id)
    }

    /// Empties the old-state list and deletes its records from the
    /// old-state directory of each of this generation's paths.
    pub fn clear_oldstate(&self, storage: &StableStorage) -> usize {
        let records = std::mem::take(&mut *self.oldstate.write());
        for rec in &records {
            storage.remove_leaf(&self.dss_paths, StableDir::OldState, &rec.leaf);
        }
        if !records.is_empty() {
            debug!(generation = self.id, cleared = records.len(), "cleared old state");
        }
        records.len()
    }
}

/// All generations of this server, current last.
#[derive(Debug)]
pub struct GraceChain {
    generations: RwLock<Vec<Arc<GraceGeneration>>>,
    current: RwLock<Arc<GraceGeneration>>,
    next_id: AtomicU32,
}

impl GraceChain {
    /// Creates the chain with its first generation.
    pub fn new(period: u64, dss_paths: Vec<PathBuf>) -> Self {
        let first = Arc::new(GraceGeneration::new(0, period, dss_paths));
        Self {
            generations: RwLock::new(vec![first.clone()]),
            current: RwLock::new(first),
            next_id: AtomicU32::new(1),
        }
    }

    /// Generation new clients join.
    pub fn current(&self) -> Arc<GraceGeneration> {
        self.current.read().clone()
    }

    /// Adds a generation and makes it current.
    pub fn new_generation(&self, period: u64, dss_paths: Vec<PathBuf>) -> Arc<GraceGeneration> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let generation = Arc::new(GraceGeneration::new(id, period, dss_paths));
        let mut gens = self.generations.write();
        gens.push(generation.clone());
        *self.current.write() = generation.clone();
        info!(generation = id, period, "new server instance");
        generation
    }

    /// Generations from newest to oldest.
    pub fn newest_first(&self) -> Vec<Arc<GraceGeneration>> {
        self.generations.read().iter().rev().cloned().collect()
    }

    /// Number of generations.
    pub fn len(&self) -> usize {
        self.generations.read().len()
    }

    /// True when no generation exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the window of every generation that has never started.
    pub fn start_pending(&self, now: u64) {
        for generation in self.generations.read().iter() {
            if !generation.is_started() {
                generation.start(now);
                info!(generation = generation.id(), "grace period started");
            }
        }
    }

    /// Restarts the window of every generation still in grace.
    pub fn reset_in_grace(&self, now: u64) {
        for generation in self.generations.read().iter() {
            if generation.in_grace(now) {
                generation.start(now);
            }
        }
    }

    /// Every storage path of every generation, deduplicated, newest first.
    pub fn all_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for generation in self.newest_first() {
            for p in generation.dss_paths() {
                if !paths.contains(p) {
                    paths.push(p.clone());
                }
            }
        }
        paths
    }

    /// Decides whether client id `id` may reclaim.
    ///
    /// Walks generations newest to oldest. A generation whose window has
    /// closed has its old state cleared on the way, so a reclaim that was
    /// possible before the window closed is never granted afterwards.
    pub fn check_reclaim(&self, id: &[u8], now: u64, storage: &StableStorage) -> bool {
        for generation in self.newest_first() {
            if generation.oldstate_len() == 0 || !generation.is_started() {
                continue;
            }
            if !generation.in_grace(now) {
                generation.clear_oldstate(storage);
                continue;
            }
            if generation.oldstate_contains(id) {
                return true;
            }
        }
        false
    }

    /// Clears the old state of every generation; used at shutdown.
    pub fn clear_all(&self, storage: &StableStorage) {
        for generation in self.newest_first() {
            generation.clear_oldstate(storage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stable::ClientRecord;
    use tempfile::TempDir;

    fn old(leaf: &str, id: &[u8]) -> OldStateRecord {
        OldStateRecord {
            leaf: leaf.to_string(),
            record: ClientRecord {
                verifier: [0; 8],
                id: id.to_vec(),
            },
        }
    }

    #[test]
    fn test_window_uses_snapshotted_period() {
        let g = GraceGeneration::new(0, 90, Vec::new());
        assert!(!g.in_grace(100));
        g.start(100);
        assert!(g.in_grace(100));
        assert!(g.in_grace(189));
        assert!(!g.in_grace(190));
        assert_eq!(g.grace_end(), Some(190));
    }

    #[test]
    fn test_start_pending_skips_started() {
        let chain = GraceChain::new(10, Vec::new());
        chain.start_pending(100);
        let second = chain.new_generation(10, Vec::new());
        chain.start_pending(105);
        assert_eq!(chain.newest_first()[1].grace_end(), Some(110));
        assert_eq!(second.grace_end(), Some(115));
    }

    #[test]
    fn test_reset_restarts_only_generations_in_grace() {
        let chain = GraceChain::new(10, Vec::new());
        chain.start_pending(100);
        chain.reset_in_grace(105);
        assert_eq!(chain.current().grace_end(), Some(115));
        chain.reset_in_grace(200);
        assert_eq!(chain.current().grace_end(), Some(115));
    }

    #[test]
    fn test_reclaim_found_in_older_generation() {
        let storage = StableStorage::local(None);
        let chain = GraceChain::new(10, Vec::new());
        chain.current().add_oldstate(vec![old("a", b"client-a")]);
        chain.new_generation(10, Vec::new());
        chain.start_pending(100);
        assert!(chain.check_reclaim(b"client-a", 101, &storage));
        assert!(!chain.check_reclaim(b"client-b", 101, &storage));
    }

    #[test]
    fn test_reclaim_after_window_clears_old_state() {
        let dir = TempDir::new().unwrap();
        let storage = StableStorage::local(None);
        storage.prepare(dir.path()).unwrap();
        let leaf = dir.path().join(crate::stable::OLDSTATE_DIR).join("a");
        std::fs::write(&leaf, b"x").unwrap();

        let chain = GraceChain::new(10, vec![dir.path().to_path_buf()]);
        chain.current().add_oldstate(vec![old("a", b"client-a")]);
        chain.start_pending(100);
        assert!(!chain.check_reclaim(b"client-a", 200, &storage));
        assert_eq!(chain.current().oldstate_len(), 0);
        assert!(!leaf.exists());
        chain.reset_in_grace(200);
        assert!(!chain.check_reclaim(b"client-a", 200, &storage));
    }

    #[test]
    fn test_unstarted_generation_keeps_old_state() {
        let storage = StableStorage::local(None);
        let chain = GraceChain::new(10, Vec::new());
        chain.current().add_oldstate(vec![old("a", b"client-a")]);
        assert!(!chain.check_reclaim(b"client-a", 500, &storage));
        assert_eq!(chain.current().oldstate_len(), 1);
    }

    #[test]
    fn test_all_paths_deduplicated() {
        let chain = GraceChain::new(10, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        chain.new_generation(10, vec![PathBuf::from("/b"), PathBuf::from("/c")]);
        assert_eq!(
            chain.all_paths(),
            vec![PathBuf::from("/b"), PathBuf::from("/c"), PathBuf::from("/a")]
        );
    }
}
