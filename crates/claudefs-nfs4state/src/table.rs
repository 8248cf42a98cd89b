//! Keyed entity tables.
//!
//! Each table owns its entries behind one coarse mutex together with a single
//! secondary index. Entries carry their own data lock, a reference count, an
//! invalid mark and the time of their last release. Lookups never return
//! invalid or hidden entries. Entries leave a table only through [`Table::reap`],
//! and only once nobody holds them.

use crate::clock::Clock;
use crate::error::{Result, StateError};
use crate::lock_order::{self, LockRank, RankToken};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Stable per-table entry handle.
pub type EntryId = u32;

/// Secondary-index key extraction.
pub trait Keyed {
    /// Index key type
    type Key: Hash + Eq + Clone + Send;

    /// Key this entry is indexed under; fixed for the entry's lifetime.
    fn key(&self) -> Self::Key;
}

/// One table entry.
pub struct Entry<T> {
    id: EntryId,
    rank: LockRank,
    data: Mutex<T>,
    refcnt: AtomicU32,
    invalid: AtomicBool,
    hidden: AtomicBool,
    time_rele: AtomicU64,
}

impl<T> Entry<T> {
    /// Entry id, unique within the table.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Locks the entry's data, checking lock order in debug builds.
    pub fn lock(&self) -> EntryGuard<'_, T> {
        let rank = lock_order::acquire(self.rank);
        EntryGuard {
            guard: self.data.lock(),
            _rank: rank,
        }
    }

    /// Locks the data while the caller already accounts for this rank.
    fn lock_ranked(&self) -> MutexGuard<'_, T> {
        self.data.lock()
    }

    /// Marks the entry unfindable. Destruction happens later in the reaper.
    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    /// True once invalidated; the entry is no longer findable.
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    /// Outstanding holds.
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// Time of the most recent release, zero if never released.
    pub fn time_rele(&self) -> u64 {
        self.time_rele.load(Ordering::SeqCst)
    }

    pub(crate) fn hide(&self) {
        self.hidden.store(true, Ordering::SeqCst);
    }

    pub(crate) fn unhide(&self) {
        self.hidden.store(false, Ordering::SeqCst);
    }

    fn is_visible(&self) -> bool {
        !self.is_invalid() && !self.hidden.load(Ordering::SeqCst)
    }
}

/// Locked entry data.
pub struct EntryGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _rank: RankToken,
}

impl<T> Deref for EntryGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for EntryGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Counted reference to an entry. Cloning holds, dropping releases.
pub struct Held<T> {
    entry: Arc<Entry<T>>,
    clock: Arc<dyn Clock>,
}

impl<T> Held<T> {
    fn new(entry: Arc<Entry<T>>, clock: Arc<dyn Clock>) -> Self {
        entry.refcnt.fetch_add(1, Ordering::SeqCst);
        Self { entry, clock }
    }

    /// True when both references name the same entry.
    pub fn ptr_eq(a: &Held<T>, b: &Held<T>) -> bool {
        Arc::ptr_eq(&a.entry, &b.entry)
    }
}

impl<T> Clone for Held<T> {
    fn clone(&self) -> Self {
        Held::new(self.entry.clone(), self.clock.clone())
    }
}

impl<T> Drop for Held<T> {
    fn drop(&mut self) {
        self.entry
            .time_rele
            .store(self.clock.now_secs(), Ordering::SeqCst);
        self.entry.refcnt.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> Deref for Held<T> {
    type Target = Entry<T>;

    fn deref(&self) -> &Entry<T> {
        &self.entry
    }
}

impl<T> fmt::Debug for Held<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Held({:?}#{})", self.entry.rank, self.entry.id)
    }
}

struct TableInner<T: Keyed> {
    entries: BTreeMap<EntryId, Arc<Entry<T>>>,
    index: HashMap<T::Key, Vec<EntryId>>,
    next_id: EntryId,
}

/// A table of entities of one kind.
pub struct Table<T: Keyed> {
    name: &'static str,
    rank: LockRank,
    clock: Arc<dyn Clock>,
    max_id: EntryId,
    inner: Mutex<TableInner<T>>,
    create_lock: Mutex<()>,
    reaped: AtomicU64,
}

impl<T: Keyed> Table<T> {
    /// Creates an empty table whose entry ids run from 1 to `max_id`.
    pub fn new(name: &'static str, rank: LockRank, clock: Arc<dyn Clock>, max_id: EntryId) -> Self {
        Self {
            name,
            rank,
            clock,
            max_id: max_id.max(1),
            inner: Mutex::new(TableInner {
                entries: BTreeMap::new(),
                index: HashMap::new(),
                next_id: 1,
            }),
            create_lock: Mutex::new(()),
            reaped: AtomicU64::new(0),
        }
    }

    /// Table name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of entries, including invalid ones awaiting the reaper.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total entries destroyed by the reaper.
    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }

    fn held(&self, entry: &Arc<Entry<T>>) -> Held<T> {
        Held::new(entry.clone(), self.clock.clone())
    }

    /// Looks up a valid entry by id.
    pub fn get(&self, id: EntryId) -> Option<Held<T>> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&id)
            .filter(|e| e.is_visible())
            .map(|e| self.held(e))
    }

    /// Looks up an entry by id even if it has been invalidated.
    pub fn get_any(&self, id: EntryId) -> Option<Held<T>> {
        let inner = self.inner.lock();
        inner.entries.get(&id).map(|e| self.held(e))
    }

    fn candidates(&self, key: &T::Key) -> Vec<Held<T>> {
        let inner = self.inner.lock();
        inner
            .index
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.entries.get(id))
                    .filter(|e| e.is_visible())
                    .map(|e| self.held(e))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn first_match<F>(&self, key: &T::Key, filter: &F) -> Option<Held<T>>
    where
        F: Fn(&T) -> bool,
    {
        self.candidates(key).into_iter().find(|h| {
            let data = h.lock_ranked();
            h.is_visible() && filter(&data)
        })
    }

    /// Finds a valid entry under `key` accepted by `filter`.
    pub fn find<F>(&self, key: &T::Key, filter: F) -> Option<Held<T>>
    where
        F: Fn(&T) -> bool,
    {
        let _rank = lock_order::acquire(self.rank);
        self.first_match(key, &filter)
    }

    /// Finds a valid entry under `key` accepted by `filter`, creating one
    /// with `create` when none exists. Returns whether the entry is new.
    ///
    /// `create` runs with the table's creation lock held and must not touch
    /// other entries of this table.
    pub fn find_or_create<F, C>(&self, key: &T::Key, filter: F, create: C) -> Result<(Held<T>, bool)>
    where
        F: Fn(&T) -> bool,
        C: FnOnce(EntryId) -> Option<T>,
    {
        let _rank = lock_order::acquire(self.rank);
        let _create = self.create_lock.lock();
        if let Some(found) = self.first_match(key, &filter) {
            return Ok((found, false));
        }
        self.insert_locked(create).map(|h| (h, true))
    }

    /// Creates a new entry without searching.
    pub fn create<C>(&self, create: C) -> Result<Held<T>>
    where
        C: FnOnce(EntryId) -> Option<T>,
    {
        let _rank = lock_order::acquire(self.rank);
        let _create = self.create_lock.lock();
        self.insert_locked(create)
    }

    fn insert_locked<C>(&self, create: C) -> Result<Held<T>>
    where
        C: FnOnce(EntryId) -> Option<T>,
    {
        let id = self.alloc_id()?;
        let data = create(id).ok_or_else(|| StateError::ServerFault {
            reason: format!("{} create policy refused entry {}", self.name, id),
        })?;
        let key = data.key();
        let entry = Arc::new(Entry {
            id,
            rank: self.rank,
            data: Mutex::new(data),
            refcnt: AtomicU32::new(0),
            invalid: AtomicBool::new(false),
            hidden: AtomicBool::new(false),
            time_rele: AtomicU64::new(self.clock.now_secs()),
        });
        let mut inner = self.inner.lock();
        inner.entries.insert(id, entry.clone());
        inner.index.entry(key).or_default().push(id);
        Ok(self.held(&entry))
    }

    fn alloc_id(&self) -> Result<EntryId> {
        let mut inner = self.inner.lock();
        for _ in 0..=self.max_id {
            let id = inner.next_id;
            inner.next_id = if id >= self.max_id { 1 } else { id + 1 };
            if !inner.entries.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(StateError::Resource {
            reason: format!("{} table full", self.name),
        })
    }

    /// Holds every entry, valid or not, for a walk.
    pub fn snapshot(&self) -> Vec<Held<T>> {
        let inner = self.inner.lock();
        inner.entries.values().map(|e| self.held(e)).collect()
    }

    /// Calls `f` for every entry, valid or not.
    pub fn walk<F>(&self, mut f: F)
    where
        F: FnMut(&Held<T>),
    {
        for held in self.snapshot() {
            f(&held);
        }
    }

    /// Destroys entries nobody holds that are invalid or that `expire`
    /// accepts. `destroy` runs after the entry has left the table.
    pub fn reap<E, D>(&self, mut expire: E, mut destroy: D) -> usize
    where
        E: FnMut(&Entry<T>) -> bool,
        D: FnMut(&Entry<T>),
    {
        let idle: Vec<Arc<Entry<T>>> = {
            let inner = self.inner.lock();
            inner
                .entries
                .values()
                .filter(|e| e.refcnt() == 0)
                .cloned()
                .collect()
        };

        let mut destroyed = 0;
        for entry in idle {
            if !entry.is_invalid() && !expire(entry.as_ref()) {
                continue;
            }
            if !self.remove_if_idle(&entry) {
                continue;
            }
            destroy(entry.as_ref());
            destroyed += 1;
        }
        if destroyed > 0 {
            self.reaped.fetch_add(destroyed as u64, Ordering::Relaxed);
            debug!(table = self.name, destroyed, "reaped entries");
        }
        destroyed
    }

    fn remove_if_idle(&self, entry: &Arc<Entry<T>>) -> bool {
        let key = entry.lock_ranked().key();
        let mut inner = self.inner.lock();
        if entry.refcnt() != 0 || !inner.entries.contains_key(&entry.id) {
            return false;
        }
        inner.entries.remove(&entry.id);
        if let Some(ids) = inner.index.get_mut(&key) {
            ids.retain(|id| *id != entry.id);
            if ids.is_empty() {
                inner.index.remove(&key);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Debug)]
    struct Item {
        name: String,
        closed: bool,
    }

    impl Keyed for Item {
        type Key = String;

        fn key(&self) -> String {
            self.name.clone()
        }
    }

    fn table() -> Table<Item> {
        Table::new("items", LockRank::OpenState, Arc::new(ManualClock::new(100)), 1000)
    }

    fn item(name: &str) -> Item {
        Item {
            name: name.to_string(),
            closed: false,
        }
    }

    #[test]
    fn test_find_or_create_returns_existing() {
        let t = table();
        let (a, created) = t
            .find_or_create(&"a".to_string(), |_| true, |_| Some(item("a")))
            .unwrap();
        assert!(created);
        let (b, created) = t
            .find_or_create(&"a".to_string(), |_| true, |_| Some(item("a")))
            .unwrap();
        assert!(!created);
        assert!(Held::ptr_eq(&a, &b));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_filter_excludes_closed_entries() {
        let t = table();
        let (a, _) = t
            .find_or_create(&"a".to_string(), |i| !i.closed, |_| Some(item("a")))
            .unwrap();
        a.lock().closed = true;
        let (b, created) = t
            .find_or_create(&"a".to_string(), |i| !i.closed, |_| Some(item("a")))
            .unwrap();
        assert!(created);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_refcount_tracks_holds() {
        let t = table();
        let a = t.create(|_| Some(item("a"))).unwrap();
        assert_eq!(a.refcnt(), 1);
        let b = a.clone();
        assert_eq!(a.refcnt(), 2);
        drop(b);
        assert_eq!(a.refcnt(), 1);
    }

    #[test]
    fn test_invalid_entries_not_found() {
        let t = table();
        let a = t.create(|_| Some(item("a"))).unwrap();
        a.invalidate();
        assert!(t.get(a.id()).is_none());
        assert!(t.get_any(a.id()).is_some());
        assert!(t.find(&"a".to_string(), |_| true).is_none());
    }

    #[test]
    fn test_hidden_entries_not_found() {
        let t = table();
        let a = t.create(|_| Some(item("a"))).unwrap();
        a.hide();
        assert!(t.find(&"a".to_string(), |_| true).is_none());
        a.unhide();
        assert!(t.find(&"a".to_string(), |_| true).is_some());
    }

    #[test]
    fn test_reap_skips_held_entries() {
        let t = table();
        let a = t.create(|_| Some(item("a"))).unwrap();
        a.invalidate();
        assert_eq!(t.reap(|_| false, |_| {}), 0);
        drop(a);
        let mut destroyed = Vec::new();
        assert_eq!(t.reap(|_| false, |e| destroyed.push(e.id())), 1);
        assert_eq!(destroyed, vec![1]);
        assert!(t.is_empty());
        assert_eq!(t.reaped(), 1);
    }

    #[test]
    fn test_reap_uses_expiry_policy() {
        let t = table();
        let id = t.create(|_| Some(item("a"))).unwrap().id();
        t.create(|_| Some(item("b"))).unwrap();
        let n = t.reap(|e| e.lock().name == "a", |_| {});
        assert_eq!(n, 1);
        assert!(t.get(id).is_none());
        assert_eq!(t.len(), 1);
        assert!(t.find(&"a".to_string(), |_| true).is_none());
    }

    #[test]
    fn test_ids_wrap_and_skip_live_entries() {
        let t: Table<Item> =
            Table::new("small", LockRank::File, Arc::new(ManualClock::new(0)), 2);
        let a = t.create(|_| Some(item("a"))).unwrap();
        let b = t.create(|_| Some(item("b"))).unwrap();
        assert_eq!((a.id(), b.id()), (1, 2));
        assert!(t.create(|_| Some(item("c"))).is_err());
        drop(b);
        t.reap(|e| e.lock().name == "b", |_| {});
        let c = t.create(|_| Some(item("c"))).unwrap();
        assert_eq!(c.id(), 2);
    }

    #[test]
    fn test_release_stamps_time() {
        let clock = Arc::new(ManualClock::new(10));
        let t: Table<Item> = Table::new("t", LockRank::File, clock.clone(), 10);
        let a = t.create(|_| Some(item("a"))).unwrap();
        let id = a.id();
        clock.advance(5);
        drop(a);
        assert_eq!(t.get(id).unwrap().time_rele(), 15);
    }
}
