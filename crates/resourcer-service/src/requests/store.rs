use std::collections::HashMap;
use std::sync::Arc;

use lru::LruCache;

use super::RequestDriver;
use super::entry::Entry;

/// All entries of one handler.
///
/// Entries with consumers are `active`. Entries without consumers are kept in the `stale` LRU
/// for reuse, bounded by `max_stale`. An entry is in exactly one of the two maps until it is
/// destroyed.
pub(super) struct Store<D: RequestDriver> {
    active: HashMap<String, Arc<Entry<D>>>,
    stale: LruCache<String, Arc<Entry<D>>>,
    max_stale: usize,
}

impl<D: RequestDriver> Store<D> {
    pub fn new(max_stale: usize) -> Self {
        Self {
            active: HashMap::new(),
            stale: LruCache::unbounded(),
            max_stale,
        }
    }

    pub fn get(&self, uid: &str) -> Option<&Arc<Entry<D>>> {
        self.active.get(uid).or_else(|| self.stale.peek(uid))
    }

    pub fn insert(&mut self, entry: Arc<Entry<D>>) {
        self.active.insert(entry.uid.clone(), entry);
    }

    /// Moves `entry` back from the stale set, if it is there.
    pub fn activate(&mut self, entry: &Arc<Entry<D>>) {
        if self
            .stale
            .peek(entry.uid.as_str())
            .is_some_and(|stale| Arc::ptr_eq(stale, entry))
        {
            self.stale.pop(entry.uid.as_str());
            self.active.insert(entry.uid.clone(), Arc::clone(entry));
        }
    }

    /// Moves `entry` into the stale set.
    ///
    /// Returns the entries pushed out by capacity pressure, which may include `entry` itself.
    /// The caller is responsible for retiring them.
    pub fn make_stale(&mut self, entry: &Arc<Entry<D>>) -> Vec<Arc<Entry<D>>> {
        if self
            .active
            .get(&entry.uid)
            .is_some_and(|active| Arc::ptr_eq(active, entry))
        {
            self.active.remove(&entry.uid);
        }
        self.stale.push(entry.uid.clone(), Arc::clone(entry));

        let mut evicted = Vec::new();
        while self.stale.len() > self.max_stale {
            match self.stale.pop_lru() {
                Some((_, entry)) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    pub fn is_stale(&self, entry: &Arc<Entry<D>>) -> bool {
        self.stale
            .peek(entry.uid.as_str())
            .is_some_and(|stale| Arc::ptr_eq(stale, entry))
    }

    /// Removes `entry` from whichever set holds it.
    pub fn remove(&mut self, entry: &Arc<Entry<D>>) -> bool {
        if self
            .active
            .get(&entry.uid)
            .is_some_and(|active| Arc::ptr_eq(active, entry))
        {
            self.active.remove(&entry.uid);
            return true;
        }
        if self.is_stale(entry) {
            self.stale.pop(entry.uid.as_str());
            return true;
        }
        false
    }

    pub fn drain(&mut self) -> Vec<Arc<Entry<D>>> {
        let mut entries: Vec<_> = self.active.drain().map(|(_, entry)| entry).collect();
        while let Some((_, entry)) = self.stale.pop_lru() {
            entries.push(entry);
        }
        entries
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn stale_len(&self) -> usize {
        self.stale.len()
    }
}
