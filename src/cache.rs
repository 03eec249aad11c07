//! Bounded get-or-load cache
//!
//! Entries expire a fixed time after they were written and the cache is
//! bounded by entry count, evicting the least recently accessed entry first.
//! Concurrent callers asking for the same missing key share a single load:
//! the first one runs the loader, the rest block on that key only.
//!
//! An optional removal listener observes every value that leaves the cache,
//! which is how write-back caches hook their save action in. Listeners always
//! run outside the cache lock, on the thread that caused the removal.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Older than the configured time-to-live
    Expired,
    /// Pushed out by the capacity bound or an explicit trim
    Size,
    /// Removed through `invalidate`/`invalidate_all`
    Explicit,
    /// Overwritten by `insert`
    Replaced,
}

pub type RemovalListener<K, V> = Box<dyn Fn(&K, V, RemovalCause) + Send + Sync>;

/// Statistics about cache performance
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
}

struct Slot<V> {
    cell: Arc<OnceLock<V>>,
    written: Instant,
    last_access: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// Keys by last access tick, least recent first
    recency: BTreeMap<u64, K>,
    tick: u64,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Mark `key` as the most recently accessed entry
    fn touch(&mut self, key: &K) -> Option<&Slot<V>> {
        let tick = self.next_tick();
        let slot = self.entries.get_mut(key)?;
        self.recency.remove(&slot.last_access);
        slot.last_access = tick;
        self.recency.insert(tick, key.clone());
        Some(&*slot)
    }

    fn put(&mut self, key: K, cell: Arc<OnceLock<V>>, written: Instant) -> Option<Slot<V>> {
        let tick = self.next_tick();
        self.recency.insert(tick, key.clone());
        let previous = self.entries.insert(
            key,
            Slot {
                cell,
                written,
                last_access: tick,
            },
        )?;
        self.recency.remove(&previous.last_access);
        Some(previous)
    }

    fn take(&mut self, key: &K) -> Option<(K, Slot<V>)> {
        let (key, slot) = self.entries.remove_entry(key)?;
        self.recency.remove(&slot.last_access);
        Some((key, slot))
    }

    /// Least recently accessed loaded entry; in-flight loads are never evicted
    fn eviction_candidate(&self) -> Option<K> {
        self.recency
            .values()
            .find(|key| self.entries.get(*key).map_or(false, |slot| slot.cell.get().is_some()))
            .cloned()
    }
}

/// Builder for [`LoadingCache`]
pub struct CacheBuilder<K, V> {
    max_capacity: usize,
    expire_after_write: Option<Duration>,
    listener: Option<RemovalListener<K, V>>,
}

impl<K, V> CacheBuilder<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity.max(1);
        self
    }

    pub fn expire_after_write(mut self, ttl: Duration) -> Self {
        self.expire_after_write = Some(ttl);
        self
    }

    pub fn removal_listener(mut self, listener: impl Fn(&K, V, RemovalCause) + Send + Sync + 'static) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn build(self) -> LoadingCache<K, V> {
        LoadingCache {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
                stats: CacheStats::default(),
            }),
            max_capacity: self.max_capacity,
            expire_after_write: self.expire_after_write,
            listener: self.listener,
        }
    }
}

pub struct LoadingCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    max_capacity: usize,
    expire_after_write: Option<Duration>,
    listener: Option<RemovalListener<K, V>>,
}

impl<K, V> LoadingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder {
            max_capacity: usize::MAX,
            expire_after_write: None,
            listener: None,
        }
    }

    fn is_expired(&self, slot: &Slot<V>, now: Instant) -> bool {
        self.expire_after_write
            .map_or(false, |ttl| now.duration_since(slot.written) >= ttl)
    }

    /// Return the cached value for `key`, running `load` on a miss.
    ///
    /// At most one `load` per key runs at a time; concurrent callers for the
    /// same key wait for it and receive its result.
    pub fn get_or_load(&self, key: K, load: impl FnOnce() -> V) -> V {
        let now = Instant::now();
        let mut removed = Vec::new();

        let (cell, missed) = {
            let mut state = self.state.lock();

            // A load still in flight is shared even past the TTL
            let expired = state
                .entries
                .get(&key)
                .map_or(false, |slot| slot.cell.get().is_some() && self.is_expired(slot, now));
            if expired {
                if let Some((key, slot)) = state.take(&key) {
                    removed.push((key, slot, RemovalCause::Expired));
                }
            }

            match state.touch(&key).map(|slot| Arc::clone(&slot.cell)) {
                Some(cell) => {
                    state.stats.hits += 1;
                    (cell, false)
                }
                None => {
                    let cell = Arc::new(OnceLock::new());
                    state.put(key, Arc::clone(&cell), now);
                    state.stats.misses += 1;
                    (cell, true)
                }
            }
        };

        let value = cell.get_or_init(load).clone();

        if missed {
            self.collect_over_capacity(&mut removed);
        }
        self.notify(removed);

        value
    }

    /// Cached value for `key` if present, loaded and not expired
    pub fn get_if_present(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let slot = state.entries.get(key)?;
        if slot.cell.get().is_none() || self.is_expired(slot, now) {
            return None;
        }
        let value = state.touch(key).and_then(|slot| slot.cell.get().cloned());
        state.stats.hits += 1;
        value
    }

    /// Store `value` under `key`, replacing anything already cached
    pub fn insert(&self, key: K, value: V) {
        let cell = Arc::new(OnceLock::new());
        let _ = cell.set(value);

        let mut removed = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.put(key.clone(), cell, Instant::now()) {
                removed.push((key, previous, RemovalCause::Replaced));
            }
        }

        self.collect_over_capacity(&mut removed);
        self.notify(removed);
    }

    pub fn invalidate(&self, key: &K) {
        let removed = self.state.lock().take(key);
        if let Some((key, slot)) = removed {
            self.notify(vec![(key, slot, RemovalCause::Explicit)]);
        }
    }

    pub fn invalidate_all(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.recency.clear();
            state.entries.drain().collect()
        };
        self.notify(
            drained
                .into_iter()
                .map(|(key, slot)| (key, slot, RemovalCause::Explicit))
                .collect(),
        );
    }

    /// Remove every entry matching `predicate`
    pub fn invalidate_if(&self, mut predicate: impl FnMut(&K) -> bool) {
        let removed = {
            let mut state = self.state.lock();
            let keys: Vec<K> = state.entries.keys().filter(|k| predicate(*k)).cloned().collect();
            keys.into_iter()
                .filter_map(|k| state.take(&k))
                .map(|(key, slot)| (key, slot, RemovalCause::Explicit))
                .collect()
        };
        self.notify(removed);
    }

    /// Evict expired entries now instead of on the next unlucky access.
    ///
    /// Returns without doing anything when another thread holds the cache lock.
    pub fn clean_up(&self) {
        let now = Instant::now();
        let removed = {
            let Some(mut state) = self.state.try_lock() else {
                return;
            };
            let keys: Vec<K> = state
                .entries
                .iter()
                .filter(|(_, slot)| slot.cell.get().is_some() && self.is_expired(slot, now))
                .map(|(key, _)| key.clone())
                .collect();
            let removed: Vec<_> = keys
                .into_iter()
                .filter_map(|k| state.take(&k))
                .map(|(key, slot)| (key, slot, RemovalCause::Expired))
                .collect();
            state.stats.evictions += removed.len() as u64;
            removed
        };
        self.notify(removed);
    }

    /// Evict the oldest written entries until at most `max_entries` remain
    pub fn trim_to(&self, max_entries: usize) {
        let removed = {
            let mut state = self.state.lock();
            if state.entries.len() <= max_entries {
                return;
            }

            let mut loaded: Vec<(K, Instant)> = state
                .entries
                .iter()
                .filter(|(_, slot)| slot.cell.get().is_some())
                .map(|(key, slot)| (key.clone(), slot.written))
                .collect();
            loaded.sort_by_key(|(_, written)| *written);

            let excess = state.entries.len() - max_entries;
            let removed: Vec<_> = loaded
                .into_iter()
                .take(excess)
                .filter_map(|(k, _)| state.take(&k))
                .map(|(key, slot)| (key, slot, RemovalCause::Size))
                .collect();
            state.stats.evictions += removed.len() as u64;
            removed
        };
        self.notify(removed);
    }

    /// Snapshot of every loaded entry
    pub fn entries(&self) -> Vec<(K, V)> {
        self.state
            .lock()
            .entries
            .iter()
            .filter_map(|(key, slot)| slot.cell.get().map(|v| (key.clone(), v.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.entry_count = state.entries.len();
        stats
    }

    fn collect_over_capacity(&self, removed: &mut Vec<(K, Slot<V>, RemovalCause)>) {
        let mut state = self.state.lock();
        while state.entries.len() > self.max_capacity {
            let Some(victim) = state.eviction_candidate() else {
                break;
            };
            if let Some((key, slot)) = state.take(&victim) {
                state.stats.evictions += 1;
                removed.push((key, slot, RemovalCause::Size));
            }
        }
    }

    fn notify(&self, removed: Vec<(K, Slot<V>, RemovalCause)>) {
        if removed.is_empty() {
            return;
        }
        log::trace!("Evicting {} cache entries", removed.len());

        let Some(listener) = &self.listener else {
            return;
        };
        for (key, slot, cause) in removed {
            if let Some(value) = slot.cell.get().cloned() {
                listener(&key, value, cause);
            }
        }
    }
}
