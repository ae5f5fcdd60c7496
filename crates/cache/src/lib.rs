//! Tiller incremental-build cache.
//!
//! The cache holds derived objects from previous compilation passes, keyed
//! by stable strings, together with the dependency links between them.
//! Invalidating a key removes it and everything transitively derived from
//! it, so a warm incremental rebuild is observably identical to a cold one.

#![forbid(unsafe_code)]

mod stats;

pub use stats::{ReconfigKind, ReconfigStats};

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

/// Cached values are type-erased; the cache has no opinion about them
/// beyond identity. Callers downcast with [`Cache::get_as`].
pub type CachedObject = Arc<dyn Any + Send + Sync>;

/// Hit/miss/invalidation counters, reset together with the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidate_calls: u64,
    pub invalidated_objects: u64,
}

/// The process-wide build cache. Mutation is single-writer: only the
/// compiling thread calls `put`/`link`/`invalidate`, and callers needing
/// concurrent compilation must serialize passes themselves.
pub struct Cache {
    entries: FxHashMap<String, CachedObject>,
    /// Forward adjacency: owner -> owned (owner was derived from owned).
    links: FxHashMap<String, BTreeSet<String>>,
    /// Reverse adjacency: owned -> owners, for invalidation walks.
    owners: FxHashMap<String, BTreeSet<String>>,
    stats: CacheStats,
}

impl Cache {
    pub fn new() -> Self {
        debug!("CACHE: initialized");
        Self {
            entries: FxHashMap::default(),
            links: FxHashMap::default(),
            owners: FxHashMap::default(),
            stats: CacheStats::default(),
        }
    }

    /// Fetch the object for `key`. A miss is never an error.
    pub fn get(&mut self, key: &str) -> Option<CachedObject> {
        match self.entries.get(key) {
            Some(obj) => {
                debug!(key, "CACHE: hit");
                self.stats.hits += 1;
                metrics::counter!("cache_hits_total", 1);
                Some(Arc::clone(obj))
            }
            None => {
                debug!(key, "CACHE: miss");
                self.stats.misses += 1;
                metrics::counter!("cache_misses_total", 1);
                None
            }
        }
    }

    /// Typed fetch: returns `None` when the cached value is not a `T`.
    /// The lookup itself still counts as a hit in the stats.
    pub fn get_as<T: Any + Send + Sync>(&mut self, key: &str) -> Option<Arc<T>> {
        self.get(key).and_then(|obj| obj.downcast::<T>().ok())
    }

    /// Insert or overwrite the entry for `key`.
    pub fn put(&mut self, key: impl Into<String>, object: CachedObject) {
        let key = key.into();
        debug!(key = %key, "CACHE: put");
        self.entries.insert(key, object);
    }

    /// Record that `owner`'s cached value was derived from `owned`'s.
    ///
    /// Idempotent. Either key may be unknown at declaration time, and the
    /// link graph may contain cycles; invalidation tolerates both.
    pub fn link(&mut self, owner: &str, owned: &str) {
        self.links
            .entry(owner.to_string())
            .or_default()
            .insert(owned.to_string());
        self.owners
            .entry(owned.to_string())
            .or_default()
            .insert(owner.to_string());
    }

    /// Remove `key` and everything transitively derived from it: every
    /// owner, every owner-of-an-owner, and so on. A worklist with a visited
    /// set keeps cyclic link graphs terminating. Unknown keys are no-ops.
    pub fn invalidate(&mut self, key: &str) {
        self.stats.invalidate_calls += 1;
        metrics::counter!("cache_invalidate_calls_total", 1);

        let mut worklist = vec![key.to_string()];
        let mut to_delete: BTreeSet<String> = BTreeSet::new();

        while let Some(key) = worklist.pop() {
            if !to_delete.insert(key.clone()) {
                continue;
            }

            if let Some(owners) = self.owners.get(&key) {
                for owner in owners {
                    debug!(key = %key, owner = %owner, "CACHE: DEL will check owner");
                    worklist.push(owner.clone());
                }
            }
        }

        for key in &to_delete {
            if self.entries.remove(key).is_some() {
                debug!(key = %key, "CACHE: DEL");
                self.stats.invalidated_objects += 1;
                metrics::counter!("cache_invalidated_objects_total", 1);
            }

            // Drop the dead key's edges in both directions.
            if let Some(owned) = self.links.remove(key) {
                for o in owned {
                    if let Some(rev) = self.owners.get_mut(&o) {
                        rev.remove(key);
                    }
                }
            }
            if let Some(owners) = self.owners.remove(key) {
                for o in owners {
                    if let Some(fwd) = self.links.get_mut(&o) {
                        fwd.remove(key);
                    }
                }
            }
        }
    }

    /// Explicit full clear: the only way the cache is ever emptied.
    pub fn reset(&mut self) {
        debug!("CACHE: reset");
        self.entries.clear();
        self.links.clear();
        self.owners.clear();
        self.stats = CacheStats::default();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Owner -> owned adjacency view, for diagnostics and tests.
    pub fn links(&self) -> &FxHashMap<String, BTreeSet<String>> {
        &self.links
    }

    /// Log the cache contents at debug level.
    pub fn dump(&self, reason: &str) {
        debug!(reason, entries = self.entries.len(), "CACHE: dump");

        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();

        for key in keys {
            debug!(key = %key, "CACHE: entry");
            if let Some(owned) = self.links.get(key.as_str()) {
                for o in owned {
                    debug!(key = %key, owned = %o, "CACHE:   ->");
                }
            }
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
