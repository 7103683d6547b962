//  Copyright 2024 Foyer Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! The bounded, concurrent, approximate-LRU map backing the cache.
//!
//! Rather than hand-roll a segmented-LRU or CLOCK table, this wraps
//! `moka::sync::Cache`, a mature, already-W-TinyLFU-backed concurrent
//! cache that `foyer-memory` itself reaches for as its own reference
//! implementation in benchmarks (see that crate's `moka` dev-dependency).
//! `moka` supplies linearisable per-key `get`/`entry`/`invalidate`, a
//! single eviction-listener callout per victim, and weakly consistent
//! iteration, with no bespoke eviction algorithm needed.

use std::sync::Arc;

use ahash::RandomState;
use moka::notification::RemovalCause;
use moka::sync::Cache;

use crate::entry::Slot;
use crate::key::CacheKey;

pub(crate) struct BoundedConcurrentMap<H>
where
    H: Send + Sync + 'static,
{
    inner: Cache<CacheKey, Arc<Slot<H>>, RandomState>,
}

impl<H> BoundedConcurrentMap<H>
where
    H: Send + Sync + 'static,
{
    /// `listener` is invoked exactly once per evicted entry, on
    /// whichever thread triggers the eviction: capacity pressure,
    /// or one of `StatementCache`'s own explicit removals.
    pub(crate) fn new(
        max_capacity: u64,
        listener: impl Fn(CacheKey, Arc<Slot<H>>, RemovalCause) + Send + Sync + 'static,
    ) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .eviction_listener(move |key: Arc<CacheKey>, value, cause| listener((*key).clone(), value, cause))
            .build_with_hasher(RandomState::default());
        Self { inner }
    }

    pub(crate) fn get(&self, key: &CacheKey) -> Option<Arc<Slot<H>>> {
        self.inner.get(key)
    }

    /// Inserts `init()` only if `key` is currently absent, a
    /// `putIfAbsent`. Returns the resident value and whether this call
    /// is the one that inserted it. `init` is only invoked if the key
    /// is absent. By construction, callers always pass an
    /// already-prepared candidate as a cheap move, never a closure that
    /// itself performs I/O, so no database call ever happens inside
    /// this per-key insertion window.
    pub(crate) fn get_or_insert_with(&self, key: CacheKey, init: impl FnOnce() -> Arc<Slot<H>>) -> (Arc<Slot<H>>, bool) {
        let entry = self.inner.entry(key).or_insert_with(init);
        let fresh = entry.is_fresh();
        // `moka` batches its internal housekeeping (including running the
        // eviction listener for any victim this insert made room for);
        // flush it immediately so a capacity-triggered close is visible
        // to the caller as soon as `retrieve`/`restore` returns, rather
        // than on some later, unrelated cache operation.
        self.inner.run_pending_tasks();
        (entry.into_value(), fresh)
    }

    pub(crate) fn invalidate(&self, key: &CacheKey) {
        self.inner.invalidate(key);
        self.inner.run_pending_tasks();
    }

    /// A weakly consistent snapshot of the current entries, used by
    /// `remove`, `remove_all`, and `clear`'s linear scans. `moka`'s own
    /// iterator already tolerates concurrent mutation; collecting it is
    /// the same trade `foyer-memory`'s own `CacheShard::clear` makes
    /// (see its "avoid collecting here?" TODO) in exchange for a scan
    /// that cannot observe a torn bucket.
    pub(crate) fn snapshot(&self) -> Vec<(CacheKey, Arc<Slot<H>>)> {
        self.inner.iter().map(|(k, v)| ((*k).clone(), v)).collect()
    }

    pub(crate) fn len(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::key::{ConnectionId, PrepareMethod};

    fn key(n: u64) -> CacheKey {
        CacheKey::new(ConnectionId::new(n), PrepareMethod::Prepare, vec!["select 1".into()])
    }

    #[test_log::test]
    fn get_or_insert_with_only_inserts_once() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let e = evicted.clone();
        let map: BoundedConcurrentMap<u64> = BoundedConcurrentMap::new(10, move |_, _, _| {
            e.fetch_add(1, Ordering::Relaxed);
        });

        let k = key(1);
        let (slot_a, fresh_a) = map.get_or_insert_with(k.clone(), || Arc::new(Slot::new_in_use(1)));
        assert!(fresh_a);

        let (slot_b, fresh_b) = map.get_or_insert_with(k, || Arc::new(Slot::new_in_use(2)));
        assert!(!fresh_b);
        assert!(Arc::ptr_eq(&slot_a, &slot_b));
    }

    #[test_log::test]
    fn snapshot_reflects_inserted_keys() {
        let map: BoundedConcurrentMap<u64> = BoundedConcurrentMap::new(10, |_, _, _| {});
        map.get_or_insert_with(key(1), || Arc::new(Slot::new_in_use(1)));
        map.get_or_insert_with(key(2), || Arc::new(Slot::new_in_use(2)));
        map.inner.run_pending_tasks();

        let snap = map.snapshot();
        assert_eq!(snap.len(), 2);
    }
}
