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

//! The public façade: [`StatementCache`] and [`MaybeStatementCache`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::entry::{CacheEntry, RawStatement, Slot};
use crate::error::CacheConfigError;
use crate::key::{CacheKey, ConnectionId};
use crate::map::BoundedConcurrentMap;
use crate::metrics::{Metrics, MetricsSnapshot};

/// A bounded, concurrent cache of prepared-statement handles.
///
/// `retrieve` and `restore` are the hot path; `remove`, `removeAll`,
/// and `clear` are the disposal paths used when a handle goes bad, a
/// connection is torn down, or the whole pool shuts down. See the
/// crate-level docs for the close-exactly-once argument.
pub struct StatementCache<H>
where
    H: RawStatement + Send + Sync + 'static,
{
    map: BoundedConcurrentMap<H>,
    metrics: Arc<Metrics>,
}

impl<H> StatementCache<H>
where
    H: RawStatement + Send + Sync + 'static,
{
    /// Builds a cache holding at most `max_size` prepared handles.
    ///
    /// Rejects `max_size <= 0`: a disabled cache is represented by
    /// [`MaybeStatementCache::Disabled`], not by a `StatementCache`
    /// that happens to hold zero entries.
    pub fn new(max_size: i64) -> Result<Self, CacheConfigError> {
        if max_size <= 0 {
            return Err(CacheConfigError::InvalidCapacity(max_size));
        }
        let metrics = Arc::new(Metrics::default());
        let listener_metrics = metrics.clone();
        let map = BoundedConcurrentMap::new(max_size as u64, move |_key, slot: Arc<Slot<H>>, _cause| {
            on_evict(&listener_metrics, &slot);
        });
        Ok(Self { map, metrics })
    }

    /// Returns a handle ready for exclusive use by the caller. On a hit,
    /// hands back the already-prepared handle; on a miss, calls
    /// `prepare` to obtain a fresh one. `prepare` is invoked at most
    /// once per call, never under any internal lock, and its error
    /// propagates unchanged.
    pub fn retrieve<F, E>(&self, key: &CacheKey, prepare: F) -> Result<CacheEntry<H>, E>
    where
        F: FnOnce() -> Result<H, E>,
    {
        let existing = self.map.get(key);
        if let Some(slot) = &existing {
            if slot.state().try_acquire() {
                self.metrics.hit.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheEntry::Cached {
                    key: key.clone(),
                    slot: slot.clone(),
                });
            }
        }

        self.metrics.miss.fetch_add(1, Ordering::Relaxed);
        let raw = prepare()?;

        if existing.is_some() {
            // The key was already occupied, in use or mid-eviction.
            // Don't even attempt an insert; `putIfAbsent` only races
            // against a truly absent key.
            return Ok(CacheEntry::Uncached(Some(raw)));
        }

        let candidate = Arc::new(Slot::new_in_use(raw));
        let for_map = candidate.clone();
        let (_resident, fresh) = self.map.get_or_insert_with(key.clone(), move || for_map);

        if fresh {
            self.metrics.insert.fetch_add(1, Ordering::Relaxed);
            return Ok(CacheEntry::Cached {
                key: key.clone(),
                slot: candidate,
            });
        }

        // Lost the race. Some other thread's insert landed first. Our
        // own `for_map` clone was dropped unused inside the closure, so
        // `candidate` is once again uniquely ours.
        let raw = Arc::try_unwrap(candidate)
            .unwrap_or_else(|_| unreachable!("losing retrieve() candidate must have no other owners"))
            .into_handle()
            .expect("freshly constructed slot always holds its handle");
        Ok(CacheEntry::Uncached(Some(raw)))
    }

    /// Releases a handle obtained from `retrieve` back to the cache.
    /// Must be called exactly once per successful `retrieve`.
    pub fn restore(&self, entry: CacheEntry<H>, clear: bool) {
        match entry {
            CacheEntry::Uncached(handle) => {
                if let Some(h) = handle {
                    self.close_now(h);
                }
            }
            CacheEntry::Cached { slot, .. } => {
                if clear {
                    slot.with_handle_mut(|h| {
                        if let Some(h) = h {
                            if let Err(e) = h.clear_warnings() {
                                tracing::warn!(error = %e, "failed to clear prepared statement warnings; releasing anyway");
                            }
                        }
                    });
                }

                if slot.state().try_release() {
                    return;
                }

                // The CAS lost only because an eviction won it first.
                // The handle is ours to close, if the listener hasn't
                // already taken it.
                if let Some(h) = slot.take() {
                    self.close_now(h);
                }
            }
        }
    }

    /// Purges the first cached handle matching `matches`, closing it if
    /// `close` is set. Returns whether a match was found. `close =
    /// false` is an escape hatch: the handle is dropped without its
    /// `close` callout running, leaving any cleanup to the handle's own
    /// `Drop` impl, if any. No code in this crate calls it with `false`.
    pub fn remove(&self, matches: impl Fn(&H) -> bool, close: bool) -> bool {
        for (key, slot) in self.map.snapshot() {
            let is_match = slot.with_handle_mut(|h| h.map(&matches).unwrap_or(false));
            if !is_match {
                continue;
            }
            self.map.invalidate(&key);
            self.metrics.remove.fetch_add(1, Ordering::Relaxed);
            slot.state().mark_evicted();
            if close {
                if let Some(h) = slot.take() {
                    self.close_now(h);
                }
            }
            return true;
        }
        false
    }

    /// Purges every entry scoped to `connection`, closing every handle
    /// regardless of its borrow state, and returns how many were
    /// removed.
    pub fn remove_all(&self, connection: ConnectionId) -> usize {
        let mut count = 0;
        for (key, slot) in self.map.snapshot() {
            if key.connection() != connection {
                continue;
            }
            self.map.invalidate(&key);
            self.metrics.remove.fetch_add(1, Ordering::Relaxed);
            slot.state().mark_evicted();
            if let Some(h) = slot.take() {
                self.close_now(h);
            }
            count += 1;
        }
        count
    }

    /// Purges every entry and closes every handle.
    pub fn clear(&self) {
        for (key, slot) in self.map.snapshot() {
            self.map.invalidate(&key);
            self.metrics.remove.fetch_add(1, Ordering::Relaxed);
            slot.state().mark_evicted();
            if let Some(h) = slot.take() {
                self.close_now(h);
            }
        }
    }

    /// Current number of cached entries. Always `<= max_size`.
    pub fn len(&self) -> u64 {
        self.map.len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time read of the cache's activity counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn close_now(&self, handle: H) {
        close_and_count(handle, &self.metrics);
    }
}

/// The eviction listener: the single place that decides, for any entry
/// leaving the map for any reason, whether its handle is closed now or
/// left for a borrower to close on `restore`.
fn on_evict<H>(metrics: &Metrics, slot: &Slot<H>)
where
    H: RawStatement + Send + Sync + 'static,
{
    metrics.evict.fetch_add(1, Ordering::Relaxed);
    let was_available = slot.state().mark_evicted();
    if !was_available {
        // Either borrowed (the borrower will close on `restore`) or
        // already evicted by a racing explicit removal. Either way,
        // this call has nothing left to do.
        return;
    }
    if let Some(h) = slot.take() {
        close_and_count(h, metrics);
    }
}

fn close_and_count<H: RawStatement>(handle: H, metrics: &Metrics) {
    match handle.close() {
        Ok(()) => {
            metrics.close_ok.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to close prepared statement handle");
            metrics.close_err.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A [`StatementCache`] that may be disabled: a `max_size` of zero or
/// less means every `retrieve` prepares fresh and every `restore`
/// closes immediately. Lets a connection pool hold one field
/// unconditionally instead of hand-rolling an `Option<StatementCache<H>>`
/// branch at every call site.
pub enum MaybeStatementCache<H>
where
    H: RawStatement + Send + Sync + 'static,
{
    /// A real, bounded cache.
    Enabled(StatementCache<H>),
    /// No caching: every `retrieve` prepares fresh and every `restore`
    /// closes immediately.
    Disabled,
}

impl<H> MaybeStatementCache<H>
where
    H: RawStatement + Send + Sync + 'static,
{
    /// `max_size <= 0` yields [`Self::Disabled`]; otherwise an
    /// [`Self::Enabled`] cache of that capacity.
    pub fn new(max_size: i64) -> Self {
        if max_size <= 0 {
            return Self::Disabled;
        }
        match StatementCache::new(max_size) {
            Ok(cache) => Self::Enabled(cache),
            Err(_) => unreachable!("max_size already validated positive"),
        }
    }

    /// See [`StatementCache::retrieve`].
    pub fn retrieve<F, E>(&self, key: &CacheKey, prepare: F) -> Result<CacheEntry<H>, E>
    where
        F: FnOnce() -> Result<H, E>,
    {
        match self {
            Self::Enabled(cache) => cache.retrieve(key, prepare),
            Self::Disabled => prepare().map(|h| CacheEntry::Uncached(Some(h))),
        }
    }

    /// See [`StatementCache::restore`].
    pub fn restore(&self, entry: CacheEntry<H>, clear: bool) {
        match self {
            Self::Enabled(cache) => cache.restore(entry, clear),
            Self::Disabled => {
                if let CacheEntry::Uncached(Some(h)) = entry {
                    if let Err(e) = h.close() {
                        tracing::warn!(error = %e, "failed to close prepared statement handle (cache disabled)");
                    }
                }
            }
        }
    }

    /// Whether this cache is actually caching anything.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    use super::*;
    use crate::key::PrepareMethod;

    static NEXT_ID: AtomicU64 = AtomicU64::new(0);

    #[derive(Debug)]
    struct TestHandle {
        id: u64,
        closes: Arc<Mutex<Vec<u64>>>,
        fail_close: bool,
    }

    impl TestHandle {
        fn new(closes: Arc<Mutex<Vec<u64>>>) -> Self {
            Self {
                id: NEXT_ID.fetch_add(1, AtomicOrdering::Relaxed),
                closes,
                fail_close: false,
            }
        }
    }

    impl RawStatement for TestHandle {
        fn close(self) -> Result<(), crate::entry::CalloutError> {
            self.closes.lock().unwrap().push(self.id);
            if self.fail_close {
                Err("simulated close failure".into())
            } else {
                Ok(())
            }
        }
    }

    fn key(conn: u64, sql: &str) -> CacheKey {
        CacheKey::new(ConnectionId::new(conn), PrepareMethod::Prepare, vec![sql.into()])
    }

    #[test_log::test]
    fn basic_hit_returns_same_handle_without_repreparing() {
        let cache: StatementCache<TestHandle> = StatementCache::new(4).unwrap();
        let closes = Arc::new(Mutex::new(Vec::new()));
        let k = key(1, "select 1");

        let mut prepares = 0;
        let entry = cache
            .retrieve(&k, || {
                prepares += 1;
                Ok::<_, ()>(TestHandle::new(closes.clone()))
            })
            .unwrap();
        let id1 = match &entry {
            CacheEntry::Cached { slot, .. } => slot.with_handle_mut(|h| h.unwrap().id),
            _ => panic!("expected cached entry on insert"),
        };
        cache.restore(entry, false);

        let entry2 = cache
            .retrieve(&k, || {
                prepares += 1;
                Ok::<_, ()>(TestHandle::new(closes.clone()))
            })
            .unwrap();
        assert_eq!(prepares, 1, "prepare callback must not run again on a hit");
        let id2 = match &entry2 {
            CacheEntry::Cached { slot, .. } => slot.with_handle_mut(|h| h.unwrap().id),
            _ => panic!("expected cached entry on hit"),
        };
        assert_eq!(id1, id2);
        cache.restore(entry2, false);
        assert!(closes.lock().unwrap().is_empty());
    }

    #[test_log::test]
    fn capacity_eviction_closes_exactly_one_victim() {
        let cache: StatementCache<TestHandle> = StatementCache::new(2).unwrap();
        let closes = Arc::new(Mutex::new(Vec::new()));

        for n in 1..=3u64 {
            let entry = cache
                .retrieve(&key(n, "select 1"), || Ok::<_, ()>(TestHandle::new(closes.clone())))
                .unwrap();
            cache.restore(entry, false);
        }

        assert_eq!(cache.len(), 2);
        assert_eq!(closes.lock().unwrap().len(), 1);
    }

    #[test_log::test]
    fn eviction_of_in_use_entry_defers_close_to_restore() {
        let cache: StatementCache<TestHandle> = StatementCache::new(1).unwrap();
        let closes = Arc::new(Mutex::new(Vec::new()));

        let e1 = cache
            .retrieve(&key(1, "select 1"), || Ok::<_, ()>(TestHandle::new(closes.clone())))
            .unwrap();

        // Force a second key in. At this capacity the map must evict
        // something to make room, and whichever of the two entries it
        // picks is still borrowed (e1 has not been restored yet, and e2
        // was just handed back without a chance to be released). Either
        // way, the victim's handle must not be closed until its own
        // owner restores it.
        let e2 = cache
            .retrieve(&key(2, "select 1"), || Ok::<_, ()>(TestHandle::new(closes.clone())))
            .unwrap();

        assert!(closes.lock().unwrap().is_empty(), "a still-borrowed handle must not be closed yet");

        cache.restore(e1, false);
        cache.restore(e2, false);
        assert_eq!(closes.lock().unwrap().len(), 1, "exactly one handle closes, once both are restored");
        assert_eq!(cache.len(), 1);
    }

    #[test_log::test]
    fn concurrent_retrieve_on_fresh_key_caches_exactly_one() {
        let cache = Arc::new(StatementCache::<TestHandle>::new(10).unwrap());
        let closes = Arc::new(Mutex::new(Vec::new()));
        let k = key(1, "select 1");
        let barrier = Arc::new(Barrier::new(32));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                let closes = closes.clone();
                let k = k.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let entry = cache.retrieve(&k, || Ok::<_, ()>(TestHandle::new(closes.clone()))).unwrap();
                    let was_cached = entry.is_cached();
                    cache.restore(entry, false);
                    was_cached
                })
            })
            .collect();

        let cached_count = handles.into_iter().map(|h| h.join().unwrap()).filter(|c| *c).count();

        assert_eq!(cached_count, 1, "exactly one retrieve should adopt the cache slot");
        assert_eq!(cache.len(), 1);
        assert_eq!(closes.lock().unwrap().len(), 31, "every losing retrieve must close its own handle");
    }

    #[test_log::test]
    fn remove_all_scopes_to_one_connection() {
        let cache: StatementCache<TestHandle> = StatementCache::new(20).unwrap();
        let closes = Arc::new(Mutex::new(Vec::new()));

        for n in 0..5 {
            let entry = cache
                .retrieve(&key(1, &format!("select {n}")), || Ok::<_, ()>(TestHandle::new(closes.clone())))
                .unwrap();
            cache.restore(entry, false);
        }
        for n in 0..3 {
            let entry = cache
                .retrieve(&key(2, &format!("select {n}")), || Ok::<_, ()>(TestHandle::new(closes.clone())))
                .unwrap();
            cache.restore(entry, false);
        }

        let removed = cache.remove_all(ConnectionId::new(1));
        assert_eq!(removed, 5);
        assert_eq!(cache.len(), 3);
        assert_eq!(closes.lock().unwrap().len(), 5);
    }

    #[test_log::test]
    fn clear_empties_the_cache_and_closes_everything() {
        let cache: StatementCache<TestHandle> = StatementCache::new(20).unwrap();
        let closes = Arc::new(Mutex::new(Vec::new()));

        for n in 0..7 {
            let conn = if n % 2 == 0 { 1 } else { 2 };
            let entry = cache
                .retrieve(&key(conn, &format!("select {n}")), || Ok::<_, ()>(TestHandle::new(closes.clone())))
                .unwrap();
            cache.restore(entry, false);
        }

        cache.clear();
        assert_eq!(cache.len(), 0);
        assert_eq!(closes.lock().unwrap().len(), 7);
    }

    // A second retrieve while the first is still held must not return
    // the same cached slot.
    #[test_log::test]
    fn second_retrieve_while_first_still_borrowed_is_uncached() {
        let cache: StatementCache<TestHandle> = StatementCache::new(10).unwrap();
        let closes = Arc::new(Mutex::new(Vec::new()));
        let k = key(1, "select 1");

        let e1 = cache.retrieve(&k, || Ok::<_, ()>(TestHandle::new(closes.clone()))).unwrap();
        assert!(e1.is_cached());

        let e2 = cache.retrieve(&k, || Ok::<_, ()>(TestHandle::new(closes.clone()))).unwrap();
        assert!(!e2.is_cached(), "a second concurrent borrower must get its own uncached handle");

        cache.restore(e2, false);
        assert_eq!(closes.lock().unwrap().len(), 1);
        cache.restore(e1, false);
        assert_eq!(closes.lock().unwrap().len(), 1, "restoring the original, still-available entry must not close it");
        assert_eq!(cache.len(), 1);
    }

    #[test_log::test]
    fn remove_purges_matching_handle_and_closes_it() {
        let cache: StatementCache<TestHandle> = StatementCache::new(10).unwrap();
        let closes = Arc::new(Mutex::new(Vec::new()));
        let entry = cache
            .retrieve(&key(1, "select 1"), || Ok::<_, ()>(TestHandle::new(closes.clone())))
            .unwrap();
        let id = match &entry {
            CacheEntry::Cached { slot, .. } => slot.with_handle_mut(|h| h.unwrap().id),
            _ => unreachable!(),
        };
        cache.restore(entry, false);

        assert!(cache.remove(|h| h.id == id, true));
        assert_eq!(cache.len(), 0);
        assert_eq!(closes.lock().unwrap(), vec![id]);
        assert!(!cache.remove(|h| h.id == id, true), "second removal finds nothing");
    }

    #[test_log::test]
    fn construction_rejects_non_positive_capacity() {
        assert_eq!(
            StatementCache::<TestHandle>::new(0).unwrap_err(),
            CacheConfigError::InvalidCapacity(0)
        );
        assert_eq!(
            StatementCache::<TestHandle>::new(-1).unwrap_err(),
            CacheConfigError::InvalidCapacity(-1)
        );
    }

    #[test_log::test]
    fn disabled_cache_never_caches_and_always_closes_on_restore() {
        let cache = MaybeStatementCache::<TestHandle>::new(0);
        assert!(!cache.is_enabled());
        let closes = Arc::new(Mutex::new(Vec::new()));

        let entry = cache
            .retrieve(&key(1, "select 1"), || Ok::<_, ()>(TestHandle::new(closes.clone())))
            .unwrap();
        assert!(!entry.is_cached());
        cache.restore(entry, false);
        assert_eq!(closes.lock().unwrap().len(), 1);
    }

    #[test_log::test]
    fn close_failure_is_logged_and_swallowed() {
        let cache: StatementCache<TestHandle> = StatementCache::new(10).unwrap();
        let closes = Arc::new(Mutex::new(Vec::new()));
        let mut entry = cache
            .retrieve(&key(1, "select 1"), || {
                let mut h = TestHandle::new(closes.clone());
                h.fail_close = true;
                Ok::<_, ()>(h)
            })
            .unwrap();
        entry.with_handle(|_| {});
        cache.remove(|_| true, true);
        assert_eq!(cache.metrics().close_err, 1);
    }
}
