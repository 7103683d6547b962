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

//! Atomic counters, following the same `fetch_add(1, Ordering::Relaxed)`
//! pattern `foyer-memory`'s `CacheShard` bumps at every hit/miss/evict
//! call site.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters tracking [`StatementCache`](crate::StatementCache) activity.
#[derive(Debug, Default)]
pub struct Metrics {
    pub(crate) hit: AtomicU64,
    pub(crate) miss: AtomicU64,
    pub(crate) insert: AtomicU64,
    pub(crate) evict: AtomicU64,
    pub(crate) remove: AtomicU64,
    pub(crate) close_ok: AtomicU64,
    pub(crate) close_err: AtomicU64,
}

impl Metrics {
    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hit: self.hit.load(Ordering::Relaxed),
            miss: self.miss.load(Ordering::Relaxed),
            insert: self.insert.load(Ordering::Relaxed),
            evict: self.evict.load(Ordering::Relaxed),
            remove: self.remove.load(Ordering::Relaxed),
            close_ok: self.close_ok.load(Ordering::Relaxed),
            close_err: self.close_err.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time read of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// `retrieve` calls that returned an already-cached, available handle.
    pub hit: u64,
    /// `retrieve` calls that had to invoke `prepareFn`.
    pub miss: u64,
    /// New cached entries adopted into the map.
    pub insert: u64,
    /// Entries evicted (capacity pressure or explicit removal).
    pub evict: u64,
    /// Entries removed via `remove`/`removeAll`/`clear`.
    pub remove: u64,
    /// Handles closed successfully.
    pub close_ok: u64,
    /// Handles whose close callout returned an error (logged, swallowed).
    pub close_err: u64,
}
