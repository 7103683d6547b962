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

//! The prepared-handle contract, the atomic tri-state lifecycle, and the
//! entry type handed back to callers of [`StatementCache::retrieve`](crate::StatementCache::retrieve).

use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::CacheKey;

/// A boxed, thread-safe error, used for the two callouts a handle
/// implementor may fail: [`RawStatement::close`] and
/// [`RawStatement::clear_warnings`].
pub type CalloutError = Box<dyn StdError + Send + Sync>;

/// The contract a cached prepared-statement handle must satisfy.
///
/// The cache does not know, and does not want to know, the shape of the
/// database API: it only ever closes a handle or asks it to drop
/// scratch warning state. This replaces the reflective proxy dispatch
/// of the source implementation with a single, small trait.
pub trait RawStatement {
    /// Releases the server-side resources held by this handle.
    ///
    /// Called at most once per handle, by whichever party wins the
    /// close-exactly-once race (see the crate-level docs). A failure is
    /// logged and swallowed by the cache; it never propagates to a
    /// caller that didn't ask for it.
    fn close(self) -> Result<(), CalloutError>;

    /// Best-effort reset of scratch warning state before the handle is
    /// returned to the pool. The default implementation does nothing.
    fn clear_warnings(&mut self) -> Result<(), CalloutError> {
        Ok(())
    }
}

/// The three-state lifecycle of a cached entry.
///
/// Transitions are atomic compare-and-swap, never locked, so that the
/// state machine itself is wait-free regardless of how long a borrower
/// holds the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    /// Not currently borrowed; the handle may be acquired.
    Available = 0,
    /// Borrowed by exactly one caller.
    InUse = 1,
    /// Terminal. The handle is being, or has been, closed.
    Evicted = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Available,
            1 => State::InUse,
            2 => State::Evicted,
            other => unreachable!("invalid cache entry state byte: {other}"),
        }
    }
}

pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    /// CAS `Available -> InUse`. Wait-free.
    pub(crate) fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(State::Available as u8, State::InUse as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// CAS `InUse -> Available`. Wait-free.
    pub(crate) fn try_release(&self) -> bool {
        self.0
            .compare_exchange(State::InUse as u8, State::Available as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Atomic swap to `Evicted`, returning whatever was there before.
    /// Idempotent: calling this more than once is safe and simply
    /// reports `Evicted` as the prior state on every call after the
    /// first. Wait-free.
    pub(crate) fn mark_evicted(&self) -> bool {
        let prior = State::from_u8(self.0.swap(State::Evicted as u8, Ordering::AcqRel));
        prior == State::Available
    }
}

/// The shared, cached backing of a [`CacheEntry::Cached`].
///
/// Lives behind an `Arc` so the map and the current borrower (if any)
/// observe the same state and the same handle. The handle itself sits
/// behind a `parking_lot::Mutex` rather than an unsynchronized cell.
/// Nothing here is held across a callout; `close`/`clear_warnings`
/// always run after the guard is dropped. The lock only sees real
/// contention in the rare case where a forced `remove`/`removeAll`/
/// `clear` targets an entry a borrower is still holding.
pub(crate) struct Slot<H> {
    state: AtomicState,
    handle: Mutex<Option<H>>,
}

impl<H> Slot<H> {
    pub(crate) fn new_in_use(handle: H) -> Self {
        Self {
            state: AtomicState::new(State::InUse),
            handle: Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn state(&self) -> &AtomicState {
        &self.state
    }

    /// Takes the handle out, if still present. Idempotent: a second
    /// call (from a racing eviction listener or a racing forced
    /// removal) observes `None` and does nothing. This is what makes
    /// close-exactly-once hold under arbitrary interleaving of
    /// eviction, forced removal, and a borrower's own restore.
    pub(crate) fn take(&self) -> Option<H> {
        self.handle.lock().take()
    }

    pub(crate) fn with_handle_mut<R>(&self, f: impl FnOnce(Option<&mut H>) -> R) -> R {
        let mut guard = self.handle.lock();
        f(guard.as_mut())
    }

    /// Consumes the slot, returning its handle if this caller holds the
    /// only reference (used when a `retrieve` race is lost and the
    /// locally prepared candidate never gets adopted by the map).
    pub(crate) fn into_handle(self) -> Option<H> {
        self.handle.into_inner()
    }
}

/// A handle returned by [`StatementCache::retrieve`](crate::StatementCache::retrieve).
///
/// Every successful `retrieve` must be paired with exactly one call to
/// [`StatementCache::restore`](crate::StatementCache::restore) (or, for
/// a disabled cache, [`MaybeStatementCache::restore`](crate::MaybeStatementCache::restore)).
pub enum CacheEntry<H> {
    /// Backed by a slot the cache owns and may reuse. Its handle is
    /// exclusively borrowed by this entry until `restore` is called.
    Cached { key: CacheKey, slot: Arc<Slot<H>> },
    /// Not tracked by the cache at all. Either the cache is disabled,
    /// it was full, or a concurrent insert for the same key won the
    /// race. `restore` always closes an uncached entry's handle.
    Uncached(Option<H>),
}

impl<H> CacheEntry<H> {
    /// Runs `f` against the held handle.
    ///
    /// Takes `&mut self` rather than `&self`: a `CacheEntry` is meant to
    /// be used by exactly one owner between `retrieve` and `restore`,
    /// so no further synchronization is needed here beyond the
    /// [`Slot`]'s own lock (which guards against a concurrent forced
    /// eviction, not against the entry's own owner).
    ///
    /// # Panics
    ///
    /// Panics if called after the handle has already been taken (e.g.
    /// calling this on an entry that was already passed to `restore`,
    /// which cannot happen through the public API since `restore`
    /// consumes the entry by value).
    pub fn with_handle<R>(&mut self, f: impl FnOnce(&mut H) -> R) -> R {
        match self {
            CacheEntry::Cached { slot, .. } => slot.with_handle_mut(|h| f(h.expect("cache entry handle missing while borrowed"))),
            CacheEntry::Uncached(handle) => f(handle.as_mut().expect("uncached entry handle missing")),
        }
    }

    /// Whether this entry is backed by a cached, reusable slot.
    pub fn is_cached(&self) -> bool {
        matches!(self, CacheEntry::Cached { .. })
    }
}

impl<H> fmt::Debug for CacheEntry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEntry::Cached { key, .. } => f.debug_struct("CacheEntry::Cached").field("key", key).finish(),
            CacheEntry::Uncached(_) => f.write_str("CacheEntry::Uncached"),
        }
    }
}
