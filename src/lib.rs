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

//! A bounded, concurrent cache of prepared database statement handles.
//!
//! A connection pool's client code repeatedly asks a connection to
//! prepare parameterised queries; preparation is expensive (a network
//! round trip plus server-side parse/plan). This crate memoises
//! prepared-statement handles keyed by `(connection, prepare method,
//! arguments)` so a second prepare with the same key, on the same
//! underlying connection, hands back the already-prepared handle
//! instead of re-issuing the prepare.
//!
//! The hard part is doing this under concurrency without ever handing
//! the same handle to two callers at once, without leaking a handle,
//! and without closing one twice. [`StatementCache`] gets there with:
//!
//! - **At-most-one active borrower per entry**, enforced by
//!   [`CacheEntry`]'s wait-free, CAS-driven three-state lifecycle
//!   (`Available` / `InUse` / `Evicted`).
//! - **Bounded size with approximate-LRU eviction**, delegated to
//!   `moka`'s concurrent cache rather than a hand-rolled eviction
//!   algorithm.
//! - **Close-exactly-once**, guaranteed by making the handle slot's
//!   "take it out" operation idempotent: whichever of the eviction
//!   listener, a forced removal, or a returning borrower gets there
//!   first does the closing; every later attempt observes nothing left
//!   to close.
//! - **Transparent fallback**: on a miss, on contention, or when the
//!   cache is disabled, the caller still gets a freshly prepared
//!   handle, just an [`CacheEntry::Uncached`] one, closed on its next
//!   `restore` rather than pooled.
//!
//! The connection pool itself, dynamic dispatch over the database API,
//! and driver discovery are all out of scope: this crate only sees a
//! `prepare` callback it invokes on a miss, and a [`RawStatement`]
//! contract the caller's handle type implements for closing and
//! clearing warnings.

mod cache;
mod entry;
mod error;
mod key;
mod map;
mod metrics;

pub use cache::{MaybeStatementCache, StatementCache};
pub use entry::{CacheEntry, CalloutError, RawStatement};
pub use error::CacheConfigError;
pub use key::{CacheKey, ConnectionId, PrepareArg, PrepareMethod};
pub use metrics::{Metrics, MetricsSnapshot};
