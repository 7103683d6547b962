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

//! Construction-time errors. Every other failure mode a caller might hit
//! (a failing prepare, a failing close, a failing warning clear, a
//! double restore) is handled in place rather than surfaced as a typed
//! error here: a failing prepare is the caller's own error type
//! propagated through `retrieve`'s generic `E`, and the rest are logged
//! and swallowed where they occur.

use thiserror::Error;

/// Fails fast at [`StatementCache::new`](crate::StatementCache::new).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheConfigError {
    /// `maxSize` was not strictly positive.
    #[error("statement cache capacity must be greater than zero, got {0}")]
    InvalidCapacity(i64),
}
