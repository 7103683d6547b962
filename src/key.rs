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

//! Identity and argument modeling for [`CacheKey`](crate::CacheKey).

/// An opaque identity token for one physical database connection.
///
/// The cache never looks inside a connection; it only needs to tell two
/// physical connections apart. The caller allocates one `ConnectionId`
/// per connection (e.g. a monotonically increasing counter, or the
/// address of the connection handle cast to a `u64`) and reuses it for
/// every key constructed against that connection. Equality and hashing
/// are by this token alone, never by connection contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Builds a connection identity from a raw token.
    pub fn new(token: u64) -> Self {
        Self(token)
    }
}

impl From<u64> for ConnectionId {
    fn from(token: u64) -> Self {
        Self(token)
    }
}

/// Which prepare variant produced a handle.
///
/// New variants can be added as the surrounding driver grows more
/// prepare flavors; this cache does not interpret the tag beyond
/// equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrepareMethod {
    /// Plain `prepareStatement(sql)`-equivalent.
    Prepare,
    /// Prepare with an explicit result-set type/concurrency/holdability
    /// modifier.
    PrepareWithResultSetOptions,
    /// Prepare a callable statement (stored procedure invocation).
    PrepareCall,
}

/// One element of an ordered prepare-argument tuple.
///
/// Modeled as a small tagged union rather than a boxed `dyn Any` array:
/// prepare arguments are SQL text plus a handful of scalar flags, never
/// arbitrary application objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrepareArg {
    /// SQL text, or any other string-valued argument.
    Text(String),
    /// An integer flag (e.g. a result-set type constant).
    Int(i64),
    /// A boolean flag.
    Bool(bool),
}

impl From<String> for PrepareArg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for PrepareArg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for PrepareArg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for PrepareArg {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Value identity for `(connection, prepare method, arguments)`.
///
/// Hash and equality are order-sensitive over `args` and defer to
/// [`ConnectionId`]'s identity semantics for `connection`. Two distinct
/// physical connections never share a cached entry, even if every other
/// field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    connection: ConnectionId,
    method: PrepareMethod,
    args: Vec<PrepareArg>,
}

impl CacheKey {
    /// Builds a new key. `args` is taken as given; order matters.
    pub fn new(connection: ConnectionId, method: PrepareMethod, args: Vec<PrepareArg>) -> Self {
        Self { connection, method, args }
    }

    /// The connection this key is scoped to.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// The prepare variant this key was constructed for.
    pub fn method(&self) -> PrepareMethod {
        self.method
    }

    /// The ordered prepare arguments.
    pub fn args(&self) -> &[PrepareArg] {
        &self.args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(conn: u64, sql: &str) -> CacheKey {
        CacheKey::new(ConnectionId::new(conn), PrepareMethod::Prepare, vec![sql.into()])
    }

    #[test_log::test]
    fn equal_args_same_connection_are_equal() {
        assert_eq!(key(1, "select 1"), key(1, "select 1"));
    }

    #[test_log::test]
    fn different_connections_never_equal() {
        assert_ne!(key(1, "select 1"), key(2, "select 1"));
    }

    #[test_log::test]
    fn argument_order_matters() {
        let a = CacheKey::new(
            ConnectionId::new(1),
            PrepareMethod::Prepare,
            vec!["select ?".into(), 1i64.into()],
        );
        let b = CacheKey::new(
            ConnectionId::new(1),
            PrepareMethod::Prepare,
            vec![1i64.into(), "select ?".into()],
        );
        assert_ne!(a, b);
    }

    #[test_log::test]
    fn method_tag_distinguishes_otherwise_identical_keys() {
        let a = CacheKey::new(ConnectionId::new(1), PrepareMethod::Prepare, vec!["select 1".into()]);
        let b = CacheKey::new(
            ConnectionId::new(1),
            PrepareMethod::PrepareCall,
            vec!["select 1".into()],
        );
        assert_ne!(a, b);
    }
}
