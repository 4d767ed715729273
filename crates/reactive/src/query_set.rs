//! Consistent snapshots of every live plain query.
//!
//! A query-set watcher sees all plain query results at once after each
//! transition, instead of one callback per query. Results in one snapshot
//! always come from the same transition.

use std::collections::BTreeMap;
use tidal_core::{FunctionError, QueryToken, Value};

/// Identifier of a query-set watcher.
pub type WatcherId = u64;

/// Callback receiving query-set snapshots.
pub type QuerySetCallback = Box<dyn Fn(&QuerySetSnapshot)>;

/// Latest result of one live query.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySetEntry {
    pub path: String,
    pub args: Value,
    pub result: Result<Value, FunctionError>,
}

/// Results of all live plain queries with a cached result, keyed by token.
///
/// Queries subscribed by several listeners appear once.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuerySetSnapshot {
    entries: BTreeMap<QueryToken, QuerySetEntry>,
}

impl QuerySetSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `token` unless it is already present.
    pub(crate) fn insert(&mut self, token: QueryToken, entry: QuerySetEntry) {
        self.entries.entry(token).or_insert(entry);
    }

    #[inline]
    pub fn contains(&self, token: &QueryToken) -> bool {
        self.entries.contains_key(token)
    }

    pub fn get(&self, token: &QueryToken) -> Option<&QuerySetEntry> {
        self.entries.get(token)
    }

    /// Value of `token`, if it is present and succeeded.
    pub fn value(&self, token: &QueryToken) -> Option<&Value> {
        self.entries.get(token)?.result.as_ref().ok()
    }

    /// Entries in token order.
    pub fn iter(&self) -> impl Iterator<Item = (&QueryToken, &QuerySetEntry)> {
        self.entries.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
