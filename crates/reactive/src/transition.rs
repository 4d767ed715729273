//! Transitions: the set of tokens whose results changed.
//!
//! A Transition is consumed by exactly one dispatch pass. It names plain query
//! tokens reported by the subscription manager and the paginated tokens whose
//! aggregate changed as a consequence.

use hashbrown::HashSet;
use tidal_core::{PaginatedQueryToken, QueryToken, SubscriptionToken};

/// Tokens changed by one batch of server updates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Plain query tokens whose cached result changed
    pub queries: Vec<QueryToken>,
    /// Paginated tokens whose aggregate result changed
    pub paginated_queries: Vec<PaginatedQueryToken>,
}

impl Transition {
    /// Creates an empty transition.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transition of plain query tokens only.
    pub fn from_queries(queries: impl IntoIterator<Item = QueryToken>) -> Self {
        Self {
            queries: queries.into_iter().collect(),
            paginated_queries: Vec::new(),
        }
    }

    /// Creates a transition of paginated tokens only.
    pub fn from_paginated(paginated: impl IntoIterator<Item = PaginatedQueryToken>) -> Self {
        Self {
            queries: Vec::new(),
            paginated_queries: paginated.into_iter().collect(),
        }
    }

    /// Returns true if no token changed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.paginated_queries.is_empty()
    }

    /// Returns the total number of tokens.
    #[inline]
    pub fn len(&self) -> usize {
        self.queries.len() + self.paginated_queries.len()
    }

    /// Adds a plain query token.
    pub fn push_query(&mut self, token: QueryToken) {
        self.queries.push(token);
    }

    /// Adds a paginated token.
    pub fn push_paginated(&mut self, token: PaginatedQueryToken) {
        self.paginated_queries.push(token);
    }

    /// Merges another transition into this one.
    pub fn merge(&mut self, other: Transition) {
        self.queries.extend(other.queries);
        self.paginated_queries.extend(other.paginated_queries);
    }

    /// Builds a lookup set over the tokens of this transition.
    pub(crate) fn changed(&self) -> ChangedTokens<'_> {
        ChangedTokens {
            queries: self.queries.iter().collect(),
            paginated: self.paginated_queries.iter().collect(),
        }
    }
}

/// Constant-time membership test over a transition.
pub(crate) struct ChangedTokens<'a> {
    queries: HashSet<&'a QueryToken>,
    paginated: HashSet<&'a PaginatedQueryToken>,
}

impl ChangedTokens<'_> {
    pub(crate) fn contains(&self, token: &SubscriptionToken) -> bool {
        match token {
            SubscriptionToken::Query(t) => self.queries.contains(t),
            SubscriptionToken::Paginated(t) => self.paginated.contains(t),
        }
    }
}
