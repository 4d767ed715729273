//! Query identities.
//!
//! A `QueryToken` is the canonical JSON of `(udfPath, args)`. Two subscriptions
//! with equal path and structurally equal arguments always get the same token,
//! which is what lets the subscription manager collapse them into one server
//! subscription.
//!
//! A `PaginatedQueryToken` additionally folds in the pagination options. The
//! options' `id` is part of the key on purpose: two lists rendered side by side
//! with the same query and arguments must not share pages.

use crate::error::{Error, Result};
use crate::path::FunctionPath;
use crate::value::{canonical_json, normalize_args};
use serde_json::{json, Value};
use std::fmt;

const PAGINATED_TAG: &str = "paginated";

/// Identity of a plain query subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryToken(String);

impl QueryToken {
    /// Builds the token for `path` called with `args`.
    ///
    /// `args` is normalized first: `null` is treated as `{}`.
    pub fn from_parts(path: &FunctionPath, args: Value) -> Result<Self> {
        let args = normalize_args(args)?;
        let encoded = canonical_json(&json!({
            "udfPath": path.as_str(),
            "args": args,
        }))?;
        Ok(Self(encoded))
    }

    /// Returns the serialized token.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options of a paginated query registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PaginationOptions {
    initial_num_items: u32,
    id: u64,
}

impl PaginationOptions {
    /// Creates pagination options. `initial_num_items` must be positive.
    pub fn new(initial_num_items: u32, id: u64) -> Result<Self> {
        if initial_num_items == 0 {
            return Err(Error::invalid_pagination_options(
                "initialNumItems must be a positive integer",
            ));
        }
        Ok(Self {
            initial_num_items,
            id,
        })
    }

    /// Number of items requested by the first page.
    #[inline]
    pub fn initial_num_items(&self) -> u32 {
        self.initial_num_items
    }

    /// Registration id distinguishing otherwise identical paginated queries.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Identity of a paginated query subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaginatedQueryToken(String);

impl PaginatedQueryToken {
    /// Builds the token for a paginated registration.
    pub fn from_parts(
        path: &FunctionPath,
        args: Value,
        options: &PaginationOptions,
    ) -> Result<Self> {
        let args = normalize_args(args)?;
        let encoded = canonical_json(&json!({
            "type": PAGINATED_TAG,
            "udfPath": path.as_str(),
            "args": args,
            "options": {
                "initialNumItems": options.initial_num_items,
                "id": options.id,
            },
        }))?;
        Ok(Self(encoded))
    }

    /// Returns the serialized token.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaginatedQueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Either kind of token. Listener records of both kinds share one registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionToken {
    Query(QueryToken),
    Paginated(PaginatedQueryToken),
}

impl SubscriptionToken {
    /// Classifies a serialized token by its `"type"` tag.
    pub fn from_serialized(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::invalid_token(format!("not JSON: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::invalid_token("not an object"))?;
        if !object.get("udfPath").is_some_and(Value::is_string) {
            return Err(Error::invalid_token("missing udfPath"));
        }

        let canonical = canonical_json(&value)
            .map_err(|e| Error::invalid_token(e.to_string()))?;
        match object.get("type").and_then(Value::as_str) {
            Some(PAGINATED_TAG) => Ok(SubscriptionToken::Paginated(PaginatedQueryToken(canonical))),
            Some(other) => Err(Error::invalid_token(format!("unknown token type {:?}", other))),
            None => Ok(SubscriptionToken::Query(QueryToken(canonical))),
        }
    }

    /// Returns true for paginated tokens.
    #[inline]
    pub fn is_paginated(&self) -> bool {
        matches!(self, SubscriptionToken::Paginated(_))
    }

    /// Returns the serialized token.
    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionToken::Query(t) => t.as_str(),
            SubscriptionToken::Paginated(t) => t.as_str(),
        }
    }
}

impl From<QueryToken> for SubscriptionToken {
    fn from(token: QueryToken) -> Self {
        SubscriptionToken::Query(token)
    }
}

impl From<PaginatedQueryToken> for SubscriptionToken {
    fn from(token: PaginatedQueryToken) -> Self {
        SubscriptionToken::Paginated(token)
    }
}

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
