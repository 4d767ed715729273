//! Tidal Core - Query identity and error types for the Tidal client.
//!
//! This crate provides the foundational types shared by the reactive engine
//! and the client facade:
//!
//! - `FunctionPath`: Canonical `module:function` names of server functions
//! - `QueryToken` / `PaginatedQueryToken`: Stable, order-independent keys for
//!   `(function, args)` and `(function, args, pagination options)`
//! - `SubscriptionToken`: Tagged union of both token kinds
//! - `Error`, `FunctionError`, `LookupError`, `RequestError`: Error taxonomy
//!
//! # Example
//!
//! ```rust
//! use tidal_core::{FunctionPath, QueryToken};
//! use serde_json::json;
//!
//! let path = FunctionPath::parse("messages:list").unwrap();
//! let a = QueryToken::from_parts(&path, json!({"channel": 1, "limit": 10})).unwrap();
//! let b = QueryToken::from_parts(&path, json!({"limit": 10, "channel": 1})).unwrap();
//!
//! assert_eq!(a, b);
//! ```

mod error;
mod path;
mod token;
mod value;

pub use error::{Error, FunctionError, LookupError, RequestError, Result};
pub use path::FunctionPath;
pub use serde_json::Value;
pub use token::{PaginatedQueryToken, PaginationOptions, QueryToken, SubscriptionToken};
pub use value::{canonical_json, normalize_args, type_name};
