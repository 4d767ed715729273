//! Error types for Tidal.
//!
//! Three families live here:
//!
//! - `Error`: caller input that cannot be turned into a query identity
//!   (bad function path, non-object arguments, bad pagination options).
//! - `FunctionError`: an application error raised by a server function. It is
//!   recoverable and always scoped to a single query or request.
//! - `LookupError` / `RequestError`: what the subscription manager hands back
//!   when a cached result or a one-shot request fails.

use serde_json::Value;
use thiserror::Error;

/// Result type alias for Tidal identity operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised while building query identities from caller input.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum Error {
    /// Function path is empty or malformed.
    #[error("Invalid function path {path:?}: {message}")]
    InvalidFunctionPath { path: String, message: String },
    /// Arguments are not a JSON object.
    #[error("Invalid arguments: {message}")]
    InvalidArgs { message: String },
    /// Pagination options violate their constraints.
    #[error("Invalid pagination options: {message}")]
    InvalidPaginationOptions { message: String },
    /// A serialized token could not be classified.
    #[error("Invalid query token: {message}")]
    InvalidToken { message: String },
}

impl Error {
    /// Creates an invalid function path error.
    pub fn invalid_function_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidFunctionPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid arguments error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Error::InvalidArgs {
            message: message.into(),
        }
    }

    /// Creates an invalid pagination options error.
    pub fn invalid_pagination_options(message: impl Into<String>) -> Self {
        Error::InvalidPaginationOptions {
            message: message.into(),
        }
    }

    /// Creates an invalid token error.
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Error::InvalidToken {
            message: message.into(),
        }
    }
}

/// An application error thrown by a server function.
///
/// `data` carries the structured payload of the error, if the function
/// attached one.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{message}")]
pub struct FunctionError {
    pub message: String,
    pub data: Option<Value>,
}

impl FunctionError {
    /// Creates a function error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Creates a function error carrying structured data.
    pub fn with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Failure to read a cached query result.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum LookupError {
    /// The query function failed. Scoped to the listeners of that query.
    #[error(transparent)]
    Function(#[from] FunctionError),
    /// The cached value is malformed. This is a bug in the value layer.
    #[error("Corrupt query result: {0}")]
    Corrupt(String),
}

impl LookupError {
    /// Returns true if this is a per-query application error.
    #[inline]
    pub fn is_function_error(&self) -> bool {
        matches!(self, LookupError::Function(_))
    }
}

/// Failure of a one-shot mutation or action.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum RequestError {
    /// The server function failed.
    #[error(transparent)]
    Function(#[from] FunctionError),
    /// The request never completed (connection dropped, worker gone).
    #[error("Transport failure: {0}")]
    Transport(String),
}
