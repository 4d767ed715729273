//! Error type for client operations.

use thiserror::Error;
use tidal_core::{FunctionError, LookupError, RequestError};

/// Result type alias for client operations.
pub type Result<T> = core::result::Result<T, ClientError>;

/// Errors returned by `ReactiveClient`.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ClientError {
    /// The client was built with `disabled: true`.
    #[error("Client is disabled")]
    Disabled,
    /// The client was closed.
    #[error("Client is closed")]
    Closed,
    /// Bad function path, arguments or pagination options.
    #[error(transparent)]
    Invalid(#[from] tidal_core::Error),
    /// The server function failed.
    #[error(transparent)]
    Function(#[from] FunctionError),
    /// A cached value could not be decoded.
    #[error("Corrupt query result: {0}")]
    Corrupt(String),
    /// The request never completed.
    #[error("Transport failure: {0}")]
    Transport(String),
}

impl From<LookupError> for ClientError {
    fn from(e: LookupError) -> Self {
        match e {
            LookupError::Function(e) => ClientError::Function(e),
            LookupError::Corrupt(message) => ClientError::Corrupt(message),
        }
    }
}

impl From<RequestError> for ClientError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Function(e) => ClientError::Function(e),
            RequestError::Transport(message) => ClientError::Transport(message),
        }
    }
}
