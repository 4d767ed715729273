//! The boundary to the transport layer.
//!
//! A `SubscriptionManager` owns the network connection and the cache of the
//! latest result of every subscribed query. The engine only reads that cache;
//! it learns about changes through the `TransitionHandler` it installs.

use futures::future::LocalBoxFuture;
use serde::Serialize;
use std::rc::Rc;
use tidal_core::{FunctionPath, LookupError, QueryToken, RequestError, Value};

/// Future returned by one-shot mutations and actions.
pub type ResponseFuture = LocalBoxFuture<'static, Result<Value, RequestError>>;

/// Receives the query tokens whose cached results changed in one transition.
pub type TransitionHandler = Rc<dyn Fn(&[QueryToken])>;

/// Callback invoked on every connection state change.
pub type ConnectionStateCallback = Box<dyn Fn(&ConnectionState)>;

/// Identifier of a connection state observer.
pub type ConnectionObserverId = u64;

/// Snapshot of the transport's connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub has_inflight_requests: bool,
    pub is_websocket_connected: bool,
    /// Milliseconds since the epoch at which the oldest in-flight request was sent.
    pub time_of_oldest_inflight_request: Option<u64>,
    pub has_ever_connected: bool,
    pub connection_count: u32,
    pub connection_retries: u32,
    pub inflight_mutations: u32,
    pub inflight_actions: u32,
}

/// Transport-facing subscription manager.
///
/// `subscribe` is refcounted by token: every call must be paired with exactly
/// one `unsubscribe` of the returned token, and identical `(path, args)` pairs
/// share one server subscription.
pub trait SubscriptionManager {
    /// Adds interest in `path(args)` and returns its token.
    fn subscribe(&self, path: &FunctionPath, args: &Value) -> tidal_core::Result<QueryToken>;

    /// Drops one unit of interest in `token`.
    fn unsubscribe(&self, token: &QueryToken);

    /// Returns true if a result (value or function error) is cached for `token`.
    fn has_local_query_result(&self, token: &QueryToken) -> bool;

    /// Reads the cached result for `token`. `Ok(None)` means nothing is cached yet.
    fn local_query_result(&self, token: &QueryToken) -> Result<Option<Value>, LookupError>;

    /// Log lines the function printed while computing the cached result.
    fn local_query_logs(&self, _token: &QueryToken) -> Option<Vec<String>> {
        None
    }

    /// Sends a mutation.
    fn mutation(&self, path: &FunctionPath, args: Value) -> ResponseFuture;

    /// Sends an action.
    fn action(&self, path: &FunctionPath, args: Value) -> ResponseFuture;

    /// Returns the current connection state.
    fn connection_state(&self) -> ConnectionState;

    /// Registers a connection state observer.
    fn subscribe_to_connection_state(
        &self,
        callback: ConnectionStateCallback,
    ) -> ConnectionObserverId;

    /// Removes a connection state observer. Unknown ids are ignored.
    fn unsubscribe_from_connection_state(&self, id: ConnectionObserverId);

    /// Authenticates as an admin, optionally acting as a user identity.
    fn set_admin_auth(&self, deploy_key: String, acting_as: Option<Value>);

    /// Installs the handler called after each batch of result changes.
    ///
    /// Implementations must not hold internal borrows while calling it.
    fn set_transition_handler(&self, handler: TransitionHandler);

    /// Shuts the transport down.
    fn close(&self) -> LocalBoxFuture<'static, ()>;
}
