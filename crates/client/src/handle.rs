//! Handles returned by `ReactiveClient` subscriptions.
//!
//! Handles hold the engine and the transport weakly, so storing one inside a
//! listener callback does not keep the client alive. Dropping a handle does
//! not unsubscribe: call `unsubscribe` explicitly.

use crate::error::Result;
use futures::future::LocalBoxFuture;
use std::rc::{Rc, Weak};
use tidal_core::{PaginatedQueryToken, QueryToken, Value};
use tidal_reactive::{
    ConnectionObserverId, ListenerHandle, PaginatedResult, QuerySetHandle, ReactiveEngine,
    SubscriptionManager, WeakEngine,
};
use tracing::trace;

/// Future of a one-shot query.
pub type QueryFuture = LocalBoxFuture<'static, Result<Value>>;

/// Future of a mutation or action.
pub type ResponseFuture = LocalBoxFuture<'static, Result<Value>>;

struct QueryBinding {
    listener: ListenerHandle,
    token: QueryToken,
    manager: Weak<dyn SubscriptionManager>,
}

/// A live query subscription.
pub struct Subscription {
    inner: Option<QueryBinding>,
}

impl Subscription {
    pub(crate) fn new(
        listener: ListenerHandle,
        token: QueryToken,
        manager: Weak<dyn SubscriptionManager>,
    ) -> Self {
        Self {
            inner: Some(QueryBinding {
                listener,
                token,
                manager,
            }),
        }
    }

    /// A subscription that never delivers. Returned by disabled clients.
    pub fn inert() -> Self {
        Self { inner: None }
    }

    /// Stops delivery and releases the query. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(binding) = &self.inner {
            trace!(token = %binding.token, "Unsubscribing query");
            binding.listener.unsubscribe();
        }
    }

    /// Returns true until `unsubscribe` or client close.
    pub fn is_active(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|binding| binding.listener.is_active())
    }

    /// Token of the subscribed query, `None` for inert subscriptions.
    pub fn token(&self) -> Option<&QueryToken> {
        self.inner.as_ref().map(|binding| &binding.token)
    }

    /// Reads the cached result without waiting for a transition.
    ///
    /// Returns `Ok(None)` while nothing is cached or once inactive.
    pub fn current_value(&self) -> Result<Option<Value>> {
        let Some((binding, manager)) = self.live() else {
            return Ok(None);
        };
        Ok(manager.local_query_result(&binding.token)?)
    }

    /// Log lines the server attached to the cached result.
    pub fn query_logs(&self) -> Option<Vec<String>> {
        let (binding, manager) = self.live()?;
        manager.local_query_logs(&binding.token)
    }

    fn live(&self) -> Option<(&QueryBinding, Rc<dyn SubscriptionManager>)> {
        let binding = self.inner.as_ref()?;
        if !binding.listener.is_active() {
            return None;
        }
        Some((binding, binding.manager.upgrade()?))
    }
}

struct PaginatedBinding {
    listener: ListenerHandle,
    token: PaginatedQueryToken,
    engine: WeakEngine,
}

/// A live paginated query subscription.
pub struct PaginatedSubscription {
    inner: Option<PaginatedBinding>,
}

impl PaginatedSubscription {
    pub(crate) fn new(
        listener: ListenerHandle,
        token: PaginatedQueryToken,
        engine: WeakEngine,
    ) -> Self {
        Self {
            inner: Some(PaginatedBinding {
                listener,
                token,
                engine,
            }),
        }
    }

    /// A subscription that never delivers.
    pub fn inert() -> Self {
        Self { inner: None }
    }

    /// Stops delivery and releases every page. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(binding) = &self.inner {
            trace!(token = %binding.token, "Unsubscribing paginated query");
            binding.listener.unsubscribe();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|binding| binding.listener.is_active())
    }

    pub fn token(&self) -> Option<&PaginatedQueryToken> {
        self.inner.as_ref().map(|binding| &binding.token)
    }

    /// Aggregates the currently loaded pages.
    pub fn current_value(&self) -> Result<Option<PaginatedResult>> {
        let Some((binding, engine)) = self.live() else {
            return Ok(None);
        };
        Ok(engine.paginated().local_query_result(&binding.token)?)
    }

    /// Requests `num_items` more items after the last loaded page.
    ///
    /// Returns `Ok(false)` if a page is still loading, the query is
    /// exhausted, or the subscription is no longer active. On success the
    /// listener observes `LoadingMore` on a later turn.
    pub fn load_more(&self, num_items: u32) -> Result<bool> {
        let Some((binding, engine)) = self.live() else {
            return Ok(false);
        };
        let requested = engine.paginated().load_more(&binding.token, num_items)?;
        if requested {
            engine.schedule_paginated_refresh(binding.token.clone());
        }
        Ok(requested)
    }

    fn live(&self) -> Option<(&PaginatedBinding, ReactiveEngine)> {
        let binding = self.inner.as_ref()?;
        if !binding.listener.is_active() {
            return None;
        }
        let engine = binding.engine.upgrade()?;
        if engine.is_closed() {
            return None;
        }
        Some((binding, engine))
    }
}

/// Registration of a connection state observer.
pub struct ConnectionStateSubscription {
    inner: Option<(ConnectionObserverId, Weak<dyn SubscriptionManager>)>,
}

impl ConnectionStateSubscription {
    pub(crate) fn new(id: ConnectionObserverId, manager: Weak<dyn SubscriptionManager>) -> Self {
        Self {
            inner: Some((id, manager)),
        }
    }

    pub fn inert() -> Self {
        Self { inner: None }
    }

    /// Stops notifications.
    pub fn unsubscribe(&self) {
        if let Some((id, manager)) = &self.inner {
            if let Some(manager) = manager.upgrade() {
                manager.unsubscribe_from_connection_state(*id);
            }
        }
    }
}

/// Registration of a query-set watcher.
pub struct QuerySetSubscription {
    inner: Option<QuerySetHandle>,
}

impl QuerySetSubscription {
    pub(crate) fn new(handle: QuerySetHandle) -> Self {
        Self {
            inner: Some(handle),
        }
    }

    pub fn inert() -> Self {
        Self { inner: None }
    }

    /// Stops delivery. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(handle) = &self.inner {
            trace!(watcher = handle.id(), "Unsubscribing query set");
            handle.unsubscribe();
        }
    }

    /// Returns true until `unsubscribe` or client close.
    pub fn is_active(&self) -> bool {
        self.inner.as_ref().is_some_and(QuerySetHandle::is_active)
    }
}
