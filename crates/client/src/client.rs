//! The reactive client facade.

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::handle::{
    ConnectionStateSubscription, PaginatedSubscription, QueryFuture, QuerySetSubscription,
    ResponseFuture, Subscription,
};
use crate::queue::MutationQueue;
use futures::channel::oneshot;
use futures::future::{self, LocalBoxFuture};
use futures::{FutureExt, TryFutureExt};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tidal_core::{
    normalize_args, FunctionError, FunctionPath, PaginationOptions, QueryToken, Value,
};
use tidal_reactive::{
    ConnectionState, DebugInfo, EngineOptions, ErrorCallback, Listener, ListenerHandle,
    PaginatedResult, QuerySetSnapshot, ReactiveEngine, ReleaseFn, Scheduler, SubscriptionManager,
    UnhandledError, UnhandledErrorHook,
};
use tracing::{debug, trace};

/// Options for a single mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MutationOptions {
    /// Send immediately instead of waiting behind queued mutations
    pub skip_queue: bool,
}

/// Builds a `ReactiveClient`.
pub struct ClientBuilder {
    config: ClientConfig,
    on_unhandled_error: Option<UnhandledErrorHook>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            on_unhandled_error: None,
        }
    }

    /// Receives query errors that no listener handles.
    pub fn on_unhandled_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&UnhandledError) + 'static,
    {
        self.on_unhandled_error = Some(Rc::new(hook));
        self
    }

    /// Creates the client.
    ///
    /// `factory` builds the transport. It is not called when the
    /// configuration is disabled.
    pub fn connect<F>(self, scheduler: Rc<dyn Scheduler>, factory: F) -> ReactiveClient
    where
        F: FnOnce(&ClientConfig) -> Rc<dyn SubscriptionManager>,
    {
        if self.config.disabled {
            debug!("Client disabled, not connecting");
            return ReactiveClient::from_parts(self.config, None);
        }

        let manager = factory(&self.config);
        let options = EngineOptions {
            verbose: self.config.verbose,
            on_unhandled_error: self.on_unhandled_error,
        };
        let engine = ReactiveEngine::new(manager.clone(), scheduler.clone(), options);
        manager.set_transition_handler(engine.transition_handler());

        let queue = self
            .config
            .queue_mutations
            .then(|| MutationQueue::start(manager, &*scheduler));
        debug!(client_id = ?self.config.client_id, queued = queue.is_some(), "Client connected");

        let live = LiveClient {
            engine,
            queue: RefCell::new(queue),
            next_pagination_id: Cell::new(0),
        };
        ReactiveClient::from_parts(self.config, Some(live))
    }
}

struct LiveClient {
    engine: ReactiveEngine,
    queue: RefCell<Option<MutationQueue>>,
    next_pagination_id: Cell<u64>,
}

impl LiveClient {
    fn manager(&self) -> &Rc<dyn SubscriptionManager> {
        self.engine.manager()
    }

    /// Registers a listener for a token the manager is already subscribed
    /// to. The listener owns that subscription.
    fn register_query(
        &self,
        path: &FunctionPath,
        args: Value,
        token: &QueryToken,
        listener: Listener,
        on_error: Option<ErrorCallback>,
    ) -> ListenerHandle {
        let manager = Rc::downgrade(self.manager());
        let released = token.clone();
        let release: ReleaseFn = Box::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.unsubscribe(&released);
            }
        });
        self.engine
            .register(listener, on_error, release, DebugInfo::new(path.as_str(), args))
    }
}

struct ClientInner {
    config: ClientConfig,
    live: Option<LiveClient>,
}

/// Client for live queries, paginated queries, mutations and actions.
///
/// Cheap to clone; clones share the same engine and transport.
#[derive(Clone)]
pub struct ReactiveClient {
    inner: Rc<ClientInner>,
}

impl fmt::Debug for ReactiveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveClient")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ReactiveClient {
    /// Starts building a client.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// A client that never connects.
    pub fn disabled() -> Self {
        Self::from_parts(ClientConfig::default().disabled(true), None)
    }

    fn from_parts(config: ClientConfig, live: Option<LiveClient>) -> Self {
        Self {
            inner: Rc::new(ClientInner { config, live }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.inner.live.is_none()
    }

    /// Returns true after `close`. A disabled client is never closed.
    pub fn is_closed(&self) -> bool {
        self.inner
            .live
            .as_ref()
            .is_some_and(|live| live.engine.is_closed())
    }

    /// Calls `on_update` with every new result of `path(args)`.
    ///
    /// A result that is already cached is delivered on a later scheduler
    /// turn. Query errors go to `on_error`, or to the unhandled-error hook if
    /// it is `None`. On a disabled or closed client the subscription is
    /// inert.
    pub fn on_update<F>(
        &self,
        path: &str,
        args: Value,
        on_update: F,
        on_error: Option<ErrorCallback>,
    ) -> Result<Subscription>
    where
        F: Fn(&Value) + 'static,
    {
        let path = FunctionPath::parse(path)?;
        let args = normalize_args(args)?;
        let Some(live) = self.open() else {
            return Ok(Subscription::inert());
        };

        let token = live.manager().subscribe(&path, &args)?;
        let listener = Listener::query(token.clone(), on_update);
        let handle = live.register_query(&path, args, &token, listener, on_error);
        trace!(path = %path, listener = handle.id(), "Subscribed query");
        Ok(Subscription::new(handle, token, Rc::downgrade(live.manager())))
    }

    /// Calls `on_update` with the aggregate of a paginated query.
    ///
    /// `args` must not contain `paginationOpts`; the first page asks for
    /// `initial_num_items` items.
    pub fn on_paginated_update<F>(
        &self,
        path: &str,
        args: Value,
        initial_num_items: u32,
        on_update: F,
        on_error: Option<ErrorCallback>,
    ) -> Result<PaginatedSubscription>
    where
        F: Fn(&PaginatedResult) + 'static,
    {
        let path = FunctionPath::parse(path)?;
        let args = normalize_args(args)?;
        let Some(live) = self.open() else {
            return Ok(PaginatedSubscription::inert());
        };

        let id = live.next_pagination_id.get() + 1;
        let options = PaginationOptions::new(initial_num_items, id)?;
        let composer = live.engine.paginated().clone();
        let token = composer.subscribe(&path, args.clone(), options)?;
        live.next_pagination_id.set(id);

        let released = token.clone();
        let release: ReleaseFn = Box::new(move || composer.unsubscribe(&released));
        let handle = live.engine.register(
            Listener::paginated(token.clone(), on_update),
            on_error,
            release,
            DebugInfo::new(path.as_str(), args),
        );
        trace!(path = %path, listener = handle.id(), "Subscribed paginated query");
        Ok(PaginatedSubscription::new(handle, token, live.engine.downgrade()))
    }

    /// Calls `callback` after every transition with the results of all live
    /// plain queries, taken together so they are mutually consistent.
    ///
    /// Nothing is delivered before the next transition. Paginated queries
    /// are not part of the snapshot. On a disabled or closed client the
    /// subscription is inert.
    pub fn watch_all<F>(&self, callback: F) -> Result<QuerySetSubscription>
    where
        F: Fn(&QuerySetSnapshot) + 'static,
    {
        let Some(live) = self.open() else {
            return Ok(QuerySetSubscription::inert());
        };
        let handle = live.engine.watch_all(Box::new(callback));
        trace!(watcher = handle.id(), "Watching all queries");
        Ok(QuerySetSubscription::new(handle))
    }

    /// Resolves with the first result of `path(args)`, then unsubscribes.
    ///
    /// Ready at once if the result is already cached. Resolves to
    /// `ClientError::Closed` if the client closes first.
    pub fn query(&self, path: &str, args: Value) -> Result<QueryFuture> {
        let path = FunctionPath::parse(path)?;
        let args = normalize_args(args)?;
        let live = self.live()?;

        let token = live.manager().subscribe(&path, &args)?;
        if live.manager().has_local_query_result(&token) {
            let cached = live.manager().local_query_result(&token);
            live.manager().unsubscribe(&token);
            let result = match cached {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(ClientError::Corrupt(format!("missing result for {}", token))),
                Err(e) => Err(e.into()),
            };
            return Ok(future::ready(result).boxed_local());
        }

        let (sender, receiver) = oneshot::channel::<Result<Value>>();
        let sender = RefCell::new(Some(sender));
        let slot: Rc<RefCell<Option<ListenerHandle>>> = Rc::new(RefCell::new(None));
        let settle: Rc<dyn Fn(Result<Value>)> = {
            let slot = slot.clone();
            Rc::new(move |result: Result<Value>| {
                if let Some(sender) = sender.borrow_mut().take() {
                    let _ = sender.send(result);
                }
                let handle = slot.borrow_mut().take();
                if let Some(handle) = handle {
                    handle.unsubscribe();
                }
            })
        };

        let on_value = settle.clone();
        let on_error: ErrorCallback =
            Box::new(move |error: &FunctionError| settle(Err(error.clone().into())));
        let listener = Listener::query(token.clone(), move |value| on_value(Ok(value.clone())));
        let handle = live.register_query(&path, args, &token, listener, Some(on_error));
        *slot.borrow_mut() = Some(handle);

        Ok(receiver
            .map(|received| received.unwrap_or(Err(ClientError::Closed)))
            .boxed_local())
    }

    /// Runs a mutation with default options.
    pub fn mutation(&self, path: &str, args: Value) -> Result<ResponseFuture> {
        self.mutation_with_options(path, args, MutationOptions::default())
    }

    /// Runs a mutation.
    ///
    /// Unless `skip_queue` is set or queueing is disabled in the config, the
    /// mutation is sent after every previously queued one has completed.
    pub fn mutation_with_options(
        &self,
        path: &str,
        args: Value,
        options: MutationOptions,
    ) -> Result<ResponseFuture> {
        let path = FunctionPath::parse(path)?;
        let args = normalize_args(args)?;
        let live = self.live()?;

        let response = match &*live.queue.borrow() {
            Some(queue) if !options.skip_queue => queue.enqueue(path, args),
            _ => live.manager().mutation(&path, args),
        };
        Ok(response.map_err(ClientError::from).boxed_local())
    }

    /// Runs an action. Actions are never queued.
    pub fn action(&self, path: &str, args: Value) -> Result<ResponseFuture> {
        let path = FunctionPath::parse(path)?;
        let args = normalize_args(args)?;
        let live = self.live()?;
        Ok(live
            .manager()
            .action(&path, args)
            .map_err(ClientError::from)
            .boxed_local())
    }

    /// Current state of the connection.
    pub fn connection_state(&self) -> Result<ConnectionState> {
        let live = self.inner.live.as_ref().ok_or(ClientError::Disabled)?;
        Ok(live.manager().connection_state())
    }

    /// Calls `callback` whenever the connection state changes.
    pub fn subscribe_to_connection_state<F>(
        &self,
        callback: F,
    ) -> Result<ConnectionStateSubscription>
    where
        F: Fn(&ConnectionState) + 'static,
    {
        let live = self.inner.live.as_ref().ok_or(ClientError::Disabled)?;
        if live.engine.is_closed() {
            return Ok(ConnectionStateSubscription::inert());
        }
        let id = live.manager().subscribe_to_connection_state(Box::new(callback));
        Ok(ConnectionStateSubscription::new(id, Rc::downgrade(live.manager())))
    }

    /// Authenticates as an admin with a deploy key, optionally acting as
    /// another identity.
    pub fn set_admin_auth(
        &self,
        deploy_key: impl Into<String>,
        acting_as: Option<Value>,
    ) -> Result<()> {
        let live = self.live()?;
        live.manager().set_admin_auth(deploy_key.into(), acting_as);
        Ok(())
    }

    /// Stops all delivery and closes the transport.
    ///
    /// Pending one-shot queries resolve to `ClientError::Closed`. Safe to
    /// call repeatedly; only the first call closes the transport.
    pub fn close(&self) -> LocalBoxFuture<'static, ()> {
        let Some(live) = &self.inner.live else {
            return future::ready(()).boxed_local();
        };
        if !live.engine.close() {
            return future::ready(()).boxed_local();
        }
        debug!(client_id = ?self.inner.config.client_id, "Closing client");
        live.queue.borrow_mut().take();
        live.manager().close()
    }

    fn live(&self) -> Result<&LiveClient> {
        let live = self.inner.live.as_ref().ok_or(ClientError::Disabled)?;
        if live.engine.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(live)
    }

    fn open(&self) -> Option<&LiveClient> {
        self.inner
            .live
            .as_ref()
            .filter(|live| !live.engine.is_closed())
    }
}
