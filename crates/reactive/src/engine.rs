//! The reactive engine: listener registration and dispatch passes.
//!
//! A dispatch pass walks the registry in registration order and delivers the
//! cached result of each listener whose token changed. Passes never overlap.
//! The registry is snapshotted when a pass starts, so listeners registered by
//! a callback wait for the next pass, while listeners removed by a callback
//! are skipped if their turn has not come yet.
//!
//! Failures are kept local to the listener they belong to:
//!
//! - a `FunctionError` goes to that listener's error callback, or to the
//!   unhandled-error hook on a later scheduler turn;
//! - a panicking callback does not stop delivery to later listeners; the first
//!   panic is resumed once the pass has finished;
//! - a corrupt cached value aborts the pass with `DispatchError::Lookup`.
//!
//! A transition that arrives while a pass is running is queued and handled
//! after that pass, so the paginated composer only ever sees changes that
//! will be dispatched.

use crate::bootstrap::{BootstrapState, BootstrapTimer};
use crate::listener::{
    DebugInfo, ErrorCallback, Listener, ListenerId, ListenerRecord, ListenerRegistry, ReleaseFn,
};
use crate::manager::{SubscriptionManager, TransitionHandler};
use crate::paginated::PaginatedQueryComposer;
use crate::query_set::{QuerySetCallback, QuerySetEntry, QuerySetSnapshot, WatcherId};
use crate::scheduler::Scheduler;
use crate::transition::Transition;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use thiserror::Error;
use tidal_core::{
    FunctionError, LookupError, PaginatedQueryToken, QueryToken, SubscriptionToken, Value,
};
use tracing::{debug, error, info, trace, warn};

type PanicPayload = Box<dyn Any + Send>;
type Watcher = Rc<dyn Fn(&QuerySetSnapshot)>;

/// Errors that abort a dispatch pass.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum DispatchError {
    /// A pass was started from inside a listener callback.
    #[error("Dispatch re-entered from a listener callback")]
    Reentrant,
    /// A cached value could not be read.
    #[error("Failed to read query result: {0}")]
    Lookup(#[from] LookupError),
}

/// An error no listener callback was registered to receive.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum UnhandledError {
    #[error("Unhandled error in query {path}: {error}")]
    Function {
        path: String,
        args: Value,
        error: FunctionError,
    },
}

/// Receives unhandled errors, always on a later scheduler turn.
pub type UnhandledErrorHook = Rc<dyn Fn(&UnhandledError)>;

/// Engine settings.
#[derive(Clone, Default)]
pub struct EngineOptions {
    /// Log pass summaries at `info` instead of `debug`
    pub verbose: bool,
    /// Replaces the default `warn!` report of unhandled errors
    pub on_unhandled_error: Option<UnhandledErrorHook>,
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("verbose", &self.verbose)
            .field("on_unhandled_error", &self.on_unhandled_error.is_some())
            .finish()
    }
}

struct EngineInner {
    manager: Rc<dyn SubscriptionManager>,
    paginated: PaginatedQueryComposer,
    scheduler: Rc<dyn Scheduler>,
    registry: RefCell<ListenerRegistry>,
    bootstrap: BootstrapTimer,
    closed: Cell<bool>,
    dispatching: Cell<bool>,
    deferred: RefCell<Vec<QueryToken>>,
    watchers: RefCell<BTreeMap<WatcherId, Watcher>>,
    next_watcher: Cell<WatcherId>,
    options: EngineOptions,
}

/// Resets the dispatching flag when a pass ends, including by unwinding.
struct PassGuard<'a>(&'a Cell<bool>);

impl<'a> PassGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.replace(true) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

enum Outcome {
    Delivered(Option<PanicPayload>),
    NotReady,
    Failed(LookupError),
}

fn guarded(f: impl FnOnce()) -> Option<PanicPayload> {
    panic::catch_unwind(AssertUnwindSafe(f)).err()
}

/// Fans cached results out to registered listeners.
#[derive(Clone)]
pub struct ReactiveEngine {
    inner: Rc<EngineInner>,
}

impl ReactiveEngine {
    /// Creates an engine reading results from `manager`.
    pub fn new(
        manager: Rc<dyn SubscriptionManager>,
        scheduler: Rc<dyn Scheduler>,
        options: EngineOptions,
    ) -> Self {
        let paginated = PaginatedQueryComposer::new(manager.clone());
        Self {
            inner: Rc::new(EngineInner {
                manager,
                paginated,
                scheduler,
                registry: RefCell::new(ListenerRegistry::new()),
                bootstrap: BootstrapTimer::new(),
                closed: Cell::new(false),
                dispatching: Cell::new(false),
                deferred: RefCell::new(Vec::new()),
                watchers: RefCell::new(BTreeMap::new()),
                next_watcher: Cell::new(0),
                options,
            }),
        }
    }

    /// Returns a handle that does not keep the engine alive.
    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Rc::downgrade(&self.inner),
        }
    }

    #[inline]
    pub fn manager(&self) -> &Rc<dyn SubscriptionManager> {
        &self.inner.manager
    }

    #[inline]
    pub fn paginated(&self) -> &PaginatedQueryComposer {
        &self.inner.paginated
    }

    #[inline]
    pub fn scheduler(&self) -> &Rc<dyn Scheduler> {
        &self.inner.scheduler
    }

    /// Returns true once `close` was called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Returns true while a pass is running.
    #[inline]
    pub fn is_dispatching(&self) -> bool {
        self.inner.dispatching.get()
    }

    #[inline]
    pub fn bootstrap_state(&self) -> BootstrapState {
        self.inner.bootstrap.state()
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.registry.borrow().len()
    }

    /// Registers a listener.
    ///
    /// `release` is called once when the listener is unsubscribed. If a result
    /// is already cached for the token, a bootstrap pass is scheduled so the
    /// listener sees it without waiting for the next transition.
    ///
    /// After `close` the listener is not stored and the returned handle is
    /// inert.
    pub fn register(
        &self,
        listener: Listener,
        on_error: Option<ErrorCallback>,
        release: ReleaseFn,
        debug: DebugInfo,
    ) -> ListenerHandle {
        if self.is_closed() {
            return ListenerHandle::detached();
        }

        let ready = self.has_result(&listener.token());
        let id = self
            .inner
            .registry
            .borrow_mut()
            .insert(listener, on_error, release, debug);
        trace!(listener = id, ready, "Registered listener");

        if ready {
            self.schedule_bootstrap();
        }
        ListenerHandle {
            id,
            engine: Rc::downgrade(&self.inner),
        }
    }

    /// Removes a listener and releases its subscription.
    ///
    /// Idempotent, and a no-op once the engine is closed.
    pub fn unsubscribe(&self, id: ListenerId) {
        if self.is_closed() {
            return;
        }
        let record = self.inner.registry.borrow_mut().remove(id);
        if let Some(record) = record {
            trace!(listener = id, "Unsubscribed listener");
            if let Some(release) = record.take_release() {
                release();
            }
        }
    }

    /// Stops all further dispatch and drops every listener.
    ///
    /// Release thunks are not called: the transport is going away with the
    /// engine. Returns false if the engine was already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.replace(true) {
            return false;
        }
        let mut registry = self.inner.registry.borrow_mut();
        debug!(listeners = registry.len(), "Closing reactive engine");
        registry.clear();
        self.inner.deferred.borrow_mut().clear();
        self.inner.watchers.borrow_mut().clear();
        true
    }

    /// Runs one pass for the tokens of `transition`, then handles any
    /// transition that arrived during it.
    pub fn dispatch(&self, transition: &Transition) -> Result<(), DispatchError> {
        self.run_pass(transition, false)?;
        self.drain_deferred()
    }

    /// Handles a batch of changed query tokens from the manager: folds page
    /// changes into paginated tokens, then dispatches.
    ///
    /// During a pass the batch is queued instead, and handled once the pass
    /// is over.
    pub fn on_transition(&self, changed: &[QueryToken]) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Ok(());
        }
        if self.is_dispatching() {
            self.defer_transition(changed);
            return Ok(());
        }
        self.apply_transition(changed)?;
        self.drain_deferred()
    }

    /// Calls `callback` after every transition with the results of all live
    /// plain queries. The first snapshot comes with the next transition.
    ///
    /// After `close` the callback is dropped and the handle is inert.
    pub fn watch_all(&self, callback: QuerySetCallback) -> QuerySetHandle {
        if self.is_closed() {
            return QuerySetHandle::detached();
        }
        let id = self.inner.next_watcher.get() + 1;
        self.inner.next_watcher.set(id);
        self.inner.watchers.borrow_mut().insert(id, Rc::from(callback));
        trace!(watcher = id, "Watching query set");
        QuerySetHandle {
            id,
            engine: Rc::downgrade(&self.inner),
        }
    }

    /// Removes a query-set watcher. Idempotent.
    pub fn unwatch(&self, id: WatcherId) {
        if self.inner.watchers.borrow_mut().remove(&id).is_some() {
            trace!(watcher = id, "Stopped watching query set");
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.borrow().len()
    }

    /// Collects the cached result of every registered plain query.
    ///
    /// Queries without a result yet are left out.
    pub fn query_set(&self) -> Result<QuerySetSnapshot, LookupError> {
        let records = self.inner.registry.borrow().snapshot();
        let mut snapshot = QuerySetSnapshot::new();
        for record in &records {
            let Listener::Query { token, .. } = record.listener() else {
                continue;
            };
            if snapshot.contains(token) {
                continue;
            }
            let result = match self.inner.manager.local_query_result(token) {
                Ok(Some(value)) => Ok(value),
                Ok(None) => continue,
                Err(LookupError::Function(e)) => Err(e),
                Err(corrupt) => return Err(corrupt),
            };
            let entry = QuerySetEntry {
                path: record.debug().path.clone(),
                args: record.debug().args.clone(),
                result,
            };
            snapshot.insert(token.clone(), entry);
        }
        Ok(snapshot)
    }

    /// Returns a handler to install on the manager.
    ///
    /// The handler holds the engine weakly and logs dispatch failures.
    pub fn transition_handler(&self) -> TransitionHandler {
        let engine = Rc::downgrade(&self.inner);
        Rc::new(move |changed: &[QueryToken]| {
            let Some(inner) = engine.upgrade() else {
                return;
            };
            if let Err(e) = (ReactiveEngine { inner }).on_transition(changed) {
                error!(error = %e, tokens = changed.len(), "Dispatch failed");
            }
        })
    }

    /// Recomputes `token` on a later turn and dispatches it if its aggregate
    /// changed. Used after `load_more` so listeners observe `LoadingMore`.
    pub fn schedule_paginated_refresh(&self, token: PaginatedQueryToken) {
        let engine = Rc::downgrade(&self.inner);
        self.inner.scheduler.defer(Box::new(move || {
            let Some(inner) = engine.upgrade() else {
                return;
            };
            let engine = ReactiveEngine { inner };
            if engine.is_closed() {
                return;
            }
            let result = match engine.inner.paginated.refresh(&token) {
                Ok(true) => engine.dispatch(&Transition::from_paginated([token])),
                Ok(false) => Ok(()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                error!(error = %e, "Paginated refresh failed");
            }
        }));
    }

    fn apply_transition(&self, changed: &[QueryToken]) -> Result<(), DispatchError> {
        let paginated = self.inner.paginated.process_transition(changed)?;
        let transition = Transition {
            queries: changed.to_vec(),
            paginated_queries: paginated,
        };
        self.run_pass(&transition, false)?;
        self.notify_watchers()
    }

    fn defer_transition(&self, changed: &[QueryToken]) {
        let mut deferred = self.inner.deferred.borrow_mut();
        for token in changed {
            if !deferred.contains(token) {
                deferred.push(token.clone());
            }
        }
        trace!(tokens = changed.len(), queued = deferred.len(), "Transition queued behind pass");
    }

    fn drain_deferred(&self) -> Result<(), DispatchError> {
        loop {
            if self.is_closed() {
                return Ok(());
            }
            let changed = std::mem::take(&mut *self.inner.deferred.borrow_mut());
            if changed.is_empty() {
                return Ok(());
            }
            debug!(tokens = changed.len(), "Handling queued transition");
            self.apply_transition(&changed)?;
        }
    }

    fn notify_watchers(&self) -> Result<(), DispatchError> {
        if self.is_closed() || self.inner.watchers.borrow().is_empty() {
            return Ok(());
        }
        let snapshot = self.query_set()?;
        let watchers: Vec<(WatcherId, Watcher)> = self
            .inner
            .watchers
            .borrow()
            .iter()
            .map(|(id, watcher)| (*id, watcher.clone()))
            .collect();
        debug!(watchers = watchers.len(), queries = snapshot.len(), "Notifying query-set watchers");

        let mut first_panic: Option<PanicPayload> = None;
        for (id, watcher) in watchers {
            if !self.inner.watchers.borrow().contains_key(&id) {
                continue;
            }
            if let Some(payload) = guarded(|| watcher(&snapshot)) {
                error!(watcher = id, "Query-set watcher panicked");
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        Ok(())
    }

    fn has_result(&self, token: &SubscriptionToken) -> bool {
        match token {
            SubscriptionToken::Query(t) => self.inner.manager.has_local_query_result(t),
            SubscriptionToken::Paginated(t) => self.inner.paginated.has_local_query_result(t),
        }
    }

    fn schedule_bootstrap(&self) {
        if !self.inner.bootstrap.arm() {
            return;
        }
        let engine = Rc::downgrade(&self.inner);
        self.inner.scheduler.defer(Box::new(move || {
            if let Some(inner) = engine.upgrade() {
                ReactiveEngine { inner }.run_bootstrap();
            }
        }));
    }

    fn run_bootstrap(&self) {
        self.inner.bootstrap.fire();
        if self.is_closed() {
            return;
        }
        let result = self
            .run_pass(&Transition::new(), true)
            .and_then(|()| self.drain_deferred());
        if let Err(e) = result {
            error!(error = %e, "Bootstrap pass failed");
        }
    }

    fn run_pass(&self, transition: &Transition, bootstrap: bool) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Ok(());
        }
        let Some(guard) = PassGuard::enter(&self.inner.dispatching) else {
            warn!("Dispatch re-entered from a listener callback");
            return Err(DispatchError::Reentrant);
        };

        let changed = transition.changed();
        let snapshot = self.inner.registry.borrow().snapshot();
        if self.inner.options.verbose {
            info!(listeners = snapshot.len(), tokens = transition.len(), bootstrap, "Dispatching");
        } else {
            debug!(
                listeners = snapshot.len(),
                tokens = transition.len(),
                bootstrap,
                "Dispatching"
            );
        }

        let mut first_panic: Option<PanicPayload> = None;
        for record in &snapshot {
            if self.is_closed() {
                break;
            }
            if record.is_removed() {
                continue;
            }
            let deliverable = changed.contains(record.token())
                || (bootstrap && !record.has_ever_run() && self.has_result(record.token()));
            if !deliverable {
                continue;
            }

            record.mark_run();
            let panicked = match self.deliver(record) {
                Outcome::Delivered(panicked) => panicked,
                Outcome::NotReady => None,
                Outcome::Failed(LookupError::Function(e)) => self.route_error(record, e),
                Outcome::Failed(corrupt) => {
                    error!(
                        listener = record.id(),
                        path = %record.debug().path,
                        error = %corrupt,
                        "Corrupt query result"
                    );
                    return Err(corrupt.into());
                }
            };
            if let Some(payload) = panicked {
                error!(
                    listener = record.id(),
                    path = %record.debug().path,
                    "Listener callback panicked"
                );
                first_panic.get_or_insert(payload);
            }
        }

        drop(guard);
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        Ok(())
    }

    fn deliver(&self, record: &ListenerRecord) -> Outcome {
        trace!(listener = record.id(), path = %record.debug().path, "Delivering");
        match record.listener() {
            Listener::Query { token, on_update } => {
                match self.inner.manager.local_query_result(token) {
                    Ok(Some(value)) => Outcome::Delivered(guarded(|| on_update(&value))),
                    Ok(None) => Outcome::NotReady,
                    Err(e) => Outcome::Failed(e),
                }
            }
            Listener::Paginated { token, on_update } => {
                match self.inner.paginated.local_query_result(token) {
                    Ok(Some(result)) => Outcome::Delivered(guarded(|| on_update(&result))),
                    Ok(None) => Outcome::NotReady,
                    Err(e) => Outcome::Failed(e),
                }
            }
        }
    }

    fn route_error(&self, record: &ListenerRecord, error: FunctionError) -> Option<PanicPayload> {
        if let Some(on_error) = record.on_error() {
            return guarded(|| on_error(&error));
        }

        let unhandled = UnhandledError::Function {
            path: record.debug().path.clone(),
            args: record.debug().args.clone(),
            error,
        };
        let hook = self.inner.options.on_unhandled_error.clone();
        self.inner.scheduler.defer(Box::new(move || match hook {
            Some(hook) => hook(&unhandled),
            None => warn!(error = %unhandled, "Unhandled error in query listener"),
        }));
        None
    }
}

/// Non-owning reference to a `ReactiveEngine`.
#[derive(Clone, Debug, Default)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    /// Returns the engine if it is still alive.
    pub fn upgrade(&self) -> Option<ReactiveEngine> {
        self.inner.upgrade().map(|inner| ReactiveEngine { inner })
    }
}

/// Handle to a query-set watcher.
#[derive(Clone, Debug)]
pub struct QuerySetHandle {
    id: WatcherId,
    engine: Weak<EngineInner>,
}

impl QuerySetHandle {
    /// A handle not attached to any engine.
    pub fn detached() -> Self {
        Self {
            id: 0,
            engine: Weak::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> WatcherId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|inner| inner.watchers.borrow().contains_key(&self.id))
    }

    /// Stops the watcher. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.engine.upgrade() {
            ReactiveEngine { inner }.unwatch(self.id);
        }
    }
}

/// Handle to a registered listener.
#[derive(Clone, Debug)]
pub struct ListenerHandle {
    id: ListenerId,
    engine: Weak<EngineInner>,
}

impl ListenerHandle {
    /// A handle not attached to any engine.
    pub fn detached() -> Self {
        Self {
            id: 0,
            engine: Weak::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Returns true while the listener is registered.
    pub fn is_active(&self) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|inner| inner.registry.borrow().contains(self.id))
    }

    /// Unsubscribes the listener. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.engine.upgrade() {
            ReactiveEngine { inner }.unsubscribe(self.id);
        }
    }
}
