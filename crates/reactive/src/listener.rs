//! Listener records and the registry that owns them.
//!
//! Every `on_update` or `on_paginated_update` registration becomes one
//! `ListenerRecord`. Records are keyed by a monotonically increasing id, so
//! iterating the registry yields registration order.

use crate::paginated::PaginatedResult;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tidal_core::{FunctionError, PaginatedQueryToken, QueryToken, SubscriptionToken, Value};

/// Unique identifier for a listener.
pub type ListenerId = u64;

/// Callback receiving a plain query result.
pub type QueryCallback = Box<dyn Fn(&Value)>;

/// Callback receiving a paginated aggregate.
pub type PaginatedCallback = Box<dyn Fn(&PaginatedResult)>;

/// Callback receiving a function error.
pub type ErrorCallback = Box<dyn Fn(&FunctionError)>;

/// Releases the subscription backing a listener.
pub type ReleaseFn = Box<dyn FnOnce()>;

/// What a listener is interested in and how it is told.
pub enum Listener {
    Query {
        token: QueryToken,
        on_update: QueryCallback,
    },
    Paginated {
        token: PaginatedQueryToken,
        on_update: PaginatedCallback,
    },
}

impl Listener {
    /// Creates a plain query listener.
    pub fn query<F>(token: QueryToken, on_update: F) -> Self
    where
        F: Fn(&Value) + 'static,
    {
        Listener::Query {
            token,
            on_update: Box::new(on_update),
        }
    }

    /// Creates a paginated listener.
    pub fn paginated<F>(token: PaginatedQueryToken, on_update: F) -> Self
    where
        F: Fn(&PaginatedResult) + 'static,
    {
        Listener::Paginated {
            token,
            on_update: Box::new(on_update),
        }
    }

    /// Returns the token this listener watches.
    pub fn token(&self) -> SubscriptionToken {
        match self {
            Listener::Query { token, .. } => SubscriptionToken::Query(token.clone()),
            Listener::Paginated { token, .. } => SubscriptionToken::Paginated(token.clone()),
        }
    }
}

/// Function path and arguments, kept for diagnostics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DebugInfo {
    pub path: String,
    pub args: Value,
}

impl DebugInfo {
    pub fn new(path: impl Into<String>, args: Value) -> Self {
        Self {
            path: path.into(),
            args,
        }
    }
}

/// A registered listener.
pub struct ListenerRecord {
    id: ListenerId,
    token: SubscriptionToken,
    listener: Listener,
    on_error: Option<ErrorCallback>,
    release: RefCell<Option<ReleaseFn>>,
    has_ever_run: Cell<bool>,
    removed: Cell<bool>,
    debug: DebugInfo,
}

impl ListenerRecord {
    fn new(
        id: ListenerId,
        listener: Listener,
        on_error: Option<ErrorCallback>,
        release: ReleaseFn,
        debug: DebugInfo,
    ) -> Self {
        Self {
            id,
            token: listener.token(),
            listener,
            on_error,
            release: RefCell::new(Some(release)),
            has_ever_run: Cell::new(false),
            removed: Cell::new(false),
            debug,
        }
    }

    /// Returns the listener ID.
    #[inline]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Returns the watched token.
    #[inline]
    pub fn token(&self) -> &SubscriptionToken {
        &self.token
    }

    #[inline]
    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    #[inline]
    pub fn on_error(&self) -> Option<&ErrorCallback> {
        self.on_error.as_ref()
    }

    #[inline]
    pub fn debug(&self) -> &DebugInfo {
        &self.debug
    }

    /// Returns true once any pass has considered this listener deliverable.
    #[inline]
    pub fn has_ever_run(&self) -> bool {
        self.has_ever_run.get()
    }

    #[inline]
    pub(crate) fn mark_run(&self) {
        self.has_ever_run.set(true);
    }

    /// Returns true once the record left the registry.
    #[inline]
    pub fn is_removed(&self) -> bool {
        self.removed.get()
    }

    /// Takes the release thunk. Returns `None` the second time.
    pub(crate) fn take_release(&self) -> Option<ReleaseFn> {
        self.release.borrow_mut().take()
    }
}

impl fmt::Debug for ListenerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRecord")
            .field("id", &self.id)
            .field("path", &self.debug.path)
            .field("paginated", &self.token.is_paginated())
            .field("has_ever_run", &self.has_ever_run.get())
            .field("removed", &self.removed.get())
            .finish()
    }
}

/// Registration-ordered listener storage.
pub struct ListenerRegistry {
    listeners: BTreeMap<ListenerId, Rc<ListenerRecord>>,
    next_id: ListenerId,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            listeners: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Adds a listener and returns its id.
    pub fn insert(
        &mut self,
        listener: Listener,
        on_error: Option<ErrorCallback>,
        release: ReleaseFn,
        debug: DebugInfo,
    ) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;

        let record = ListenerRecord::new(id, listener, on_error, release, debug);
        self.listeners.insert(id, Rc::new(record));
        id
    }

    /// Removes a listener. A removed record is flagged so that a pass holding a
    /// snapshot skips it.
    ///
    /// Returns the record if it was present.
    pub fn remove(&mut self, id: ListenerId) -> Option<Rc<ListenerRecord>> {
        let record = self.listeners.remove(&id)?;
        record.removed.set(true);
        Some(record)
    }

    /// Returns a listener by id.
    pub fn get(&self, id: ListenerId) -> Option<&Rc<ListenerRecord>> {
        self.listeners.get(&id)
    }

    #[inline]
    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners.contains_key(&id)
    }

    /// Returns the current records in registration order.
    pub fn snapshot(&self) -> Vec<Rc<ListenerRecord>> {
        self.listeners.values().cloned().collect()
    }

    /// Returns all listener IDs in registration order.
    pub fn ids(&self) -> Vec<ListenerId> {
        self.listeners.keys().copied().collect()
    }

    /// Returns the number of registered listeners.
    #[inline]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns true if there are no listeners.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Drops every record without running release thunks.
    pub fn clear(&mut self) {
        for record in self.listeners.values() {
            record.removed.set(true);
        }
        self.listeners.clear();
    }
}
