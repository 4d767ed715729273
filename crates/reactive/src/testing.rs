//! In-memory subscription manager.
//!
//! `FakeSubscriptionManager` behaves like a transport whose server is the
//! test itself: subscriptions are refcounted by token, results are placed in
//! the cache by the test, and transitions are pushed explicitly. Requests
//! either resolve through a scripted responder or stay pending until the
//! test resolves them in FIFO order.

use crate::manager::{
    ConnectionObserverId, ConnectionState, ConnectionStateCallback, ResponseFuture,
    SubscriptionManager, TransitionHandler,
};
use futures::channel::oneshot;
use futures::future::{self, LocalBoxFuture};
use hashbrown::{HashMap, HashSet};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tidal_core::{FunctionError, FunctionPath, LookupError, QueryToken, RequestError, Value};
use tracing::warn;

/// Kind of a one-shot request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Mutation,
    Action,
}

/// A request as the fake received it.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    pub kind: RequestKind,
    pub path: String,
    pub args: Value,
}

type Responder = Rc<dyn Fn(&RecordedRequest) -> Result<Value, RequestError>>;

struct PendingRequest {
    kind: RequestKind,
    reply: oneshot::Sender<Result<Value, RequestError>>,
}

#[derive(Default)]
struct FakeState {
    refcounts: HashMap<QueryToken, usize>,
    args: HashMap<QueryToken, Value>,
    order: Vec<QueryToken>,
    results: HashMap<QueryToken, Result<Value, FunctionError>>,
    logs: HashMap<QueryToken, Vec<String>>,
    corrupt: HashSet<QueryToken>,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
    requests: Vec<RecordedRequest>,
    pending: VecDeque<PendingRequest>,
    responder: Option<Responder>,
    connection: ConnectionState,
    observers: BTreeMap<ConnectionObserverId, Rc<dyn Fn(&ConnectionState)>>,
    next_observer: ConnectionObserverId,
    admin_auth: Option<(String, Option<Value>)>,
    closed: bool,
}

impl FakeState {
    fn update_inflight(&mut self) {
        let count = |kind| self.pending.iter().filter(|p| p.kind == kind).count() as u32;
        let mutations = count(RequestKind::Mutation);
        let actions = count(RequestKind::Action);
        self.connection.inflight_mutations = mutations;
        self.connection.inflight_actions = actions;
        self.connection.has_inflight_requests = mutations + actions > 0;
    }
}

/// Subscription manager backed by in-memory maps.
#[derive(Default)]
pub struct FakeSubscriptionManager {
    state: RefCell<FakeState>,
    handler: RefCell<Option<TransitionHandler>>,
}

impl FakeSubscriptionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the token of `path(args)`.
    ///
    /// # Panics
    ///
    /// Panics on an invalid path or non-object arguments.
    pub fn token(path: &str, args: Value) -> QueryToken {
        let path = FunctionPath::parse(path).expect("valid function path");
        QueryToken::from_parts(&path, args).expect("object arguments")
    }

    /// Number of `subscribe` calls so far.
    pub fn subscribe_calls(&self) -> usize {
        self.state.borrow().subscribe_calls
    }

    /// Number of `unsubscribe` calls so far.
    pub fn unsubscribe_calls(&self) -> usize {
        self.state.borrow().unsubscribe_calls
    }

    /// Current refcount of `token`.
    pub fn refcount(&self, token: &QueryToken) -> usize {
        self.state.borrow().refcounts.get(token).copied().unwrap_or(0)
    }

    pub fn is_subscribed(&self, token: &QueryToken) -> bool {
        self.refcount(token) > 0
    }

    /// Subscribed tokens, in order of first subscription.
    pub fn active_tokens(&self) -> Vec<QueryToken> {
        let state = self.state.borrow();
        state
            .order
            .iter()
            .filter(|t| state.refcounts.contains_key(*t))
            .cloned()
            .collect()
    }

    /// Arguments `token` was subscribed with.
    pub fn subscribed_args(&self, token: &QueryToken) -> Option<Value> {
        self.state.borrow().args.get(token).cloned()
    }

    /// Places a result in the cache without notifying anyone.
    pub fn set_result(&self, token: &QueryToken, result: Result<Value, FunctionError>) {
        let mut state = self.state.borrow_mut();
        state.corrupt.remove(token);
        state.results.insert(token.clone(), result);
    }

    pub fn set_logs(&self, token: &QueryToken, logs: Vec<String>) {
        self.state.borrow_mut().logs.insert(token.clone(), logs);
    }

    /// Makes every read of `token` fail as corrupt.
    pub fn mark_corrupt(&self, token: &QueryToken) {
        self.state.borrow_mut().corrupt.insert(token.clone());
    }

    /// Stores the given results, then reports their tokens as one transition.
    pub fn push_transition(&self, updates: Vec<(QueryToken, Result<Value, FunctionError>)>) {
        let tokens: Vec<QueryToken> = {
            let mut state = self.state.borrow_mut();
            updates
                .into_iter()
                .map(|(token, result)| {
                    state.corrupt.remove(&token);
                    state.results.insert(token.clone(), result);
                    token
                })
                .collect()
        };
        self.notify(&tokens);
    }

    /// Reports `tokens` as changed. Does nothing once closed.
    pub fn notify(&self, tokens: &[QueryToken]) {
        if self.state.borrow().closed {
            return;
        }
        let handler = self.handler.borrow().clone();
        if let Some(handler) = handler {
            handler(tokens);
        }
    }

    pub fn has_transition_handler(&self) -> bool {
        self.handler.borrow().is_some()
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.borrow().requests.clone()
    }

    /// Number of requests waiting for `resolve_next`.
    pub fn pending_requests(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Resolves the oldest pending request. Returns false if none is pending.
    pub fn resolve_next(&self, result: Result<Value, RequestError>) -> bool {
        let pending = {
            let mut state = self.state.borrow_mut();
            let pending = state.pending.pop_front();
            state.update_inflight();
            pending
        };
        match pending {
            Some(pending) => {
                let _ = pending.reply.send(result);
                true
            }
            None => false,
        }
    }

    /// Answers every later request immediately with `responder`.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&RecordedRequest) -> Result<Value, RequestError> + 'static,
    {
        self.state.borrow_mut().responder = Some(Rc::new(responder));
    }

    /// Replaces the connection state and notifies observers.
    pub fn set_connection_state(&self, connection: ConnectionState) {
        let observers: Vec<Rc<dyn Fn(&ConnectionState)>> = {
            let mut state = self.state.borrow_mut();
            state.connection = connection.clone();
            state.observers.values().cloned().collect()
        };
        for observer in observers {
            observer(&connection);
        }
    }

    pub fn connection_observer_count(&self) -> usize {
        self.state.borrow().observers.len()
    }

    /// Last admin credentials set.
    pub fn admin_auth(&self) -> Option<(String, Option<Value>)> {
        self.state.borrow().admin_auth.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    fn request(&self, kind: RequestKind, path: &FunctionPath, args: Value) -> ResponseFuture {
        let request = RecordedRequest {
            kind,
            path: path.to_string(),
            args,
        };

        let mut state = self.state.borrow_mut();
        state.requests.push(request.clone());
        if state.closed {
            return Box::pin(future::ready(Err(RequestError::Transport(
                "connection closed".into(),
            ))));
        }
        if let Some(responder) = state.responder.clone() {
            drop(state);
            return Box::pin(future::ready(responder(&request)));
        }

        let (reply, rx) = oneshot::channel();
        state.pending.push_back(PendingRequest { kind, reply });
        state.update_inflight();
        Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(RequestError::Transport("request dropped".into())))
        })
    }
}

impl SubscriptionManager for FakeSubscriptionManager {
    fn subscribe(&self, path: &FunctionPath, args: &Value) -> tidal_core::Result<QueryToken> {
        let token = QueryToken::from_parts(path, args.clone())?;
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.subscribe_calls += 1;
        let count = state.refcounts.entry(token.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            state.args.insert(token.clone(), args.clone());
            if !state.order.contains(&token) {
                state.order.push(token.clone());
            }
        }
        Ok(token)
    }

    fn unsubscribe(&self, token: &QueryToken) {
        let mut state = self.state.borrow_mut();
        state.unsubscribe_calls += 1;
        let remaining = match state.refcounts.get_mut(token) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => {
                warn!(token = %token, "Unsubscribe without a matching subscribe");
                return;
            }
        };
        if remaining == 0 {
            state.refcounts.remove(token);
            state.args.remove(token);
            state.results.remove(token);
            state.logs.remove(token);
        }
    }

    fn has_local_query_result(&self, token: &QueryToken) -> bool {
        let state = self.state.borrow();
        state.results.contains_key(token) || state.corrupt.contains(token)
    }

    fn local_query_result(&self, token: &QueryToken) -> Result<Option<Value>, LookupError> {
        let state = self.state.borrow();
        if state.corrupt.contains(token) {
            return Err(LookupError::Corrupt(format!("undecodable value for {}", token)));
        }
        match state.results.get(token) {
            Some(Ok(value)) => Ok(Some(value.clone())),
            Some(Err(e)) => Err(LookupError::Function(e.clone())),
            None => Ok(None),
        }
    }

    fn local_query_logs(&self, token: &QueryToken) -> Option<Vec<String>> {
        self.state.borrow().logs.get(token).cloned()
    }

    fn mutation(&self, path: &FunctionPath, args: Value) -> ResponseFuture {
        self.request(RequestKind::Mutation, path, args)
    }

    fn action(&self, path: &FunctionPath, args: Value) -> ResponseFuture {
        self.request(RequestKind::Action, path, args)
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.borrow().connection.clone()
    }

    fn subscribe_to_connection_state(
        &self,
        callback: ConnectionStateCallback,
    ) -> ConnectionObserverId {
        let mut state = self.state.borrow_mut();
        let id = state.next_observer;
        state.next_observer += 1;
        state.observers.insert(id, Rc::from(callback));
        id
    }

    fn unsubscribe_from_connection_state(&self, id: ConnectionObserverId) {
        self.state.borrow_mut().observers.remove(&id);
    }

    fn set_admin_auth(&self, deploy_key: String, acting_as: Option<Value>) {
        self.state.borrow_mut().admin_auth = Some((deploy_key, acting_as));
    }

    fn set_transition_handler(&self, handler: TransitionHandler) {
        *self.handler.borrow_mut() = Some(handler);
    }

    fn close(&self) -> LocalBoxFuture<'static, ()> {
        let pending: Vec<PendingRequest> = {
            let mut state = self.state.borrow_mut();
            state.closed = true;
            state.observers.clear();
            let pending = state.pending.drain(..).collect();
            state.update_inflight();
            pending
        };
        for request in pending {
            let _ = request
                .reply
                .send(Err(RequestError::Transport("connection closed".into())));
        }
        Box::pin(future::ready(()))
    }
}
