//! Tidal Reactive - Query subscription synchronization engine.
//!
//! This crate sits between a transport (`SubscriptionManager`) that keeps the
//! latest result of every subscribed query, and the many independent
//! listeners interested in those results.
//!
//! # Core Concepts
//!
//! - `SubscriptionManager`: The transport boundary. Refcounts subscriptions by
//!   token and reports changed tokens through a `TransitionHandler`
//! - `ListenerRegistry`: Registration-ordered listener records
//! - `ReactiveEngine`: Runs dispatch passes over the registry
//! - `BootstrapTimer`: Coalesces immediate delivery of already-cached results
//! - `PaginatedQueryComposer`: Builds paginated subscriptions out of page
//!   subscriptions
//! - `Scheduler`: Defers work to a later turn of the event loop
//! - `QuerySetSnapshot`: All live plain query results after one transition
//!
//! The in-memory `testing::FakeSubscriptionManager` is behind the `testing`
//! feature.
//!
//! # Example
//!
//! ```rust
//! use futures::executor::LocalPool;
//! use serde_json::json;
//! use std::rc::Rc;
//! use tidal_core::FunctionPath;
//! use tidal_reactive::testing::FakeSubscriptionManager;
//! use tidal_reactive::{
//!     DebugInfo, EngineOptions, Listener, LocalPoolScheduler, ReactiveEngine, SubscriptionManager,
//! };
//!
//! let mut pool = LocalPool::new();
//! let manager = Rc::new(FakeSubscriptionManager::new());
//! let scheduler = Rc::new(LocalPoolScheduler::new(pool.spawner()));
//! let engine = ReactiveEngine::new(manager.clone(), scheduler, EngineOptions::default());
//! manager.set_transition_handler(engine.transition_handler());
//!
//! let path = FunctionPath::parse("messages:list").unwrap();
//! let token = manager.subscribe(&path, &json!({})).unwrap();
//! engine.register(
//!     Listener::query(token.clone(), |value| println!("messages: {}", value)),
//!     None,
//!     Box::new(|| {}),
//!     DebugInfo::new("messages:list", json!({})),
//! );
//!
//! manager.push_transition(vec![(token, Ok(json!(["hello"])))]);
//! pool.run_until_stalled();
//! ```

pub mod bootstrap;
pub mod engine;
pub mod listener;
pub mod manager;
pub mod paginated;
pub mod query_set;
pub mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transition;

pub use bootstrap::{BootstrapState, BootstrapTimer};
pub use engine::{
    DispatchError, EngineOptions, ListenerHandle, QuerySetHandle, ReactiveEngine,
    UnhandledError, UnhandledErrorHook, WeakEngine,
};
pub use listener::{
    DebugInfo, ErrorCallback, Listener, ListenerId, ListenerRecord, ListenerRegistry,
    PaginatedCallback, QueryCallback, ReleaseFn,
};
pub use manager::{
    ConnectionObserverId, ConnectionState, ConnectionStateCallback, ResponseFuture,
    SubscriptionManager, TransitionHandler,
};
pub use paginated::{PaginatedQueryComposer, PaginatedResult, PaginationStatus};
pub use query_set::{QuerySetCallback, QuerySetEntry, QuerySetSnapshot, WatcherId};
#[cfg(target_arch = "wasm32")]
pub use scheduler::MicrotaskScheduler;
pub use scheduler::{LocalPoolScheduler, Scheduler, Task};
pub use transition::Transition;
