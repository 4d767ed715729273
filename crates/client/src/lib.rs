//! Tidal Client - Reactive client for server-computed queries.
//!
//! `ReactiveClient` keeps live views of query results, composes paginated
//! queries, and issues mutations and actions over a transport implementing
//! `tidal_reactive::SubscriptionManager`.
//!
//! # Example
//!
//! ```rust
//! use futures::executor::LocalPool;
//! use serde_json::json;
//! use std::rc::Rc;
//! use tidal_client::{ClientBuilder, ClientConfig};
//! use tidal_reactive::testing::FakeSubscriptionManager;
//! use tidal_reactive::LocalPoolScheduler;
//!
//! let mut pool = LocalPool::new();
//! let fake = Rc::new(FakeSubscriptionManager::new());
//! let manager = fake.clone();
//! let client = ClientBuilder::new(ClientConfig::default()).connect(
//!     Rc::new(LocalPoolScheduler::new(pool.spawner())),
//!     move |_| manager,
//! );
//!
//! let subscription = client
//!     .on_update("messages:list", json!({"channel": "general"}), |messages| {
//!         println!("messages: {}", messages);
//!     }, None)
//!     .unwrap();
//!
//! let token = subscription.token().unwrap().clone();
//! fake.push_transition(vec![(token, Ok(json!(["hello"])))]);
//! pool.run_until_stalled();
//!
//! assert_eq!(subscription.current_value().unwrap(), Some(json!(["hello"])));
//! subscription.unsubscribe();
//! ```

mod client;
mod config;
mod error;
mod handle;
mod queue;

pub use client::{ClientBuilder, MutationOptions, ReactiveClient};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use handle::{
    ConnectionStateSubscription, PaginatedSubscription, QueryFuture, QuerySetSubscription,
    ResponseFuture, Subscription,
};
pub use tidal_reactive::{
    ConnectionState, PaginatedResult, PaginationStatus, QuerySetEntry, QuerySetSnapshot,
    UnhandledError,
};
