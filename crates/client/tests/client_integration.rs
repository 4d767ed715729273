//! Integration tests for `ReactiveClient` over the in-memory manager.

use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use tidal_client::{
    ClientBuilder, ClientConfig, ClientError, ConnectionState, MutationOptions, PaginationStatus,
    QuerySetSnapshot, ReactiveClient, Subscription, UnhandledError,
};
use tidal_core::{FunctionError, QueryToken, RequestError, Value};
use tidal_reactive::testing::{FakeSubscriptionManager, RequestKind};
use tidal_reactive::LocalPoolScheduler;
use tracing_subscriber::EnvFilter;

type Log<T> = Rc<RefCell<Vec<T>>>;

struct Harness {
    pool: LocalPool,
    fake: Rc<FakeSubscriptionManager>,
    client: ReactiveClient,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness_with(builder: ClientBuilder) -> Harness {
    init_tracing();
    let pool = LocalPool::new();
    let fake = Rc::new(FakeSubscriptionManager::new());
    let manager = fake.clone();
    let scheduler = Rc::new(LocalPoolScheduler::new(pool.spawner()));
    let client = builder.connect(scheduler, move |_| manager);
    Harness { pool, fake, client }
}

fn harness() -> Harness {
    harness_with(ClientBuilder::new(ClientConfig::default()))
}

fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

/// Subscribes `path({})` and records every delivered value.
fn record(h: &Harness, path: &str, seen: &Log<Value>) -> Subscription {
    let seen = seen.clone();
    h.client
        .on_update(path, json!({}), move |v| seen.borrow_mut().push(v.clone()), None)
        .unwrap()
}

fn page(items: &[i64], is_done: bool, cursor: &str) -> Value {
    json!({"page": items, "isDone": is_done, "continueCursor": cursor})
}

fn page_token(num_items: u32, cursor: Option<&str>, id: u64) -> QueryToken {
    FakeSubscriptionManager::token(
        "messages:list",
        json!({"paginationOpts": {"numItems": num_items, "cursor": cursor, "id": id}}),
    )
}

#[test]
fn test_identical_queries_share_one_subscription() {
    let h = harness();
    let a = h
        .client
        .on_update("messages:list", json!({"channel": 1, "limit": 5}), |_| {}, None)
        .unwrap();
    let b = h
        .client
        .on_update("messages:list", json!({"limit": 5, "channel": 1}), |_| {}, None)
        .unwrap();

    let token = a.token().unwrap().clone();
    assert_eq!(b.token(), Some(&token));
    assert_eq!(h.fake.active_tokens(), vec![token.clone()]);
    assert_eq!(h.fake.refcount(&token), 2);

    a.unsubscribe();
    a.unsubscribe();
    assert_eq!(h.fake.refcount(&token), 1);
    b.unsubscribe();
    assert!(!h.fake.is_subscribed(&token));
}

#[test]
fn test_listeners_fire_in_registration_order() {
    let mut h = harness();
    let order: Log<u32> = log();
    let mut subscriptions = Vec::new();
    for n in 1..=3 {
        let order = order.clone();
        subscriptions.push(
            h.client
                .on_update("messages:list", json!({}), move |_| order.borrow_mut().push(n), None)
                .unwrap(),
        );
    }
    let token = subscriptions[0].token().unwrap().clone();

    h.fake.push_transition(vec![(token, Ok(json!(["hi"])))]);
    h.pool.run_until_stalled();

    assert_eq!(*order.borrow(), vec![1, 2, 3]);
}

#[test]
fn test_panicking_listener_does_not_starve_others() {
    let mut h = harness();
    let seen: Log<Value> = log();
    let bad = h
        .client
        .on_update("messages:list", json!({}), |_| panic!("listener failure"), None)
        .unwrap();
    let _good = record(&h, "messages:list", &seen);
    let token = bad.token().unwrap().clone();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        h.fake.push_transition(vec![(token.clone(), Ok(json!(1)))]);
    }));
    assert!(outcome.is_err());
    assert_eq!(*seen.borrow(), vec![json!(1)]);

    bad.unsubscribe();
    h.fake.push_transition(vec![(token, Ok(json!(2)))]);
    h.pool.run_until_stalled();
    assert_eq!(*seen.borrow(), vec![json!(1), json!(2)]);
}

#[test]
fn test_query_error_stays_with_its_listener() {
    let mut h = harness();
    let errors: Log<FunctionError> = log();
    let seen: Log<Value> = log();

    let errors_clone = errors.clone();
    let failing = h
        .client
        .on_update(
            "messages:broken",
            json!({}),
            |_| {},
            Some(Box::new(move |e: &FunctionError| {
                errors_clone.borrow_mut().push(e.clone())
            })),
        )
        .unwrap();
    let healthy = record(&h, "messages:list", &seen);

    h.fake.push_transition(vec![
        (failing.token().unwrap().clone(), Err(FunctionError::new("denied"))),
        (healthy.token().unwrap().clone(), Ok(json!([]))),
    ]);
    h.pool.run_until_stalled();

    assert_eq!(*errors.borrow(), vec![FunctionError::new("denied")]);
    assert_eq!(*seen.borrow(), vec![json!([])]);
    assert_eq!(
        failing.current_value(),
        Err(ClientError::Function(FunctionError::new("denied")))
    );
}

#[test]
fn test_unhandled_error_reaches_hook_on_later_turn() {
    let unhandled: Log<UnhandledError> = log();
    let unhandled_clone = unhandled.clone();
    let mut h = harness_with(
        ClientBuilder::new(ClientConfig::default())
            .on_unhandled_error(move |e| unhandled_clone.borrow_mut().push(e.clone())),
    );
    let subscription = h
        .client
        .on_update("messages:list", json!({}), |_| {}, None)
        .unwrap();

    h.fake.push_transition(vec![(
        subscription.token().unwrap().clone(),
        Err(FunctionError::new("boom")),
    )]);
    assert!(unhandled.borrow().is_empty());

    h.pool.run_until_stalled();
    let unhandled = unhandled.borrow();
    assert_eq!(unhandled.len(), 1);
    let UnhandledError::Function { path, error, .. } = &unhandled[0];
    assert_eq!(path, "messages:list");
    assert_eq!(error.message, "boom");
}

#[test]
fn test_cached_result_bootstraps_each_new_listener_once() {
    let mut h = harness();
    let first: Log<Value> = log();
    let sub = record(&h, "messages:list", &first);
    h.fake
        .push_transition(vec![(sub.token().unwrap().clone(), Ok(json!("cached")))]);
    h.pool.run_until_stalled();

    let late: Vec<Log<Value>> = (0..3).map(|_| log()).collect();
    let _subs: Vec<Subscription> =
        late.iter().map(|seen| record(&h, "messages:list", seen)).collect();
    assert!(late.iter().all(|seen| seen.borrow().is_empty()));

    h.pool.run_until_stalled();
    h.pool.run_until_stalled();

    for seen in &late {
        assert_eq!(*seen.borrow(), vec![json!("cached")]);
    }
    assert_eq!(*first.borrow(), vec![json!("cached")]);
}

#[test]
fn test_listener_removed_mid_pass_is_skipped() {
    let mut h = harness();
    let seen: Log<Value> = log();
    let victim: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));

    let victim_clone = victim.clone();
    let killer = h
        .client
        .on_update(
            "messages:list",
            json!({}),
            move |_| {
                if let Some(victim) = victim_clone.borrow().as_ref() {
                    victim.unsubscribe();
                }
            },
            None,
        )
        .unwrap();
    *victim.borrow_mut() = Some(record(&h, "messages:list", &seen));

    let token = killer.token().unwrap().clone();
    h.fake.push_transition(vec![(token.clone(), Ok(json!(1)))]);
    h.pool.run_until_stalled();

    assert!(seen.borrow().is_empty());
    assert!(!victim.borrow().as_ref().unwrap().is_active());
    assert_eq!(h.fake.refcount(&token), 1);
}

#[test]
fn test_first_update_then_late_registration() {
    let mut h = harness();
    let calls_a: Log<Value> = log();
    let sub_a = record(&h, "lists:listA", &calls_a);
    assert!(calls_a.borrow().is_empty());

    h.fake
        .push_transition(vec![(sub_a.token().unwrap().clone(), Ok(json!(["x"])))]);
    assert_eq!(*calls_a.borrow(), vec![json!(["x"])]);

    let calls_b: Log<Value> = log();
    let _sub_b = record(&h, "lists:listA", &calls_b);
    assert!(calls_b.borrow().is_empty());

    h.pool.run_until_stalled();
    assert_eq!(*calls_b.borrow(), vec![json!(["x"])]);
    assert_eq!(calls_a.borrow().len(), 1);
}

#[test]
fn test_load_more_extends_once_and_shows_loading() {
    let mut h = harness();
    let updates: Log<(Vec<Value>, PaginationStatus)> = log();
    let updates_clone = updates.clone();
    let subscription = h
        .client
        .on_paginated_update(
            "messages:list",
            json!({}),
            2,
            move |r| {
                updates_clone
                    .borrow_mut()
                    .push((r.results.clone(), r.status))
            },
            None,
        )
        .unwrap();

    let first = page_token(2, None, 1);
    assert!(h.fake.is_subscribed(&first));
    assert_eq!(subscription.load_more(2), Ok(false));

    h.fake
        .push_transition(vec![(first, Ok(page(&[1, 2], false, "c1")))]);
    assert_eq!(
        updates.borrow().last().cloned(),
        Some((vec![json!(1), json!(2)], PaginationStatus::CanLoadMore))
    );

    assert_eq!(subscription.load_more(2), Ok(true));
    assert_eq!(subscription.load_more(2), Ok(false));
    assert_eq!(h.fake.active_tokens().len(), 2);

    h.pool.run_until_stalled();
    assert_eq!(
        updates.borrow().last().cloned(),
        Some((vec![json!(1), json!(2)], PaginationStatus::LoadingMore))
    );

    let second = page_token(2, Some("c1"), 1);
    h.fake.push_transition(vec![(second, Ok(page(&[3], true, "c2")))]);
    let result = subscription.current_value().unwrap().unwrap();
    assert_eq!(result.results, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(result.status, PaginationStatus::Exhausted);
    assert_eq!(subscription.load_more(2), Ok(false));
    assert_eq!(updates.borrow().len(), 3);

    subscription.unsubscribe();
    assert!(h.fake.active_tokens().is_empty());
    assert_eq!(subscription.load_more(2), Ok(false));
}

#[test]
fn test_page_pushed_from_a_callback_reaches_paginated_listener() {
    let h = harness();
    let pages: Log<Vec<Value>> = log();
    let pages_clone = pages.clone();
    h.client
        .on_paginated_update(
            "messages:list",
            json!({}),
            2,
            move |r| pages_clone.borrow_mut().push(r.results.clone()),
            None,
        )
        .unwrap();

    let fake = h.fake.clone();
    let trigger = h
        .client
        .on_update(
            "messages:count",
            json!({}),
            move |_| {
                let first = page_token(2, None, 1);
                fake.push_transition(vec![(first, Ok(page(&[1, 2], false, "c1")))]);
            },
            None,
        )
        .unwrap();

    let token = trigger.token().unwrap().clone();
    h.fake.push_transition(vec![(token, Ok(json!(2)))]);
    assert_eq!(*pages.borrow(), vec![vec![json!(1), json!(2)]]);

    h.fake
        .push_transition(vec![(page_token(2, None, 1), Ok(page(&[1, 2], false, "c1")))]);
    assert_eq!(pages.borrow().len(), 1);
}

#[test]
fn test_watch_all_delivers_one_consistent_snapshot_per_transition() {
    let h = harness();
    let a = h.client.on_update("messages:list", json!({}), |_| {}, None).unwrap();
    let a_again = h.client.on_update("messages:list", json!({}), |_| {}, None).unwrap();
    let b = h.client.on_update("users:get", json!({"id": 7}), |_| {}, None).unwrap();
    let c = h.client.on_update("users:count", json!({}), |_| {}, None).unwrap();
    let (a, b, c) = (
        a.token().unwrap().clone(),
        b.token().unwrap().clone(),
        c.token().unwrap().clone(),
    );
    assert_eq!(a_again.token(), Some(&a));

    let snapshots: Log<QuerySetSnapshot> = log();
    let snapshots_clone = snapshots.clone();
    let watcher = h
        .client
        .watch_all(move |s| snapshots_clone.borrow_mut().push(s.clone()))
        .unwrap();
    assert!(watcher.is_active());

    h.fake.push_transition(vec![
        (a.clone(), Ok(json!(["hi"]))),
        (b.clone(), Err(FunctionError::new("no such user"))),
    ]);

    {
        let snapshots = snapshots.borrow();
        assert_eq!(snapshots.len(), 1);
        let snapshot = &snapshots[0];
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.value(&a), Some(&json!(["hi"])));
        let user = snapshot.get(&b).unwrap();
        assert_eq!(user.path, "users:get");
        assert_eq!(user.args, json!({"id": 7}));
        assert_eq!(user.result, Err(FunctionError::new("no such user")));
        assert!(!snapshot.contains(&c));
    }

    h.fake.push_transition(vec![(c.clone(), Ok(json!(3)))]);
    assert_eq!(snapshots.borrow().len(), 2);
    assert_eq!(snapshots.borrow()[1].len(), 3);
    assert_eq!(snapshots.borrow()[1].value(&c), Some(&json!(3)));

    watcher.unsubscribe();
    assert!(!watcher.is_active());
    h.fake.push_transition(vec![(c, Ok(json!(4)))]);
    assert_eq!(snapshots.borrow().len(), 2);
}

#[test]
fn test_closed_client_is_silent() {
    let mut h = harness();
    let seen: Log<Value> = log();
    let subscription = record(&h, "messages:list", &seen);
    let token = subscription.token().unwrap().clone();

    h.pool.run_until(h.client.close());
    assert!(h.client.is_closed());
    assert!(h.fake.is_closed());
    assert!(!subscription.is_active());

    h.fake.push_transition(vec![(token, Ok(json!(1)))]);
    h.pool.run_until_stalled();
    assert!(seen.borrow().is_empty());

    let late = record(&h, "messages:list", &seen);
    assert!(!late.is_active());
    late.unsubscribe();
    subscription.unsubscribe();

    assert_eq!(h.client.query("messages:list", json!({})).err(), Some(ClientError::Closed));
    assert_eq!(h.client.mutation("messages:send", json!({})).err(), Some(ClientError::Closed));
    assert_eq!(h.client.set_admin_auth("key", None), Err(ClientError::Closed));
    h.pool.run_until(h.client.close());
}

#[test]
fn test_disabled_client_never_connects() {
    let built = Rc::new(Cell::new(false));
    let built_clone = built.clone();
    let pool = LocalPool::new();
    let client = ClientBuilder::new(ClientConfig::default().disabled(true)).connect(
        Rc::new(LocalPoolScheduler::new(pool.spawner())),
        move |_| {
            built_clone.set(true);
            Rc::new(FakeSubscriptionManager::new())
        },
    );

    assert!(!built.get());
    assert!(client.is_disabled());

    let subscription = client.on_update("messages:list", json!({}), |_| {}, None).unwrap();
    assert!(!subscription.is_active());
    assert_eq!(subscription.current_value(), Ok(None));
    let paginated = client
        .on_paginated_update("messages:list", json!({}), 5, |_| {}, None)
        .unwrap();
    assert_eq!(paginated.load_more(5), Ok(false));

    assert_eq!(client.query("a:b", json!({})).err(), Some(ClientError::Disabled));
    assert_eq!(client.mutation("a:b", json!({})).err(), Some(ClientError::Disabled));
    assert_eq!(client.action("a:b", json!({})).err(), Some(ClientError::Disabled));
    assert_eq!(client.connection_state(), Err(ClientError::Disabled));
    assert!(matches!(
        client.subscribe_to_connection_state(|_| {}),
        Err(ClientError::Disabled)
    ));
}

#[test]
fn test_query_resolves_from_first_transition() {
    let mut h = harness();
    let future = h.client.query("messages:count", json!({})).unwrap();
    let token = FakeSubscriptionManager::token("messages:count", json!({}));
    assert!(h.fake.is_subscribed(&token));

    h.fake.push_transition(vec![(token.clone(), Ok(json!(7)))]);
    assert_eq!(h.pool.run_until(future), Ok(json!(7)));
    assert!(!h.fake.is_subscribed(&token));
}

#[test]
fn test_query_ready_when_cached() {
    let mut h = harness();
    let seen: Log<Value> = log();
    let live = record(&h, "messages:count", &seen);
    let token = live.token().unwrap().clone();
    h.fake.push_transition(vec![(token.clone(), Ok(json!(3)))]);

    let future = h.client.query("messages:count", json!({})).unwrap();
    assert_eq!(h.pool.run_until(future), Ok(json!(3)));
    assert_eq!(h.fake.refcount(&token), 1);
}

#[test]
fn test_query_rejects_with_function_error() {
    let mut h = harness();
    let future = h.client.query("messages:count", json!({})).unwrap();
    let token = FakeSubscriptionManager::token("messages:count", json!({}));

    h.fake
        .push_transition(vec![(token, Err(FunctionError::new("forbidden")))]);
    assert_eq!(
        h.pool.run_until(future),
        Err(ClientError::Function(FunctionError::new("forbidden")))
    );
}

#[test]
fn test_pending_query_fails_on_close() {
    let mut h = harness();
    let future = h.client.query("messages:count", json!({})).unwrap();
    h.pool.run_until(h.client.close());
    assert_eq!(h.pool.run_until(future), Err(ClientError::Closed));
}

#[test]
fn test_queued_mutations_keep_call_order() {
    let mut h = harness();
    let results: Log<(&'static str, Result<Value, ClientError>)> = log();
    let calls = [
        ("first", MutationOptions::default()),
        ("second", MutationOptions::default()),
        ("urgent", MutationOptions { skip_queue: true }),
    ];
    for (name, options) in calls {
        let response = h
            .client
            .mutation_with_options("messages:send", json!({"name": name}), options)
            .unwrap();
        let results = results.clone();
        h.pool
            .spawner()
            .spawn_local(async move {
                let result = response.await;
                results.borrow_mut().push((name, result));
            })
            .unwrap();
    }
    h.pool.run_until_stalled();

    let sent = |h: &Harness| -> Vec<Value> {
        h.fake
            .requests()
            .into_iter()
            .map(|r| r.args["name"].clone())
            .collect()
    };
    assert_eq!(sent(&h), vec![json!("urgent"), json!("first")]);

    assert!(h.fake.resolve_next(Ok(json!("u"))));
    h.pool.run_until_stalled();
    assert_eq!(sent(&h).len(), 2);
    assert!(h.fake.resolve_next(Ok(json!(1))));
    h.pool.run_until_stalled();
    assert_eq!(sent(&h), vec![json!("urgent"), json!("first"), json!("second")]);

    assert!(h
        .fake
        .resolve_next(Err(RequestError::Function(FunctionError::new("conflict")))));
    h.pool.run_until_stalled();

    assert_eq!(
        *results.borrow(),
        vec![
            ("urgent", Ok(json!("u"))),
            ("first", Ok(json!(1))),
            (
                "second",
                Err(ClientError::Function(FunctionError::new("conflict")))
            ),
        ]
    );
}

#[test]
fn test_unqueued_mutations_are_sent_immediately() {
    let h = harness_with(ClientBuilder::new(
        ClientConfig::default().queue_mutations(false),
    ));
    let _a = h.client.mutation("messages:send", json!({"n": 1})).unwrap();
    let _b = h.client.mutation("messages:send", json!({"n": 2})).unwrap();
    assert_eq!(h.fake.pending_requests(), 2);
    assert_eq!(h.client.connection_state().unwrap().inflight_mutations, 2);
}

#[test]
fn test_action_is_forwarded() {
    let mut h = harness();
    h.fake.respond_with(|request| Ok(json!({"echo": request.args.clone()})));

    let response = h.client.action("files:upload", json!({"size": 3})).unwrap();
    assert_eq!(h.pool.run_until(response), Ok(json!({"echo": {"size": 3}})));
    assert_eq!(h.fake.requests()[0].kind, RequestKind::Action);
}

#[test]
fn test_transport_failure_surfaces_as_client_error() {
    let mut h = harness();
    h.fake
        .respond_with(|_| Err(RequestError::Transport("socket reset".into())));
    let response = h.client.action("files:upload", json!({})).unwrap();
    assert_eq!(
        h.pool.run_until(response),
        Err(ClientError::Transport("socket reset".into()))
    );
}

#[test]
fn test_connection_state_observation() {
    let h = harness();
    let states: Log<ConnectionState> = log();
    let states_clone = states.clone();
    let observer = h
        .client
        .subscribe_to_connection_state(move |s| states_clone.borrow_mut().push(s.clone()))
        .unwrap();

    let connected = ConnectionState {
        is_websocket_connected: true,
        has_ever_connected: true,
        connection_count: 1,
        ..ConnectionState::default()
    };
    h.fake.set_connection_state(connected.clone());
    assert_eq!(h.client.connection_state(), Ok(connected.clone()));
    assert_eq!(*states.borrow(), vec![connected]);

    observer.unsubscribe();
    assert_eq!(h.fake.connection_observer_count(), 0);
    h.fake.set_connection_state(ConnectionState::default());
    assert_eq!(states.borrow().len(), 1);
}

#[test]
fn test_admin_auth_is_forwarded() {
    let h = harness();
    h.client
        .set_admin_auth("deploy-key", Some(json!({"subject": "user-1"})))
        .unwrap();
    assert_eq!(
        h.fake.admin_auth(),
        Some(("deploy-key".to_string(), Some(json!({"subject": "user-1"}))))
    );
}

#[test]
fn test_query_logs_follow_cached_result() {
    let mut h = harness();
    let seen: Log<Value> = log();
    let subscription = record(&h, "messages:list", &seen);
    let token = subscription.token().unwrap().clone();
    assert_eq!(subscription.query_logs(), None);

    h.fake.set_logs(&token, vec!["scanned 12 documents".into()]);
    h.fake.push_transition(vec![(token, Ok(json!([])))]);
    h.pool.run_until_stalled();

    assert_eq!(
        subscription.query_logs(),
        Some(vec!["scanned 12 documents".to_string()])
    );
    subscription.unsubscribe();
    assert_eq!(subscription.query_logs(), None);
}
