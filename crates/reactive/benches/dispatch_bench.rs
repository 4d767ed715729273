//! Benchmarks for tidal-reactive dispatch.
//!
//! Target: fan-out to 1000 listeners of one token < 100μs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::executor::LocalPool;
use serde_json::json;
use std::cell::Cell;
use std::rc::Rc;
use tidal_core::{FunctionPath, PaginationOptions, QueryToken};
use tidal_reactive::testing::FakeSubscriptionManager;
use tidal_reactive::{
    DebugInfo, EngineOptions, Listener, LocalPoolScheduler, ReactiveEngine, SubscriptionManager,
    Transition,
};

fn setup() -> (LocalPool, Rc<FakeSubscriptionManager>, ReactiveEngine) {
    let pool = LocalPool::new();
    let fake = Rc::new(FakeSubscriptionManager::new());
    let scheduler = Rc::new(LocalPoolScheduler::new(pool.spawner()));
    let engine = ReactiveEngine::new(fake.clone(), scheduler, EngineOptions::default());
    (pool, fake, engine)
}

fn register(
    engine: &ReactiveEngine,
    fake: &FakeSubscriptionManager,
    name: &str,
    hits: &Rc<Cell<u64>>,
) -> QueryToken {
    let path = FunctionPath::parse(name).unwrap();
    let token = fake.subscribe(&path, &json!({})).unwrap();
    let hits = hits.clone();
    engine.register(
        Listener::query(token.clone(), move |_| hits.set(hits.get() + 1)),
        None,
        Box::new(|| {}),
        DebugInfo::new(name, json!({})),
    );
    token
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for size in [1, 10, 100, 1000] {
        let (_pool, fake, engine) = setup();
        let hits = Rc::new(Cell::new(0));
        let mut token = None;
        for _ in 0..size {
            token = Some(register(&engine, &fake, "messages:list", &hits));
        }
        let Some(token) = token else { continue };
        fake.set_result(&token, Ok(json!({"count": 1})));
        let transition = Transition::from_queries([token]);

        group.bench_with_input(BenchmarkId::new("one_token", size), &transition, |b, transition| {
            b.iter(|| engine.dispatch(black_box(transition)).unwrap())
        });
    }

    group.finish();
}

fn bench_sparse_transition(c: &mut Criterion) {
    let mut group = c.benchmark_group("sparse");

    // Many distinct tokens, one of them changes.
    for size in [10, 100, 1000] {
        let (_pool, fake, engine) = setup();
        let hits = Rc::new(Cell::new(0));
        let tokens: Vec<QueryToken> = (0..size)
            .map(|i| register(&engine, &fake, &format!("module{}:query", i), &hits))
            .collect();
        for token in &tokens {
            fake.set_result(token, Ok(json!(1)));
        }
        let transition = Transition::from_queries([tokens[size / 2].clone()]);

        group.bench_with_input(BenchmarkId::new("one_of_n", size), &transition, |b, transition| {
            b.iter(|| engine.dispatch(black_box(transition)).unwrap())
        });
    }

    group.finish();
}

fn bench_paginated_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("paginated");

    for pages in [1, 10, 50] {
        let (_pool, fake, engine) = setup();
        let composer = engine.paginated();
        let path = FunctionPath::parse("messages:list").unwrap();
        let token = composer
            .subscribe(&path, json!({}), PaginationOptions::new(20, 1).unwrap())
            .unwrap();
        for i in 0..pages {
            let page = composer.page_tokens(&token).last().cloned().unwrap();
            let items: Vec<u32> = (0..20).collect();
            let body = json!({
                "page": items,
                "isDone": i + 1 == pages,
                "continueCursor": format!("c{}", i),
            });
            fake.set_result(&page, Ok(body));
            if i + 1 < pages {
                composer.load_more(&token, 20).unwrap();
            }
        }

        group.bench_with_input(BenchmarkId::new("aggregate", pages), &token, |b, token| {
            b.iter(|| composer.local_query_result(black_box(token)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fan_out, bench_sparse_transition, bench_paginated_aggregate);
criterion_main!(benches);
