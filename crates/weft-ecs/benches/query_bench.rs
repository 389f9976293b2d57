//! Benchmarks for the spawn/mutate/query hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use weft_ecs::prelude::*;

fn position() -> Trait {
    Trait::new("position", Record::new().with("x", 0.0).with("y", 0.0))
}

fn velocity() -> Trait {
    Trait::new("velocity", Record::new().with("dx", 0.0).with("dy", 0.0))
}

fn bench_spawn(c: &mut Criterion) {
    let pos = position();
    let vel = velocity();
    c.bench_function("spawn_1k_entities_two_traits", |b| {
        b.iter(|| {
            let mut world = World::new();
            for i in 0..1_000 {
                let mut bundle = TraitBundle::new();
                bundle.add_with(&pos, Record::new().with("x", i as f64));
                bundle.add(&vel);
                black_box(world.spawn(bundle).unwrap());
            }
        })
    });
}

fn bench_cached_query(c: &mut Criterion) {
    let pos = position();
    let vel = velocity();
    let mut world = World::new();
    for i in 0..10_000 {
        let mut bundle = TraitBundle::new();
        bundle.add(&pos);
        if i % 2 == 0 {
            bundle.add(&vel);
        }
        world.spawn(bundle).unwrap();
    }
    // Warm the cache so the measurement covers the maintained-set read.
    world.query(&[QueryParam::all(&pos), QueryParam::all(&vel)]);

    c.bench_function("cached_query_10k_entities", |b| {
        b.iter(|| {
            black_box(world.query(&[QueryParam::all(&pos), QueryParam::all(&vel)]));
        })
    });
}

fn bench_add_remove_churn(c: &mut Criterion) {
    let pos = position();
    let tag = Trait::tag("marker");
    let mut world = World::new();
    let entities: Vec<Entity> = (0..1_000)
        .map(|_| world.spawn_with(&pos).unwrap())
        .collect();
    world.query(&[QueryParam::all(&tag)]);

    c.bench_function("tag_churn_1k_entities", |b| {
        b.iter(|| {
            for &e in &entities {
                world.add(e, &tag).unwrap();
            }
            for &e in &entities {
                world.remove(e, &tag).unwrap();
            }
        })
    });
}

fn bench_tracked_query(c: &mut Criterion) {
    let pos = position();
    let changed = Changed::new();
    let mut world = World::new();
    let entities: Vec<Entity> = (0..1_000)
        .map(|_| world.spawn_with(&pos).unwrap())
        .collect();
    world.query(&[changed.of(&pos)]);

    c.bench_function("changed_tracker_consume_1k", |b| {
        let mut x = 0.0;
        b.iter(|| {
            x += 1.0;
            for &e in &entities {
                world.set(e, &pos, &Record::new().with("x", x)).unwrap();
            }
            black_box(world.query(&[changed.of(&pos)]));
        })
    });
}

criterion_group!(
    benches,
    bench_spawn,
    bench_cached_query,
    bench_add_remove_churn,
    bench_tracked_query
);
criterion_main!(benches);
