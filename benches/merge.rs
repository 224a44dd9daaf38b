//! Performance benchmarks for closure maintenance.
//!
//! Run with: `cargo bench --bench merge`
//!
//! All benchmarks run against the in-memory store, so they measure the
//! merge/prune logic rather than database round trips.

use criterion::{
    black_box, criterion_group, criterion_main,
    BenchmarkId, Criterion, Throughput,
};
use std::collections::BTreeSet;

use closure_kernel::{
    closure_delta, ClosureEdge, EdgeCoordinator, InMemoryClosureStore, PruneStrategy,
};
use tokio::runtime::Runtime;

/// Build a linear chain `0 → 1 → … → len-1`.
async fn chain(len: u64, strategy: PruneStrategy) -> EdgeCoordinator<u64, InMemoryClosureStore<u64>> {
    let coordinator = EdgeCoordinator::new(InMemoryClosureStore::new()).with_prune_strategy(strategy);
    for node in 1..len {
        coordinator
            .add_parent_child(&(node - 1), &node)
            .await
            .expect("chain edges are acyclic");
    }
    coordinator
}

/// Benchmark the pure delta computation for a join of two chains.
fn bench_closure_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("closure_delta");

    for size in [10u64, 50, 200] {
        let ancestors: BTreeSet<u64> = (0..size).collect();
        let descendants: BTreeSet<u64> = (size + 2..2 * size + 2).collect();
        let existing: BTreeSet<ClosureEdge<u64>> = BTreeSet::new();

        group.throughput(Throughput::Elements(size * size));
        group.bench_with_input(BenchmarkId::new("join", size), &size, |b, &size| {
            b.iter(|| {
                closure_delta(
                    black_box(&size),
                    black_box(&(size + 1)),
                    &ancestors,
                    &descendants,
                    &existing,
                )
            })
        });
    }

    group.finish();
}

/// Benchmark appending one edge to the end of a chain.
fn bench_add_to_chain(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("add_parent_child");

    for len in [16u64, 64, 256] {
        group.bench_with_input(BenchmarkId::new("chain_tail", len), &len, |b, &len| {
            b.iter_batched(
                || rt.block_on(chain(len, PruneStrategy::Local)),
                |coordinator| {
                    rt.block_on(coordinator.add_parent_child(&(len - 1), &len))
                        .expect("acyclic")
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark cutting a chain in the middle under each prune strategy.
fn bench_remove_from_chain(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("remove_parent_child");

    for strategy in [PruneStrategy::Local, PruneStrategy::Rederive] {
        for len in [16u64, 64] {
            group.bench_with_input(
                BenchmarkId::new(strategy.to_string(), len),
                &len,
                |b, &len| {
                    let mid = len / 2;
                    b.iter_batched(
                        || rt.block_on(chain(len, strategy)),
                        |coordinator| {
                            rt.block_on(coordinator.remove_parent_child(&(mid - 1), &mid))
                                .expect("present")
                        },
                        criterion::BatchSize::LargeInput,
                    );
                },
            );
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_closure_delta,
    bench_add_to_chain,
    bench_remove_from_chain,
);

criterion_main!(benches);
