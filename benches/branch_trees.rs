use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use glas::runtime::Runtime;
use glas::value::{Value, EMPTY_STEM32, UNIT};
use glas::Mutator;

fn bottom_up_tree(m: &Mutator, depth: u32) -> Value {
    if depth == 0 {
        return UNIT;
    }
    let left = bottom_up_tree(m, depth - 1);
    let right = bottom_up_tree(m, depth - 1);
    Value::from_cell(m.alloc_branch(EMPTY_STEM32, EMPTY_STEM32, left, right))
}

fn count_nodes(v: Value) -> usize {
    if !v.is_cell() {
        return 0;
    }
    unsafe {
        let cell = v.cell();
        1 + count_nodes((*cell).slot_value(1)) + count_nodes((*cell).slot_value(2))
    }
}

pub fn bench_trees(c: &mut Criterion) {
    env_logger::try_init().ok();
    let mut group = c.benchmark_group("branch trees");
    group.sample_size(20);

    for depth in [12u32, 14, 16].iter() {
        group.bench_function(BenchmarkId::new("build+collect", depth), |b| {
            b.iter_batched_ref(
                Runtime::new,
                |rt| {
                    let m = rt.attach_thread();
                    {
                        let _busy = m.busy();
                        let tree = bottom_up_tree(&m, *depth);
                        assert_eq!(count_nodes(tree), (1 << *depth) - 1);
                    }
                    rt.gc_now(true);
                    drop(m);
                    rt.shutdown();
                },
                criterion::BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_trees);
criterion_main!(benches);
