use criterion::{Criterion, black_box, criterion_group, criterion_main};
use js_gc::{Runtime, Value};

fn populate_acyclic(ctx: &js_gc::Context, count: usize) -> Vec<Value> {
    let name = ctx.atom("payload").unwrap();
    (0..count)
        .map(|i| {
            let obj = ctx.new_object().unwrap();
            let s = ctx
                .new_string(if i % 2 == 0 { "even" } else { "odd" })
                .unwrap();
            ctx.set_property(obj, name, s).unwrap();
            obj
        })
        .collect()
}

fn populate_cycles(rt: &Runtime, ctx: &js_gc::Context, count: usize) {
    let next = ctx.atom("next").unwrap();
    for _ in 0..count {
        let a = ctx.new_object().unwrap();
        let b = ctx.new_object().unwrap();
        rt.retain_value(a);
        ctx.set_property(b, next, a).unwrap();
        ctx.set_property(a, next, b).unwrap();
        rt.release_value(a);
    }
}

fn benchmark_object_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Object Creation");

    for &count in &[1_000usize, 10_000] {
        group.bench_function(format!("create_{count}_objects"), |b| {
            b.iter(|| {
                let rt = Runtime::new();
                rt.set_gc_threshold(js_gc::GC_THRESHOLD_DISABLED);
                let ctx = rt.new_context().unwrap();
                let objects = populate_acyclic(&ctx, count);
                black_box(rt.live_cell_count());
                for obj in objects {
                    rt.release_value(obj);
                }
            });
        });
    }

    group.finish();
}

fn benchmark_refcount_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("Refcount Release");

    group.bench_function("release_10000_acyclic", |b| {
        b.iter_with_setup(
            || {
                let rt = Runtime::new();
                rt.set_gc_threshold(js_gc::GC_THRESHOLD_DISABLED);
                let ctx = rt.new_context().unwrap();
                let objects = populate_acyclic(&ctx, 10_000);
                (rt, objects)
            },
            |(rt, objects)| {
                for obj in objects {
                    rt.release_value(obj);
                }
                black_box(rt.live_cell_count());
            },
        );
    });

    group.finish();
}

fn benchmark_cycle_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("Cycle Collection");

    for &count in &[100usize, 1_000] {
        group.bench_function(format!("collect_{count}_cycles"), |b| {
            b.iter_with_setup(
                || {
                    let rt = Runtime::new();
                    rt.set_gc_threshold(js_gc::GC_THRESHOLD_DISABLED);
                    let ctx = rt.new_context().unwrap();
                    populate_cycles(&rt, &ctx, count);
                    rt
                },
                |rt| {
                    black_box(rt.run_gc());
                },
            );
        });
    }

    group.bench_function("gc_over_live_heap", |b| {
        let rt = Runtime::new();
        rt.set_gc_threshold(js_gc::GC_THRESHOLD_DISABLED);
        let ctx = rt.new_context().unwrap();
        let keep = populate_acyclic(&ctx, 5_000);
        let anchor = ctx.atom("keep").unwrap();
        let holder = ctx.new_array().unwrap();
        for obj in keep {
            ctx.array_push(holder, obj).unwrap();
        }
        ctx.set_property(ctx.global(), anchor, holder).unwrap();
        b.iter(|| black_box(rt.run_gc()));
    });

    group.finish();
}

fn benchmark_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("Heap Snapshot");

    group.bench_function("snapshot_1000_objects", |b| {
        let rt = Runtime::new();
        rt.set_gc_threshold(js_gc::GC_THRESHOLD_DISABLED);
        let ctx = rt.new_context().unwrap();
        let holder = ctx.new_array().unwrap();
        for obj in populate_acyclic(&ctx, 1_000) {
            ctx.array_push(holder, obj).unwrap();
        }
        ctx.set_property(ctx.global(), ctx.atom("keep").unwrap(), holder)
            .unwrap();
        b.iter(|| {
            let mut out = Vec::new();
            ctx.write_heap_snapshot(&mut out).unwrap();
            black_box(out.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_object_creation,
    benchmark_refcount_release,
    benchmark_cycle_collection,
    benchmark_snapshot
);
criterion_main!(benches);
