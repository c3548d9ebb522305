//! Slot lifecycle benchmarks: id allocation, destruction, and thread teardown.

use std::cell::Cell;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tagtls_core::{ElementWrapper, SlotHandle, Tag, ThreadLocal, declare_tag};

declare_tag! {
    struct LifecycleTag;
}

fn bench_allocate_destroy(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_destroy");
    let registry = LifecycleTag::registry();

    group.bench_function("empty_slot", |b| {
        b.iter(|| {
            let handle = SlotHandle::new();
            black_box(registry.allocate(&handle).unwrap());
            registry.destroy(&handle);
        });
    });

    group.bench_function("populated_slot", |b| {
        b.iter(|| {
            let handle = SlotHandle::new();
            let cell = registry.get(&handle).unwrap();
            // SAFETY: freshly resolved cell for this thread.
            let previous = unsafe { &mut *cell.as_ptr() }.replace(ElementWrapper::boxed(Box::new(7_u64)));
            debug_assert!(!previous.is_set());
            black_box(registry.destroy(&handle));
        });
    });
    group.finish();
}

fn bench_thread_teardown(c: &mut Criterion) {
    let slots: &[usize] = &[1, 16, 128];
    let mut group = c.benchmark_group("thread_teardown");

    for &count in slots {
        let locals: Vec<ThreadLocal<Cell<u64>, LifecycleTag>> =
            (0..count).map(|_| ThreadLocal::new(|| Cell::new(0))).collect();

        group.bench_with_input(BenchmarkId::new("spawn_touch_join", count), &count, |b, _| {
            b.iter(|| {
                std::thread::scope(|s| {
                    s.spawn(|| {
                        for local in &locals {
                            local.with(|v| v.set(1));
                        }
                    })
                    .join()
                    .unwrap();
                });
            });
        });
    }

    group.bench_function("spawn_join_baseline", |b| {
        b.iter(|| {
            std::thread::spawn(|| black_box(0_u64)).join().unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_allocate_destroy, bench_thread_teardown);
criterion_main!(benches);
