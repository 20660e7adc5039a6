use std::alloc::{alloc, dealloc, Layout};
use std::time::{Duration, Instant};

use bitmap_heap::{Heap, SLOT_SIZE};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn system_layout(nslots: usize) -> Layout {
    // Layout::from_size_align only fails on a bad alignment
    Layout::from_size_align(nslots * SLOT_SIZE, SLOT_SIZE).unwrap()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let heap = Heap::new();

    let mut group = c.benchmark_group("SingleAlloc");

    group.bench_function("Heap", |b| {
        b.iter(|| {
            let ptr = heap.allocate(black_box(SLOT_SIZE)).unwrap();
            unsafe { heap.free(ptr) };
        })
    });

    group.bench_function("Heap (large)", |b| {
        b.iter(|| {
            let ptr = heap.allocate(black_box(16 * SLOT_SIZE)).unwrap();
            unsafe { heap.free(ptr) };
        })
    });

    group.bench_function("System Allocator", |b| {
        let layout = system_layout(1);
        b.iter(|| unsafe {
            let ptr = alloc(black_box(layout));
            dealloc(ptr, layout);
        })
    });

    group.finish();

    let mut group = c.benchmark_group("Fill");
    for n in (64..=1024).step_by(320) {

        group.bench_with_input(BenchmarkId::new("Heap", n), &n, move |b, n| {
            let n = *n;

            b.iter_custom(move |iters| {
                let mut duration = Duration::new(0, 0);

                for _ in 0..iters {
                    let heap = Heap::new();
                    let mut ptrs = Vec::with_capacity(n);

                    let start = Instant::now();
                    for i in 0..n {
                        let size = (1 + i % 8) * SLOT_SIZE;
                        ptrs.push(heap.allocate(black_box(size)).unwrap());
                    }
                    for ptr in ptrs {
                        unsafe { heap.free(ptr) };
                    }
                    duration += start.elapsed();
                }

                duration
            });
        });

        group.bench_with_input(BenchmarkId::new("System Allocator", n), &n, move |b, n| {
            let n = *n;

            b.iter_custom(move |iters| {
                let mut duration = Duration::new(0, 0);

                for _ in 0..iters {
                    let mut ptrs = Vec::with_capacity(n);

                    let start = Instant::now();
                    for i in 0..n {
                        let layout = system_layout(1 + i % 8);
                        ptrs.push((unsafe { alloc(black_box(layout)) }, layout));
                    }
                    for (ptr, layout) in ptrs {
                        unsafe { dealloc(ptr, layout) };
                    }
                    duration += start.elapsed();
                }

                duration
            });
        });
    }
    group.finish();

    let mut group = c.benchmark_group("Collect");

    group.bench_function("Heap", |b| {
        b.iter_custom(|iters| {
            let mut duration = Duration::new(0, 0);

            for _ in 0..iters {
                let ptrs: Vec<_> = (0..4).map(|_| heap.allocate(32 * SLOT_SIZE).unwrap()).collect();
                for ptr in ptrs {
                    unsafe { heap.free(ptr) };
                }

                let start = Instant::now();
                black_box(heap.force_garbage_collect());
                duration += start.elapsed();
            }

            duration
        })
    });

    group.finish();
}

criterion_group!{
    name = benches;
    config = Criterion::default()
        .warm_up_time(std::time::Duration::from_millis(100))
        .sample_size(50);
    targets = criterion_benchmark
}

criterion_main!(benches);
