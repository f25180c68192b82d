// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

fn main() {
    divan::main();
}

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const NUM_TASKS: &[usize] = &[100, 1_000, 10_000];

/// Amount of work per task in the spin scenarios. Small enough that
/// scheduling overhead still matters, large enough that there is something
/// to parallelize.
const SPIN_UNITS: u32 = 200;

/// Emulates a short CPU-bound task.
fn spin_work(units: u32) {
    let mut acc = 0u64;
    for i in 0..units {
        acc = divan::black_box(acc.wrapping_add(i as u64));
    }
    divan::black_box(acc);
}

/// Baseline benchmarks running every task body inline (without any
/// multi-threading involved).
mod serial {
    use super::{spin_work, NUM_TASKS, SPIN_UNITS};
    use divan::counter::ItemsCount;
    use divan::{black_box, Bencher};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[divan::bench(args = NUM_TASKS)]
    fn flood(bencher: Bencher, len: usize) {
        let executed = AtomicUsize::new(0);
        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            for _ in 0..len {
                black_box(&executed).fetch_add(1, Ordering::Relaxed);
            }
        })
    }

    #[divan::bench(args = NUM_TASKS)]
    fn spin(bencher: Bencher, len: usize) {
        let executed = AtomicUsize::new(0);
        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            for _ in 0..len {
                spin_work(SPIN_UNITS);
                black_box(&executed).fetch_add(1, Ordering::Relaxed);
            }
        })
    }
}

/// Benchmarks using Rayon's fire-and-forget spawns.
mod rayon {
    use super::{spin_work, NUM_TASKS, NUM_THREADS, SPIN_UNITS};
    use divan::counter::ItemsCount;
    use divan::Bencher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[divan::bench(consts = NUM_THREADS, args = NUM_TASKS)]
    fn flood_rayon<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(NUM_THREADS)
            .build()
            .unwrap();
        let executed = Arc::new(AtomicUsize::new(0));

        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            executed.store(0, Ordering::Relaxed);
            for _ in 0..len {
                let executed = executed.clone();
                thread_pool.spawn(move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                });
            }
            while executed.load(Ordering::Relaxed) < len {
                std::hint::spin_loop();
            }
        });
    }

    #[divan::bench(consts = NUM_THREADS, args = NUM_TASKS)]
    fn spin_rayon<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(NUM_THREADS)
            .build()
            .unwrap();
        let executed = Arc::new(AtomicUsize::new(0));

        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            executed.store(0, Ordering::Relaxed);
            for _ in 0..len {
                let executed = executed.clone();
                thread_pool.spawn(move || {
                    spin_work(SPIN_UNITS);
                    executed.fetch_add(1, Ordering::Relaxed);
                });
            }
            while executed.load(Ordering::Relaxed) < len {
                std::hint::spin_loop();
            }
        });
    }

    #[divan::bench(consts = NUM_THREADS, args = NUM_TASKS)]
    fn fanout_rayon<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(NUM_THREADS)
            .build()
            .unwrap();
        let executed = Arc::new(AtomicUsize::new(0));

        bencher.counter(ItemsCount::new(len + 1)).bench_local(|| {
            executed.store(0, Ordering::Relaxed);
            let root_executed = executed.clone();
            thread_pool.spawn(move || {
                for _ in 0..len {
                    let executed = root_executed.clone();
                    rayon::spawn(move || {
                        executed.fetch_add(1, Ordering::Relaxed);
                    });
                }
                root_executed.fetch_add(1, Ordering::Relaxed);
            });
            while executed.load(Ordering::Relaxed) < len + 1 {
                std::hint::spin_loop();
            }
        });
    }
}

/// Benchmarks using Tasklight.
mod tasklight {
    use super::{spin_work, NUM_TASKS, NUM_THREADS, SPIN_UNITS};
    use divan::counter::ItemsCount;
    use divan::Bencher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tasklight::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};

    #[divan::bench(consts = NUM_THREADS, args = NUM_TASKS)]
    fn flood<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(NUM_THREADS).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build();
        let executed = Arc::new(AtomicUsize::new(0));

        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            executed.store(0, Ordering::Relaxed);
            for _ in 0..len {
                let executed = executed.clone();
                thread_pool.spawn(move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                });
            }
            while executed.load(Ordering::Relaxed) < len {
                std::hint::spin_loop();
            }
        });
    }

    #[divan::bench(consts = NUM_THREADS, args = NUM_TASKS)]
    fn spin<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(NUM_THREADS).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build();
        let executed = Arc::new(AtomicUsize::new(0));

        bencher.counter(ItemsCount::new(len)).bench_local(|| {
            executed.store(0, Ordering::Relaxed);
            for _ in 0..len {
                let executed = executed.clone();
                thread_pool.spawn(move || {
                    spin_work(SPIN_UNITS);
                    executed.fetch_add(1, Ordering::Relaxed);
                });
            }
            while executed.load(Ordering::Relaxed) < len {
                std::hint::spin_loop();
            }
        });
    }

    #[divan::bench(consts = NUM_THREADS, args = NUM_TASKS)]
    fn fanout<const NUM_THREADS: usize>(bencher: Bencher, len: usize) {
        let thread_pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(NUM_THREADS).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build();
        let executed = Arc::new(AtomicUsize::new(0));

        bencher.counter(ItemsCount::new(len + 1)).bench_local(|| {
            executed.store(0, Ordering::Relaxed);
            let spawner = thread_pool.spawner();
            let root_executed = executed.clone();
            thread_pool.spawn(move || {
                for _ in 0..len {
                    let executed = root_executed.clone();
                    spawner.spawn(move || {
                        executed.fetch_add(1, Ordering::Relaxed);
                    });
                }
                root_executed.fetch_add(1, Ordering::Relaxed);
            });
            while executed.load(Ordering::Relaxed) < len + 1 {
                std::hint::spin_loop();
            }
        });
    }
}
