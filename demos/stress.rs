// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to stress the thread pool with bursts of tasks.

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tasklight::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let thread_pool = ThreadPoolBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: CpuPinningPolicy::IfSupported,
    }
    .build();

    let executed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let expected = match cli.scenario {
        Scenario::Flood => {
            for _ in 0..cli.num_tasks {
                let executed = executed.clone();
                thread_pool.spawn(move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                });
            }
            cli.num_tasks
        }
        Scenario::Spin => {
            // The per-task durations follow a uniform distribution, fixed by
            // a constant seed for reproducibility.
            let mut rng = ChaCha12Rng::seed_from_u64(42);
            for _ in 0..cli.num_tasks {
                let units = rng.random_range(0..=cli.max_spin);
                let executed = executed.clone();
                thread_pool.spawn(move || {
                    spin_work(units);
                    executed.fetch_add(1, Ordering::Relaxed);
                });
            }
            cli.num_tasks
        }
        Scenario::Fanout => {
            for _ in 0..cli.fanout_roots {
                let spawner = thread_pool.spawner();
                let executed = executed.clone();
                let children = cli.fanout_children;
                thread_pool.spawn(move || {
                    for _ in 0..children {
                        let executed = executed.clone();
                        spawner.spawn(move || {
                            executed.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                    executed.fetch_add(1, Ordering::Relaxed);
                });
            }
            cli.fanout_roots * (cli.fanout_children + 1)
        }
    };

    let enqueue_duration = start.elapsed();
    println!("enqueued from the main thread in {enqueue_duration:?}");

    while executed.load(Ordering::Relaxed) < expected {
        std::thread::yield_now();
    }
    let total_duration = start.elapsed();
    println!("executed {expected} tasks in {total_duration:?}");
    println!("completed counter = {}", thread_pool.completed_tasks());
}

/// Emulates a short CPU-bound task.
fn spin_work(units: u32) {
    let mut acc = 0u64;
    for i in 0..units {
        acc = black_box(acc.wrapping_add(i as u64));
    }
    black_box(acc);
}

/// CLI tool to stress the thread pool with bursts of tasks.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Scenario to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of tasks to spawn. Used only for the flood and spin scenarios.
    #[arg(long, default_value_t = 1_000_000)]
    num_tasks: usize,

    /// Maximum amount of spin work per task. Used only for the spin
    /// scenario.
    #[arg(long, default_value_t = 1_000)]
    max_spin: u32,

    /// Number of root tasks. Used only for the fanout scenario.
    #[arg(long, default_value_t = 1_000)]
    fanout_roots: usize,

    /// Number of children spawned by each root task. Used only for the
    /// fanout scenario.
    #[arg(long, default_value_t = 1_000)]
    fanout_children: usize,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Spawn a burst of no-op tasks from the main thread.
    Flood,
    /// Spawn a burst of short CPU-bound tasks of random durations.
    Spin,
    /// Spawn root tasks, each of which spawns its own children.
    Fanout,
}
