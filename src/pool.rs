// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A thread pool scheduling fire-and-forget tasks over work-stealing deques.

use crate::deque::{Steal, Stealer, WorkStealingDeque};
use crate::macros::{log_debug, log_error, log_warn};
#[cfg(feature = "log_parallelism")]
use crate::macros::{log_info, log_trace};
use crate::sync::Status;
use crossbeam_utils::CachePadded;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::cell::Cell;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
#[cfg(feature = "log_parallelism")]
use std::ops::AddAssign;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
#[cfg(feature = "log_parallelism")]
use std::sync::Mutex;
use std::thread::JoinHandle;

/// A unit of work scheduled on a [`ThreadPool`].
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// ```
    /// # use std::sync::mpsc;
    /// # use tasklight::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// let pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::AvailableParallelism,
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    ///
    /// let (sender, receiver) = mpsc::channel();
    /// for i in 1..=10 {
    ///     let sender = sender.clone();
    ///     pool.spawn(move || sender.send(i * i).unwrap());
    /// }
    ///
    /// let sum: i32 = receiver.iter().take(10).sum();
    /// assert_eq!(sum, 385);
    /// ```
    pub fn build(&self) -> ThreadPool {
        ThreadPool::new(self)
    }
}

/// A thread pool that executes fire-and-forget tasks, balancing the load
/// among its worker threads via work stealing.
///
/// Each worker owns a deque of tasks. A task spawned from within another task
/// lands on the spawning worker's deque and is executed in LIFO order, unless
/// an idle worker steals it first; tasks spawned from outside the pool go
/// through a shared inbound queue that idle workers serve in FIFO order. No
/// execution order is guaranteed across workers.
///
/// Dropping the pool stops the workers: tasks already executing run to
/// completion, tasks still queued are discarded.
pub struct ThreadPool {
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
    /// State shared with the worker threads.
    shared: Arc<SharedContext>,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(builder: &ThreadPoolBuilder) -> Self {
        let num_threads: NonZeroUsize = match builder.num_threads {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .expect("Getting the available parallelism failed"),
            ThreadCount::Count(count) => count,
        };
        let num_threads: usize = num_threads.into();
        let cpu_pinning = builder.cpu_pinning;

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let deques: Vec<WorkStealingDeque<Task>> =
            (0..num_threads).map(|_| WorkStealingDeque::new()).collect();
        let shared = Arc::new(SharedContext {
            dispatcher: Dispatcher::new(),
            stealers: deques.iter().map(|deque| deque.stealer()).collect(),
            completed: CachePadded::new(AtomicU64::new(0)),
            stop: CachePadded::new(AtomicBool::new(false)),
            #[cfg(feature = "log_parallelism")]
            stats: Mutex::new(WorkerStats::default()),
        });

        let threads = deques
            .into_iter()
            .enumerate()
            .map(|(id, deque)| {
                let context = WorkerContext {
                    id,
                    deque,
                    shared: shared.clone(),
                };
                WorkerThreadHandle {
                    handle: std::thread::Builder::new()
                        .name(format!("tasklight-worker-{id}"))
                        .spawn(move || {
                            #[cfg(all(
                                not(miri),
                                any(
                                    target_os = "android",
                                    target_os = "dragonfly",
                                    target_os = "freebsd",
                                    target_os = "linux"
                                )
                            ))]
                            match cpu_pinning {
                                CpuPinningPolicy::No => (),
                                CpuPinningPolicy::IfSupported => {
                                    let mut cpu_set = CpuSet::new();
                                    if let Err(_e) = cpu_set.set(id) {
                                        log_warn!(
                                            "Failed to set CPU affinity for thread #{id}: {_e}"
                                        );
                                    } else if let Err(_e) =
                                        sched_setaffinity(Pid::from_raw(0), &cpu_set)
                                    {
                                        log_warn!(
                                            "Failed to set CPU affinity for thread #{id}: {_e}"
                                        );
                                    } else {
                                        log_debug!("Pinned thread #{id} to CPU #{id}");
                                    }
                                }
                                CpuPinningPolicy::Always => {
                                    let mut cpu_set = CpuSet::new();
                                    if let Err(e) = cpu_set.set(id) {
                                        panic!("Failed to set CPU affinity for thread #{id}: {e}");
                                    } else if let Err(e) =
                                        sched_setaffinity(Pid::from_raw(0), &cpu_set)
                                    {
                                        panic!("Failed to set CPU affinity for thread #{id}: {e}");
                                    } else {
                                        log_debug!("Pinned thread #{id} to CPU #{id}");
                                    }
                                }
                            }
                            context.run()
                        })
                        .expect("Spawning a worker thread failed"),
                }
            })
            .collect();
        log_debug!("[main thread] Spawned workers");

        Self { threads, shared }
    }

    /// Schedules a task for execution on the pool.
    ///
    /// This never blocks on task execution: the task runs at some later point
    /// on one of the worker threads. Queues grow without bound, so spawning
    /// is also never subject to backpressure.
    ///
    /// A panic inside the task is caught by the executing worker, reported
    /// through the `log` feature's error level, and counted as a completion;
    /// it doesn't affect other tasks nor the pool itself.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.schedule(Box::new(task));
    }

    /// Returns a cloneable handle that spawns tasks on this pool, usable from
    /// inside tasks for recursive fan-out.
    pub fn spawner(&self) -> Spawner {
        Spawner {
            shared: self.shared.clone(),
        }
    }

    /// Number of tasks that finished executing since the pool was built,
    /// including tasks that panicked.
    ///
    /// The counter is monotonically non-decreasing and purely observational:
    /// it trails the actual completions by an instant.
    pub fn completed_tasks(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Returns the number of worker threads that have been spawned in this
    /// thread pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.threads.len().try_into().unwrap()
    }
}

impl Drop for ThreadPool {
    /// Stops and joins all the threads in the pool.
    ///
    /// Tasks already executing run to completion; tasks still queued are
    /// dropped.
    #[allow(clippy::single_match, clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.dispatcher.wake_all();

        log_debug!("[main thread] Joining threads in the pool...");
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");

        #[cfg(feature = "log_parallelism")]
        {
            let stats = self.shared.stats.lock().unwrap();
            log_info!("Scheduling statistics:");
            log_info!("- local tasks: {}", stats.local_tasks);
            log_info!("- inbound tasks: {}", stats.inbound_tasks);
            log_info!("- stolen tasks: {}", stats.stolen_tasks);
            log_info!("- empty scans: {}", stats.empty_scans);
            log_info!("- parks: {}", stats.parks);
            log_info!(
                "- total executed: {}",
                stats.local_tasks + stats.inbound_tasks + stats.stolen_tasks
            );
        }
    }
}

/// A cloneable handle for spawning tasks on a [`ThreadPool`].
///
/// Unlike the pool itself, the handle can be captured by tasks, which is how
/// a task schedules further tasks. It doesn't keep the workers alive: tasks
/// spawned after the pool was dropped are discarded without running.
#[derive(Clone)]
pub struct Spawner {
    /// State shared with the pool and its workers.
    shared: Arc<SharedContext>,
}

impl Spawner {
    /// Schedules a task for execution on the pool, with the same contract as
    /// [`ThreadPool::spawn()`].
    ///
    /// When called from a worker thread of this pool, the task is pushed
    /// onto that worker's own deque, where it runs in LIFO order unless an
    /// idle peer steals it first.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.schedule(Box::new(task));
    }
}

/// State shared between the pool facade, the [`Spawner`] handles and the
/// worker threads.
struct SharedContext {
    /// Inbound queue and park/wake signal.
    dispatcher: Dispatcher,
    /// Stealing handles to every worker's deque, indexed by worker id.
    stealers: Vec<Stealer<Task>>,
    /// Number of tasks that finished executing, across all workers.
    completed: CachePadded<AtomicU64>,
    /// Set once at shutdown; workers exit their loop when they observe it.
    stop: CachePadded<AtomicBool>,
    /// Aggregated scheduling statistics of stopped workers.
    #[cfg(feature = "log_parallelism")]
    stats: Mutex<WorkerStats>,
}

impl SharedContext {
    /// Schedules a task: pushed onto the current worker's deque when called
    /// from a worker thread of this pool, queued through the dispatcher
    /// otherwise. Either way, one parked worker is notified.
    fn schedule(self: &Arc<Self>, task: Task) {
        let registered = CURRENT_WORKER.with(|current| current.get());
        match registered {
            Some(worker) if std::ptr::eq(worker.shared, Arc::as_ptr(self)) => {
                // SAFETY: the registration was made by the worker running on
                // this very thread, covers its whole run loop, and points to
                // a deque that doesn't move for the registration's lifetime.
                // Pushing from the worker's own thread upholds the deque's
                // owner-only contract.
                unsafe { (*worker.deque).push(task) };
                self.dispatcher.notify_stealable();
            }
            _ => self.dispatcher.send(task),
        }
    }
}

/// The inbound side of the pool: tasks spawned from outside the workers land
/// in a shared queue, and the signal wakes parked workers whenever work may
/// have appeared anywhere in the pool.
struct Dispatcher {
    /// Queue and epoch, behind the same mutex the wake signal uses, so that
    /// enqueuing and the pre-park emptiness check cannot interleave
    /// unnoticed.
    signal: Status<Inbound>,
}

/// State behind the dispatcher's mutex.
struct Inbound {
    /// Tasks spawned from outside the pool, oldest first.
    queue: VecDeque<Task>,
    /// Bumped on every event that may create work (an inbound task, a local
    /// push, shutdown). A worker parks only while the epoch still equals the
    /// value it captured before its last empty scan, so a bump between the
    /// scan and the park prevents the sleep instead of being lost.
    epoch: u64,
}

/// Outcome of a worker's poll of the dispatcher.
enum Assignment {
    /// The oldest inbound task, taken off the queue.
    Task(Task),
    /// Nothing is queued; the token allows parking if the steal pass that
    /// follows also comes up empty.
    Idle { epoch: u64 },
}

impl Dispatcher {
    fn new() -> Self {
        Self {
            signal: Status::new(Inbound {
                queue: VecDeque::new(),
                epoch: 0,
            }),
        }
    }

    /// Queues a task from outside the workers and wakes one parked worker.
    fn send(&self, task: Task) {
        self.signal.notify_one_with(|inbound| {
            inbound.queue.push_back(task);
            inbound.epoch += 1;
        });
    }

    /// Signals that a task was pushed onto some worker's deque, waking one
    /// parked worker to come and steal it.
    fn notify_stealable(&self) {
        self.signal.notify_one_with(|inbound| inbound.epoch += 1);
    }

    /// Takes the oldest inbound task, or returns the park token to use if
    /// nothing is queued.
    fn poll(&self) -> Assignment {
        self.signal
            .with_locked(|inbound| match inbound.queue.pop_front() {
                Some(task) => Assignment::Task(task),
                None => Assignment::Idle {
                    epoch: inbound.epoch,
                },
            })
    }

    /// Parks the calling worker until the epoch moves past the token or the
    /// pool stops. Waking up is a hint, not a work assignment: the worker
    /// re-scans everything afterwards.
    fn park(&self, epoch: u64, stop: &AtomicBool) {
        drop(
            self.signal
                .wait_while(|inbound| inbound.epoch == epoch && !stop.load(Ordering::Acquire)),
        );
    }

    /// Wakes every parked worker at shutdown.
    fn wake_all(&self) {
        self.signal.notify_all_with(|inbound| inbound.epoch += 1);
    }
}

thread_local! {
    /// Registration of the pool worker running on this thread, if any, used
    /// to route nested spawns to the worker's own deque.
    static CURRENT_WORKER: Cell<Option<CurrentWorker>> = const { Cell::new(None) };
}

/// Pointers to the state of the worker running on the current thread, valid
/// for the duration of a [`WorkerRegistration`].
#[derive(Clone, Copy)]
struct CurrentWorker {
    /// Identifies the pool this worker belongs to.
    shared: *const SharedContext,
    /// The deque owned by this worker.
    deque: *const WorkStealingDeque<Task>,
}

/// Guard that registers the current thread as a pool worker and clears the
/// registration when dropped.
struct WorkerRegistration;

impl WorkerRegistration {
    fn enter(shared: &Arc<SharedContext>, deque: &WorkStealingDeque<Task>) -> Self {
        CURRENT_WORKER.with(|current| {
            current.set(Some(CurrentWorker {
                shared: Arc::as_ptr(shared),
                deque,
            }))
        });
        Self
    }
}

impl Drop for WorkerRegistration {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|current| current.set(None));
    }
}

/// A worker thread of the pool.
struct WorkerContext {
    /// Index of this worker in the pool.
    id: usize,
    /// The deque owned by this worker.
    deque: WorkStealingDeque<Task>,
    /// State shared with the rest of the pool.
    shared: Arc<SharedContext>,
}

impl WorkerContext {
    /// Main function executed by this worker thread: drain the local deque,
    /// then serve the inbound queue, then steal from peers, and park once
    /// the whole pool looks empty.
    fn run(self) {
        let WorkerContext { id, deque, shared } = self;
        // Locals (rather than fields) so that the registration can hold a
        // pointer to the deque while the loop below still uses it.
        let _registration = WorkerRegistration::enter(&shared, &deque);
        #[cfg(feature = "log_parallelism")]
        let mut stats = WorkerStats::default();

        log_debug!("[worker {id}] Started");
        'main: loop {
            // Draining-local phase: execute everything in the local deque,
            // newest first.
            while let Some(task) = deque.pop() {
                #[cfg(feature = "log_parallelism")]
                {
                    stats.local_tasks += 1;
                }
                Self::execute(task, id, &shared);
                if shared.stop.load(Ordering::Acquire) {
                    break 'main;
                }
            }

            if shared.stop.load(Ordering::Acquire) {
                break 'main;
            }

            // Inbound phase: serve tasks spawned from outside the workers.
            let epoch = match shared.dispatcher.poll() {
                Assignment::Task(task) => {
                    #[cfg(feature = "log_parallelism")]
                    {
                        stats.inbound_tasks += 1;
                    }
                    Self::execute(task, id, &shared);
                    continue 'main;
                }
                Assignment::Idle { epoch } => epoch,
            };

            // Stealing phase: scan the peers round-robin, starting after
            // this worker's own index.
            let num_workers = shared.stealers.len();
            let mut contended = false;
            for offset in 1..num_workers {
                let victim = (id + offset) % num_workers;
                match shared.stealers[victim].steal() {
                    Steal::Success(task) => {
                        #[cfg(feature = "log_parallelism")]
                        {
                            stats.stolen_tasks += 1;
                            log_trace!("[worker {id}] Stole a task from worker {victim}");
                        }
                        Self::execute(task, id, &shared);
                        continue 'main;
                    }
                    Steal::Empty => (),
                    Steal::Retry => contended = true,
                }
            }

            if contended {
                // A busy foreign lock may be hiding work: rescan instead of
                // parking.
                std::thread::yield_now();
                continue 'main;
            }

            // Idle phase. The deque was drained by this worker and nothing
            // was pushed onto it since.
            debug_assert!(deque.is_empty());
            #[cfg(feature = "log_parallelism")]
            {
                stats.empty_scans += 1;
                stats.parks += 1;
            }
            log_debug!("[worker {id}] Parking: no work in the pool");
            shared.dispatcher.park(epoch, &shared.stop);
            log_debug!("[worker {id}] Woke up");
        }
        log_debug!("[worker {id}] Stopping");

        #[cfg(feature = "log_parallelism")]
        {
            *shared.stats.lock().unwrap() += &stats;
        }
    }

    /// Runs one task, isolating panics and counting the completion.
    fn execute(task: Task, _id: usize, shared: &SharedContext) {
        // A panicking task must not take the worker down with it: catch the
        // unwind, report it, and keep scheduling.
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            log_error!("[worker {_id}] A task panicked");
        }
        shared.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-worker scheduling counters, aggregated into the pool-wide statistics
/// when the worker stops.
#[cfg(feature = "log_parallelism")]
#[derive(Default)]
struct WorkerStats {
    /// Tasks executed straight from the worker's own deque.
    local_tasks: u64,
    /// Tasks taken from the inbound queue.
    inbound_tasks: u64,
    /// Tasks stolen from a peer's deque.
    stolen_tasks: u64,
    /// Full steal passes that found nothing to take.
    empty_scans: u64,
    /// Times the worker parked.
    parks: u64,
}

#[cfg(feature = "log_parallelism")]
impl AddAssign<&WorkerStats> for WorkerStats {
    fn add_assign(&mut self, other: &WorkerStats) {
        self.local_tasks += other.local_tasks;
        self.inbound_tasks += other.inbound_tasks;
        self.stolen_tasks += other.stolen_tasks;
        self.empty_scans += other.empty_scans;
        self.parks += other.parks;
    }
}
