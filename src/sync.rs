// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives for parking and waking worker threads.

use std::sync::{Condvar, Mutex, MutexGuard};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
///
/// The mutex is only ever held for short, non-blocking critical sections, so
/// poisoning cannot happen unless a closure passed to one of these methods
/// panics.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Applies the update to the status and notifies one waiting thread.
    pub fn notify_one_with(&self, update: impl FnOnce(&mut T)) {
        update(&mut self.mutex.lock().unwrap());
        self.condvar.notify_one();
    }

    /// Applies the update to the status and notifies all waiting threads.
    pub fn notify_all_with(&self, update: impl FnOnce(&mut T)) {
        update(&mut self.mutex.lock().unwrap());
        self.condvar.notify_all();
    }

    /// Locks the status and applies the given function to it, without
    /// notifying any waiting thread.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.mutex.lock().unwrap())
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify
    /// the status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn wait_returns_immediately_if_predicate_is_false() {
        let status = Status::new(42);
        let guard = status.wait_while(|x| *x != 42);
        assert_eq!(*guard, 42);
    }

    #[test]
    fn notify_one_wakes_a_waiting_thread() {
        let status = Arc::new(Status::new(0));

        let waiter = std::thread::spawn({
            let status = status.clone();
            move || {
                let guard = status.wait_while(|x| *x == 0);
                *guard
            }
        });

        status.notify_one_with(|x| *x = 1);
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn notify_all_wakes_every_waiting_thread() {
        const NUM_THREADS: usize = 4;

        let status = Arc::new(Status::new(false));
        let woken = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                std::thread::spawn({
                    let status = status.clone();
                    let woken = woken.clone();
                    move || {
                        drop(status.wait_while(|ready| !*ready));
                        woken.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        status.notify_all_with(|ready| *ready = true);
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::Relaxed), NUM_THREADS);
    }

    #[test]
    fn with_locked_reads_and_writes_the_status() {
        let status = Status::new(vec![1, 2, 3]);
        let first = status.with_locked(|v| v.pop());
        assert_eq!(first, Some(3));
        status.with_locked(|v| v.push(4));
        let guard = status.wait_while(|v| v.is_empty());
        assert_eq!(*guard, vec![1, 2, 4]);
    }
}
