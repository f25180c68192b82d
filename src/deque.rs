// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A per-worker deque of tasks with a lock-free local end and a mutex-guarded
//! stealing end.
//!
//! The owner of a [`WorkStealingDeque`] pushes and pops at the local end in
//! LIFO order, without taking a lock in the common case. Any number of
//! [`Stealer`] handles remove the oldest item from the opposite end under a
//! try-lock, so a thief drains long-queued work first while the owner keeps
//! operating on the freshest, cache-hot items. The only paths that go through
//! the lock are steals, buffer growth, and the rare pop that races a steal
//! for the last remaining item.

use crossbeam_utils::CachePadded;
use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

/// Capacity of a freshly created deque. Growth doubles the capacity, which
/// always stays a power of two.
const INITIAL_CAPACITY: usize = 32;

/// Outcome of a steal attempt on a [`Stealer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// The oldest item of the deque was claimed.
    Success(T),
    /// The deque was observed to be empty.
    Empty,
    /// The attempt lost a race against another operation holding the foreign
    /// lock. Not an error: the caller may retry later, and the deque may or
    /// may not contain items.
    Retry,
}

/// Owning handle to a work-stealing deque.
///
/// The owner pushes and pops at the local end. This handle can be sent to the
/// owning thread but not shared: local operations are unsynchronized on the
/// fast path, which is sound only if a single thread performs them.
pub struct WorkStealingDeque<T> {
    inner: Arc<Inner<T>>,
    /// Opts out of [`Sync`], keeping the handle [`Send`].
    _not_sync: PhantomData<Cell<()>>,
}

/// Stealing handle to a work-stealing deque, removing items from the foreign
/// end. Cloneable and shareable across threads.
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

// Access rules for the fields of `Inner`, upheld throughout this module:
//
// - `buffer` (the slot pointer and mask) is read by the owner without the
//   lock, read by stealers while holding `foreign_lock`, and replaced only by
//   the owner while holding `foreign_lock`. Cross-thread buffer accesses are
//   therefore always serialized by the lock.
// - A slot is written by the owner's push at index `tail` before `tail` is
//   advanced, and moved out either by the owner's pop or by the stealer that
//   claimed its index through the head/tail protocol. The protocol keeps
//   `tail - head` strictly below the capacity (transiently equal to it when a
//   push races the rollback of a failed steal), so the slot written at `tail`
//   never aliases a live slot in `[head, tail)`, and each index in that range
//   is claimed by exactly one remover.
// - `head` is advanced only under the lock (steals, growth); `tail` is
//   written only by the owner. The last-item race between a pop and a steal
//   is decided by the pair of sequentially consistent exchanges: each side
//   publishes its own provisional index update before re-reading the other
//   side's index, so at least one of the two observes the conflict.
struct Inner<T> {
    /// Index of the next item to steal (the foreign end). Transiently exceeds
    /// `tail` by one while a steal that will roll back is in flight.
    head: CachePadded<AtomicUsize>,
    /// Index of the next free slot at the local end.
    tail: CachePadded<AtomicUsize>,
    /// Circular storage; slot `i` of the logical deque lives at `i & mask`.
    buffer: UnsafeCell<Buffer<T>>,
    /// Serializes steals against each other, against buffer growth, and
    /// against the contested-pop resolution. No user code ever runs while it
    /// is held, so it cannot be poisoned.
    foreign_lock: Mutex<()>,
}

// SAFETY:
//
// Sending or sharing an `Inner` moves values of `T` between threads (pushed
// by the owner, moved out by a stealer), hence the `T: Send` bound. No `&T`
// pointing into the deque is ever observable from two threads, so `T: Sync`
// is not required. The index protocol and the foreign lock serialize all
// cross-thread accesses to `buffer` as described in the access rules above.
unsafe impl<T: Send> Send for Inner<T> {}
// SAFETY: as for the `Send` implementation above.
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> WorkStealingDeque<T> {
    /// Creates an empty deque with the initial capacity.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                head: CachePadded::new(AtomicUsize::new(0)),
                tail: CachePadded::new(AtomicUsize::new(0)),
                buffer: UnsafeCell::new(Buffer::new(INITIAL_CAPACITY)),
                foreign_lock: Mutex::new(()),
            }),
            _not_sync: PhantomData,
        }
    }

    /// Returns a new stealing handle to this deque.
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Pushes an item at the local end.
    ///
    /// The fast path writes the slot and publishes it by advancing `tail`,
    /// without any lock. When the buffer is full relative to `head`, the push
    /// falls back to [`push_slow()`](Self::push_slow), which doubles the
    /// capacity under the foreign lock.
    pub fn push(&self, value: T) {
        let inner = &*self.inner;
        // Only the owner stores `tail`, so a relaxed read sees its latest
        // value.
        let tail = inner.tail.load(Ordering::Relaxed);
        let head = inner.head.load(Ordering::SeqCst);

        // SAFETY: `push` is an owner-only operation and only the owner
        // replaces the buffer, so the reference is stable for the whole call.
        let buffer = unsafe { inner.buffer() };
        if tail < head + buffer.mask {
            // SAFETY: slot `tail` is outside the live range, so no stealer
            // accesses it (see the access rules above), and it holds no
            // initialized value.
            unsafe { buffer.write(tail, value) };
            // Publishes the slot write: a stealer that observes the new
            // `tail` also observes the written slot.
            inner.tail.store(tail + 1, Ordering::SeqCst);
        } else {
            self.push_slow(value);
        }
    }

    /// Completes a push when the buffer looks full: re-checks the room under
    /// the foreign lock and doubles the capacity if needed.
    #[cold]
    fn push_slow(&self, value: T) {
        let inner = &*self.inner;
        let _guard = inner.foreign_lock.lock().unwrap();

        // Stealers only move `head` while holding the lock, so the count
        // computed here is exact and stable until the guard is dropped.
        let head = inner.head.load(Ordering::SeqCst);
        let tail = inner.tail.load(Ordering::Relaxed);
        let count = tail - head;

        // SAFETY: owner-only call, as in `push()`.
        let needs_growth = count >= unsafe { inner.buffer() }.mask;
        if needs_growth {
            let new_buffer = {
                // SAFETY: owner-only call, as in `push()`.
                let buffer = unsafe { inner.buffer() };
                let new_buffer = Buffer::new(buffer.capacity() * 2);
                // Re-lay-out the live items at the start of the new buffer,
                // preserving their relative order.
                for i in 0..count {
                    // SAFETY: slot `head + i` is live and no stealer can
                    // touch it while the lock is held; slot `i` of the new
                    // buffer holds no initialized value yet.
                    unsafe { new_buffer.write(i, buffer.take(head + i)) };
                }
                new_buffer
            };
            // SAFETY: the owner holds the lock, so neither a stealer (locked
            // out) nor the owner itself (running this statement) can hold a
            // reference into the old buffer. The old buffer only contains
            // moved-out slots at this point, so dropping it frees no item.
            unsafe { *inner.buffer.get() = new_buffer };
            inner.head.store(0, Ordering::SeqCst);
            inner.tail.store(count, Ordering::SeqCst);

            // SAFETY: slot `count` of the fresh buffer is free; `count` fits
            // since the new capacity is `2 * (mask + 1) > count + 1`.
            unsafe { inner.buffer().write(count, value) };
            inner.tail.store(count + 1, Ordering::SeqCst);
        } else {
            // Steals freed room since the fast-path check: no growth needed.
            // SAFETY: slot `tail` is free, as in `push()`.
            unsafe { inner.buffer().write(tail, value) };
            inner.tail.store(tail + 1, Ordering::SeqCst);
        }
    }

    /// Pops the most recently pushed item from the local end.
    ///
    /// Returns [`None`] if the deque is empty, or if a concurrent steal
    /// claimed the last remaining item first.
    pub fn pop(&self) -> Option<T> {
        let inner = &*self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        if inner.head.load(Ordering::SeqCst) >= tail {
            return None;
        }

        // Provisionally claim the last item. The exchange must be globally
        // visible before `head` is re-read below: a plain store could be
        // reordered after the read, and a steal of the same item between the
        // emptiness check above and the re-read would then go unnoticed.
        let tail = tail - 1;
        let previous = inner.tail.swap(tail, Ordering::SeqCst);
        debug_assert_eq!(previous, tail + 1);

        let head = inner.head.load(Ordering::SeqCst);
        if head <= tail {
            // No steal can have claimed index `tail`: a steal claims an index
            // only after its advance of `head` past that index is visible.
            // SAFETY: index `tail` is initialized and this pop is its only
            // claimant.
            Some(unsafe { inner.buffer().take(tail) })
        } else {
            self.pop_contested(tail)
        }
    }

    /// Resolves a pop whose provisional `tail` decrement crossed a concurrent
    /// steal: either the steal rolled back and the item is still there, or
    /// the steal won and the decrement must be undone.
    #[cold]
    fn pop_contested(&self, tail: usize) -> Option<T> {
        let inner = &*self.inner;
        let _guard = inner.foreign_lock.lock().unwrap();

        // Under the lock, `head` is stable and every past steal is complete:
        // an observed advance past `tail` is a definitive claim, not an
        // optimistic one that could still roll back.
        if inner.head.load(Ordering::SeqCst) <= tail {
            // SAFETY: index `tail` is initialized and unclaimed, and stealers
            // are locked out.
            Some(unsafe { inner.buffer().take(tail) })
        } else {
            // The stealer won the race for the last item: undo the
            // provisional decrement and report the deque empty.
            inner.tail.store(tail + 1, Ordering::SeqCst);
            None
        }
    }

    /// Number of items in the deque. A racy hint: it may be stale as soon as
    /// it is read.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the deque is empty. A racy hint, like [`len()`](Self::len).
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl<T> Default for WorkStealingDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stealer<T> {
    /// Attempts to steal the oldest item from the foreign end.
    ///
    /// Never blocks: if the foreign lock is busy, returns [`Steal::Retry`]
    /// immediately.
    pub fn steal(&self) -> Steal<T> {
        let inner = &*self.inner;
        let _guard = match inner.foreign_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Steal::Retry,
            // No user code runs under the foreign lock (see `Inner`), so
            // poisoning cannot happen.
            Err(TryLockError::Poisoned(e)) => panic!("foreign lock poisoned: {e}"),
        };

        // Optimistically claim the oldest item. As in `pop()`, the exchange
        // must be globally visible before `tail` is read, so that a pop
        // targeting the same last item cannot be missed. Other writers of
        // `head` are excluded by the lock.
        let head = inner.head.load(Ordering::SeqCst);
        let previous = inner.head.swap(head + 1, Ordering::SeqCst);
        debug_assert_eq!(previous, head);

        if head < inner.tail.load(Ordering::SeqCst) {
            // SAFETY: index `head` is initialized, and the advance of `head`
            // makes this stealer its only claimant: a concurrent pop that
            // observed the advance resolves through the lock, and one that
            // did not observe it targeted a later index.
            Steal::Success(unsafe { inner.buffer().take(head) })
        } else {
            // The deque was empty (or the owner took the last item first):
            // roll back the optimistic advance.
            inner.head.store(head, Ordering::SeqCst);
            Steal::Empty
        }
    }

    /// Number of items in the deque. A racy hint: a steal in flight on
    /// another thread can transiently make it undercount by one.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the deque is empty. A racy hint, like [`len()`](Self::len).
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Inner<T> {
    /// Returns a view of the current buffer.
    ///
    /// # Safety
    ///
    /// The caller must either be on the owning handle's thread or hold
    /// `foreign_lock`, so that the buffer cannot be concurrently replaced by
    /// a growth.
    #[inline(always)]
    unsafe fn buffer(&self) -> &Buffer<T> {
        // SAFETY: per this function's contract, the buffer is not being
        // replaced: growth happens on the owner's thread under the lock.
        unsafe { &*self.buffer.get() }
    }

    /// Item count hint; the two loads are not a consistent snapshot.
    #[inline(always)]
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        // `head` transiently exceeds `tail` during a steal that rolls back.
        tail.saturating_sub(head)
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let buffer = self.buffer.get_mut();
        for index in head..tail {
            // SAFETY: this is the last handle to the deque, so every slot in
            // the live range is initialized and unaliased.
            unsafe { drop(buffer.take(index)) };
        }
    }
}

/// Fixed-capacity circular storage. Slots outside the live range hold no
/// initialized value, so the buffer itself never drops items.
struct Buffer<T> {
    /// Storage for `mask + 1` slots.
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Capacity minus one; the capacity is a power of two, so `index & mask`
    /// wraps an unbounded index onto its slot.
    mask: usize,
}

impl<T> Buffer<T> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            slots: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            mask: capacity - 1,
        }
    }

    #[inline(always)]
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Initializes the slot at the given index with a value.
    ///
    /// # Safety
    ///
    /// The slot must not hold an initialized value, and no other thread may
    /// access it during the call.
    #[inline(always)]
    unsafe fn write(&self, index: usize, value: T) {
        // SAFETY: exclusive slot access, per this function's contract.
        unsafe { (*self.slots[index & self.mask].get()).write(value) };
    }

    /// Moves the value out of the slot at the given index, leaving the slot
    /// uninitialized.
    ///
    /// # Safety
    ///
    /// The slot must hold an initialized value that was not moved out since,
    /// and no other thread may access it during the call.
    #[inline(always)]
    unsafe fn take(&self, index: usize) -> T {
        // SAFETY: exclusive access to an initialized slot, per this
        // function's contract.
        unsafe { (*self.slots[index & self.mask].get()).assume_init_read() }
    }
}
