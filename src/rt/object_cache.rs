// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded lock-free cache of reusable objects.
//!
//! A multi-producer multi-consumer ring over a power-of-two slot array,
//! driven by two atomic cursors plus a per-slot sequence number. `get`
//! returns a recycled object or `None`; `put` inserts unless the ring is
//! full, in which case the object is handed back to the caller (and
//! normally just dropped).
//!
//! Used as the free-list behind the chunk caches and anywhere short-lived
//! objects are worth recycling.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One ring slot: sequence number + possibly-initialized value.
///
/// The sequence encodes the slot's turn: `seq == pos` means free for the
/// producer at `pos`, `seq == pos + 1` means occupied for the consumer at
/// `pos`.
struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC recycling ring.
pub(crate) struct ObjectCache<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,

    // Producer cursor (put side).
    head: CachePadded<AtomicUsize>,

    // Consumer cursor (get side).
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: ObjectCache is Send + Sync for T: Send because:
// - a slot's value is written only by the producer that won the head CAS
//   and read only by the consumer that won the tail CAS
// - the per-slot sequence (Acquire/Release) publishes the value between them
unsafe impl<T: Send> Send for ObjectCache<T> {}
unsafe impl<T: Send> Sync for ObjectCache<T> {}

impl<T> ObjectCache<T> {
    /// Create a cache retaining at most `capacity` objects
    /// (rounded up to the next power of two).
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let capacity = capacity.next_power_of_two();

        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Insert `value`, or hand it back if the ring is full.
    pub(crate) fn put(&self, value: T) -> Result<(), T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == pos {
                // Slot free for this position; claim it.
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the head CAS makes this thread the sole
                        // writer of the slot until the seq store below
                        // publishes it to the matching consumer.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if (seq as isize).wrapping_sub(pos as isize) < 0 {
                // Slot still occupied a full lap behind: ring is full.
                return Err(value);
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop a recycled object, or `None` if the ring is empty.
    pub(crate) fn get(&self) -> Option<T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let expected = pos.wrapping_add(1);

            if seq == expected {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the tail CAS makes this thread the sole
                        // reader of the value written by the producer that
                        // published seq == pos + 1.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.seq
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if (seq as isize).wrapping_sub(expected as isize) < 0 {
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of retained objects.
    pub(crate) fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    /// Drop every retained object; returns how many were drained.
    pub(crate) fn clear(&self) -> usize {
        let mut drained = 0;
        while self.get().is_some() {
            drained += 1;
        }
        drained
    }
}

impl<T> Drop for ObjectCache<T> {
    fn drop(&mut self) {
        self.clear();
    }
}
