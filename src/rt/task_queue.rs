// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multi-producer single-consumer queue of reactor-thread tasks.
//!
//! An intrusive linked list with two shared cells, `tail` (latest
//! enqueued) and `head` (next to consume), each padded onto its own cache
//! line. Producers swap themselves into `tail` and chain through the
//! previous node's `next` pointer; the producer that finds `tail` empty
//! publishes `head` and reports the transition so the caller can wake the
//! reactor.
//!
//! The consumer closes a batch by installing a no-op sentinel node into an
//! empty `tail`: producers arriving later keep enqueueing, but the current
//! batch is guaranteed at least one consumable node. While walking the
//! list, a `next == null` node is unlinked by CASing `tail` back to null;
//! if that CAS loses to a producer, the consumer busy-waits for the
//! producer's `next` store, which is always imminent.
//!
//! # Protocol
//!
//! ```text
//!  producer                          consumer (reactor thread)
//!  --------                          -------------------------
//!  prev = tail.swap(node)            close_batch: tail CAS null -> dummy,
//!  if prev == null:                                head = dummy
//!      head = node  (+ wake)         spin until head != null
//!  else:                             walk head -> next -> ...
//!      prev.next = node              last node: head = null,
//!                                                tail CAS node -> null
//!                                    on CAS loss: spin on node.next
//! ```

use crossbeam::utils::CachePadded;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// List node carrying one task. A node with no task is a batch sentinel.
pub(crate) struct Node<T> {
    next: AtomicPtr<Node<T>>,
    item: Option<T>,
}

impl<T> Node<T> {
    fn new(item: Option<T>) -> Box<Self> {
        Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            item,
        })
    }
}

/// Consumer-owned spare sentinel, recycled across batches.
pub(crate) struct SpareNode<T>(Option<Box<Node<T>>>);

impl<T> Default for SpareNode<T> {
    fn default() -> Self {
        Self(None)
    }
}

/// Outcome of a push: whether the list was empty, and an opaque identity
/// of the pushed node for the wake-alarm comparison.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Pushed {
    pub was_empty: bool,
    pub token: usize,
}

/// Lock-free MPSC task list.
pub(crate) struct TaskQueue<T> {
    // Latest enqueued node; producers swap themselves in here.
    tail: CachePadded<AtomicPtr<Node<T>>>,

    // Next node to consume; published by the empty-transition producer
    // or by the consumer's sentinel.
    head: CachePadded<AtomicPtr<Node<T>>>,
}

// SAFETY: TaskQueue is Send + Sync for T: Send because:
// - nodes are heap-allocated and ownership transfers through the atomic
//   tail/head/next pointers with Release/Acquire ordering
// - a node is freed only by the single consumer, and only after it is
//   unlinked (tail CAS) or its successor is visible (next != null), so a
//   producer's pending `prev.next` store always targets a live node
unsafe impl<T: Send> Send for TaskQueue<T> {}
unsafe impl<T: Send> Sync for TaskQueue<T> {}

impl<T> TaskQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Enqueue `item`. Multi-producer safe.
    pub(crate) fn push(&self, item: T) -> Pushed {
        let node = Box::into_raw(Node::new(Some(item)));
        let prev = self.tail.swap(node, Ordering::AcqRel);
        if prev.is_null() {
            // List was empty: this node is also the batch head.
            self.head.store(node, Ordering::Release);
            Pushed {
                was_empty: true,
                token: node as usize,
            }
        } else {
            // SAFETY: `prev` cannot have been freed. The consumer frees a
            // node only after unlinking it from `tail` (which our swap
            // just prevented) or after observing its `next`, which is the
            // very store below.
            unsafe { (*prev).next.store(node, Ordering::Release) };
            Pushed {
                was_empty: false,
                token: node as usize,
            }
        }
    }

    /// True if the batch head is still the node identified by `token`.
    ///
    /// Used by the wake alarm: the pointer value is only compared, never
    /// dereferenced, so a stale token is harmless.
    pub(crate) fn head_matches(&self, token: usize) -> bool {
        self.head.load(Ordering::Acquire) as usize == token
    }

    /// Install the batch sentinel if the list is empty. Consumer only.
    ///
    /// Guarantees the following [`drain`](Self::drain) finds at least one
    /// consumable node without waiting on producers.
    pub(crate) fn close_batch(&self, spare: &mut SpareNode<T>) {
        let node = Box::into_raw(spare.0.take().unwrap_or_else(|| Node::new(None)));
        if self
            .tail
            .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.head.store(node, Ordering::Release);
        } else {
            // Batch already has a head (or will momentarily); keep the
            // sentinel for the next iteration.
            // SAFETY: the CAS failed, so the node was never published.
            spare.0 = Some(unsafe { Box::from_raw(node) });
        }
    }

    /// Consume the current batch (and any nodes that arrive while
    /// draining). Consumer only; must follow [`close_batch`](Self::close_batch).
    pub(crate) fn drain(&self, spare: &mut SpareNode<T>, mut f: impl FnMut(T)) {
        // The head may trail a producer's tail swap by an instant.
        let mut node = loop {
            let p = self.head.load(Ordering::Acquire);
            if !p.is_null() {
                break p;
            }
            std::hint::spin_loop();
        };

        loop {
            // SAFETY: `node` came from head/next and is owned by the
            // consumer until freed below.
            let mut next = unsafe { (*node).next.load(Ordering::Acquire) };
            if next.is_null() {
                // Possibly the last node: detach the batch.
                self.head.store(ptr::null_mut(), Ordering::Release);
                if self
                    .tail
                    .compare_exchange(node, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // A producer swapped tail first; its next store is
                    // imminent.
                    next = loop {
                        // SAFETY: the racing producer holds `node` as its
                        // `prev` and will not free it; see push().
                        let n = unsafe { (*node).next.load(Ordering::Acquire) };
                        if !n.is_null() {
                            break n;
                        }
                        std::hint::spin_loop();
                    };
                }
            }

            // SAFETY: `node` is unlinked (or its successor captured);
            // no other thread can reach it anymore.
            let mut boxed = unsafe { Box::from_raw(node) };
            match boxed.item.take() {
                Some(item) => f(item),
                None => {
                    // Sentinel: recycle instead of reallocating each batch.
                    if spare.0.is_none() {
                        boxed.next.store(ptr::null_mut(), Ordering::Relaxed);
                        spare.0 = Some(boxed);
                    }
                }
            }

            node = next;
            if node.is_null() {
                // A new batch may have begun while we were unlinking.
                node = self.head.load(Ordering::Acquire);
                if node.is_null() {
                    break;
                }
            }
        }
    }
}

impl<T> TaskQueue<T> {
    /// Free every queued node without running the tasks. Only valid once
    /// all producers are quiesced; tasks that never reached the consumer
    /// may close reference cycles (task -> owner -> queue), so teardown
    /// must not rely on `Drop` alone.
    pub(crate) fn purge(&self) {
        let mut node = self.head.load(Ordering::Acquire);
        if node.is_null() {
            node = self.tail.load(Ordering::Acquire);
        }
        while !node.is_null() {
            // SAFETY: no producers or consumers remain; every published
            // node is a Box::into_raw allocation reachable exactly once
            // through head/next.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
        self.head.store(ptr::null_mut(), Ordering::Relaxed);
        self.tail.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

impl<T> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        self.purge();
    }
}
