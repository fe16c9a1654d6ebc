// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-session outbound queue.
//!
//! Appends are linearised by the queue lock; dequeueing is performed only
//! by the writer job currently in flight (the `writing` flag admits one
//! at a time). `armed` tracks whether write interest is enabled or an
//! enable task is queued; `closed` refuses further sends and marks that
//! the session closes once the queue drains.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::buffer::PooledBuffer;

/// Upper bound on buffers gathered into one vectored write.
pub(crate) const MAX_WRITEV: usize = 32;

/// Completion gate for `send_data_sync`.
pub(crate) struct SyncWaiter {
    state: Mutex<Option<bool>>,
    cv: Condvar,
}

impl SyncWaiter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    /// Mark the wait complete; first caller wins.
    pub(crate) fn complete(&self, ok: bool) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(ok);
            self.cv.notify_all();
        }
    }

    /// Block until the buffer is fully written (`true`) or the session
    /// closed first (`false`).
    pub(crate) fn wait(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if let Some(ok) = *state {
                return ok;
            }
            self.cv.wait(&mut state);
        }
    }
}

pub(crate) struct OutEntry {
    pub(crate) buf: PooledBuffer,
    pub(crate) pos: usize,
    pub(crate) waiter: Option<Arc<SyncWaiter>>,
}

/// Lock-guarded outbound state.
pub(crate) struct Outbound {
    pub(crate) queue: VecDeque<OutEntry>,
    pub(crate) armed: bool,
    pub(crate) writing: bool,
    pub(crate) closed: bool,
    pub(crate) queued_bytes: usize,
}

impl Outbound {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            armed: false,
            writing: false,
            closed: false,
            queued_bytes: 0,
        }
    }

    pub(crate) fn push(&mut self, buf: PooledBuffer, waiter: Option<Arc<SyncWaiter>>) {
        self.queued_bytes += buf.len();
        self.queue.push_back(OutEntry {
            buf,
            pos: 0,
            waiter,
        });
    }

    /// Claim responsibility for enabling write interest; true at most
    /// once per idle period.
    pub(crate) fn try_arm(&mut self) -> bool {
        if !self.armed && !self.writing {
            self.armed = true;
            true
        } else {
            false
        }
    }

    /// Consume `n` written bytes from the front of the queue, completing
    /// sync waiters whose buffers drained.
    pub(crate) fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.queue.front_mut() else {
                debug_assert!(false, "advance past end of outbound queue");
                return;
            };
            let remaining = front.buf.len() - front.pos;
            if n >= remaining {
                n -= remaining;
                self.queued_bytes -= front.buf.len();
                if let Some(entry) = self.queue.pop_front() {
                    if let Some(waiter) = entry.waiter {
                        waiter.complete(true);
                    }
                }
            } else {
                front.pos += n;
                return;
            }
        }
    }

    /// Drop everything still queued, failing sync waiters.
    pub(crate) fn fail_pending(&mut self) {
        while let Some(entry) = self.queue.pop_front() {
            if let Some(waiter) = entry.waiter {
                waiter.complete(false);
            }
        }
        self.queued_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    fn buf(pool: &BufferPool, n: usize) -> PooledBuffer {
        pool.alloc(n)
    }

    #[test]
    fn test_advance_partial_and_full() {
        let pool = BufferPool::with_config(4096, false, 8, 1);
        let mut out = Outbound::new();
        out.push(buf(&pool, 100), None);
        out.push(buf(&pool, 50), None);
        assert_eq!(out.queued_bytes, 150);

        out.advance(30);
        assert_eq!(out.queue.len(), 2);
        assert_eq!(out.queue.front().map(|e| e.pos), Some(30));

        out.advance(70);
        assert_eq!(out.queue.len(), 1);
        assert_eq!(out.queued_bytes, 50);

        out.advance(50);
        assert!(out.queue.is_empty());
        assert_eq!(out.queued_bytes, 0);
    }

    #[test]
    fn test_advance_completes_waiters_in_order() {
        let pool = BufferPool::with_config(4096, false, 8, 1);
        let mut out = Outbound::new();
        let w1 = SyncWaiter::new();
        let w2 = SyncWaiter::new();
        out.push(buf(&pool, 10), Some(Arc::clone(&w1)));
        out.push(buf(&pool, 10), Some(Arc::clone(&w2)));

        out.advance(10);
        assert!(w1.wait());

        out.advance(10);
        assert!(w2.wait());
    }

    #[test]
    fn test_fail_pending_releases_waiters() {
        let pool = BufferPool::with_config(4096, false, 8, 1);
        let mut out = Outbound::new();
        let w = SyncWaiter::new();
        out.push(buf(&pool, 10), Some(Arc::clone(&w)));

        out.fail_pending();
        assert!(!w.wait());
        assert!(out.queue.is_empty());
    }

    #[test]
    fn test_try_arm_once_per_idle() {
        let mut out = Outbound::new();
        assert!(out.try_arm());
        assert!(!out.try_arm());
        out.armed = false;
        out.writing = true;
        assert!(!out.try_arm());
        out.writing = false;
        assert!(out.try_arm());
    }
}
