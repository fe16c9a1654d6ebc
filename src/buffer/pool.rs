// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free bump allocator over recyclable chunks.
//!
//! The pool slices buffers out of a current chunk, tracked by a single
//! 32-bit state word: `state % chunk_size` is the offset inside the
//! chunk, and the rest of the word is a monotonically growing byte
//! cursor, which makes the compare-and-swap ABA-safe. The sentinel `-1`
//! means "switching chunks, retry"; chunk rotation is serialised by
//! winning the CAS to `-1`.
//!
//! Requests that cannot be carved from the current chunk either rotate to
//! a fresh one, take a dedicated cache chunk (`size == chunk_size`), or
//! allocate a one-off oversized chunk that dies with its slice. Best for
//! buffers with a short life time.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::sync::Arc;

use super::chunk::{Chunk, ChunkCache};
use super::slice::PooledBuffer;

/// Slab pool yielding reference-counted buffer slices.
pub struct BufferPool {
    cache: Arc<ChunkCache>,
    chunk_size: i32,
    direct: bool,

    // Offset-within-chunk in the low bits (mod chunk_size), monotonic
    // cursor otherwise; -1 while the chunk is being rotated.
    state: AtomicI32,

    // Current chunk; replaced only while state == -1.
    chunk: AtomicPtr<Chunk>,
}

// SAFETY: BufferPool is Send + Sync because:
// - the state word serialises all chunk rotation (the -1 lock) and makes
//   fast-path reservations ABA-safe (monotonic cursor)
// - the chunk pointer is replaced only by the rotation owner and read
//   before a state CAS that fails if any rotation intervened
// - chunk lifetime is governed by its byte-granular refcount, which
//   pre-pays every byte the fast path can hand out
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Pool with heap-backed 64 KiB-style chunks and default cache bounds.
    pub fn new(chunk_size: u32) -> Self {
        Self::with_config(chunk_size, true, 128, 2)
    }

    pub fn with_config(
        chunk_size: u32,
        direct: bool,
        cache_max: usize,
        cache_initial: usize,
    ) -> Self {
        assert!(chunk_size > 0 && chunk_size < i32::MAX as u32);
        let cache = ChunkCache::new(direct, chunk_size, cache_max, cache_initial);
        let chunk = cache.get();
        Self {
            cache,
            chunk_size: chunk_size as i32,
            direct,
            state: AtomicI32::new(0),
            chunk: AtomicPtr::new(chunk.as_ptr()),
        }
    }

    /// Allocate exactly `size` bytes.
    pub fn alloc(&self, size: usize) -> PooledBuffer {
        self.alloc_min(size, size)
    }

    /// Allocate between `min_size` and `size` bytes; the caller accepts
    /// any length in that range. Slices are four-byte aligned.
    pub fn alloc_min(&self, size: usize, min_size: usize) -> PooledBuffer {
        assert!(size > 0 && min_size > 0 && min_size <= size);
        assert!(size <= (i32::MAX - 4) as usize);
        let size_i = size as i32;
        let min_i = min_size as i32;
        let cs = self.chunk_size;

        loop {
            let state = self.state.load(Ordering::Acquire);
            if state == -1 {
                // Another thread is rotating chunks.
                std::hint::spin_loop();
                continue;
            }

            let offs = state % cs;
            let space = cs - offs;
            let reserved = (size_i + 3) & !3;

            if reserved < space {
                debug_assert!(offs + reserved <= cs);

                let mut new_state = state.wrapping_add(reserved);
                if new_state <= 0 {
                    new_state = offs + reserved;
                }

                let chunk = self.chunk.load(Ordering::Acquire);
                if self
                    .state
                    .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                // SAFETY: the CAS succeeded against the state observed
                // after the chunk load, so no rotation replaced (or could
                // have released) the chunk in between; the reservation is
                // pre-paid by the chunk's initial count.
                let chunk = unsafe { NonNull::new_unchecked(chunk) };
                return PooledBuffer::new(chunk, offs as u32, size, reserved);
            } else if reserved == space {
                // Exact fit: this slice finishes the chunk.
                if self
                    .state
                    .compare_exchange(state, -1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                // SAFETY: we hold the rotation lock; the pointer is the
                // live current chunk.
                let old = unsafe { NonNull::new_unchecked(self.chunk.load(Ordering::Relaxed)) };
                Chunk::release(old, 1);
                let fresh = self.cache.get();
                self.chunk.store(fresh.as_ptr(), Ordering::Release);

                let mut new_state = state.wrapping_add(space);
                if new_state <= 0 {
                    new_state = offs + space;
                }
                self.state.store(new_state, Ordering::Release);

                return PooledBuffer::new(old, offs as u32, size, reserved);
            } else if min_i <= space {
                // size > space but the caller accepts a shorter slice.
                if self
                    .state
                    .compare_exchange(state, -1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                // SAFETY: rotation lock held (as above).
                let old = unsafe { NonNull::new_unchecked(self.chunk.load(Ordering::Relaxed)) };
                Chunk::release(old, 1);
                let fresh = self.cache.get();
                self.chunk.store(fresh.as_ptr(), Ordering::Release);

                let mut new_state = state.wrapping_add(space);
                if new_state <= 0 {
                    new_state = offs + space;
                }
                self.state.store(new_state, Ordering::Release);

                return PooledBuffer::new(old, offs as u32, space as usize, space);
            } else if size_i < cs {
                // Does not fit in the remainder; rotate and carve from a
                // fresh chunk.
                if self
                    .state
                    .compare_exchange(state, -1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                return self.alloc_new_locked(state, space, size, reserved);
            } else if size_i == cs {
                // Whole-chunk request: take a dedicated chunk, leave the
                // current one untouched. The pool token is released up
                // front so the chunk recycles when the slice dies.
                let fresh = self.cache.get();
                let buf = PooledBuffer::new(fresh, 0, size, cs);
                Chunk::release(fresh, 1);
                return buf;
            } else if min_i <= cs {
                // min_size fits a chunk even though size does not.
                if self
                    .state
                    .compare_exchange(state, -1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                let rs = (min_i + 3) & !3;
                debug_assert!(rs <= cs);
                return self.alloc_new_locked(state, space, min_size, rs);
            } else {
                // Jumbo request: one-off chunk with no owning cache, dies
                // with the slice.
                let chunk = Chunk::alloc_orphan(size as u32, self.direct);
                let buf = PooledBuffer::new(chunk, 0, size, size_i);
                Chunk::release(chunk, 1);
                return buf;
            }
        }
    }

    /// Rotate to a fresh chunk and carve the slice from its start.
    /// Caller must hold the rotation lock (`state == -1`).
    fn alloc_new_locked(
        &self,
        state: i32,
        space: i32,
        size: usize,
        reserved: i32,
    ) -> PooledBuffer {
        // SAFETY: rotation lock held; pointer is the live current chunk.
        let old = unsafe { NonNull::new_unchecked(self.chunk.load(Ordering::Relaxed)) };
        // The tail of the outgoing chunk is abandoned: its unused bytes
        // plus the pool token.
        Chunk::release(old, space + 1);

        let fresh = self.cache.get();
        self.chunk.store(fresh.as_ptr(), Ordering::Release);

        let mut new_state = state.wrapping_add(space);
        debug_assert_eq!(new_state % self.chunk_size, 0);
        new_state = new_state.wrapping_add(reserved);
        if new_state < 0 {
            new_state = reserved;
        }
        self.state.store(new_state, Ordering::Release);

        PooledBuffer::new(fresh, 0, size, reserved)
    }

    /// Drain the backing chunk cache; returns how many chunks were freed.
    pub fn clear(&self) -> usize {
        self.cache.clear()
    }

    /// Number of chunks parked in the backing cache.
    pub fn cached_chunks(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> i32 {
        self.state.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, v: i32) {
        self.state.store(v, Ordering::SeqCst);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::Relaxed);
        debug_assert_ne!(state, -1, "pool dropped mid-rotation");
        let offs = state % self.chunk_size;
        let space = self.chunk_size - offs;
        // SAFETY: exclusive access in Drop; the pointer is the live
        // current chunk. Releasing the unallocated tail plus the token
        // hands the chunk to outstanding slices, or straight back to the
        // cache when there are none.
        let chunk = unsafe { NonNull::new_unchecked(self.chunk.load(Ordering::Relaxed)) };
        Chunk::release(chunk, space + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const CS: u32 = 1024;

    fn round4(n: usize) -> usize {
        (n + 3) & !3
    }

    #[test]
    fn test_alloc_basic_shape() {
        let pool = BufferPool::with_config(CS, false, 8, 1);
        let buf = pool.alloc(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.reserved(), round4(100));
        assert_eq!(buf.offset(), 0);

        let next = pool.alloc(1);
        assert_eq!(next.offset(), 104);
        assert_eq!(next.reserved(), 4);
    }

    #[test]
    fn test_sequential_rotation_keeps_cache_stable() {
        let pool = BufferPool::with_config(CS, false, 8, 2);
        // Pool took one chunk at construction.
        assert_eq!(pool.cached_chunks(), 1);

        for _ in 0..50 {
            let buf = pool.alloc(600);
            drop(buf);
        }
        // Every rotated-out chunk returned once its slices dropped.
        assert_eq!(pool.cached_chunks(), 1);
    }

    #[test]
    fn test_exact_fit_finishes_chunk() {
        let pool = BufferPool::with_config(CS, false, 8, 1);
        let a = pool.alloc(CS as usize - 256);
        assert_eq!(a.offset(), 0);

        // Exactly the remaining 256 bytes.
        let b = pool.alloc(256);
        assert_eq!(b.offset(), (CS - 256) as u32);
        assert_eq!(b.reserved(), 256usize);

        // Fresh chunk afterwards.
        let c = pool.alloc(8);
        assert_eq!(c.offset(), 0);
    }

    #[test]
    fn test_short_fit_when_caller_accepts_less() {
        let pool = BufferPool::with_config(CS, false, 8, 1);
        let _a = pool.alloc(CS as usize - 100);

        // 100 bytes left; ask for 400 but accept 50.
        let b = pool.alloc_min(400, 50);
        assert_eq!(b.len(), 100);
        assert_eq!(b.reserved(), 100usize);

        // The pool rotated; next alloc starts a fresh chunk.
        let c = pool.alloc(8);
        assert_eq!(c.offset(), 0);
    }

    #[test]
    fn test_rotation_when_no_fit() {
        let pool = BufferPool::with_config(CS, false, 8, 1);
        let _a = pool.alloc(CS as usize - 100);

        // 100 left, need 500, accept nothing less.
        let b = pool.alloc(500);
        assert_eq!(b.offset(), 0);
        assert_eq!(b.reserved(), 500usize);
        assert_eq!(pool.state(), CS as i32 + 500);
    }

    #[test]
    fn test_whole_chunk_takes_dedicated_chunk() {
        let pool = BufferPool::with_config(CS, false, 8, 2);
        let state_before = pool.state();

        let buf = pool.alloc(CS as usize);
        assert_eq!(buf.len(), CS as usize);
        assert_eq!(buf.reserved(), CS as usize);
        assert_eq!(buf.offset(), 0);

        // Current chunk untouched.
        assert_eq!(pool.state(), state_before);

        let cached = pool.cached_chunks();
        drop(buf);
        // Dedicated chunk recycled into the cache.
        assert_eq!(pool.cached_chunks(), cached + 1);
    }

    #[test]
    fn test_oversize_with_small_min_comes_from_fresh_chunk() {
        let pool = BufferPool::with_config(CS, false, 8, 1);
        // Leave 20 bytes in the current chunk so min_size cannot fit.
        let _fill = pool.alloc(CS as usize - 20);

        let buf = pool.alloc_min(3 * CS as usize, 30);
        assert_eq!(buf.len(), 30);
        assert_eq!(buf.reserved(), round4(30));
        assert_eq!(buf.offset(), 0);
    }

    #[test]
    fn test_fresh_chunk_short_fit_takes_whole_remainder() {
        let pool = BufferPool::with_config(CS, false, 8, 1);
        // A fresh chunk with an oversize request and a tiny minimum gets
        // the whole remaining space.
        let buf = pool.alloc_min(3 * CS as usize, 30);
        assert_eq!(buf.len(), CS as usize);
        assert_eq!(buf.reserved(), CS as usize);
    }

    #[test]
    fn test_jumbo_one_off_chunk() {
        let pool = BufferPool::with_config(CS, false, 8, 1);
        let cached = pool.cached_chunks();

        let buf = pool.alloc(3 * CS as usize);
        assert_eq!(buf.len(), 3 * CS as usize);
        assert_eq!(buf.reserved(), 3 * CS as usize);

        drop(buf);
        // One-off chunks never enter the cache.
        assert_eq!(pool.cached_chunks(), cached);
    }

    #[test]
    fn test_wraparound_rebase() {
        let pool = BufferPool::with_config(CS, false, 8, 1);
        // A state at offset 0, close enough to i32::MAX to wrap.
        let high = i32::MAX - 1023; // multiple of 1024
        assert_eq!(high % CS as i32, 0);
        pool.force_state(high);

        let a = pool.alloc(512);
        assert_eq!(a.offset(), 0);

        // 512 left: exact fit path, state + space overflows and rebases.
        let b = pool.alloc(512);
        assert_eq!(b.offset(), 512);
        assert!(pool.state() >= 0, "state must rebase, not stay wrapped");
        assert_eq!(pool.state() % CS as i32, 0);

        let c = pool.alloc(16);
        assert_eq!(c.offset(), 0);
    }

    #[test]
    fn test_concurrent_stress_returns_chunks() {
        const THREADS: usize = 8;
        const ITERS: usize = 2_000;

        let pool = Arc::new(BufferPool::with_config(CS, false, 256, 2));
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                // Small deterministic per-thread generator.
                let mut x = (t as u32).wrapping_mul(2654435761).wrapping_add(1);
                for _ in 0..ITERS {
                    x = x.wrapping_mul(1664525).wrapping_add(1013904223);
                    let size = 1 + (x as usize % (3 * CS as usize));
                    let buf = pool.alloc_min(size, 1);
                    assert!(!buf.is_empty());
                    assert!(buf.len() <= size);
                    drop(buf);
                }
            }));
        }
        for h in handles {
            h.join().expect("stress thread");
        }

        // All slices released: chunks are either parked in the cache or
        // held (one) by the pool itself; allocation still works.
        assert!(pool.cached_chunks() >= 1);
        let buf = pool.alloc(64);
        assert_eq!(buf.len(), 64);
    }
}
