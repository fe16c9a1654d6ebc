// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backing chunks and the per-size chunk cache.
//!
//! A [`Chunk`] is a fixed-capacity byte region with an atomic reference
//! count initialised to `capacity + 1`. The `+ 1` is the pool-ownership
//! token; every buffer slice carved from the chunk accounts for its
//! reserved bytes. When the count reaches zero the chunk returns to its
//! owning [`ChunkCache`] (count reset) or is freed if the cache is gone or
//! the chunk was a one-off.
//!
//! The cache-to-chunk edge is an owning free list; the chunk-to-cache
//! back edge is a non-owning `Weak` used only on the final release, so
//! there is no reference cycle.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use crate::rt::ObjectCache;

/// Page alignment used for direct (OS-page-backed) chunks.
const PAGE_ALIGN: usize = 4096;

/// Fixed-capacity backing buffer with byte-granular reference counting.
pub(crate) struct Chunk {
    data: NonNull<u8>,
    layout: Layout,
    capacity: u32,
    rc: AtomicI32,
    cache: Weak<ChunkCache>,
}

// SAFETY: Chunk is Send + Sync because:
// - the byte region is partitioned between slices by the pool's state-word
//   protocol; a given byte range has a single writer before publication
// - the reference count and the final-release path are atomic
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Allocate a chunk owned by `cache`. Aborts on allocation failure.
    pub(crate) fn alloc(cache: Weak<ChunkCache>, capacity: u32, direct: bool) -> NonNull<Chunk> {
        assert!(capacity > 0, "chunk capacity must be > 0");
        let align = if direct { PAGE_ALIGN } else { 8 };
        // Align is a power of two and capacity fits i32, so this cannot
        // fail.
        let layout = Layout::from_size_align(capacity as usize, align).expect("chunk layout");

        // SAFETY: layout has non-zero size (capacity > 0).
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(data) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };

        let chunk = Box::new(Chunk {
            data,
            layout,
            capacity,
            rc: AtomicI32::new(capacity as i32 + 1),
            cache,
        });
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(chunk)) }
    }

    /// Allocate a one-off chunk with no owning cache; it is freed when its
    /// count reaches zero.
    pub(crate) fn alloc_orphan(capacity: u32, direct: bool) -> NonNull<Chunk> {
        Self::alloc(Weak::new(), capacity, direct)
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    #[cfg(test)]
    pub(crate) fn refcount(ptr: NonNull<Chunk>) -> i32 {
        // SAFETY: test-only; caller keeps the chunk alive.
        unsafe { ptr.as_ref() }.rc.load(Ordering::Acquire)
    }

    /// Release `bytes` of the chunk's claim. On the final release the
    /// chunk returns to its cache (count reset to `capacity + 1`) or is
    /// freed.
    pub(crate) fn release(ptr: NonNull<Chunk>, bytes: i32) {
        debug_assert!(bytes >= 0);
        loop {
            // SAFETY: the caller holds part of the chunk's claim, so the
            // chunk is alive for the duration of this call.
            let rc = unsafe { ptr.as_ref() }.rc.load(Ordering::Relaxed);
            debug_assert!(rc >= bytes, "over-release: rc={rc} bytes={bytes}");
            let cas = unsafe { ptr.as_ref() }.rc.compare_exchange(
                rc,
                rc - bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            if cas.is_err() {
                continue;
            }
            if rc == bytes {
                // Last reference: recycle or free.
                let cache = unsafe { ptr.as_ref() }.cache.upgrade();
                match cache {
                    Some(cache) => {
                        let reset = unsafe { ptr.as_ref() }.capacity as i32 + 1;
                        unsafe { ptr.as_ref() }.rc.store(reset, Ordering::Release);
                        cache.put_back(CachedChunk(ptr));
                    }
                    None => {
                        // SAFETY: count is zero and the cache is gone;
                        // nothing else can reach this chunk.
                        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
                    }
                }
            }
            return;
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: data/layout come from the alloc_zeroed in Chunk::alloc.
        unsafe { dealloc(self.data.as_ptr(), self.layout) };
    }
}

/// Owning handle for a chunk parked in (or in transit to) a cache.
///
/// Dropping it frees the chunk, which makes cache overflow and cache
/// teardown the same code path.
pub(crate) struct CachedChunk(pub(crate) NonNull<Chunk>);

// SAFETY: ownership of the chunk allocation moves with the handle.
unsafe impl Send for CachedChunk {}

impl CachedChunk {
    /// Take the raw chunk out without freeing it.
    pub(crate) fn into_ptr(self) -> NonNull<Chunk> {
        let ptr = self.0;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for CachedChunk {
    fn drop(&mut self) {
        // SAFETY: the handle owns the chunk; see CachedChunk docs.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

/// Bounded free-list of equally sized chunks.
///
/// `get` pops or allocates; `put_back` pushes or drops. The cache hands
/// every chunk a `Weak` back-handle at allocation so final releases find
/// their way home.
pub(crate) struct ChunkCache {
    free: ObjectCache<CachedChunk>,
    chunk_size: u32,
    direct: bool,
    initial_size: usize,
    weak_self: Weak<ChunkCache>,
}

impl ChunkCache {
    pub(crate) fn new(
        direct: bool,
        chunk_size: u32,
        max_size: usize,
        initial_size: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ChunkCache>| {
            let cache = Self {
                free: ObjectCache::new(max_size.max(1)),
                chunk_size,
                direct,
                initial_size,
                weak_self: weak.clone(),
            };
            for _ in 0..initial_size {
                let chunk = Chunk::alloc(weak.clone(), chunk_size, direct);
                let _ = cache.free.put(CachedChunk(chunk));
            }
            cache
        })
    }

    pub(crate) fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    #[allow(dead_code)]
    pub(crate) fn initial_size(&self) -> usize {
        self.initial_size
    }

    /// Pop a recycled chunk or allocate a fresh one.
    pub(crate) fn get(&self) -> NonNull<Chunk> {
        match self.free.get() {
            Some(cached) => cached.into_ptr(),
            None => Chunk::alloc(self.weak_self.clone(), self.chunk_size, self.direct),
        }
    }

    /// Return a chunk to the free list; drops it if the list is full.
    pub(crate) fn put_back(&self, chunk: CachedChunk) {
        if self.free.put(chunk).is_err() {
            log::trace!("ChunkCache[{}]: full, dropping chunk", self.chunk_size);
        }
    }

    /// Number of chunks currently parked.
    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }

    /// Drop every parked chunk; returns how many were freed.
    pub(crate) fn clear(&self) -> usize {
        let drained = self.free.clear();
        log::debug!("ChunkCache[{}]: drained {} chunks", self.chunk_size, drained);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefill_and_reuse() {
        let cache = ChunkCache::new(false, 1024, 8, 2);
        assert_eq!(cache.len(), 2);

        let a = cache.get();
        assert_eq!(cache.len(), 1);
        assert_eq!(Chunk::refcount(a), 1025);

        // Full release sends it back.
        Chunk::release(a, 1025);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_allocates_on_empty() {
        let cache = ChunkCache::new(false, 512, 4, 0);
        assert_eq!(cache.len(), 0);
        let c = cache.get();
        assert_eq!(Chunk::refcount(c), 513);
        Chunk::release(c, 513);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_refcount_reset_on_return() {
        let cache = ChunkCache::new(false, 256, 4, 1);
        let c = cache.get();
        Chunk::release(c, 100);
        Chunk::release(c, 157);
        // 257 total released: back in the cache with a fresh count.
        assert_eq!(cache.len(), 1);
        let again = cache.get();
        assert_eq!(Chunk::refcount(again), 257);
        Chunk::release(again, 257);
    }

    #[test]
    fn test_orphan_chunk_freed() {
        let c = Chunk::alloc_orphan(128, false);
        assert_eq!(Chunk::refcount(c), 129);
        // Full release with no cache frees the chunk (no crash, no leak
        // under sanitizers).
        Chunk::release(c, 129);
    }

    #[test]
    fn test_clear_drains() {
        let cache = ChunkCache::new(false, 64, 8, 3);
        assert_eq!(cache.clear(), 3);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_release_after_cache_dropped_frees() {
        let cache = ChunkCache::new(false, 64, 4, 0);
        let c = cache.get();
        drop(cache);
        // The weak back-handle is dead; the final release must free.
        Chunk::release(c, 65);
    }

    #[test]
    fn test_direct_chunks_page_aligned() {
        let cache = ChunkCache::new(true, 4096, 2, 1);
        let c = cache.get();
        // SAFETY: chunk alive, base is the allocation start.
        let addr = unsafe { c.as_ref() }.base() as usize;
        assert_eq!(addr % 4096, 0);
        Chunk::release(c, 4097);
    }
}
