// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine and emitter configuration.
//!
//! [`EngineConfig`] controls engine-wide behavior: worker thread count,
//! input block sizing and cache bounds, and the shared output buffer pool.
//! [`EmitterConfig`] carries per-acceptor/per-connector overrides; a value
//! of `0` means "use the engine default".
//!
//! # Example
//!
//! ```
//! use strand::EngineConfig;
//!
//! let config = EngineConfig {
//!     thread_pool_threads: 8,
//!     input_queue_block_size: 64 * 1024,
//!     ..Default::default()
//! };
//! assert_eq!(config.thread_pool_threads, 8);
//! ```

use std::thread;

/// Engine-wide configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Name used for thread naming and log context.
    pub name: String,

    /// Worker thread count (0 = `max(4, available CPUs)`).
    pub thread_pool_threads: usize,

    /// Default block size for per-session input buffers, in bytes.
    pub input_queue_block_size: u32,

    /// Chunks pre-allocated per input block cache.
    pub input_queue_cache_initial_size: usize,

    /// Maximum chunks retained per input block cache
    /// (0 = `3 x thread_pool_threads`).
    pub input_queue_cache_max_size: usize,

    /// Back buffers with page-aligned allocations instead of plain heap
    /// memory.
    pub use_direct_buffers: bool,

    /// Chunk size of the shared output buffer pool.
    pub output_pool_chunk_size: u32,

    /// Chunks pre-allocated in the output pool's cache.
    pub output_pool_cache_initial_size: usize,

    /// Maximum chunks retained by the output pool's cache.
    pub output_pool_cache_max_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "strand".to_string(),
            thread_pool_threads: 0,
            input_queue_block_size: 32 * 1024,
            input_queue_cache_initial_size: 2,
            input_queue_cache_max_size: 0,
            use_direct_buffers: true,
            output_pool_chunk_size: 64 * 1024,
            output_pool_cache_initial_size: 2,
            output_pool_cache_max_size: 128,
        }
    }
}

impl EngineConfig {
    /// Resolve the worker thread count: `max(4, CPUs)` when unset.
    pub fn resolved_threads(&self) -> usize {
        if self.thread_pool_threads != 0 {
            return self.thread_pool_threads;
        }
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        cpus.max(4)
    }

    /// Resolve the input cache bound: `3 x threads` when unset.
    pub fn resolved_input_cache_max(&self) -> usize {
        if self.input_queue_cache_max_size != 0 {
            self.input_queue_cache_max_size
        } else {
            self.resolved_threads() * 3
        }
    }
}

/// Per-emitter configuration overrides.
///
/// Zero-valued fields fall back to the owning engine's [`EngineConfig`].
#[derive(Clone, Copy, Debug)]
pub struct EmitterConfig {
    /// Input block size override for sessions of this emitter.
    pub input_queue_block_size: u32,

    /// Input block cache prefill override.
    pub input_queue_cache_initial_size: usize,

    /// Input block cache bound override.
    pub input_queue_cache_max_size: usize,

    /// Buffer backing override; `None` uses the engine default. Applies
    /// when this emitter is the first to create the cache for its block
    /// size.
    pub use_direct_buffers: Option<bool>,

    /// Disable Nagle's algorithm on accepted/connected sockets.
    pub tcp_no_delay: bool,

    /// Set `SO_REUSEADDR` before binding (acceptors only).
    pub reuse_addr: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            input_queue_block_size: 0,
            input_queue_cache_initial_size: 0,
            input_queue_cache_max_size: 0,
            use_direct_buffers: None,
            tcp_no_delay: true,
            reuse_addr: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.input_queue_block_size, 32 * 1024);
        assert_eq!(c.output_pool_chunk_size, 64 * 1024);
        assert!(c.use_direct_buffers);
        assert!(c.resolved_threads() >= 4);
    }

    #[test]
    fn test_cache_max_follows_threads() {
        let c = EngineConfig {
            thread_pool_threads: 6,
            ..Default::default()
        };
        assert_eq!(c.resolved_input_cache_max(), 18);

        let c = EngineConfig {
            thread_pool_threads: 6,
            input_queue_cache_max_size: 5,
            ..Default::default()
        };
        assert_eq!(c.resolved_input_cache_max(), 5);
    }

    #[test]
    fn test_emitter_defaults() {
        let e = EmitterConfig::default();
        assert_eq!(e.input_queue_block_size, 0);
        assert!(e.tcp_no_delay);
        assert!(e.reuse_addr);
    }
}
