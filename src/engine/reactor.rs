// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reactor loop and engine front door.
//!
//! One dedicated thread (the caller of [`Engine::run`]) owns the mio
//! `Poll`, drains readiness events, and interleaves them with the
//! lock-free queue of reactor-thread tasks. Per-session work runs on the
//! worker pool; the reactor never blocks on application code.
//!
//! ```text
//!  +--------------------------------------------------------------+
//!  |                      reactor thread                           |
//!  |   poll (selectNow while active_readers > 0, else blocking)    |
//!  |   close task batch (sentinel) -> dispatch ready tokens        |
//!  |   drain task batch -> drain deferred list                     |
//!  +-------------------------------|------------------------------+
//!          ^  Waker (alarm task)   v  read/write/accept jobs
//!  +-------------------------------+------------------------------+
//!  |                        worker pool                            |
//!  +--------------------------------------------------------------+
//! ```
//!
//! Shutdown is two-hop: a worker task quiesces every emitter (this may
//! block, so it must not run on the reactor), then a reactor task closes
//! every session and flips the loop into the STOPPING state, which drains
//! with `selectNow` until no token remains registered.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::{BufferPool, ChunkCache, PooledBuffer};
use crate::config::{EmitterConfig, EngineConfig};
use crate::emitter::{Acceptor, AcceptorIo, Connector, ConnectorIo};
use crate::engine::dispatch::{Attachment, BoxedTask, Ready, SelectorCtx, SelectorTask};
use crate::error::{EngineError, Result};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::rt::{PoolRunnable, SpareNode, TaskQueue, ThreadPool};
use crate::session::Session;

/// Token reserved for the poll waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// Maximum events processed per poll.
const MAX_EVENTS: usize = 128;

/// Recyclable worker task that wakes the reactor when a batch opens.
///
/// Compares the queue head against the node that triggered the
/// empty-to-nonempty transition; if the batch has not been consumed yet,
/// the multiplexer is woken. Afterwards the alarm parks itself back into
/// the engine's alarm cell for reuse.
pub(crate) struct SelectorAlarm {
    cmp: AtomicUsize,
    shared: Weak<Shared>,
}

impl PoolRunnable for SelectorAlarm {
    fn run_in_pool(self: Box<Self>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.tasks.head_matches(self.cmp.load(Ordering::Acquire)) {
            if let Err(e) = shared.waker.wake() {
                log::warn!("{}: waker failed: {}", shared.config.name, e);
            }
        }
        self.cmp.store(0, Ordering::Relaxed);

        let ptr = Box::into_raw(self);
        if shared
            .alarm
            .compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Cell occupied by a younger alarm; this one retires.
            // SAFETY: ptr came from Box::into_raw above and was not
            // published anywhere.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

/// Emitter registry entry; entries stay registered until the engine
/// stops so a later `stop()` can still quiesce them.
#[derive(Clone)]
pub(crate) enum EmitterEntry {
    Acceptor(Arc<AcceptorIo>),
    Connector(Arc<ConnectorIo>),
}

impl EmitterEntry {
    fn stop_and_wait(&self) -> Result<()> {
        match self {
            EmitterEntry::Acceptor(a) => a.stop_and_wait(),
            EmitterEntry::Connector(c) => c.stop_and_wait(),
        }
    }
}

pub(crate) struct EmitterRegistry {
    pub(crate) stopped: bool,
    pub(crate) emitters: HashMap<usize, EmitterEntry>,
}

/// State shared between the reactor thread, workers, and user threads.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) pool: ThreadPool,
    pub(crate) tasks: TaskQueue<BoxedTask>,
    pub(crate) metrics: EngineMetrics,
    alarm: AtomicPtr<SelectorAlarm>,
    waker: Waker,
    poll: Mutex<Option<Poll>>,
    registry: Mutex<EmitterRegistry>,
    block_caches: Mutex<HashMap<u32, Arc<ChunkCache>>>,
    out_pool: BufferPool,
    next_token: AtomicUsize,
    input_cache_max: usize,
    weak_self: Weak<Shared>,
}

impl Shared {
    /// Enqueue a task for the reactor thread, optionally waking the
    /// multiplexer if the queue was empty.
    pub(crate) fn run_on_reactor(&self, wake: bool, task: impl SelectorTask + 'static) {
        let pushed = self.tasks.push(Box::new(task) as BoxedTask);
        if pushed.was_empty && wake {
            let ptr = self.alarm.swap(ptr::null_mut(), Ordering::AcqRel);
            let alarm: Box<SelectorAlarm> = if ptr.is_null() {
                Box::new(SelectorAlarm {
                    cmp: AtomicUsize::new(0),
                    shared: self.weak_self.clone(),
                })
            } else {
                // SAFETY: the cell held ownership of this allocation.
                unsafe { Box::from_raw(ptr) }
            };
            alarm.cmp.store(pushed.token, Ordering::Release);
            self.pool.execute_boxed(alarm);
        }
    }

    pub(crate) fn alloc_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn remove_emitter_no_wait(&self, key: usize) {
        self.registry.lock().emitters.remove(&key);
    }

    /// Input block cache shared per distinct block size; created on first
    /// use with that emitter's bounds.
    pub(crate) fn input_block_cache(&self, cfg: &EmitterConfig) -> Arc<ChunkCache> {
        let block = if cfg.input_queue_block_size != 0 {
            cfg.input_queue_block_size
        } else {
            self.config.input_queue_block_size
        };
        let initial = if cfg.input_queue_cache_initial_size != 0 {
            cfg.input_queue_cache_initial_size
        } else {
            self.config.input_queue_cache_initial_size
        };
        let max = if cfg.input_queue_cache_max_size != 0 {
            cfg.input_queue_cache_max_size
        } else {
            self.input_cache_max
        };
        let direct = cfg
            .use_direct_buffers
            .unwrap_or(self.config.use_direct_buffers);

        let mut caches = self.block_caches.lock();
        caches
            .entry(block)
            .or_insert_with(|| ChunkCache::new(direct, block, max, initial))
            .clone()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let ptr = self.alarm.swap(ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            // SAFETY: the cell owned the parked alarm.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

/// A single-reactor, multi-threaded TCP session engine.
///
/// Cheap to clone; all clones drive the same engine. The thread that
/// calls [`run`](Engine::run) becomes the reactor thread and blocks until
/// [`stop`](Engine::stop) completes. Multiple engines may coexist in one
/// process.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Engine> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let threads = config.resolved_threads();
        let input_cache_max = config.resolved_input_cache_max();
        let pool = ThreadPool::new(&config.name, threads);
        let out_pool = BufferPool::with_config(
            config.output_pool_chunk_size,
            config.use_direct_buffers,
            config.output_pool_cache_max_size,
            config.output_pool_cache_initial_size,
        );

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            config,
            pool,
            tasks: TaskQueue::new(),
            metrics: EngineMetrics::default(),
            alarm: AtomicPtr::new(ptr::null_mut()),
            waker,
            poll: Mutex::new(Some(poll)),
            registry: Mutex::new(EmitterRegistry {
                stopped: false,
                emitters: HashMap::new(),
            }),
            block_caches: Mutex::new(HashMap::new()),
            out_pool,
            next_token: AtomicUsize::new(1),
            input_cache_max,
            weak_self: weak.clone(),
        });

        Ok(Engine { shared })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Allocate an output buffer from the engine's shared pool.
    pub fn alloc_buffer(&self, len: usize) -> PooledBuffer {
        self.shared.out_pool.alloc(len)
    }

    /// Allocate between `min_len` and `len` bytes from the output pool.
    pub fn alloc_buffer_min(&self, len: usize, min_len: usize) -> PooledBuffer {
        self.shared.out_pool.alloc_min(len, min_len)
    }

    /// Current counter values.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Drive the reactor on the calling thread until the engine stops.
    ///
    /// May be called once per engine; a second call returns
    /// [`EngineError::Stopped`].
    pub fn run(&self) -> Result<()> {
        let mut poll = self.shared.poll.lock().take().ok_or(EngineError::Stopped)?;
        self.shared.pool.start()?;
        log::debug!(
            "{}: reactor started ({} workers)",
            self.shared.config.name,
            self.shared.pool.workers()
        );

        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut channels: HashMap<Token, Attachment> = HashMap::new();
        let mut later: Vec<BoxedTask> = Vec::new();
        let mut spare = SpareNode::default();
        let mut stopping = false;
        let mut readers: i32 = 0;
        let mut stat_iterations: u64 = 0;
        let mut stat_busy: u64 = 0;

        loop {
            stat_iterations += 1;

            let timeout = if !stopping {
                if readers > 0 {
                    // Workers are consuming buffers and will post re-arm
                    // tasks; keep spinning the loop.
                    stat_busy += 1;
                    Some(Duration::ZERO)
                } else {
                    None
                }
            } else {
                if channels.is_empty() && readers == 0 {
                    break;
                }
                // Keep draining completion tasks without blocking.
                Some(Duration::ZERO)
            };

            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!("{}: poll failed: {}", self.shared.config.name, e);
                break;
            }

            // Close the task batch: guarantees the drain below finds at
            // least one consumable node (the no-op sentinel).
            self.shared.tasks.close_batch(&mut spare);

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed() || event.is_error();
                if let Some(attachment) = channels.get(&token) {
                    readers +=
                        attachment.handle_ready_ops(Ready { readable, writable }, &self.shared.pool);
                }
            }

            let mut cx = SelectorCtx {
                registry: poll.registry(),
                channels: &mut channels,
                later: &mut later,
                stopping: &mut stopping,
            };
            self.shared.tasks.drain(&mut spare, |task| {
                readers -= task.run_on_reactor(&mut cx);
            });

            // Deferred tasks run strictly after the batch.
            let deferred: Vec<BoxedTask> = std::mem::take(cx.later);
            for task in deferred {
                let rc = task.run_on_reactor(&mut cx);
                debug_assert_eq!(rc, 0, "deferred tasks must not retire read jobs");
            }
        }

        let pool_result = self.shared.pool.stop_and_wait();

        if stopping {
            // Workers are joined and every session refuses new work, so
            // no producer remains; free tasks that never ran (they hold
            // session handles that would otherwise cycle back to the
            // engine).
            self.shared.tasks.purge();
        }
        for (_, cache) in self.shared.block_caches.lock().drain() {
            cache.clear();
        }
        // Break the registry -> emitter -> engine cycle.
        self.shared.registry.lock().emitters.clear();

        log::debug!(
            "{}: reactor finished ({} iterations, {} with active readers)",
            self.shared.config.name,
            stat_iterations,
            stat_busy
        );
        pool_result
    }

    /// Request engine shutdown. Idempotent and non-blocking; every
    /// session observes `on_connection_closed`, every emitter is
    /// quiesced, and [`run`](Engine::run) returns.
    pub fn stop(&self) {
        {
            let mut reg = self.shared.registry.lock();
            if reg.stopped {
                return;
            }
            reg.stopped = true;
        }
        log::debug!("{}: stop requested", self.shared.config.name);

        // Hop 1 (worker): emitter quiesce may block, so it must not run
        // on the reactor thread.
        let shared = Arc::clone(&self.shared);
        self.shared.pool.execute(move || {
            let emitters: Vec<EmitterEntry> =
                shared.registry.lock().emitters.values().cloned().collect();
            for emitter in emitters {
                if let Err(e) = emitter.stop_and_wait() {
                    log::warn!("emitter stop: {e}");
                }
            }

            // Hop 2 (reactor): session close touches interest sets.
            shared.run_on_reactor(true, |cx: &mut SelectorCtx<'_>| {
                let sessions: Vec<Arc<Session>> = cx
                    .channels
                    .values()
                    .filter_map(|a| match a {
                        Attachment::Session(s) => Some(Arc::clone(s)),
                        _ => None,
                    })
                    .collect();
                for session in sessions {
                    session.close_connection();
                }
                *cx.stopping = true;
                0
            });
        });
    }

    /// Register a listening emitter and start accepting.
    pub fn add_acceptor(&self, acceptor: Arc<dyn Acceptor>) -> Result<()> {
        let cfg = acceptor.config();
        let listener = match bind_listener(acceptor.local_addr(), &cfg) {
            Ok(l) => l,
            Err(e) => {
                let err = EngineError::Io(e);
                acceptor.on_exception(&err);
                return Err(err);
            }
        };
        let blocks = self.shared.input_block_cache(&cfg);
        let key = emitter_key(Arc::as_ptr(&acceptor) as *const ());
        let io = match AcceptorIo::new(self.clone(), Arc::clone(&acceptor), listener, cfg, blocks) {
            Ok(io) => io,
            Err(e) => {
                acceptor.on_exception(&e);
                return Err(e);
            }
        };

        let err = {
            let mut reg = self.shared.registry.lock();
            if reg.stopped {
                Some(EngineError::Stopped)
            } else if reg.emitters.contains_key(&key) {
                Some(EngineError::AlreadyRegistered)
            } else {
                reg.emitters.insert(key, EmitterEntry::Acceptor(Arc::clone(&io)));
                None
            }
        };

        match err {
            None => {
                io.start();
                Ok(())
            }
            Some(e) => {
                acceptor.on_exception(&e);
                Err(e)
            }
        }
    }

    /// Quiesce an acceptor: no further sessions are produced once this
    /// returns. Existing sessions are unaffected.
    pub fn remove_acceptor(&self, acceptor: &Arc<dyn Acceptor>) -> Result<()> {
        self.remove_emitter(emitter_key(Arc::as_ptr(acceptor) as *const ()))
    }

    /// Register an outbound connection attempt.
    pub fn add_connector(&self, connector: Arc<dyn Connector>) -> Result<()> {
        let cfg = connector.config();
        let stream = match connect_nonblocking(connector.remote_addr()) {
            Ok(s) => s,
            Err(e) => {
                self.shared.metrics.record_connect_failed();
                let err = EngineError::Io(e);
                connector.on_exception(&err);
                return Err(err);
            }
        };
        let blocks = self.shared.input_block_cache(&cfg);
        let key = emitter_key(Arc::as_ptr(&connector) as *const ());
        let io = ConnectorIo::new(self.clone(), Arc::clone(&connector), stream, cfg, blocks, key);

        let err = {
            let mut reg = self.shared.registry.lock();
            if reg.stopped {
                Some(EngineError::Stopped)
            } else if reg.emitters.contains_key(&key) {
                Some(EngineError::AlreadyRegistered)
            } else {
                reg.emitters
                    .insert(key, EmitterEntry::Connector(Arc::clone(&io)));
                None
            }
        };

        match err {
            None => {
                io.start();
                Ok(())
            }
            Some(e) => {
                connector.on_exception(&e);
                Err(e)
            }
        }
    }

    /// Abort a pending outbound connect, waiting for it to settle.
    pub fn remove_connector(&self, connector: &Arc<dyn Connector>) -> Result<()> {
        self.remove_emitter(emitter_key(Arc::as_ptr(connector) as *const ()))
    }

    fn remove_emitter(&self, key: usize) -> Result<()> {
        // The entry stays in the registry so a later engine stop can
        // still walk it; quiescing is idempotent.
        let entry = self.shared.registry.lock().emitters.get(&key).cloned();
        match entry {
            Some(entry) => entry.stop_and_wait(),
            None => Ok(()),
        }
    }
}

fn emitter_key(ptr: *const ()) -> usize {
    ptr as usize
}

fn bind_listener(addr: SocketAddr, cfg: &EmitterConfig) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(cfg.reuse_addr)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_runs_and_stops_empty() {
        let engine = Engine::new(EngineConfig {
            name: "reactor-test".into(),
            thread_pool_threads: 4,
            ..Default::default()
        })
        .expect("engine");

        let runner = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.run())
        };

        // Give the reactor a moment to block, then stop it.
        std::thread::sleep(Duration::from_millis(50));
        engine.stop();
        runner
            .join()
            .expect("reactor thread")
            .expect("clean shutdown");
    }

    #[test]
    fn test_stop_is_idempotent() {
        let engine = Engine::new(EngineConfig::default()).expect("engine");
        let runner = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.run())
        };
        engine.stop();
        engine.stop();
        engine.stop();
        runner.join().expect("reactor thread").expect("shutdown");
    }

    #[test]
    fn test_run_twice_fails() {
        let engine = Engine::new(EngineConfig::default()).expect("engine");
        let runner = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.run())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(engine.run(), Err(EngineError::Stopped)));
        engine.stop();
        runner.join().expect("reactor thread").expect("shutdown");
    }

    #[test]
    fn test_block_caches_shared_by_size() {
        let engine = Engine::new(EngineConfig::default()).expect("engine");
        let a = engine.shared().input_block_cache(&EmitterConfig {
            input_queue_block_size: 8192,
            ..Default::default()
        });
        let b = engine.shared().input_block_cache(&EmitterConfig {
            input_queue_block_size: 8192,
            ..Default::default()
        });
        let c = engine.shared().input_block_cache(&EmitterConfig::default());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.chunk_size(), 32 * 1024);
    }
}
