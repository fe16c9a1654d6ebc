// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sessions: the per-connection inbound and outbound data paths.
//!
//! Inbound: readable readiness makes the reactor post a worker job
//! (raising `active_readers` by one). The worker takes a block from the
//! emitter's input cache, does one non-blocking read, hands the filled
//! slice to the listener, and posts a reactor task that re-arms read
//! interest and retires the reader count. Listener callbacks for one
//! session never overlap.
//!
//! Outbound: `send_data` appends to the queue and, when the session was
//! idle, posts a reactor task enabling write interest. Writable readiness
//! makes a worker gather the queue into vectored writes until it is empty
//! (write interest is then disabled) or the socket pushes back (interest
//! stays armed). `send_data_sync` additionally parks the caller until its
//! buffer drains. `close_connection` lets the writer finish the queue,
//! then cancels the registration and delivers the final callback.

mod outbound;

use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use mio::{Interest, Token};
use parking_lot::Mutex;

use crate::buffer::chunk::Chunk;
use crate::buffer::{ChunkCache, PooledBuffer};
use crate::config::EmitterConfig;
use crate::engine::dispatch::{Attachment, ChannelHandler, Ready, SelectorCtx};
use crate::engine::Engine;
use crate::rt::ThreadPool;

pub(crate) use outbound::{Outbound, SyncWaiter, MAX_WRITEV};

/// Receives a session's inbound bytes and end-of-life notification.
///
/// Callbacks for a given session are ordered and never concurrent with
/// each other; `on_connection_closed` is the last call, exactly once.
pub trait SessionListener: Send + Sync {
    /// A chunk of the inbound byte stream, in TCP order. The listener may
    /// retain the buffer (it is reference counted) beyond the callback.
    fn on_data_received(&self, data: PooledBuffer);

    /// The connection is gone: peer closed, I/O error, local close, or
    /// engine stop.
    fn on_connection_closed(&self);
}

// Session state bits.
const READING: u32 = 1; // read job in flight
const CLOSED: u32 = 2; // deregistered from the reactor

/// One TCP connection driven by the engine.
///
/// Handed to the emitter callback that creates the listener; methods may
/// be called from any thread.
pub struct Session {
    engine: Engine,
    stream: TcpStream,
    fd: RawFd,
    token: Token,
    local: SocketAddr,
    remote: SocketAddr,
    listener: OnceLock<Arc<dyn SessionListener>>,
    blocks: Arc<ChunkCache>,
    block_size: u32,
    flags: AtomicU32,
    out: Mutex<Outbound>,
    // Serialises listener callbacks; the flag records that
    // on_connection_closed was delivered.
    callback_gate: Mutex<bool>,
    weak_self: Weak<Session>,
}

impl Session {
    pub(crate) fn new(
        engine: Engine,
        stream: TcpStream,
        remote: SocketAddr,
        cfg: &EmitterConfig,
        blocks: Arc<ChunkCache>,
    ) -> io::Result<Arc<Session>> {
        stream.set_nonblocking(true)?;
        if cfg.tcp_no_delay {
            let _ = stream.set_nodelay(true);
        }
        let local = stream.local_addr()?;
        let fd = stream.as_raw_fd();
        let token = engine.shared().alloc_token();
        let block_size = blocks.chunk_size();
        engine.shared().metrics.record_session_opened();

        Ok(Arc::new_cyclic(|weak: &Weak<Session>| Session {
            engine,
            stream,
            fd,
            token,
            local,
            remote,
            listener: OnceLock::new(),
            blocks,
            block_size,
            flags: AtomicU32::new(0),
            out: Mutex::new(Outbound::new()),
            callback_gate: Mutex::new(false),
            weak_self: weak.clone(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Bytes queued for write and not yet on the wire.
    pub fn pending_out_bytes(&self) -> usize {
        self.out.lock().queued_bytes
    }

    /// Enqueue a buffer for write. Returns false if the session is
    /// closing or closed; ordering follows the append order.
    pub fn send_data(&self, buf: PooledBuffer) -> bool {
        self.enqueue_out(buf, None)
    }

    /// Enqueue a buffer and block the caller until it is fully written.
    /// Returns false if the session closed before that happened.
    pub fn send_data_sync(&self, buf: PooledBuffer) -> bool {
        let waiter = SyncWaiter::new();
        if !self.enqueue_out(buf, Some(Arc::clone(&waiter))) {
            return false;
        }
        waiter.wait()
    }

    /// Copy `data` into a pooled buffer and enqueue it.
    pub fn send_bytes(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return !self.out.lock().closed;
        }
        let mut buf = self.engine.alloc_buffer(data.len());
        buf.as_mut_slice().copy_from_slice(data);
        self.send_data(buf)
    }

    fn enqueue_out(&self, buf: PooledBuffer, waiter: Option<Arc<SyncWaiter>>) -> bool {
        let arm = {
            let mut out = self.out.lock();
            if out.closed {
                return false;
            }
            if buf.is_empty() {
                // Nothing to write; complete immediately.
                if let Some(waiter) = waiter {
                    waiter.complete(true);
                }
                return true;
            }
            out.push(buf, waiter);
            out.try_arm()
        };
        if arm {
            let session = self.arc();
            self.engine
                .shared()
                .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                    session.refresh_interest(cx);
                    0
                });
        }
        true
    }

    /// Request close. The writer drains what is already queued, then the
    /// registration is cancelled and `on_connection_closed` delivered.
    /// Returns true if this call initiated the close.
    pub fn close_connection(&self) -> bool {
        let finish_now = {
            let mut out = self.out.lock();
            if out.closed {
                return false;
            }
            out.closed = true;
            // With a writer in flight or data pending, the drain path
            // finishes the close.
            !out.writing && out.queue.is_empty()
        };
        if finish_now {
            self.post_final_close();
        }
        true
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn SessionListener>) {
        let _ = self.listener.set(listener);
    }

    /// Register with the reactor and enable read interest. Reactor
    /// thread only.
    ///
    /// The listener ran before registration and may already have queued
    /// data or requested a close, so the initial interest set comes from
    /// the outbound state.
    pub(crate) fn install(&self, cx: &mut SelectorCtx<'_>) -> io::Result<()> {
        if self.flags.load(Ordering::Acquire) & CLOSED != 0 {
            // Closed before it ever reached the reactor.
            return Ok(());
        }
        let write_armed = self.out.lock().armed;
        let interests = if write_armed {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        cx.register(self.fd, self.token, interests)?;
        cx.channels.insert(self.token, Attachment::Session(self.arc()));
        log::trace!("session {} -> {} installed", self.local, self.remote);
        Ok(())
    }

    /// Tear down a session that never reached the reactor (registration
    /// raced engine or emitter shutdown).
    pub(crate) fn discard(&self) {
        {
            let mut out = self.out.lock();
            out.closed = true;
            out.fail_pending();
        }
        self.flags.fetch_or(CLOSED, Ordering::AcqRel);
        let _ = self.stream.shutdown(Shutdown::Both);
        let session = self.arc();
        self.engine
            .shared()
            .pool
            .execute(move || session.deliver_closed());
    }

    fn arc(&self) -> Arc<Session> {
        // A method call implies a live handle, so the upgrade cannot fail
        // outside Arc::new_cyclic.
        self.weak_self.upgrade().expect("session handle alive")
    }

    // ------------------------------------------------------------------
    // Inbound path (worker side)
    // ------------------------------------------------------------------

    fn read_job(&self) {
        let gate = self.callback_gate.lock();
        if *gate {
            // Close callback already delivered; retire the reader.
            drop(gate);
            self.post_read_completion();
            return;
        }

        let chunk = self.blocks.get();
        let cap = self.block_size as usize;
        // SAFETY: the chunk came fresh from the cache, so this worker is
        // its only referent until a slice is published below.
        let data =
            unsafe { std::slice::from_raw_parts_mut(chunk.as_ref().base(), cap) };

        let result = loop {
            match (&self.stream).read(data) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                r => break r,
            }
        };

        match result {
            Ok(0) => {
                Self::give_back(chunk, cap);
                drop(gate);
                log::trace!("session {}: end of stream", self.remote);
                self.close_connection();
                self.post_read_completion();
            }
            Ok(n) => {
                let buf = PooledBuffer::new(chunk, 0, n, cap as i32);
                // Release the cache token; the slice now owns the block.
                Chunk::release(chunk, 1);
                self.engine.shared().metrics.record_bytes_received(n);
                if let Some(listener) = self.listener.get() {
                    listener.on_data_received(buf);
                }
                drop(gate);
                self.post_read_rearm();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Self::give_back(chunk, cap);
                drop(gate);
                self.post_read_rearm();
            }
            Err(e) => {
                Self::give_back(chunk, cap);
                drop(gate);
                self.fail_connection(e);
                self.post_read_completion();
            }
        }
    }

    /// Return an unused input block to its cache.
    fn give_back(chunk: NonNull<Chunk>, cap: usize) {
        Chunk::release(chunk, cap as i32 + 1);
    }

    // The re-arm and completion tasks skip the wake alarm: the read job
    // they retire keeps `active_readers` positive, so the reactor is
    // polling non-blockingly until they are consumed.

    fn post_read_rearm(&self) {
        let session = self.arc();
        self.engine
            .shared()
            .run_on_reactor(false, move |cx: &mut SelectorCtx<'_>| {
                session.flags.fetch_and(!READING, Ordering::AcqRel);
                session.refresh_interest(cx);
                1
            });
    }

    fn post_read_completion(&self) {
        self.engine
            .shared()
            .run_on_reactor(false, |_cx: &mut SelectorCtx<'_>| 1);
    }

    // ------------------------------------------------------------------
    // Outbound path (worker side)
    // ------------------------------------------------------------------

    fn drain_outbound(&self) {
        loop {
            let mut views: Vec<(PooledBuffer, usize)> = Vec::new();
            {
                let out = self.out.lock();
                for entry in out.queue.iter().take(MAX_WRITEV) {
                    views.push((entry.buf.clone(), entry.pos));
                }
            }

            if views.is_empty() {
                let finish_close = {
                    let mut out = self.out.lock();
                    if !out.queue.is_empty() {
                        // New data raced in; keep draining.
                        continue;
                    }
                    out.writing = false;
                    out.armed = false;
                    out.closed
                };
                if finish_close {
                    self.post_final_close();
                } else {
                    let session = self.arc();
                    self.engine
                        .shared()
                        .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                            session.refresh_interest(cx);
                            0
                        });
                }
                return;
            }

            let slices: Vec<IoSlice<'_>> = views
                .iter()
                .map(|(buf, pos)| IoSlice::new(&buf.as_slice()[*pos..]))
                .collect();

            match (&self.stream).write_vectored(&slices) {
                Ok(0) => {
                    self.fail_connection(io::ErrorKind::WriteZero.into());
                    return;
                }
                Ok(n) => {
                    self.engine.shared().metrics.record_bytes_sent(n);
                    self.out.lock().advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.engine.shared().metrics.record_send_blocked();
                    self.out.lock().writing = false;
                    // Interest stays armed; refresh to cover the edge we
                    // may have consumed.
                    let session = self.arc();
                    self.engine
                        .shared()
                        .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                            session.refresh_interest(cx);
                            0
                        });
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail_connection(e);
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Close path
    // ------------------------------------------------------------------

    fn fail_connection(&self, err: io::Error) {
        log::debug!("session {}: i/o error: {}", self.remote, err);
        {
            let mut out = self.out.lock();
            out.closed = true;
            out.writing = false;
            out.fail_pending();
        }
        self.post_final_close();
    }

    fn post_final_close(&self) {
        let session = self.arc();
        self.engine
            .shared()
            .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                session.finish_close(cx);
                0
            });
    }

    /// Cancel the registration and hand the final callback to a worker.
    /// Reactor thread only; idempotent.
    fn finish_close(&self, cx: &mut SelectorCtx<'_>) {
        if self.flags.fetch_or(CLOSED, Ordering::AcqRel) & CLOSED != 0 {
            return;
        }
        cx.channels.remove(&self.token);
        if let Err(e) = cx.deregister(self.fd) {
            log::trace!("session {}: deregister: {}", self.remote, e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);

        let session = self.arc();
        self.engine
            .shared()
            .pool
            .execute(move || session.deliver_closed());
    }

    /// Deliver `on_connection_closed` exactly once, serialised against
    /// the inbound callbacks, and fail any parked sync senders.
    fn deliver_closed(&self) {
        {
            let mut gate = self.callback_gate.lock();
            if !*gate {
                *gate = true;
                if let Some(listener) = self.listener.get() {
                    listener.on_connection_closed();
                }
                self.engine.shared().metrics.record_session_closed();
            }
        }
        self.out.lock().fail_pending();
    }

    /// Recompute interest bits from the outbound state. Reactor thread
    /// only; a no-op once closed.
    fn refresh_interest(&self, cx: &mut SelectorCtx<'_>) {
        if self.flags.load(Ordering::Acquire) & CLOSED != 0 {
            return;
        }
        let write_armed = self.out.lock().armed;
        let interests = if write_armed {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = cx.reregister(self.fd, self.token, interests) {
            log::trace!("session {}: reregister: {}", self.remote, e);
        }
    }
}

impl ChannelHandler for Arc<Session> {
    fn handle_ready_ops(&self, ready: Ready, pool: &ThreadPool) -> i32 {
        let mut delta = 0;

        if ready.readable
            && self.flags.fetch_or(READING, Ordering::AcqRel) & (READING | CLOSED) == 0
        {
            let session = Arc::clone(self);
            pool.execute(move || session.read_job());
            delta += 1;
        }

        if ready.writable {
            let spawn = {
                let mut out = self.out.lock();
                if !out.writing && !out.queue.is_empty() {
                    out.writing = true;
                    true
                } else {
                    false
                }
            };
            if spawn {
                let session = Arc::clone(self);
                pool.execute(move || session.drain_outbound());
            }
        }

        delta
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("token", &self.token.0)
            .finish()
    }
}
