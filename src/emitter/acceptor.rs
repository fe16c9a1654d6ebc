// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Accepting side of the engine.
//!
//! Accept readiness posts a worker job that drains `accept` until the
//! socket would block, building a session (and its listener) for each new
//! connection. A follow-up reactor task installs the sessions, then
//! re-arms accept interest via the deferred list so it runs after this
//! batch's registrations.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mio::{Interest, Token};
use parking_lot::{Condvar, Mutex};

use super::Acceptor;
use crate::buffer::ChunkCache;
use crate::config::EmitterConfig;
use crate::engine::dispatch::{Attachment, ChannelHandler, Ready, SelectorCtx};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::rt::ThreadPool;
use crate::session::Session;

struct AcceptorState {
    stop_requested: bool,
    deregistered: bool,
    pending_jobs: usize,
}

/// Internal I/O shell for one registered acceptor.
pub(crate) struct AcceptorIo {
    engine: Engine,
    user: Arc<dyn Acceptor>,
    cfg: EmitterConfig,
    listener: Mutex<Option<TcpListener>>,
    fd: RawFd,
    token: Token,
    local_addr: SocketAddr,
    blocks: Arc<ChunkCache>,
    // One accept job in flight at a time.
    accepting: AtomicBool,
    state: Mutex<AcceptorState>,
    cv: Condvar,
    weak_self: Weak<AcceptorIo>,
}

impl AcceptorIo {
    pub(crate) fn new(
        engine: Engine,
        user: Arc<dyn Acceptor>,
        listener: TcpListener,
        cfg: EmitterConfig,
        blocks: Arc<ChunkCache>,
    ) -> Result<Arc<Self>> {
        let fd = listener.as_raw_fd();
        let local_addr = listener.local_addr()?;
        let token = engine.shared().alloc_token();
        Ok(Arc::new_cyclic(|weak: &Weak<AcceptorIo>| AcceptorIo {
            engine,
            user,
            cfg,
            listener: Mutex::new(Some(listener)),
            fd,
            token,
            local_addr,
            blocks,
            accepting: AtomicBool::new(false),
            state: Mutex::new(AcceptorState {
                stop_requested: false,
                deregistered: false,
                pending_jobs: 0,
            }),
            cv: Condvar::new(),
            weak_self: weak.clone(),
        }))
    }

    fn arc(&self) -> Arc<AcceptorIo> {
        self.weak_self.upgrade().expect("acceptor handle alive")
    }

    /// Post the reactor task that registers the listener.
    pub(crate) fn start(&self) {
        let io = self.arc();
        self.engine
            .shared()
            .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                if *cx.stopping || io.state.lock().stop_requested {
                    io.mark_deregistered();
                    return 0;
                }
                match cx.register(io.fd, io.token, Interest::READABLE) {
                    Ok(()) => {
                        cx.channels
                            .insert(io.token, Attachment::Acceptor(Arc::clone(&io)));
                        log::debug!("acceptor listening on {}", io.local_addr);
                        io.user.on_started(io.local_addr);
                    }
                    Err(e) => {
                        io.user.on_exception(&EngineError::Io(e));
                        io.mark_deregistered();
                    }
                }
                0
            });
    }

    /// Quiesce: no new sessions once this returns. Must not be called on
    /// the reactor thread.
    pub(crate) fn stop_and_wait(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.stop_requested {
                state.stop_requested = true;
                let io = self.arc();
                self.engine
                    .shared()
                    .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                        cx.channels.remove(&io.token);
                        if let Err(e) = cx.deregister(io.fd) {
                            log::trace!("acceptor deregister: {e}");
                        }
                        io.mark_deregistered();
                        0
                    });
            }
        }

        let mut state = self.state.lock();
        while !(state.deregistered && state.pending_jobs == 0) {
            self.cv.wait(&mut state);
        }
        drop(state);

        // Safe to close now: deregistered and no accept job can touch it.
        *self.listener.lock() = None;
        log::debug!("acceptor on {} stopped", self.local_addr);
        Ok(())
    }

    fn mark_deregistered(&self) {
        let mut state = self.state.lock();
        state.deregistered = true;
        drop(state);
        self.cv.notify_all();
    }

    fn job_done(&self) {
        let mut state = self.state.lock();
        state.pending_jobs -= 1;
        drop(state);
        self.cv.notify_all();
    }

    /// Worker job: drain pending connections, then install them from the
    /// reactor thread.
    fn accept_job(&self) {
        let mut sessions: Vec<Arc<Session>> = Vec::new();
        {
            let guard = self.listener.lock();
            if let Some(listener) = guard.as_ref() {
                loop {
                    match listener.accept() {
                        Ok((stream, remote)) => {
                            match Session::new(
                                self.engine.clone(),
                                stream,
                                remote,
                                &self.cfg,
                                Arc::clone(&self.blocks),
                            ) {
                                Ok(session) => {
                                    let session_listener = self.user.on_accepted(&session);
                                    session.set_listener(session_listener);
                                    sessions.push(session);
                                }
                                Err(e) => self.user.on_exception(&EngineError::Io(e)),
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            self.user.on_exception(&EngineError::Io(e));
                            break;
                        }
                    }
                }
            }
        }

        let io = self.arc();
        self.engine
            .shared()
            .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                let stopped = *cx.stopping || io.state.lock().stop_requested;
                for session in sessions {
                    if stopped {
                        session.discard();
                    } else if let Err(e) = session.install(cx) {
                        session.discard();
                        io.user.on_exception(&EngineError::Io(e));
                    }
                }

                io.accepting.store(false, Ordering::Release);
                if !stopped {
                    // Re-arm accept interest after this batch settles.
                    let rearm = Arc::clone(&io);
                    cx.defer(Box::new(move |cx: &mut SelectorCtx<'_>| {
                        if !rearm.state.lock().stop_requested {
                            if let Err(e) =
                                cx.reregister(rearm.fd, rearm.token, Interest::READABLE)
                            {
                                log::trace!("acceptor re-arm: {e}");
                            }
                        }
                        0
                    }));
                }
                io.job_done();
                0
            });
    }
}

impl ChannelHandler for Arc<AcceptorIo> {
    fn handle_ready_ops(&self, ready: Ready, pool: &ThreadPool) -> i32 {
        if ready.readable && !self.accepting.swap(true, Ordering::AcqRel) {
            self.state.lock().pending_jobs += 1;
            let io = Arc::clone(self);
            pool.execute(move || io.accept_job());
        }
        0
    }
}
