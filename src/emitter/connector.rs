// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connecting side of the engine.
//!
//! The non-blocking connect is registered for write readiness; the first
//! writable event posts a worker job that checks `SO_ERROR`, builds the
//! session and its listener, and hands the socket over to a session
//! registration on the reactor thread. A connector produces at most one
//! session and then removes itself from the registry.

use std::io;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mio::{Interest, Token};
use parking_lot::{Condvar, Mutex};

use super::Connector;
use crate::buffer::ChunkCache;
use crate::config::EmitterConfig;
use crate::engine::dispatch::{Attachment, ChannelHandler, Ready, SelectorCtx};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::rt::ThreadPool;
use crate::session::Session;

struct ConnectorState {
    stop_requested: bool,
    settled: bool,
}

/// Internal I/O shell for one registered connector.
pub(crate) struct ConnectorIo {
    engine: Engine,
    user: Arc<dyn Connector>,
    cfg: EmitterConfig,
    // Present while the connect is pending; taken by the finish job or
    // the abort path.
    stream: Mutex<Option<TcpStream>>,
    fd: RawFd,
    token: Token,
    blocks: Arc<ChunkCache>,
    finishing: AtomicBool,
    state: Mutex<ConnectorState>,
    cv: Condvar,
    registry_key: usize,
    weak_self: Weak<ConnectorIo>,
}

impl ConnectorIo {
    pub(crate) fn new(
        engine: Engine,
        user: Arc<dyn Connector>,
        stream: TcpStream,
        cfg: EmitterConfig,
        blocks: Arc<ChunkCache>,
        registry_key: usize,
    ) -> Arc<Self> {
        let fd = stream.as_raw_fd();
        let token = engine.shared().alloc_token();
        Arc::new_cyclic(|weak: &Weak<ConnectorIo>| ConnectorIo {
            engine,
            user,
            cfg,
            stream: Mutex::new(Some(stream)),
            fd,
            token,
            blocks,
            finishing: AtomicBool::new(false),
            state: Mutex::new(ConnectorState {
                stop_requested: false,
                settled: false,
            }),
            cv: Condvar::new(),
            registry_key,
            weak_self: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<ConnectorIo> {
        self.weak_self.upgrade().expect("connector handle alive")
    }

    /// Post the reactor task that registers the pending connect for
    /// write readiness. An already-connected socket reports writable
    /// immediately, so both cases flow through the same path.
    pub(crate) fn start(&self) {
        let io = self.arc();
        self.engine
            .shared()
            .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                if *cx.stopping || io.state.lock().stop_requested {
                    let stream = io.stream.lock().take();
                    drop(stream);
                    io.user.on_exception(&EngineError::Stopped);
                    io.settle();
                    return 0;
                }
                match cx.register(io.fd, io.token, Interest::WRITABLE) {
                    Ok(()) => {
                        cx.channels
                            .insert(io.token, Attachment::Connector(Arc::clone(&io)));
                    }
                    Err(e) => {
                        io.user.on_exception(&EngineError::Io(e));
                        io.engine.shared().remove_emitter_no_wait(io.registry_key);
                        io.settle();
                    }
                }
                0
            });
    }

    /// Wait until the connect produced a session, failed, or was aborted.
    /// Must not be called on the reactor thread.
    pub(crate) fn stop_and_wait(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.stop_requested {
                state.stop_requested = true;
                let io = self.arc();
                self.engine
                    .shared()
                    .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                        // Abort only a still-pending connect; a finish job
                        // in flight owns completion and will settle.
                        if let Some(stream) = io.stream.lock().take() {
                            cx.channels.remove(&io.token);
                            if let Err(e) = cx.deregister(io.fd) {
                                log::trace!("connector deregister: {e}");
                            }
                            drop(stream);
                            io.user.on_exception(&EngineError::Stopped);
                            io.engine.shared().remove_emitter_no_wait(io.registry_key);
                            io.settle();
                        }
                        0
                    });
            }
        }

        let mut state = self.state.lock();
        while !state.settled {
            self.cv.wait(&mut state);
        }
        Ok(())
    }

    fn settle(&self) {
        let mut state = self.state.lock();
        state.settled = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Worker job: resolve the pending connect.
    fn finish_job(&self) {
        let pending = self.stream.lock().take();
        let Some(stream) = pending else {
            // Aborted before the job ran.
            return;
        };

        let outcome = match stream.take_error() {
            Ok(Some(e)) => Err((e, stream)),
            Err(e) => Err((e, stream)),
            Ok(None) => match stream.peer_addr() {
                Ok(peer) => Ok((stream, peer)),
                Err(e) => {
                    // Connect still failed (e.g. ENOTCONN after refusal).
                    let err =
                        stream.take_error().ok().flatten().unwrap_or(e);
                    Err((err, stream))
                }
            },
        };

        match outcome {
            Ok((stream, remote)) => {
                match Session::new(
                    self.engine.clone(),
                    stream,
                    remote,
                    &self.cfg,
                    Arc::clone(&self.blocks),
                ) {
                    Ok(session) => {
                        let listener = self.user.on_connected(&session);
                        session.set_listener(listener);
                        let io = self.arc();
                        self.engine
                            .shared()
                            .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                                cx.channels.remove(&io.token);
                                if let Err(e) = cx.deregister(io.fd) {
                                    log::trace!("connector handoff deregister: {e}");
                                }
                                if *cx.stopping || io.state.lock().stop_requested {
                                    session.discard();
                                } else if let Err(e) = session.install(cx) {
                                    session.discard();
                                    io.user.on_exception(&EngineError::Io(e));
                                }
                                io.engine.shared().remove_emitter_no_wait(io.registry_key);
                                io.settle();
                                0
                            });
                    }
                    Err(e) => self.connect_failed(e, None),
                }
            }
            Err((e, stream)) => self.connect_failed(e, Some(stream)),
        }
    }

    /// Report a failed connect and clean up the registration. The failed
    /// socket stays open until after deregistration so its descriptor
    /// cannot be recycled underneath the reactor.
    fn connect_failed(&self, err: io::Error, stream: Option<TcpStream>) {
        self.engine.shared().metrics.record_connect_failed();
        log::debug!("connector to {}: {}", self.user.remote_addr(), err);
        self.user.on_exception(&EngineError::Io(err));

        let io = self.arc();
        self.engine
            .shared()
            .run_on_reactor(true, move |cx: &mut SelectorCtx<'_>| {
                cx.channels.remove(&io.token);
                if let Err(e) = cx.deregister(io.fd) {
                    log::trace!("connector cleanup deregister: {e}");
                }
                drop(stream);
                io.engine.shared().remove_emitter_no_wait(io.registry_key);
                io.settle();
                0
            });
    }
}

impl ChannelHandler for Arc<ConnectorIo> {
    fn handle_ready_ops(&self, ready: Ready, pool: &ThreadPool) -> i32 {
        if (ready.writable || ready.readable) && !self.finishing.swap(true, Ordering::AcqRel) {
            let io = Arc::clone(self);
            pool.execute(move || io.finish_job());
        }
        0
    }
}
