// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reactor-thread task plumbing and readiness dispatch.
//!
//! A [`SelectorTask`] is a callback that must run on the reactor thread,
//! typically to mutate interest bits or the token table; it receives a
//! [`SelectorCtx`] borrowing the reactor-owned state and returns the
//! number of outstanding read jobs it retires.
//!
//! Channel handlers come in three shapes — session, acceptor, connector —
//! modelled as the [`Attachment`] variants sharing the
//! [`ChannelHandler`] dispatch capability.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use crate::emitter::{AcceptorIo, ConnectorIo};
use crate::rt::ThreadPool;
use crate::session::Session;

/// Readiness bits delivered to a channel handler.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Ready {
    pub readable: bool,
    pub writable: bool,
}

/// A callback executed on the reactor thread.
///
/// The returned value is subtracted from the reactor's `active_readers`
/// count; tasks that do not complete a read job return 0.
pub(crate) trait SelectorTask: Send {
    fn run_on_reactor(self: Box<Self>, cx: &mut SelectorCtx<'_>) -> i32;
}

impl<F> SelectorTask for F
where
    F: FnOnce(&mut SelectorCtx<'_>) -> i32 + Send,
{
    fn run_on_reactor(self: Box<Self>, cx: &mut SelectorCtx<'_>) -> i32 {
        (*self)(cx)
    }
}

pub(crate) type BoxedTask = Box<dyn SelectorTask>;

/// Reactor-owned state handed to selector tasks.
///
/// Interest bits and the token table are mutated exclusively through this
/// context, which only ever exists on the reactor thread.
pub(crate) struct SelectorCtx<'a> {
    pub registry: &'a Registry,
    pub channels: &'a mut HashMap<Token, Attachment>,
    pub later: &'a mut Vec<BoxedTask>,
    pub stopping: &'a mut bool,
}

impl SelectorCtx<'_> {
    pub(crate) fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.registry.register(&mut SourceFd(&fd), token, interests)
    }

    pub(crate) fn reregister(
        &self,
        fd: RawFd,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(&mut SourceFd(&fd), token, interests)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    /// Queue a task onto the reactor-private list drained after the
    /// current batch. Only for tasks that return 0.
    pub(crate) fn defer(&mut self, task: BoxedTask) {
        self.later.push(task);
    }
}

/// Capability shared by everything a token can point at.
pub(crate) trait ChannelHandler {
    /// React to readiness; returns the delta for `active_readers`
    /// (positive when a read job now owes the reactor a re-arm).
    fn handle_ready_ops(&self, ready: Ready, pool: &ThreadPool) -> i32;
}

/// What a registered token resolves to.
#[derive(Clone)]
pub(crate) enum Attachment {
    Session(Arc<Session>),
    Acceptor(Arc<AcceptorIo>),
    Connector(Arc<ConnectorIo>),
}

impl Attachment {
    pub(crate) fn handle_ready_ops(&self, ready: Ready, pool: &ThreadPool) -> i32 {
        match self {
            Attachment::Session(s) => s.handle_ready_ops(ready, pool),
            Attachment::Acceptor(a) => a.handle_ready_ops(ready, pool),
            Attachment::Connector(c) => c.handle_ready_ops(ready, pool),
        }
    }
}
