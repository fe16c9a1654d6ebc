// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Emitters: the listening and outbound-connect channel handlers.
//!
//! An [`Acceptor`] or [`Connector`] is the application-facing half; the
//! engine wraps it in an internal I/O shell that owns the socket, the
//! reactor registration, and the quiesce protocol. Emitters are tracked
//! in the engine's registry and participate in shutdown.

mod acceptor;
mod connector;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::EmitterConfig;
use crate::error::EngineError;
use crate::session::{Session, SessionListener};

pub(crate) use acceptor::AcceptorIo;
pub(crate) use connector::ConnectorIo;

/// Server-side emitter: accepts inbound connections.
pub trait Acceptor: Send + Sync {
    /// Address to bind; port 0 selects an ephemeral port.
    fn local_addr(&self) -> SocketAddr;

    /// Per-emitter overrides; defaults fall back to the engine config.
    fn config(&self) -> EmitterConfig {
        EmitterConfig::default()
    }

    /// The listener has been bound and registered; reports the actual
    /// local address (useful with an ephemeral port).
    fn on_started(&self, local_addr: SocketAddr) {
        let _ = local_addr;
    }

    /// A connection was accepted; return the listener for its session.
    fn on_accepted(&self, session: &Arc<Session>) -> Arc<dyn SessionListener>;

    /// A registration or socket error tied to this emitter.
    fn on_exception(&self, error: &EngineError) {
        log::warn!("acceptor: {error}");
    }
}

/// Client-side emitter: initiates one outbound connection.
pub trait Connector: Send + Sync {
    /// Address to connect to.
    fn remote_addr(&self) -> SocketAddr;

    /// Per-emitter overrides; defaults fall back to the engine config.
    fn config(&self) -> EmitterConfig {
        EmitterConfig::default()
    }

    /// The connection completed; return the listener for its session.
    fn on_connected(&self, session: &Arc<Session>) -> Arc<dyn SessionListener>;

    /// The connect failed or was aborted by shutdown.
    fn on_exception(&self, error: &EngineError) {
        log::warn!("connector: {error}");
    }
}
