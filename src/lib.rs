// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # strand - single-reactor TCP session engine
//!
//! A high-throughput, event-driven TCP engine: one reactor thread owns a
//! non-blocking multiplexer and orchestrates readiness; a worker pool
//! performs per-session reads and writes; inbound bytes reach
//! user-supplied listeners as pooled, reference-counted buffers; outbound
//! writes are queued, coalesced, and flushed without ever blocking the
//! reactor.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use strand::{Acceptor, Engine, EngineConfig, PooledBuffer, Session, SessionListener};
//!
//! struct EchoServer;
//!
//! struct EchoSession {
//!     session: Arc<Session>,
//! }
//!
//! impl SessionListener for EchoSession {
//!     fn on_data_received(&self, data: PooledBuffer) {
//!         // Buffers are retainable: echo by re-queueing the same slice.
//!         self.session.send_data(data.clone());
//!     }
//!     fn on_connection_closed(&self) {}
//! }
//!
//! impl Acceptor for EchoServer {
//!     fn local_addr(&self) -> std::net::SocketAddr {
//!         "127.0.0.1:9000".parse().unwrap()
//!     }
//!     fn on_accepted(&self, session: &Arc<Session>) -> Arc<dyn SessionListener> {
//!         Arc::new(EchoSession { session: Arc::clone(session) })
//!     }
//! }
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! engine.add_acceptor(Arc::new(EchoServer))?;
//! engine.run()?; // blocks until engine.stop()
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                            Engine                                   |
//! |  +--------------------+   +---------------------------------------+ |
//! |  |   reactor thread   |   |             worker pool               | |
//! |  |  mio Poll + Waker  |<--|  read jobs / write drains / accepts   | |
//! |  |  task queue (MPSC) |-->|  (FIFO, max(4, cpus) threads)         | |
//! |  +--------------------+   +---------------------------------------+ |
//! |        |                                            |               |
//! |        v                                            v               |
//! |  Acceptor / Connector  -->  Session  -->  SessionListener          |
//! |                                |                                    |
//! |                       BufferPool / ChunkCache                       |
//! |              (lock-free slab of refcounted slices)                  |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Guarantees
//!
//! - Per session, `on_data_received` follows the TCP byte order and
//!   callbacks never overlap; `on_connection_closed` is the last call,
//!   delivered exactly once.
//! - `send_data` order is preserved per producer; concurrent producers
//!   are ordered by the append linearisation.
//! - Interest bits and registrations are touched only on the reactor
//!   thread; the reactor never blocks on application code.
//!
//! The engine speaks raw TCP. Framing, TLS, and request/response
//! semantics belong to the layers above.

pub mod buffer;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod session;

pub(crate) mod rt;

pub use buffer::{BufferPool, PooledBuffer};
pub use config::{EmitterConfig, EngineConfig};
pub use emitter::{Acceptor, Connector};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use metrics::MetricsSnapshot;
pub use session::{Session, SessionListener};
