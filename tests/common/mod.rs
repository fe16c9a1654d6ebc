// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared scaffolding for the end-to-end tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use strand::{Acceptor, Engine, EngineConfig, Session, SessionListener};

/// Spawn the reactor on its own thread.
pub fn start_engine(name: &str) -> (Engine, JoinHandle<strand::Result<()>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = Engine::new(EngineConfig {
        name: name.to_string(),
        thread_pool_threads: 4,
        ..Default::default()
    })
    .expect("engine");
    let runner = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.run())
    };
    (engine, runner)
}

/// Acceptor binding an ephemeral loopback port, reporting the bound
/// address over a channel and building listeners with a caller-supplied
/// factory.
pub struct TestAcceptor {
    addr_tx: Mutex<Option<Sender<SocketAddr>>>,
    factory: Box<dyn Fn(&Arc<Session>) -> Arc<dyn SessionListener> + Send + Sync>,
}

impl TestAcceptor {
    pub fn new(
        factory: impl Fn(&Arc<Session>) -> Arc<dyn SessionListener> + Send + Sync + 'static,
    ) -> (Arc<Self>, Receiver<SocketAddr>) {
        let (tx, rx) = channel();
        (
            Arc::new(Self {
                addr_tx: Mutex::new(Some(tx)),
                factory: Box::new(factory),
            }),
            rx,
        )
    }
}

impl Acceptor for TestAcceptor {
    fn local_addr(&self) -> SocketAddr {
        "127.0.0.1:0".parse().expect("loopback addr")
    }

    fn on_started(&self, local_addr: SocketAddr) {
        if let Some(tx) = self.addr_tx.lock().expect("addr_tx lock").take() {
            let _ = tx.send(local_addr);
        }
    }

    fn on_accepted(&self, session: &Arc<Session>) -> Arc<dyn SessionListener> {
        (self.factory)(session)
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Position-dependent payload byte, cheap to recompute on the verify side.
pub fn pattern_byte(stream_id: usize, index: usize) -> u8 {
    ((index.wrapping_mul(31) ^ stream_id.wrapping_mul(17)) & 0xff) as u8
}
