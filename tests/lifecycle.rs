// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session lifecycle scenarios: outbound connects, connection churn, and
//! shutdown under load.

mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{start_engine, wait_until, TestAcceptor};
use strand::{Connector, PooledBuffer, Session, SessionListener};

struct EchoListener {
    session: Arc<Session>,
}

impl SessionListener for EchoListener {
    fn on_data_received(&self, data: PooledBuffer) {
        self.session.send_data(data.clone());
    }

    fn on_connection_closed(&self) {}
}

#[derive(Default)]
struct Collector {
    bytes: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl SessionListener for Collector {
    fn on_data_received(&self, data: PooledBuffer) {
        self.bytes.lock().expect("bytes lock").extend_from_slice(&data);
    }

    fn on_connection_closed(&self) {
        assert!(
            !self.closed.swap(true, Ordering::AcqRel),
            "on_connection_closed delivered twice"
        );
    }
}

struct TestConnector {
    addr: SocketAddr,
    session: Mutex<Option<Arc<Session>>>,
    collector: Arc<Collector>,
}

impl Connector for TestConnector {
    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    fn on_connected(&self, session: &Arc<Session>) -> Arc<dyn SessionListener> {
        *self.session.lock().expect("session lock") = Some(Arc::clone(session));
        self.collector.clone()
    }
}

#[test]
fn connector_round_trip_with_sync_send() {
    let (engine, runner) = start_engine("connector");
    let (acceptor, addr_rx) = TestAcceptor::new(|session| {
        Arc::new(EchoListener {
            session: Arc::clone(session),
        })
    });
    engine.add_acceptor(acceptor).expect("add acceptor");
    let addr = addr_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("acceptor started");

    let collector = Arc::new(Collector::default());
    let connector = Arc::new(TestConnector {
        addr,
        session: Mutex::new(None),
        collector: Arc::clone(&collector),
    });
    engine
        .add_connector(connector.clone())
        .expect("add connector");

    assert!(wait_until(Duration::from_secs(5), || {
        connector.session.lock().expect("session lock").is_some()
    }));
    let session = connector
        .session
        .lock()
        .expect("session lock")
        .clone()
        .expect("connected session");

    // Synchronous send blocks until the bytes hit the socket.
    let mut buf = engine.alloc_buffer(11);
    buf.as_mut_slice().copy_from_slice(b"hello there");
    assert!(session.send_data_sync(buf));

    assert!(wait_until(Duration::from_secs(5), || {
        collector.bytes.lock().expect("bytes lock").len() == 11
    }));
    assert_eq!(&*collector.bytes.lock().expect("bytes lock"), b"hello there");

    // Local close: the listener must observe exactly one closed callback.
    assert!(session.close_connection());
    assert!(!session.close_connection());
    assert!(wait_until(Duration::from_secs(5), || {
        collector.closed.load(Ordering::Acquire)
    }));

    // A closed session refuses further sends.
    assert!(!session.send_bytes(b"late"));

    engine.stop();
    runner.join().expect("reactor thread").expect("shutdown");
}

#[test]
fn rapid_connect_disconnect_leaks_nothing() {
    const CONNECTIONS: usize = 500;

    let (engine, runner) = start_engine("churn");
    let received = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    struct ChurnListener {
        received: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        fired: AtomicBool,
    }
    impl SessionListener for ChurnListener {
        fn on_data_received(&self, data: PooledBuffer) {
            self.received.fetch_add(data.len(), Ordering::Relaxed);
        }
        fn on_connection_closed(&self) {
            assert!(!self.fired.swap(true, Ordering::AcqRel));
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    let (acceptor, addr_rx) = {
        let received = Arc::clone(&received);
        let closed = Arc::clone(&closed);
        TestAcceptor::new(move |_session| {
            Arc::new(ChurnListener {
                received: Arc::clone(&received),
                closed: Arc::clone(&closed),
                fired: AtomicBool::new(false),
            })
        })
    };
    engine.add_acceptor(acceptor).expect("add acceptor");
    let addr = addr_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("acceptor started");

    for _ in 0..CONNECTIONS {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(&[0xAB; 4]).expect("write");
        // Dropping the stream closes it; the engine must observe EOF.
    }

    assert!(
        wait_until(Duration::from_secs(30), || {
            closed.load(Ordering::Relaxed) == CONNECTIONS
        }),
        "only {} of {} sessions closed",
        closed.load(Ordering::Relaxed),
        CONNECTIONS
    );
    assert_eq!(received.load(Ordering::Relaxed), CONNECTIONS * 4);

    engine.stop();
    runner.join().expect("reactor thread").expect("shutdown");

    let snapshot = engine.metrics();
    assert_eq!(snapshot.sessions_opened, CONNECTIONS as u64);
    assert_eq!(snapshot.sessions_closed, CONNECTIONS as u64);
    assert_eq!(snapshot.active_sessions(), 0);
}

#[test]
fn shutdown_under_load_closes_every_session_once() {
    const SESSIONS: usize = 100;

    let (engine, runner) = start_engine("shutdown");
    let closed = Arc::new(AtomicUsize::new(0));

    struct CountingListener {
        closed: Arc<AtomicUsize>,
        fired: AtomicBool,
    }
    impl SessionListener for CountingListener {
        fn on_data_received(&self, _data: PooledBuffer) {}
        fn on_connection_closed(&self) {
            assert!(!self.fired.swap(true, Ordering::AcqRel));
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    let (acceptor, addr_rx) = {
        let closed = Arc::clone(&closed);
        TestAcceptor::new(move |_session| {
            Arc::new(CountingListener {
                closed: Arc::clone(&closed),
                fired: AtomicBool::new(false),
            })
        })
    };
    engine.add_acceptor(acceptor).expect("add acceptor");
    let addr = addr_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("acceptor started");

    let mut streams = Vec::new();
    for i in 0..SESSIONS {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream
            .write_all(format!("session-{i}").as_bytes())
            .expect("write");
        streams.push(stream);
    }

    assert!(wait_until(Duration::from_secs(10), || {
        engine.metrics().sessions_opened == SESSIONS as u64
    }));

    engine.stop();
    runner.join().expect("reactor thread").expect("shutdown");

    assert_eq!(closed.load(Ordering::Relaxed), SESSIONS);
    let snapshot = engine.metrics();
    assert_eq!(snapshot.sessions_closed, SESSIONS as u64);
    assert_eq!(snapshot.active_sessions(), 0);

    // Clients observe end of stream.
    for mut stream in streams {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let mut sink = [0u8; 16];
        loop {
            match stream.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => panic!("expected EOF after engine stop, got {e}"),
            }
        }
    }
}
