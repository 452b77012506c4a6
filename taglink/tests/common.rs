//! Common utilities for runtime integration tests.
//!
//! Tests drive two workers attached to one in-process fabric and tick
//! both engines by hand.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

use loopnet::Fabric;
use taglink::{Connection, Handler, Status, Worker, WorkerConfig};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Everything the handler observed, in arrival order.
#[derive(Default)]
pub struct Events {
    pub accepted: Vec<Rc<Connection>>,
    pub errors: Vec<u32>,
    pub iomsgs: Vec<(u32, Vec<u8>)>,
}

/// Handler recording every event into a shared `Events`.
pub struct Recorder {
    pub events: Rc<RefCell<Events>>,
}

impl Handler for Recorder {
    fn on_accepted(&mut self, conn: &Rc<Connection>) {
        self.events.borrow_mut().accepted.push(conn.clone());
    }

    fn on_iomsg(&mut self, conn: &Rc<Connection>, data: &[u8]) {
        self.events
            .borrow_mut()
            .iomsgs
            .push((conn.id(), data.to_vec()));
    }

    fn on_error(&mut self, conn: &Rc<Connection>) {
        self.events.borrow_mut().errors.push(conn.id());
    }
}

/// A listening server worker and a client worker on one fabric.
pub struct Pair {
    pub fabric: Fabric,
    pub server: Worker,
    pub client: Worker,
    pub server_events: Rc<RefCell<Events>>,
    pub client_events: Rc<RefCell<Events>>,
}

pub fn pair(addr: SocketAddr) -> Pair {
    pair_with(addr, WorkerConfig::default())
}

pub fn pair_with(addr: SocketAddr, config: WorkerConfig) -> Pair {
    init_logging();
    let fabric = Fabric::new();

    let server_events = Rc::new(RefCell::new(Events::default()));
    let server = Worker::new(
        Box::new(fabric.attach()),
        Box::new(Recorder {
            events: server_events.clone(),
        }),
        config.clone(),
    )
    .expect("server worker");
    server.listen(addr).expect("listen");

    let client_events = Rc::new(RefCell::new(Events::default()));
    let client = Worker::new(
        Box::new(fabric.attach()),
        Box::new(Recorder {
            events: client_events.clone(),
        }),
        config,
    )
    .expect("client worker");

    Pair {
        fabric,
        server,
        client,
        server_events,
        client_events,
    }
}

/// Tick both workers `n` times, client first.
pub fn tick(pair: &Pair, n: usize) {
    for _ in 0..n {
        pair.client.progress();
        pair.server.progress();
    }
}

/// Tick until `pred` holds, up to a generous bound. Returns whether it
/// ever held.
pub fn tick_until(pair: &Pair, mut pred: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if pred() {
            return true;
        }
        tick(pair, 1);
    }
    pred()
}

/// Connect the client to `addr` and run both sides to establishment.
/// Returns the client-side and server-side connections.
pub fn establish(pair: &Pair, addr: SocketAddr) -> (Rc<Connection>, Rc<Connection>) {
    let status = Rc::new(Cell::new(None));
    let s = status.clone();
    let before = pair.server_events.borrow().accepted.len();
    let client_conn = pair
        .client
        .connect(addr, Box::new(move |st| s.set(Some(st))));
    assert!(
        tick_until(pair, || {
            status.get().is_some() && pair.server_events.borrow().accepted.len() > before
        }),
        "handshake did not complete"
    );
    assert_eq!(status.get(), Some(Status::Ok));
    let server_conn = pair.server_events.borrow().accepted[before].clone();
    (client_conn, server_conn)
}
