//! Worker engine: one cooperative, single-threaded progress context.
//!
//! The worker owns the provider, the request arena, the connection
//! registry, and the queues that sequence deferred work: in-progress
//! handshakes ordered by deadline, unaccepted inbound connection
//! requests, failed connections awaiting the user's error hook, and
//! disconnecting connections awaiting reaping. A single io-message
//! receive is outstanding from creation to teardown.
//!
//! Each `progress()` tick runs one provider poll, then drains completions
//! and events in a fixed order: connection requests, endpoint errors,
//! request completions, the io-message receive, handshake timeouts,
//! pending accepts, failed-connection hooks, finished disconnects.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::conn::Connection;
use crate::error::{Error, Result, Status};
use crate::provider::{ConnRequest, Features, Provider, Submit};
use crate::request::{noop, CompletionCb, ReqId, RequestArena};
use crate::tag;

/// User-overridable event hooks, dispatched from `progress()`.
pub trait Handler {
    /// A server-side connection finished its handshake.
    fn on_accepted(&mut self, conn: &Rc<Connection>) {
        let _ = conn;
    }

    /// An in-band io message arrived on an established connection.
    fn on_iomsg(&mut self, conn: &Rc<Connection>, data: &[u8]) {
        let _ = (conn, data);
    }

    /// An established connection failed. Dispatched at most once per
    /// connection, from the progress tick, never from inside the
    /// provider.
    fn on_error(&mut self, conn: &Rc<Connection>) {
        let _ = conn;
    }
}

/// Handler that ignores every event.
impl Handler for () {}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Size of the io-message receive buffer.
    /// Default: 4096
    pub iomsg_size: usize,
    /// Timeout applied to handshakes (client and server) and to
    /// unaccepted connection requests.
    /// Default: 10s
    pub connect_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            iomsg_size: 4096,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the io-message buffer size.
    pub fn with_iomsg_size(mut self, iomsg_size: usize) -> Self {
        self.iomsg_size = iomsg_size;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Shared engine state. Connections hold an `Rc` to this.
pub(crate) struct Engine {
    pub(crate) provider: RefCell<Box<dyn Provider>>,
    pub(crate) arena: Rc<RequestArena>,
    handler: RefCell<Box<dyn Handler>>,
    conns: RefCell<HashMap<u32, Rc<Connection>>>,
    handshaking: RefCell<Vec<(Instant, Rc<Connection>)>>,
    pending_accepts: RefCell<VecDeque<(ConnRequest, Instant)>>,
    failed: RefCell<VecDeque<Rc<Connection>>>,
    disconnecting: RefCell<VecDeque<Rc<Connection>>>,
    iomsg_req: Cell<Option<ReqId>>,
    config: WorkerConfig,
}

/// A single-threaded progress context driving a set of connections.
pub struct Worker {
    engine: Rc<Engine>,
}

impl Worker {
    /// Create a worker over `provider`. Fails if the provider lacks the
    /// required TAG and STREAM capabilities. Posts the io-message
    /// receive.
    pub fn new(
        mut provider: Box<dyn Provider>,
        handler: Box<dyn Handler>,
        config: WorkerConfig,
    ) -> Result<Worker> {
        let features = provider.features();
        if !features.contains(Features::REQUIRED) {
            return Err(Error::MissingFeatures(Features::REQUIRED.difference(features)));
        }

        let arena = Rc::new(RequestArena::new());
        provider.bind(arena.clone());

        let engine = Rc::new(Engine {
            provider: RefCell::new(provider),
            arena,
            handler: RefCell::new(handler),
            conns: RefCell::new(HashMap::new()),
            handshaking: RefCell::new(Vec::new()),
            pending_accepts: RefCell::new(VecDeque::new()),
            failed: RefCell::new(VecDeque::new()),
            disconnecting: RefCell::new(VecDeque::new()),
            iomsg_req: Cell::new(None),
            config,
        });
        engine.recv_io_message();
        info!("created worker (features {:?})", features);
        Ok(Worker { engine })
    }

    /// Start accepting connections on `addr`. Accepted connections are
    /// handed to the handler's `on_accepted`.
    pub fn listen(&self, addr: SocketAddr) -> Result<()> {
        self.engine
            .provider
            .borrow_mut()
            .listen(addr)
            .map_err(Error::Listen)?;
        info!("started listener on {}", addr);
        Ok(())
    }

    /// Begin connecting to `addr`. The establish callback is invoked with
    /// the outcome exactly once, from a later `progress()` call or inline
    /// on immediate failure.
    pub fn connect(&self, addr: SocketAddr, establish_cb: CompletionCb) -> Rc<Connection> {
        let conn = Connection::new(self.engine.clone());
        conn.connect(addr, establish_cb);
        conn
    }

    /// Drive all outstanding communication one tick forward.
    pub fn progress(&self) {
        Engine::progress(&self.engine);
    }

    /// Look up a live connection by id.
    pub fn connection(&self, conn_id: u32) -> Option<Rc<Connection>> {
        self.engine.conns.borrow().get(&conn_id).cloned()
    }

    /// Number of live connections (established or handshaking).
    pub fn connection_count(&self) -> usize {
        self.engine.conns.borrow().len()
    }

    /// Number of in-flight request records, the io-message receive
    /// included.
    pub fn in_flight_requests(&self) -> usize {
        self.engine.arena.in_flight()
    }

    /// The worker's configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.engine.config
    }
}

impl Engine {
    pub(crate) fn progress(this: &Rc<Engine>) {
        this.provider.borrow_mut().progress();
        this.drain_conn_requests();
        this.drain_ep_errors();
        this.arena.dispatch();
        this.progress_io_message();
        this.progress_timed_out_conns();
        Engine::progress_conn_requests(this);
        this.progress_failed_connections();
        this.progress_disconnected_connections();
    }

    /// Post the single long-lived io-message receive.
    fn recv_io_message(&self) {
        let buf = vec![0u8; self.config.iomsg_size];
        let submit = self
            .provider
            .borrow_mut()
            .tag_recv(buf, tag::IOMSG_TAG, tag::IOMSG_TAG);
        match submit {
            Submit::Pending(id) => self.iomsg_req.set(Some(id)),
            Submit::Done | Submit::Fail(_) => panic!("failed to post the io message receive"),
        }
    }

    fn drain_conn_requests(&self) {
        loop {
            let req = self.provider.borrow_mut().next_conn_request();
            let Some(req) = req else { return };
            match self.provider.borrow().conn_request_addr(req) {
                Some(addr) => debug!("new connection request {:?} from {}", req, addr),
                None => debug!("new connection request {:?}", req),
            }
            self.pending_accepts
                .borrow_mut()
                .push_back((req, Instant::now()));
        }
    }

    fn drain_ep_errors(&self) {
        loop {
            let event = self.provider.borrow_mut().next_ep_error();
            let Some((err_arg, status)) = event else { return };
            let conn = self.conns.borrow().get(&(err_arg as u32)).cloned();
            match conn {
                Some(conn) => conn.handle_connection_error(status),
                None => debug!(
                    "endpoint error for unknown connection {}: {}",
                    err_arg, status
                ),
            }
        }
    }

    fn progress_io_message(&self) {
        let Some(id) = self.iomsg_req.get() else { return };
        let Some((status, sender_tag, _len)) = self.arena.completed_info(id) else {
            return;
        };
        if status.is_err() {
            warn!("io message receive failed: {}", status);
            self.arena.release(id);
            self.iomsg_req.set(None);
            self.recv_io_message();
            return;
        }
        let conn_id = tag::iomsg_sender(sender_tag);
        let conn = self.conns.borrow().get(&conn_id).cloned();
        match conn {
            None => {
                warn!("io message for unknown connection {}", conn_id);
                self.arena.release(id);
                self.iomsg_req.set(None);
                self.recv_io_message();
            }
            Some(conn) if !conn.is_established() => {
                // The tagged receive can complete before the handshake's
                // stream receive; re-check on the next tick.
            }
            Some(conn) => {
                let (_, _, buf, len) = self
                    .arena
                    .take_completed(id)
                    .expect("completed io message request");
                self.iomsg_req.set(None);
                self.handler.borrow_mut().on_iomsg(&conn, &buf[..len]);
                self.recv_io_message();
            }
        }
    }

    fn progress_timed_out_conns(&self) {
        loop {
            let conn = {
                let mut handshaking = self.handshaking.borrow_mut();
                match handshaking.first() {
                    Some((deadline, _)) if *deadline <= Instant::now() => {
                        Some(handshaking.remove(0).1)
                    }
                    _ => None,
                }
            };
            let Some(conn) = conn else { return };
            conn.handle_connection_error(Status::TimedOut);
        }
    }

    fn progress_conn_requests(this: &Rc<Engine>) {
        loop {
            let next = this.pending_accepts.borrow_mut().pop_front();
            let Some((req, arrived)) = next else { return };
            if arrived.elapsed() > this.config.connect_timeout {
                warn!(
                    "rejecting connection request {:?}: server timeout ({:?}) elapsed",
                    req, this.config.connect_timeout
                );
                this.provider.borrow_mut().reject(req);
                continue;
            }
            let conn = Connection::new(this.clone());
            let engine = this.clone();
            let accepted = conn.clone();
            conn.accept(
                req,
                Box::new(move |status| {
                    if status == Status::Ok {
                        engine.handler.borrow_mut().on_accepted(&accepted);
                    } else {
                        debug!("{} accept failed: {}", accepted.log_prefix(), status);
                        accepted.disconnect(noop());
                    }
                }),
            );
        }
    }

    fn progress_failed_connections(&self) {
        loop {
            let conn = self.failed.borrow_mut().pop_front();
            let Some(conn) = conn else { return };
            self.handler.borrow_mut().on_error(&conn);
        }
    }

    fn progress_disconnected_connections(&self) {
        let pending: Vec<Rc<Connection>> = self.disconnecting.borrow_mut().drain(..).collect();
        for conn in pending {
            if conn.disconnect_progress() {
                debug!("{} disconnect finished", conn.log_prefix());
            } else {
                self.disconnecting.borrow_mut().push_back(conn);
            }
        }
    }

    pub(crate) fn add_connection(&self, conn: &Rc<Connection>) {
        let prev = self.conns.borrow_mut().insert(conn.id(), conn.clone());
        debug_assert!(prev.is_none());
        debug!("{} added to connection map", conn.log_prefix());
    }

    pub(crate) fn remove_connection(&self, conn_id: u32) {
        if self.conns.borrow_mut().remove(&conn_id).is_some() {
            debug!("[conn #{}] removed from connection map", conn_id);
        }
    }

    pub(crate) fn add_handshaking(&self, conn: &Rc<Connection>) {
        let deadline = Instant::now() + self.config.connect_timeout;
        self.handshaking.borrow_mut().push((deadline, conn.clone()));
    }

    pub(crate) fn remove_handshaking(&self, conn_id: u32) {
        // Entries leave close to insertion order; the linear search stays
        // short.
        let mut handshaking = self.handshaking.borrow_mut();
        if let Some(pos) = handshaking.iter().position(|(_, c)| c.id() == conn_id) {
            handshaking.remove(pos);
        }
    }

    pub(crate) fn push_failed(&self, conn: Rc<Connection>) {
        self.failed.borrow_mut().push_back(conn);
    }

    pub(crate) fn move_connection_to_disconnecting(&self, conn: &Rc<Connection>) {
        self.remove_connection(conn.id());
        let mut disconnecting = self.disconnecting.borrow_mut();
        debug_assert!(!disconnecting.iter().any(|c| Rc::ptr_eq(c, conn)));
        disconnecting.push_back(conn.clone());
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let engine = &self.engine;

        // Reject connection requests that were never accepted.
        loop {
            let next = engine.pending_accepts.borrow_mut().pop_front();
            let Some((req, _)) = next else { break };
            debug!("rejecting connection request {:?} at shutdown", req);
            engine.provider.borrow_mut().reject(req);
        }

        // Fail connections still handshaking so their establish callback
        // fires exactly once, then disconnect them.
        loop {
            let conn = engine.handshaking.borrow_mut().pop().map(|(_, c)| c);
            let Some(conn) = conn else { break };
            conn.handle_connection_error(Status::Cancelled);
            if !conn.is_disconnecting() {
                conn.disconnect(noop());
            }
        }

        // Disconnect connections awaiting the error hook and everything
        // still registered.
        loop {
            let conn = engine.failed.borrow_mut().pop_front();
            let Some(conn) = conn else { break };
            if !conn.is_disconnecting() {
                conn.disconnect(noop());
            }
        }
        let conns: Vec<Rc<Connection>> =
            engine.conns.borrow_mut().drain().map(|(_, c)| c).collect();
        for conn in conns {
            if !conn.is_disconnecting() {
                conn.disconnect(noop());
            }
        }

        // Drive the provider until every disconnect has been reaped and
        // only the io message receive remains in flight.
        while !engine.disconnecting.borrow().is_empty() || engine.arena.in_flight() > 1 {
            engine.provider.borrow_mut().progress();
            engine.arena.dispatch();
            engine.progress_disconnected_connections();
        }

        // Reap the io message receive.
        if let Some(id) = engine.iomsg_req.take() {
            engine.provider.borrow_mut().cancel(id);
            engine.provider.borrow_mut().progress();
            engine.arena.release(id);
        }
    }
}
