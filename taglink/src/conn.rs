//! Connection state machine.
//!
//! A connection wraps a provider endpoint and owns every request in
//! flight on it. After endpoint creation both sides exchange their
//! connection ids over the endpoint's stream channel; the handshake
//! completes when the 4-byte receive of the remote id finishes. Data and
//! io-message sends carry the remote id in the tag so the peer routes by
//! its own local id.
//!
//! Disconnection cancels outstanding requests, force-closes the endpoint,
//! and completes once the outstanding list drains and the asynchronous
//! close finishes. Errors are sticky: the first terminal status wins and
//! later submissions are refused.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};

use crate::error::Status;
use crate::provider::{ConnRequest, EpHandle, Submit};
use crate::request::{Attach, CompletionCb, DataCb, ReqCallback, ReqId};
use crate::tag;
use crate::worker::Engine;

static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(1);

/// A connection to one peer, owned by its worker and shared with user
/// code through `Rc`.
pub struct Connection {
    me: Weak<Connection>,
    engine: Rc<Engine>,
    conn_id: u32,
    remote_conn_id: Cell<u32>,
    ep: Cell<Option<EpHandle>>,
    status: Cell<Status>,
    establish_cb: RefCell<Option<CompletionCb>>,
    disconnect_cb: RefCell<Option<CompletionCb>>,
    close_request: Cell<Option<ReqId>>,
    outstanding: RefCell<Vec<ReqId>>,
    peer_addr: Cell<Option<SocketAddr>>,
    log_prefix: RefCell<String>,
}

impl Connection {
    pub(crate) fn new(engine: Rc<Engine>) -> Rc<Connection> {
        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let conn = Rc::new_cyclic(|me| Connection {
            me: me.clone(),
            engine,
            conn_id,
            remote_conn_id: Cell::new(0),
            ep: Cell::new(None),
            status: Cell::new(Status::InProgress),
            establish_cb: RefCell::new(None),
            disconnect_cb: RefCell::new(None),
            close_request: Cell::new(None),
            outstanding: RefCell::new(Vec::new()),
            peer_addr: Cell::new(None),
            log_prefix: RefCell::new(format!("[conn #{}]", conn_id)),
        });
        debug!("{} created", conn.log_prefix());
        conn
    }

    fn rc(&self) -> Rc<Connection> {
        self.me.upgrade().expect("connection is alive")
    }

    /// Process-local connection id. Nonzero.
    #[inline]
    pub fn id(&self) -> u32 {
        self.conn_id
    }

    /// The peer's connection id, zero until the handshake completes.
    #[inline]
    pub fn remote_id(&self) -> u32 {
        self.remote_conn_id.get()
    }

    /// Whether the handshake has completed.
    #[inline]
    pub fn is_established(&self) -> bool {
        self.remote_conn_id.get() != 0
    }

    /// Current connection status. Terminal errors are sticky.
    #[inline]
    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Socket address of the peer, once known.
    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr.get()
    }

    /// Printable prefix identifying this connection in logs.
    pub fn log_prefix(&self) -> String {
        self.log_prefix.borrow().clone()
    }

    fn set_peer(&self, addr: SocketAddr) {
        self.peer_addr.set(Some(addr));
        *self.log_prefix.borrow_mut() = format!("[conn #{} {}]", self.conn_id, addr);
    }

    pub(crate) fn connect(&self, addr: SocketAddr, cb: CompletionCb) {
        self.set_peer(addr);
        *self.establish_cb.borrow_mut() = Some(cb);
        debug!("{} connecting to {}", self.log_prefix(), addr);
        let created = self
            .engine
            .provider
            .borrow_mut()
            .ep_connect(addr, self.conn_id as u64);
        self.finish_ep_create(created);
    }

    /// Begin accepting an inbound connection request. Normally driven by
    /// the worker's accept loop.
    pub fn accept(&self, req: ConnRequest, cb: CompletionCb) {
        if let Some(addr) = self.engine.provider.borrow().conn_request_addr(req) {
            self.set_peer(addr);
        }
        *self.establish_cb.borrow_mut() = Some(cb);
        debug!("{} accepting connection request {:?}", self.log_prefix(), req);
        let created = self
            .engine
            .provider
            .borrow_mut()
            .ep_accept(req, self.conn_id as u64);
        self.finish_ep_create(created);
    }

    fn finish_ep_create(&self, created: Result<EpHandle, Status>) {
        match created {
            Ok(ep) => {
                self.ep.set(Some(ep));
                debug!("{} created endpoint {:?}", self.log_prefix(), ep);
                self.handshake();
                self.engine.add_connection(&self.rc());
            }
            Err(status) => {
                warn!("{} endpoint creation failed: {}", self.log_prefix(), status);
                self.handle_connection_error(status);
            }
        }
    }

    /// Exchange connection ids over the stream channel: receive the
    /// remote id (wait-all, 4 bytes), then send the local one.
    fn handshake(&self) {
        let ep = self.ep.get().expect("handshake without endpoint");

        let this = self.rc();
        let on_remote_id = ReqCallback::Data(Box::new(move |status, data| {
            if status == Status::Ok && data.len() >= 4 {
                this.remote_conn_id
                    .set(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
            }
            this.established(status);
        }));

        let submit = self.engine.provider.borrow_mut().stream_recv(ep, 4);
        match submit {
            Submit::Pending(id) => {
                match self.engine.arena.attach(id, on_remote_id, Some(self.rc())) {
                    Attach::Pending => {
                        self.outstanding.borrow_mut().push(id);
                        self.engine.add_handshaking(&self.rc());
                    }
                    Attach::Completed {
                        status,
                        cb,
                        buf,
                        recv_len,
                    } => {
                        cb.invoke(status, &buf[..recv_len]);
                        if self.status.get().is_err() {
                            return;
                        }
                    }
                }
            }
            Submit::Fail(status) => {
                self.established(status);
                return;
            }
            Submit::Done => {
                debug_assert!(false, "stream receives always return a request");
                return;
            }
        }

        // Send the local id. There is no completion observer: a failed
        // send surfaces through the endpoint's peer-error event.
        let bytes = self.conn_id.to_le_bytes();
        match self.engine.provider.borrow_mut().stream_send(ep, &bytes) {
            Submit::Pending(id) => self.engine.arena.release(id),
            Submit::Done | Submit::Fail(_) => {}
        }
    }

    /// Complete establishment. Invoked at most once with effect; the
    /// establish callback is taken before invocation.
    fn established(&self, status: Status) {
        if status == Status::Ok {
            debug_assert_ne!(self.remote_conn_id.get(), 0);
            debug!(
                "{} established, remote id is {}",
                self.log_prefix(),
                self.remote_conn_id.get()
            );
        }
        if self.status.get() == Status::InProgress {
            self.status.set(status);
        }
        self.engine.remove_handshaking(self.conn_id);
        if let Some(cb) = self.establish_cb.borrow_mut().take() {
            cb(status);
        }
    }

    /// Send a data message with sequence number `sn`. Returns false if the
    /// endpoint is gone or the connection has failed; the callback is then
    /// never invoked.
    pub fn send_data(&self, data: &[u8], sn: u32, cb: CompletionCb) -> bool {
        let tag = tag::data_tag(self.remote_conn_id.get(), sn);
        self.send_common("tag send", data, tag, cb)
    }

    /// Send an in-band io message.
    pub fn send_iomsg(&self, data: &[u8], cb: CompletionCb) -> bool {
        let tag = tag::iomsg_tag(self.remote_conn_id.get(), 0);
        self.send_common("io message send", data, tag, cb)
    }

    fn send_common(&self, what: &str, data: &[u8], tag: u64, cb: CompletionCb) -> bool {
        let Some(ep) = self.ep.get() else { return false };
        if self.status.get().is_err() {
            return false;
        }
        let submit = self.engine.provider.borrow_mut().tag_send(ep, data, tag);
        self.process_request(what, submit, ReqCallback::Completion(cb))
    }

    /// Receive a data message of up to `len` bytes with sequence number
    /// `sn`. The callback borrows the received payload. Returns false if
    /// the endpoint is gone or the connection has failed.
    pub fn recv_data(&self, len: usize, sn: u32, cb: DataCb) -> bool {
        if self.ep.get().is_none() {
            return false;
        }
        if self.status.get().is_err() {
            return false;
        }
        let tag = tag::data_tag(self.conn_id, sn);
        let submit =
            self.engine
                .provider
                .borrow_mut()
                .tag_recv(vec![0u8; len], tag, tag::DATA_TAG_MASK);
        self.process_request("tag receive", submit, ReqCallback::Data(cb))
    }

    /// Resolve a submission: inline completion, synchronous failure, or an
    /// in-flight request that may already have completed.
    fn process_request(&self, what: &str, submit: Submit, cb: ReqCallback) -> bool {
        match submit {
            Submit::Done => {
                cb.invoke(Status::Ok, &[]);
                true
            }
            Submit::Fail(status) => {
                warn!("{} {} failed: {}", self.log_prefix(), what, status);
                cb.invoke(status, &[]);
                false
            }
            Submit::Pending(id) => match self.engine.arena.attach(id, cb, Some(self.rc())) {
                Attach::Pending => {
                    self.outstanding.borrow_mut().push(id);
                    true
                }
                Attach::Completed {
                    status,
                    cb,
                    buf,
                    recv_len,
                } => {
                    cb.invoke(status, &buf[..recv_len]);
                    status == Status::Ok
                }
            },
        }
    }

    /// Start disconnection. Outstanding requests are cancelled and the
    /// endpoint force-closed; `cb` runs once everything has drained.
    ///
    /// Must not be called before establishment has completed, nor twice.
    pub fn disconnect(&self, cb: CompletionCb) {
        assert!(
            self.establish_cb.borrow().is_none(),
            "disconnect during establishment"
        );
        assert!(
            self.disconnect_cb.borrow().is_none(),
            "connection is already disconnecting"
        );
        debug!(
            "{} disconnecting, endpoint {:?}",
            self.log_prefix(),
            self.ep.get()
        );
        *self.disconnect_cb.borrow_mut() = Some(cb);
        if self.outstanding.borrow().is_empty() {
            self.ep_close();
            self.engine.move_connection_to_disconnecting(&self.rc());
        } else {
            self.cancel_all();
            self.ep_close();
        }
    }

    pub(crate) fn is_disconnecting(&self) -> bool {
        self.disconnect_cb.borrow().is_some()
    }

    fn ep_close(&self) {
        let Some(ep) = self.ep.take() else { return };
        debug_assert!(self.close_request.get().is_none());
        debug!("{} closing endpoint {:?} (force)", self.log_prefix(), ep);
        let close_req = self.engine.provider.borrow_mut().ep_close_force(ep);
        self.close_request.set(close_req);
    }

    /// Advance a disconnecting connection. True once the close request has
    /// finished and the disconnect callback has run.
    pub(crate) fn disconnect_progress(&self) -> bool {
        debug_assert!(self.ep.get().is_none());
        debug_assert!(self.disconnect_cb.borrow().is_some());
        if let Some(id) = self.close_request.get() {
            if self.engine.arena.check_status(id) == Status::InProgress {
                return false;
            }
            self.engine.arena.release(id);
            self.close_request.set(None);
        }
        debug_assert!(self.outstanding.borrow().is_empty());
        if let Some(cb) = self.disconnect_cb.borrow_mut().take() {
            cb(Status::Ok);
        }
        true
    }

    fn cancel_all(&self) {
        let ids: Vec<ReqId> = self.outstanding.borrow().clone();
        if ids.is_empty() {
            return;
        }
        let mut provider = self.engine.provider.borrow_mut();
        for (count, id) in ids.iter().enumerate() {
            debug!(
                "{} cancelling request {:?} #{}",
                self.log_prefix(),
                id,
                count + 1
            );
            provider.cancel(*id);
        }
    }

    /// Unlink a completed request; during disconnect, draining the list
    /// moves the connection to the reaping queue.
    pub(crate) fn request_completed(&self, id: ReqId) {
        let drained = {
            let mut outstanding = self.outstanding.borrow_mut();
            if let Some(pos) = outstanding.iter().position(|r| *r == id) {
                outstanding.swap_remove(pos);
            }
            outstanding.is_empty()
        };
        if self.is_disconnecting() {
            debug!(
                "{} completed request {:?} during disconnect",
                self.log_prefix(),
                id
            );
            if drained {
                self.engine.move_connection_to_disconnecting(&self.rc());
            }
        }
    }

    /// Handle an endpoint failure, a creation failure, or a handshake
    /// timeout. Idempotent: the first terminal status wins.
    ///
    /// For an established connection the user hook is dispatched from the
    /// failed queue on the current tick, never from inside the provider;
    /// outstanding requests drain through the cancellation path. For a
    /// connection still handshaking, the establish callback fires
    /// directly.
    pub(crate) fn handle_connection_error(&self, status: Status) {
        if self.status.get().is_err() {
            return;
        }
        warn!("{} detected error: {}", self.log_prefix(), status);
        self.status.set(status);
        if self.is_established() {
            self.cancel_all();
            self.engine.remove_connection(self.conn_id);
            self.engine.push_failed(self.rc());
        } else {
            self.engine.remove_handshaking(self.conn_id);
            if let Some(cb) = self.establish_cb.borrow_mut().take() {
                cb(status);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug_assert!(self.outstanding.borrow().is_empty());
        debug_assert!(self.close_request.get().is_none());
        debug_assert!(self.establish_cb.borrow().is_none());
        debug_assert!(self.disconnect_cb.borrow().is_none());
        debug!("{} released", self.log_prefix());
    }
}
