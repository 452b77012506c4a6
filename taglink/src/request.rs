//! In-flight request records and the submission/completion race.
//!
//! Every non-blocking provider operation allocates a record in the
//! [`RequestArena`]. The submitter and the completion path race benignly:
//! an operation may complete while the submitting call is still on the
//! stack. The `completed` flag resolves the race without locks:
//!
//! - If the submitter finds the record already completed, it claims the
//!   record, invokes the user callback itself, and frees it.
//! - Otherwise it stores the callback and the owning connection; the
//!   completion is then dispatched by the engine after the provider poll.
//!
//! The provider never invokes user callbacks — `finish` only records the
//! outcome and queues the record for dispatch, so completions reported
//! from inside a submission call cannot re-enter the runtime.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use slab::Slab;

use crate::conn::Connection;
use crate::error::Status;

/// Identifier of an in-flight request record.
///
/// The generation guards slab-slot reuse: a stale id (an inline completion
/// already claimed by its submitter, or a fire-and-forget release) is
/// ignored wherever it surfaces later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId {
    idx: u32,
    gen: u32,
}

/// Completion callback for operations without a received payload.
pub type CompletionCb = Box<dyn FnOnce(Status)>;

/// Completion callback receiving the received payload. The slice borrows
/// the request's buffer and is empty on error or cancellation.
pub type DataCb = Box<dyn FnOnce(Status, &[u8])>;

/// The user callback stored in a request record.
pub enum ReqCallback {
    Completion(CompletionCb),
    Data(DataCb),
}

impl ReqCallback {
    /// Invoke with the final status and, for receives, the payload.
    pub fn invoke(self, status: Status, data: &[u8]) {
        match self {
            ReqCallback::Completion(cb) => cb(status),
            ReqCallback::Data(cb) => cb(status, data),
        }
    }
}

/// An always-safe no-op completion callback.
pub fn noop() -> CompletionCb {
    Box::new(|_| ())
}

struct Request {
    gen: u32,
    callback: Option<ReqCallback>,
    conn: Option<Rc<Connection>>,
    completed: bool,
    status: Status,
    buf: Option<Vec<u8>>,
    recv_len: usize,
    sender_tag: u64,
}

/// Outcome of [`RequestArena::attach`].
pub enum Attach {
    /// Callback stored; the request stays in flight and must be linked
    /// into the owning connection's outstanding list.
    Pending,
    /// The request had already completed during submission. The record is
    /// freed and the callback handed back for the submitter to invoke.
    Completed {
        status: Status,
        cb: ReqCallback,
        buf: Vec<u8>,
        recv_len: usize,
    },
}

/// Arena of in-flight request records, shared between the engine and the
/// provider. Single-threaded; all mutation happens on the progress thread.
pub struct RequestArena {
    slab: RefCell<Slab<Request>>,
    next_gen: Cell<u32>,
    ready: RefCell<VecDeque<ReqId>>,
}

impl RequestArena {
    pub fn new() -> Self {
        Self {
            slab: RefCell::new(Slab::new()),
            next_gen: Cell::new(1),
            ready: RefCell::new(VecDeque::new()),
        }
    }

    fn insert(&self, buf: Option<Vec<u8>>) -> ReqId {
        let gen = self.next_gen.get();
        self.next_gen.set(gen.wrapping_add(1));
        let idx = self.slab.borrow_mut().insert(Request {
            gen,
            callback: None,
            conn: None,
            completed: false,
            status: Status::InProgress,
            buf,
            recv_len: 0,
            sender_tag: 0,
        });
        ReqId {
            idx: idx as u32,
            gen,
        }
    }

    /// Allocate a record for a send-like operation (provider side).
    pub fn start(&self) -> ReqId {
        self.insert(None)
    }

    /// Allocate a record owning the receive buffer (provider side).
    pub fn start_recv(&self, buf: Vec<u8>) -> ReqId {
        self.insert(Some(buf))
    }

    /// Record the completion of a request (provider side).
    ///
    /// Never invokes callbacks. If a callback is attached the record is
    /// queued for dispatch; otherwise the `completed` flag is left for the
    /// submitter or a poller to claim. A second completion of the same
    /// request, and any stale id, is ignored.
    pub fn finish(&self, id: ReqId, status: Status) {
        let queued = {
            let mut slab = self.slab.borrow_mut();
            let rec = match slab.get_mut(id.idx as usize) {
                Some(r) if r.gen == id.gen && !r.completed => r,
                _ => return,
            };
            rec.completed = true;
            rec.status = status;
            rec.callback.is_some()
        };
        if queued {
            self.ready.borrow_mut().push_back(id);
        }
    }

    /// Record the completion of a receive, copying the payload into the
    /// request's buffer (provider side).
    pub fn finish_recv(&self, id: ReqId, status: Status, sender_tag: u64, data: &[u8]) {
        {
            let mut slab = self.slab.borrow_mut();
            let rec = match slab.get_mut(id.idx as usize) {
                Some(r) if r.gen == id.gen && !r.completed => r,
                _ => return,
            };
            rec.sender_tag = sender_tag;
            if let Some(buf) = rec.buf.as_mut() {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                rec.recv_len = n;
            }
        }
        self.finish(id, status);
    }

    /// Resolve the submission race (submitter side, after the provider
    /// returned a request id).
    pub fn attach(&self, id: ReqId, cb: ReqCallback, conn: Option<Rc<Connection>>) -> Attach {
        let mut slab = self.slab.borrow_mut();
        let completed = {
            let rec = slab
                .get_mut(id.idx as usize)
                .filter(|r| r.gen == id.gen)
                .expect("attach to unknown request");
            if !rec.completed {
                rec.callback = Some(cb);
                rec.conn = conn;
                return Attach::Pending;
            }
            rec.completed
        };
        debug_assert!(completed);
        let rec = slab.remove(id.idx as usize);
        Attach::Completed {
            status: rec.status,
            cb,
            buf: rec.buf.unwrap_or_default(),
            recv_len: rec.recv_len,
        }
    }

    /// Run queued completion callbacks (engine side, once per progress
    /// tick, with no provider borrow held).
    pub fn dispatch(&self) -> usize {
        let mut count = 0;
        loop {
            let id = match self.ready.borrow_mut().pop_front() {
                Some(id) => id,
                None => return count,
            };
            let taken = {
                let mut slab = self.slab.borrow_mut();
                match slab.get(id.idx as usize) {
                    Some(r) if r.gen == id.gen && r.callback.is_some() => {
                        Some(slab.remove(id.idx as usize))
                    }
                    _ => None,
                }
            };
            let Some(rec) = taken else { continue };
            let buf = rec.buf.unwrap_or_default();
            let len = rec.recv_len.min(buf.len());
            if let Some(cb) = rec.callback {
                cb.invoke(rec.status, &buf[..len]);
            }
            if let Some(conn) = rec.conn {
                conn.request_completed(id);
            }
            count += 1;
        }
    }

    /// Whether a callback-less request has completed (poller side).
    pub fn is_completed(&self, id: ReqId) -> bool {
        self.slab
            .borrow()
            .get(id.idx as usize)
            .map(|r| r.gen == id.gen && r.completed)
            .unwrap_or(false)
    }

    /// Status, sender tag, and received length of a completed request,
    /// without freeing it.
    pub fn completed_info(&self, id: ReqId) -> Option<(Status, u64, usize)> {
        let slab = self.slab.borrow();
        let rec = slab.get(id.idx as usize)?;
        if rec.gen != id.gen || !rec.completed {
            return None;
        }
        Some((rec.status, rec.sender_tag, rec.recv_len))
    }

    /// Take a completed request out of the arena, with its buffer.
    pub fn take_completed(&self, id: ReqId) -> Option<(Status, u64, Vec<u8>, usize)> {
        let mut slab = self.slab.borrow_mut();
        match slab.get(id.idx as usize) {
            Some(r) if r.gen == id.gen && r.completed => {}
            _ => return None,
        }
        let rec = slab.remove(id.idx as usize);
        let buf = rec.buf.unwrap_or_default();
        let len = rec.recv_len.min(buf.len());
        Some((rec.status, rec.sender_tag, buf, len))
    }

    /// Poll a request's status without consuming it (endpoint-close
    /// requests).
    pub fn check_status(&self, id: ReqId) -> Status {
        match self.slab.borrow().get(id.idx as usize) {
            Some(r) if r.gen == id.gen => {
                if r.completed {
                    r.status
                } else {
                    Status::InProgress
                }
            }
            _ => Status::Ok,
        }
    }

    /// Free a record without invoking anything. Stale ids are ignored, so
    /// a fire-and-forget release races safely with a later completion.
    pub fn release(&self, id: ReqId) {
        let mut slab = self.slab.borrow_mut();
        let matches = slab
            .get(id.idx as usize)
            .map(|r| r.gen == id.gen)
            .unwrap_or(false);
        if matches {
            slab.remove(id.idx as usize);
        }
    }

    /// Number of live records.
    pub fn in_flight(&self) -> usize {
        self.slab.borrow().len()
    }
}

impl Default for RequestArena {
    fn default() -> Self {
        Self::new()
    }
}
