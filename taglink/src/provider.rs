//! Transport provider capability surface.
//!
//! The runtime drives a single polling provider per worker: endpoints,
//! tagged messages, per-endpoint byte streams, and a progress tick. All
//! handles are opaque. Completions are never delivered by calling back
//! into the runtime; the provider records them in the shared
//! [`RequestArena`] and queues events that the engine drains right after
//! the poll (connection requests and endpoint errors included).

use std::net::SocketAddr;
use std::rc::Rc;

use bitflags::bitflags;

use crate::error::Status;
use crate::request::{ReqId, RequestArena};

bitflags! {
    /// Provider capability bits surfaced at worker creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// Tagged send/receive with masked matching.
        const TAG = 1 << 0;
        /// Per-endpoint in-order byte stream.
        const STREAM = 1 << 1;
        /// Blocking wakeup support.
        const WAKEUP = 1 << 2;
        /// Remote memory access.
        const RMA = 1 << 3;
        /// 32-bit atomics.
        const AMO32 = 1 << 4;
        /// 64-bit atomics.
        const AMO64 = 1 << 5;
    }
}

impl Features {
    /// Features the runtime cannot operate without.
    pub const REQUIRED: Features = Features::TAG.union(Features::STREAM);
}

/// Opaque provider endpoint handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpHandle(pub u64);

/// Opaque inbound connection request handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnRequest(pub u64);

/// Result of a non-blocking submission.
///
/// Receives always return `Pending` or `Fail` (the request record carries
/// the buffer); sends may complete inline with `Done`. A `Pending`
/// request may already be completed by the time the submission returns —
/// the submitter resolves that race through [`RequestArena::attach`].
#[derive(Debug)]
pub enum Submit {
    /// Completed inline with `Ok`; no request record was created.
    Done,
    /// Submission failed; no request record was created.
    Fail(Status),
    /// In flight (or completed inline) as the given request record.
    Pending(ReqId),
}

/// A polling transport provider bound to one worker.
pub trait Provider {
    /// Hand the provider the worker's request arena. Called exactly once,
    /// before any other method.
    fn bind(&mut self, arena: Rc<RequestArena>);

    /// Capability bits of this provider.
    fn features(&self) -> Features;

    /// Start accepting connection requests on `addr`.
    fn listen(&mut self, addr: SocketAddr) -> std::result::Result<(), Status>;

    /// Drain one queued inbound connection request, if any.
    fn next_conn_request(&mut self) -> Option<ConnRequest>;

    /// Socket address of the requesting client.
    fn conn_request_addr(&self, req: ConnRequest) -> Option<SocketAddr>;

    /// Reject a pending connection request.
    fn reject(&mut self, req: ConnRequest);

    /// Create an endpoint actively connected to `addr`. `err_arg` is
    /// echoed back in endpoint-error events for this endpoint.
    fn ep_connect(&mut self, addr: SocketAddr, err_arg: u64)
        -> std::result::Result<EpHandle, Status>;

    /// Create an endpoint from an inbound connection request.
    fn ep_accept(&mut self, req: ConnRequest, err_arg: u64)
        -> std::result::Result<EpHandle, Status>;

    /// Close an endpoint immediately, dropping in-flight traffic. Returns
    /// a close request to poll via the arena, or `None` if the close
    /// finished inline.
    fn ep_close_force(&mut self, ep: EpHandle) -> Option<ReqId>;

    /// Non-blocking tagged send. The payload is copied out before return.
    fn tag_send(&mut self, ep: EpHandle, data: &[u8], tag: u64) -> Submit;

    /// Non-blocking tagged receive into `buf`, matching messages whose
    /// sender tag satisfies `sender_tag & mask == tag & mask`.
    fn tag_recv(&mut self, buf: Vec<u8>, tag: u64, mask: u64) -> Submit;

    /// Non-blocking stream send on an endpoint. Copied out before return.
    fn stream_send(&mut self, ep: EpHandle, data: &[u8]) -> Submit;

    /// Non-blocking stream receive of exactly `len` bytes (wait-all).
    fn stream_recv(&mut self, ep: EpHandle, len: usize) -> Submit;

    /// Request cancellation of an in-flight operation. The request is only
    /// cancelled once its completion is recorded (with `Cancelled`).
    fn cancel(&mut self, id: ReqId);

    /// Drive outstanding communication. Returns the number of events
    /// processed.
    fn progress(&mut self) -> usize;

    /// Drain one queued endpoint-error event: the `err_arg` registered at
    /// endpoint creation and the failure status.
    fn next_ep_error(&mut self) -> Option<(u64, Status)>;
}
