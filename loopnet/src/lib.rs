//! loopnet - in-process loopback provider for the taglink runtime.
//!
//! A [`Fabric`] connects any number of workers living in one process.
//! Each attached [`Loopback`] implements [`taglink::Provider`]: listeners
//! are registered by socket address (no OS sockets are opened), endpoints
//! form pairs, tagged messages are matched against posted receives with
//! the usual `sender_tag & mask == tag & mask` rule, and each endpoint
//! carries an in-order byte stream.
//!
//! Delivery semantics mirror a real transport closely enough to exercise
//! the runtime's corner cases:
//!
//! - Sends below the eager limit complete inline; larger sends stay in
//!   flight until the receiving side matches them (rendezvous) and can be
//!   cancelled and retracted until then.
//! - Connecting to an address nobody listens on creates a black-hole
//!   endpoint: nothing completes until the connect timeout expires.
//! - Force-closing an endpoint breaks the pair and queues a peer-error
//!   event for the survivor; the close itself finishes on the next
//!   progress tick.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;

use log::debug;

use taglink::{ConnRequest, EpHandle, Features, Provider, ReqId, RequestArena, Status, Submit};

/// Sends below this size complete inline by default.
pub const DEFAULT_EAGER_LIMIT: usize = 8192;

/// Per-provider configuration.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Sends below this size complete inline; larger ones rendezvous.
    pub eager_limit: usize,
    /// Capability bits reported to the runtime.
    pub features: Features,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            eager_limit: DEFAULT_EAGER_LIMIT,
            features: Features::TAG.union(Features::STREAM),
        }
    }
}

impl LoopbackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the eager/rendezvous threshold.
    pub fn with_eager_limit(mut self, eager_limit: usize) -> Self {
        self.eager_limit = eager_limit;
        self
    }

    /// Set the reported capability bits.
    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }
}

struct WireMsg {
    tag: u64,
    data: Vec<u8>,
    /// Sender context and request id for rendezvous sends; `None` for
    /// eager sends, which completed at submission.
    send_req: Option<(u32, ReqId)>,
}

#[derive(Clone, Copy)]
struct PostedRecv {
    req: ReqId,
    tag: u64,
    mask: u64,
}

struct StreamWait {
    req: ReqId,
    ep: u64,
    need: usize,
}

struct EpState {
    ctx: u32,
    err_arg: u64,
    peer: Option<u64>,
    remote_addr: SocketAddr,
    stream_in: VecDeque<u8>,
    /// Stream bytes sent before the peer endpoint existed.
    out_backlog: Vec<u8>,
    failed: Option<Status>,
}

struct ConnReqState {
    client_ep: u64,
    client_addr: SocketAddr,
}

#[derive(Default)]
struct Mailbox {
    msgs: VecDeque<WireMsg>,
    conn_requests: VecDeque<u64>,
    ep_errors: VecDeque<(u64, Status)>,
    /// Rendezvous sends of this context completed by a remote match.
    acks: VecDeque<ReqId>,
}

struct FabricState {
    next_ctx: u32,
    next_ep: u64,
    next_conn_req: u64,
    listeners: HashMap<SocketAddr, u32>,
    eps: HashMap<u64, EpState>,
    conn_reqs: HashMap<u64, ConnReqState>,
    mailboxes: HashMap<u32, Mailbox>,
}

impl FabricState {
    fn alloc_ep(&mut self) -> u64 {
        let id = self.next_ep;
        self.next_ep += 1;
        id
    }

    /// Break an endpoint out of its pair, queueing a peer-error event for
    /// a live survivor.
    fn break_pair(&mut self, ep_id: u64) {
        let Some(ep) = self.eps.remove(&ep_id) else { return };
        let Some(peer_id) = ep.peer else { return };
        if let Some(peer) = self.eps.get_mut(&peer_id) {
            if peer.failed.is_none() {
                peer.failed = Some(Status::PeerClosed);
                peer.peer = None;
                let (peer_ctx, peer_arg) = (peer.ctx, peer.err_arg);
                if let Some(mb) = self.mailboxes.get_mut(&peer_ctx) {
                    mb.ep_errors.push_back((peer_arg, Status::PeerClosed));
                }
            }
        }
    }
}

/// An in-process fabric connecting workers of a single process.
pub struct Fabric {
    state: Rc<RefCell<FabricState>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(FabricState {
                next_ctx: 1,
                next_ep: 1,
                next_conn_req: 1,
                listeners: HashMap::new(),
                eps: HashMap::new(),
                conn_reqs: HashMap::new(),
                mailboxes: HashMap::new(),
            })),
        }
    }

    /// Attach a provider with default configuration.
    pub fn attach(&self) -> Loopback {
        self.attach_with(LoopbackConfig::default())
    }

    /// Attach a provider with the given configuration.
    pub fn attach_with(&self, cfg: LoopbackConfig) -> Loopback {
        let mut st = self.state.borrow_mut();
        let ctx = st.next_ctx;
        st.next_ctx += 1;
        st.mailboxes.insert(ctx, Mailbox::default());
        Loopback {
            state: self.state.clone(),
            ctx,
            cfg,
            arena: None,
            posted: Vec::new(),
            stream_waits: Vec::new(),
            pending_sends: HashMap::new(),
            closing: Vec::new(),
        }
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker's view of the fabric. Implements [`Provider`].
pub struct Loopback {
    state: Rc<RefCell<FabricState>>,
    ctx: u32,
    cfg: LoopbackConfig,
    arena: Option<Rc<RequestArena>>,
    posted: Vec<PostedRecv>,
    stream_waits: Vec<StreamWait>,
    /// Rendezvous sends in flight, by destination context.
    pending_sends: HashMap<ReqId, u32>,
    /// Close requests finishing on the next progress tick.
    closing: Vec<ReqId>,
}

impl Loopback {
    fn arena(&self) -> Rc<RequestArena> {
        self.arena.clone().expect("provider not bound to a worker")
    }

    /// Synthetic client address, one per context.
    fn client_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000u16.wrapping_add(self.ctx as u16)))
    }

    /// Pull the first message matching `tag`/`mask` out of this context's
    /// mailbox.
    fn match_msg(&self, tag: u64, mask: u64) -> Option<WireMsg> {
        let mut st = self.state.borrow_mut();
        let mb = st.mailboxes.get_mut(&self.ctx)?;
        let pos = mb.msgs.iter().position(|m| m.tag & mask == tag & mask)?;
        mb.msgs.remove(pos)
    }

    /// Complete the sending side of a matched rendezvous message.
    fn ack_sender(&self, msg: &WireMsg) {
        if let Some((src_ctx, send_req)) = msg.send_req {
            let mut st = self.state.borrow_mut();
            if let Some(mb) = st.mailboxes.get_mut(&src_ctx) {
                mb.acks.push_back(send_req);
            }
        }
    }
}

impl Provider for Loopback {
    fn bind(&mut self, arena: Rc<RequestArena>) {
        self.arena = Some(arena);
    }

    fn features(&self) -> Features {
        self.cfg.features
    }

    fn listen(&mut self, addr: SocketAddr) -> Result<(), Status> {
        let mut st = self.state.borrow_mut();
        if st.listeners.contains_key(&addr) {
            return Err(Status::BadAddress);
        }
        st.listeners.insert(addr, self.ctx);
        Ok(())
    }

    fn next_conn_request(&mut self) -> Option<ConnRequest> {
        let mut st = self.state.borrow_mut();
        let req = st.mailboxes.get_mut(&self.ctx)?.conn_requests.pop_front()?;
        Some(ConnRequest(req))
    }

    fn conn_request_addr(&self, req: ConnRequest) -> Option<SocketAddr> {
        self.state
            .borrow()
            .conn_reqs
            .get(&req.0)
            .map(|cr| cr.client_addr)
    }

    fn reject(&mut self, req: ConnRequest) {
        let st = &mut *self.state.borrow_mut();
        let Some(cr) = st.conn_reqs.remove(&req.0) else { return };
        debug!("rejecting connection request {} from {}", req.0, cr.client_addr);
        if let Some(client) = st.eps.get_mut(&cr.client_ep) {
            if client.failed.is_none() {
                client.failed = Some(Status::PeerClosed);
                let (client_ctx, client_arg) = (client.ctx, client.err_arg);
                if let Some(mb) = st.mailboxes.get_mut(&client_ctx) {
                    mb.ep_errors.push_back((client_arg, Status::PeerClosed));
                }
            }
        }
    }

    fn ep_connect(&mut self, addr: SocketAddr, err_arg: u64) -> Result<EpHandle, Status> {
        let client_addr = self.client_addr();
        let mut st = self.state.borrow_mut();
        let ep_id = st.alloc_ep();
        st.eps.insert(
            ep_id,
            EpState {
                ctx: self.ctx,
                err_arg,
                peer: None,
                remote_addr: addr,
                stream_in: VecDeque::new(),
                out_backlog: Vec::new(),
                failed: None,
            },
        );
        if let Some(&listener_ctx) = st.listeners.get(&addr) {
            let req_id = st.next_conn_req;
            st.next_conn_req += 1;
            st.conn_reqs.insert(
                req_id,
                ConnReqState {
                    client_ep: ep_id,
                    client_addr,
                },
            );
            if let Some(mb) = st.mailboxes.get_mut(&listener_ctx) {
                mb.conn_requests.push_back(req_id);
            }
        }
        // Without a listener the endpoint is a black hole; the runtime's
        // connect timeout deals with it.
        Ok(EpHandle(ep_id))
    }

    fn ep_accept(&mut self, req: ConnRequest, err_arg: u64) -> Result<EpHandle, Status> {
        let mut st = self.state.borrow_mut();
        let Some(cr) = st.conn_reqs.remove(&req.0) else {
            return Err(Status::BadAddress);
        };
        let client_alive = st
            .eps
            .get(&cr.client_ep)
            .map(|e| e.failed.is_none())
            .unwrap_or(false);
        if !client_alive {
            return Err(Status::PeerClosed);
        }
        let ep_id = st.alloc_ep();
        let backlog = {
            let client = st.eps.get_mut(&cr.client_ep).expect("client endpoint");
            client.peer = Some(ep_id);
            std::mem::take(&mut client.out_backlog)
        };
        st.eps.insert(
            ep_id,
            EpState {
                ctx: self.ctx,
                err_arg,
                peer: Some(cr.client_ep),
                remote_addr: cr.client_addr,
                stream_in: backlog.into_iter().collect(),
                out_backlog: Vec::new(),
                failed: None,
            },
        );
        Ok(EpHandle(ep_id))
    }

    fn ep_close_force(&mut self, ep: EpHandle) -> Option<ReqId> {
        {
            let mut st = self.state.borrow_mut();
            if !st.eps.contains_key(&ep.0) {
                return None;
            }
            st.break_pair(ep.0);
        }
        let id = self.arena().start();
        self.closing.push(id);
        Some(id)
    }

    fn tag_send(&mut self, ep: EpHandle, data: &[u8], tag: u64) -> Submit {
        let dst_ctx = {
            let st = self.state.borrow();
            let Some(e) = st.eps.get(&ep.0) else {
                return Submit::Fail(Status::EndpointFailed);
            };
            if let Some(status) = e.failed {
                return Submit::Fail(status);
            }
            let Some(peer) = e.peer else {
                return Submit::Fail(Status::EndpointFailed);
            };
            match st.eps.get(&peer) {
                Some(p) => p.ctx,
                None => return Submit::Fail(Status::EndpointFailed),
            }
        };
        if data.len() < self.cfg.eager_limit {
            let mut st = self.state.borrow_mut();
            if let Some(mb) = st.mailboxes.get_mut(&dst_ctx) {
                mb.msgs.push_back(WireMsg {
                    tag,
                    data: data.to_vec(),
                    send_req: None,
                });
            }
            Submit::Done
        } else {
            let id = self.arena().start();
            let mut st = self.state.borrow_mut();
            if let Some(mb) = st.mailboxes.get_mut(&dst_ctx) {
                mb.msgs.push_back(WireMsg {
                    tag,
                    data: data.to_vec(),
                    send_req: Some((self.ctx, id)),
                });
            }
            self.pending_sends.insert(id, dst_ctx);
            Submit::Pending(id)
        }
    }

    fn tag_recv(&mut self, buf: Vec<u8>, tag: u64, mask: u64) -> Submit {
        let arena = self.arena();
        let id = arena.start_recv(buf);
        match self.match_msg(tag, mask) {
            Some(msg) => {
                arena.finish_recv(id, Status::Ok, msg.tag, &msg.data);
                self.ack_sender(&msg);
            }
            None => self.posted.push(PostedRecv { req: id, tag, mask }),
        }
        Submit::Pending(id)
    }

    fn stream_send(&mut self, ep: EpHandle, data: &[u8]) -> Submit {
        let mut st = self.state.borrow_mut();
        let (peer, failed) = match st.eps.get(&ep.0) {
            Some(e) => (e.peer, e.failed),
            None => return Submit::Fail(Status::EndpointFailed),
        };
        if let Some(status) = failed {
            return Submit::Fail(status);
        }
        match peer {
            Some(peer_id) => {
                if let Some(p) = st.eps.get_mut(&peer_id) {
                    p.stream_in.extend(data);
                }
            }
            None => {
                // Peer endpoint does not exist yet (connection request
                // pending); hold the bytes back until pairing.
                st.eps
                    .get_mut(&ep.0)
                    .expect("endpoint")
                    .out_backlog
                    .extend_from_slice(data);
            }
        }
        Submit::Done
    }

    fn stream_recv(&mut self, ep: EpHandle, len: usize) -> Submit {
        let arena = self.arena();
        let (avail, failed) = {
            let st = self.state.borrow();
            match st.eps.get(&ep.0) {
                Some(e) => (e.stream_in.len(), e.failed),
                None => return Submit::Fail(Status::EndpointFailed),
            }
        };
        let id = arena.start_recv(vec![0u8; len]);
        if avail >= len {
            let data: Vec<u8> = {
                let mut st = self.state.borrow_mut();
                let e = st.eps.get_mut(&ep.0).expect("endpoint");
                e.stream_in.drain(..len).collect()
            };
            arena.finish_recv(id, Status::Ok, 0, &data);
        } else if let Some(status) = failed {
            arena.finish_recv(id, status, 0, &[]);
        } else {
            self.stream_waits.push(StreamWait {
                req: id,
                ep: ep.0,
                need: len,
            });
        }
        Submit::Pending(id)
    }

    fn cancel(&mut self, id: ReqId) {
        if let Some(dst_ctx) = self.pending_sends.remove(&id) {
            let mut st = self.state.borrow_mut();
            if let Some(mb) = st.mailboxes.get_mut(&dst_ctx) {
                mb.msgs.retain(|m| m.send_req != Some((self.ctx, id)));
            }
            drop(st);
            self.arena().finish(id, Status::Cancelled);
            return;
        }
        if let Some(pos) = self.posted.iter().position(|p| p.req == id) {
            self.posted.remove(pos);
            self.arena().finish_recv(id, Status::Cancelled, 0, &[]);
            return;
        }
        if let Some(pos) = self.stream_waits.iter().position(|w| w.req == id) {
            self.stream_waits.remove(pos);
            self.arena().finish_recv(id, Status::Cancelled, 0, &[]);
        }
        // Anything else has already completed or was released.
    }

    fn progress(&mut self) -> usize {
        let arena = self.arena();
        let mut events = 0;

        // Endpoint closes finish one tick after they were issued.
        for id in self.closing.drain(..) {
            arena.finish(id, Status::Ok);
            events += 1;
        }

        // Rendezvous sends acknowledged by the receiving side.
        let acks: Vec<ReqId> = {
            let mut st = self.state.borrow_mut();
            match st.mailboxes.get_mut(&self.ctx) {
                Some(mb) => mb.acks.drain(..).collect(),
                None => Vec::new(),
            }
        };
        for id in acks {
            self.pending_sends.remove(&id);
            arena.finish(id, Status::Ok);
            events += 1;
        }

        // Stream receives: wait-all fills, or endpoint failure.
        let mut i = 0;
        while i < self.stream_waits.len() {
            let (ready, failed) = {
                let st = self.state.borrow();
                match st.eps.get(&self.stream_waits[i].ep) {
                    Some(e) => (e.stream_in.len() >= self.stream_waits[i].need, e.failed),
                    None => (false, Some(Status::EndpointFailed)),
                }
            };
            if ready {
                let w = self.stream_waits.remove(i);
                let data: Vec<u8> = {
                    let mut st = self.state.borrow_mut();
                    let e = st.eps.get_mut(&w.ep).expect("endpoint");
                    e.stream_in.drain(..w.need).collect()
                };
                arena.finish_recv(w.req, Status::Ok, 0, &data);
                events += 1;
            } else if let Some(status) = failed {
                let w = self.stream_waits.remove(i);
                arena.finish_recv(w.req, status, 0, &[]);
                events += 1;
            } else {
                i += 1;
            }
        }

        // Tagged matching, in posted order.
        let mut i = 0;
        while i < self.posted.len() {
            let pr = self.posted[i];
            match self.match_msg(pr.tag, pr.mask) {
                Some(msg) => {
                    self.posted.remove(i);
                    arena.finish_recv(pr.req, Status::Ok, msg.tag, &msg.data);
                    self.ack_sender(&msg);
                    events += 1;
                }
                None => i += 1,
            }
        }

        events
    }

    fn next_ep_error(&mut self) -> Option<(u64, Status)> {
        let mut st = self.state.borrow_mut();
        st.mailboxes.get_mut(&self.ctx)?.ep_errors.pop_front()
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        let st = &mut *self.state.borrow_mut();
        st.listeners.retain(|_, ctx| *ctx != self.ctx);
        st.mailboxes.remove(&self.ctx);
        // Break any endpoints left open, notifying live peers.
        let mine: Vec<u64> = st
            .eps
            .iter()
            .filter(|(_, e)| e.ctx == self.ctx)
            .map(|(id, _)| *id)
            .collect();
        for id in mine {
            st.break_pair(id);
        }
    }
}
