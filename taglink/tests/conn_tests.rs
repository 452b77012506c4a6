//! Runtime integration tests over the in-process loopback fabric.

mod common;

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use loopnet::{Fabric, LoopbackConfig, DEFAULT_EAGER_LIMIT};
use taglink::{noop, Connection, Handler, Status, Worker, WorkerConfig};

use common::{establish, pair, pair_with, tick, tick_until, Recorder};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

// =============================================================================
// Establishment
// =============================================================================

#[test]
fn test_handshake_round_trip() {
    let addr = addr(5555);
    let pair = pair(addr);
    let (client_conn, server_conn) = establish(&pair, addr);

    assert!(client_conn.is_established());
    assert!(server_conn.is_established());
    assert_eq!(client_conn.remote_id(), server_conn.id());
    assert_eq!(server_conn.remote_id(), client_conn.id());
    assert_eq!(client_conn.status(), Status::Ok);
    assert_eq!(server_conn.status(), Status::Ok);
    assert_eq!(pair.client.connection_count(), 1);
    assert_eq!(pair.server.connection_count(), 1);

    // Idle workers carry exactly one in-flight request: the io message
    // receive.
    tick(&pair, 3);
    assert_eq!(pair.client.in_flight_requests(), 1);
    assert_eq!(pair.server.in_flight_requests(), 1);
}

#[test]
fn test_handshake_timeout() {
    common::init_logging();
    let fabric = Fabric::new();
    let config = WorkerConfig::default().with_connect_timeout(Duration::from_millis(100));
    let worker = Worker::new(Box::new(fabric.attach()), Box::new(()), config).unwrap();

    let status = Rc::new(Cell::new(None));
    let s = status.clone();
    let started = Instant::now();
    // Nobody listens on this address; the endpoint is a black hole.
    let conn = worker.connect(addr(5999), Box::new(move |st| s.set(Some(st))));

    while status.get().is_none() && started.elapsed() < Duration::from_secs(5) {
        worker.progress();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(status.get(), Some(Status::TimedOut));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(!conn.is_established());
    assert_eq!(conn.remote_id(), 0);

    conn.disconnect(noop());
    worker.progress();
    worker.progress();
    assert_eq!(worker.connection_count(), 0);
    drop(worker);
    assert_eq!(Rc::strong_count(&conn), 1, "connection must be released");
}

#[test]
fn test_stale_connection_request_is_rejected() {
    // With a zero timeout every queued connection request is already
    // stale when the server processes it.
    let addr = addr(5602);
    let pair = pair_with(addr, WorkerConfig::default().with_connect_timeout(Duration::ZERO));

    let status = Rc::new(Cell::new(None));
    let s = status.clone();
    let conn = pair
        .client
        .connect(addr, Box::new(move |st| s.set(Some(st))));

    assert!(tick_until(&pair, || status.get().is_some()));
    let failure = status.get().unwrap();
    assert!(failure.is_err());
    assert!(pair.server_events.borrow().accepted.is_empty());
    assert_eq!(pair.server.connection_count(), 0);

    conn.disconnect(noop());
    tick(&pair, 2);
    assert_eq!(pair.client.connection_count(), 0);
}

#[test]
fn test_multiple_connections_get_distinct_ids() {
    let addr = addr(5603);
    let pair = pair(addr);
    let (cc1, sc1) = establish(&pair, addr);
    let (cc2, sc2) = establish(&pair, addr);

    assert_ne!(cc1.id(), cc2.id());
    assert_ne!(sc1.id(), sc2.id());
    assert_eq!(cc1.remote_id(), sc1.id());
    assert_eq!(cc2.remote_id(), sc2.id());
    assert_eq!(pair.client.connection_count(), 2);
    assert_eq!(pair.server.connection_count(), 2);
}

// =============================================================================
// Data transfer and the submission/completion race
// =============================================================================

#[test]
fn test_synchronous_send_completion() {
    let addr = addr(5604);
    let pair = pair(addr);
    let (client_conn, _server_conn) = establish(&pair, addr);

    let status = Rc::new(Cell::new(None));
    let s = status.clone();
    let ok = client_conn.send_data(b"8 bytes!", 1, Box::new(move |st| s.set(Some(st))));
    assert!(ok);
    // An eager send completes before send_data returns, and leaves no
    // request behind.
    assert_eq!(status.get(), Some(Status::Ok));
    assert_eq!(pair.client.in_flight_requests(), 1);
}

#[test]
fn test_asynchronous_send_completion() {
    let addr = addr(5605);
    let pair = pair(addr);
    let (client_conn, server_conn) = establish(&pair, addr);

    let payload = vec![0xabu8; 8 << 20];
    let sent = Rc::new(Cell::new(None));
    let s = sent.clone();
    assert!(client_conn.send_data(&payload, 2, Box::new(move |st| s.set(Some(st)))));
    assert!(sent.get().is_none(), "large sends stay in flight");
    assert_eq!(pair.client.in_flight_requests(), 2);

    let received = Rc::new(RefCell::new(None));
    let r = received.clone();
    assert!(server_conn.recv_data(
        payload.len(),
        2,
        Box::new(move |st, data| {
            *r.borrow_mut() = Some((st, data.len(), data.first().copied()));
        }),
    ));

    assert!(tick_until(&pair, || {
        sent.get().is_some() && received.borrow().is_some()
    }));
    assert_eq!(sent.get(), Some(Status::Ok));
    assert_eq!(
        *received.borrow(),
        Some((Status::Ok, payload.len(), Some(0xab)))
    );
    assert_eq!(pair.client.in_flight_requests(), 1);
    assert_eq!(pair.server.in_flight_requests(), 1);
}

#[test]
fn test_receive_of_already_arrived_data_completes_inline() {
    let addr = addr(5606);
    let pair = pair(addr);
    let (client_conn, server_conn) = establish(&pair, addr);

    // The eager message reaches the server before any receive is posted.
    assert!(client_conn.send_data(b"early", 3, noop()));

    let received = Rc::new(RefCell::new(None));
    let r = received.clone();
    let ok = server_conn.recv_data(
        16,
        3,
        Box::new(move |st, data| *r.borrow_mut() = Some((st, data.to_vec()))),
    );
    assert!(ok);
    // The request completed during submission; the callback already ran.
    assert_eq!(
        *received.borrow(),
        Some((Status::Ok, b"early".to_vec()))
    );
    assert_eq!(pair.server.in_flight_requests(), 1);
}

#[test]
fn test_sequence_numbers_route_to_matching_receives() {
    let addr = addr(5607);
    let pair = pair(addr);
    let (client_conn, server_conn) = establish(&pair, addr);

    let got = Rc::new(RefCell::new(Vec::new()));
    for sn in [7u32, 8u32] {
        let g = got.clone();
        assert!(server_conn.recv_data(
            16,
            sn,
            Box::new(move |st, data| g.borrow_mut().push((sn, st, data.to_vec()))),
        ));
    }

    // Send in reverse order; matching is by sequence number, not arrival.
    assert!(client_conn.send_data(b"eight", 8, noop()));
    assert!(client_conn.send_data(b"seven", 7, noop()));

    assert!(tick_until(&pair, || got.borrow().len() == 2));
    let got = got.borrow();
    assert!(got.contains(&(7, Status::Ok, b"seven".to_vec())));
    assert!(got.contains(&(8, Status::Ok, b"eight".to_vec())));
}

// =============================================================================
// Disconnect
// =============================================================================

#[test]
fn test_disconnect_with_in_flight_sends() {
    let addr = addr(5608);
    let pair = pair(addr);
    let (client_conn, _server_conn) = establish(&pair, addr);

    let order = Rc::new(RefCell::new(Vec::<(&str, Status)>::new()));
    let payload = vec![1u8; DEFAULT_EAGER_LIMIT * 2];
    for _ in 0..2 {
        let o = order.clone();
        assert!(client_conn.send_data(&payload, 1, Box::new(move |st| {
            o.borrow_mut().push(("send", st));
        })));
    }
    assert_eq!(order.borrow().len(), 0);

    let o = order.clone();
    client_conn.disconnect(Box::new(move |st| o.borrow_mut().push(("disc", st))));

    assert!(tick_until(&pair, || order.borrow().len() == 3));
    let order = order.borrow();
    assert_eq!(order[0], ("send", Status::Cancelled));
    assert_eq!(order[1], ("send", Status::Cancelled));
    assert_eq!(order[2], ("disc", Status::Ok));
    assert_eq!(pair.client.connection_count(), 0);
}

#[test]
fn test_disconnect_without_outstanding_requests() {
    let addr = addr(5609);
    let pair = pair(addr);
    let (client_conn, _server_conn) = establish(&pair, addr);

    let done = Rc::new(Cell::new(None));
    let d = done.clone();
    client_conn.disconnect(Box::new(move |st| d.set(Some(st))));
    assert!(tick_until(&pair, || done.get().is_some()));
    assert_eq!(done.get(), Some(Status::Ok));
    assert_eq!(pair.client.connection_count(), 0);

    tick(&pair, 2);
    drop(pair);
    assert_eq!(Rc::strong_count(&client_conn), 1);
}

#[test]
#[should_panic(expected = "already disconnecting")]
fn test_repeated_disconnect_is_rejected() {
    let addr = addr(5610);
    let pair = pair(addr);
    let (client_conn, _server_conn) = establish(&pair, addr);

    client_conn.disconnect(noop());
    client_conn.disconnect(noop());
}

// =============================================================================
// Peer errors
// =============================================================================

struct SeqHandler {
    seq: Rc<RefCell<Vec<String>>>,
}

impl Handler for SeqHandler {
    fn on_error(&mut self, _conn: &Rc<Connection>) {
        self.seq.borrow_mut().push("on_error".to_string());
    }
}

#[test]
fn test_peer_error_mid_transfer() {
    common::init_logging();
    let addr = addr(5611);
    let fabric = Fabric::new();

    let server_events = Rc::new(RefCell::new(common::Events::default()));
    let server = Worker::new(
        Box::new(fabric.attach()),
        Box::new(Recorder {
            events: server_events.clone(),
        }),
        WorkerConfig::default(),
    )
    .unwrap();
    server.listen(addr).unwrap();

    let seq = Rc::new(RefCell::new(Vec::new()));
    let client = Worker::new(
        Box::new(fabric.attach()),
        Box::new(SeqHandler { seq: seq.clone() }),
        WorkerConfig::default(),
    )
    .unwrap();

    // Establish by hand.
    let status = Rc::new(Cell::new(None));
    let s = status.clone();
    let client_conn = client.connect(addr, Box::new(move |st| s.set(Some(st))));
    for _ in 0..20 {
        client.progress();
        server.progress();
    }
    assert_eq!(status.get(), Some(Status::Ok));
    let server_conn = server_events.borrow().accepted[0].clone();

    // Two receives outstanding when the peer goes away.
    for _ in 0..2 {
        let q = seq.clone();
        assert!(client_conn.recv_data(
            1024,
            5,
            Box::new(move |st, _| q.borrow_mut().push(format!("recv err={}", st.is_err()))),
        ));
    }
    server_conn.disconnect(noop());

    for _ in 0..20 {
        server.progress();
        client.progress();
    }

    // The failed receives complete with an error before the user hook
    // runs, and the hook runs exactly once.
    assert_eq!(
        *seq.borrow(),
        vec![
            "recv err=true".to_string(),
            "recv err=true".to_string(),
            "on_error".to_string(),
        ]
    );
    assert!(client_conn.status().is_err());

    // A failed connection admits no new submissions.
    assert!(!client_conn.send_data(b"x", 9, noop()));
    assert!(!client_conn.recv_data(8, 9, Box::new(|_, _| ())));

    // Disconnect still completes the lifecycle.
    let done = Rc::new(Cell::new(None));
    let d = done.clone();
    client_conn.disconnect(Box::new(move |st| d.set(Some(st))));
    for _ in 0..10 {
        client.progress();
    }
    assert_eq!(done.get(), Some(Status::Ok));
    assert_eq!(client.connection_count(), 0);
}

// =============================================================================
// Io messages
// =============================================================================

#[test]
fn test_iomsg_round_trip() {
    let addr = addr(5612);
    let pair = pair(addr);
    let (client_conn, server_conn) = establish(&pair, addr);

    assert!(client_conn.send_iomsg(b"ping", noop()));
    assert!(tick_until(&pair, || !pair
        .server_events
        .borrow()
        .iomsgs
        .is_empty()));
    assert_eq!(
        pair.server_events.borrow().iomsgs[0],
        (server_conn.id(), b"ping".to_vec())
    );

    assert!(server_conn.send_iomsg(b"pong", noop()));
    assert!(tick_until(&pair, || !pair
        .client_events
        .borrow()
        .iomsgs
        .is_empty()));
    assert_eq!(
        pair.client_events.borrow().iomsgs[0],
        (client_conn.id(), b"pong".to_vec())
    );

    // The io message receive was reposted; a second message flows too.
    assert!(client_conn.send_iomsg(b"ping2", noop()));
    assert!(tick_until(&pair, || pair.server_events.borrow().iomsgs.len() == 2));
    assert_eq!(
        pair.server_events.borrow().iomsgs[1],
        (server_conn.id(), b"ping2".to_vec())
    );
}

#[test]
fn test_iomsg_routes_by_connection() {
    let addr = addr(5613);
    let pair = pair(addr);
    let (cc1, sc1) = establish(&pair, addr);
    let (cc2, sc2) = establish(&pair, addr);

    assert!(cc1.send_iomsg(b"one", noop()));
    assert!(cc2.send_iomsg(b"two", noop()));
    assert!(tick_until(&pair, || pair.server_events.borrow().iomsgs.len() == 2));

    let iomsgs = pair.server_events.borrow().iomsgs.clone();
    assert!(iomsgs.contains(&(sc1.id(), b"one".to_vec())));
    assert!(iomsgs.contains(&(sc2.id(), b"two".to_vec())));
    let _ = (cc1, cc2);
}

#[test]
fn test_iomsg_for_unknown_connection_is_dropped() {
    use taglink::{Provider, RequestArena};

    let addr = addr(5614);
    let pair = pair(addr);
    let (client_conn, server_conn) = establish(&pair, addr);

    // A raw provider completes the server-side handshake by hand, then
    // sends an io message whose sender tag carries an id the server has
    // never assigned.
    let mut rogue = pair.fabric.attach();
    rogue.bind(Rc::new(RequestArena::new()));
    let ep = rogue.ep_connect(addr, 1).unwrap();
    assert!(matches!(
        rogue.stream_send(ep, &77u32.to_le_bytes()),
        taglink::Submit::Done
    ));
    assert!(tick_until(&pair, || pair.server.connection_count() == 2));

    let bogus_tag = taglink::tag::iomsg_tag(0xdead_beef, 0);
    assert!(matches!(
        rogue.tag_send(ep, b"boo", bogus_tag),
        taglink::Submit::Done
    ));
    tick(&pair, 3);
    // The message is dropped; the server keeps running.
    assert!(pair.server_events.borrow().iomsgs.is_empty());

    // The receive was reposted and routable messages still flow.
    assert!(client_conn.send_iomsg(b"later", noop()));
    assert!(tick_until(&pair, || !pair
        .server_events
        .borrow()
        .iomsgs
        .is_empty()));
    assert_eq!(
        pair.server_events.borrow().iomsgs[0],
        (server_conn.id(), b"later".to_vec())
    );
}

// =============================================================================
// Feature negotiation
// =============================================================================

#[test]
fn test_required_features_are_enforced() {
    common::init_logging();
    let fabric = Fabric::new();
    let provider = fabric.attach_with(LoopbackConfig::default().with_features(
        taglink::Features::TAG,
    ));
    match Worker::new(Box::new(provider), Box::new(()), WorkerConfig::default()) {
        Err(taglink::Error::MissingFeatures(missing)) => {
            assert_eq!(missing, taglink::Features::STREAM);
        }
        _ => panic!("worker creation must fail without STREAM"),
    }
}
