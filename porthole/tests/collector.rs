//! Cycle collection: reclamation of objects whose only references sit inside
//! undelivered messages, and the reachability rules that protect everything
//! else.

mod harness;

use porthole::{Credentials, EndpointKind, SendOptions, Transport, TransportError};

use harness::{audit, send_with_rights, stream_pair};

#[test]
fn test_cross_cycle_of_two_sockets_reclaimed() {
    harness::init_tracing();
    let transport = Transport::default();
    let process = transport.process(Credentials::root());
    let (a, b) = process
        .open_endpoint_pair(EndpointKind::Stream)
        .expect("pair");

    // Each endpoint's queue ends up naming the other side's object: sending
    // a's own descriptor lands it in b's queue and vice versa.
    send_with_rights(&process, a, b"", &[a]).expect("send");
    send_with_rights(&process, b, b"", &[b]).expect("send");
    audit(&transport);

    // The first close leaves the other side process-reachable; nothing may
    // be collected yet.
    process.close(a).expect("close");
    audit(&transport);
    assert_eq!(transport.live_objects(), 2);

    // The second close leaves both objects referenced only by each other's
    // queues; the pass at close must dissolve the cycle.
    process.close(b).expect("close");
    assert_eq!(transport.live_objects(), 0);
    assert_eq!(transport.stats().inflight_refs, 0);
    assert_eq!(transport.stats().objects_reclaimed, 2);
    audit(&transport);
}

#[test]
fn test_cycle_survives_while_a_descriptor_remains() {
    let transport = Transport::default();
    let process = transport.process(Credentials::root());
    let (a, b) = process
        .open_endpoint_pair(EndpointKind::Stream)
        .expect("pair");

    send_with_rights(&process, a, b"", &[a]).expect("send");
    send_with_rights(&process, b, b"", &[b]).expect("send");
    let held = process.duplicate(a).expect("dup");

    process.close(a).expect("close");
    process.close(b).expect("close");
    transport.collect_now();

    // One process-visible descriptor to a keeps a marked; a's queue in turn
    // keeps b marked.
    assert_eq!(transport.live_objects(), 2);
    audit(&transport);

    process.close(held).expect("close last");
    assert_eq!(transport.live_objects(), 0);
    audit(&transport);
}

#[test]
fn test_self_cycle_reclaimed_and_peer_sees_end_of_stream() {
    let transport = Transport::default();
    let process = transport.process(Credentials::root());
    let (a, b) = process
        .open_endpoint_pair(EndpointKind::Stream)
        .expect("pair");

    // b's queue names b itself.
    send_with_rights(&process, a, b"", &[b]).expect("send");
    process.close(b).expect("close");

    assert_eq!(transport.live_objects(), 1);
    // Collection tore b down, which unlinked the pair.
    assert_eq!(process.try_receive(a), Ok(None));
    audit(&transport);

    process.close(a).expect("close");
    assert_eq!(transport.live_objects(), 0);
}

#[test]
fn test_datagram_cycle_reclaimed() {
    let transport = Transport::default();
    let process = transport.process(Credentials::root());
    let (a, b) = process
        .open_endpoint_pair(EndpointKind::Datagram)
        .expect("pair");

    send_with_rights(&process, a, b"", &[a]).expect("send");
    send_with_rights(&process, b, b"", &[b]).expect("send");
    process.close(a).expect("close");
    process.close(b).expect("close");

    assert_eq!(transport.live_objects(), 0);
    assert_eq!(transport.stats().inflight_refs, 0);
    audit(&transport);
}

#[test]
fn test_plain_object_stranded_in_flight_is_reclaimed() {
    let pair = stream_pair();
    let passed = pair.client.open_plain().expect("open plain");

    send_with_rights(&pair.client, pair.client_fd, b"", &[passed]).expect("send");
    pair.client.close(passed).expect("close");
    // Still held by the server endpoint's queue, which is reachable.
    assert_eq!(pair.transport.stats().objects_reclaimed, 0);

    // Closing the whole receiving side strands the queued object: its only
    // reference is in-transit inside an unreachable queue.
    pair.server.close(pair.server_fd).expect("close");
    pair.client.close(pair.client_fd).expect("close");
    pair.server.close(pair.listener_fd).expect("close");

    assert_eq!(pair.transport.live_objects(), 0);
    assert_eq!(pair.transport.stats().inflight_refs, 0);
    audit(&pair.transport);
}

#[test]
fn test_listener_queued_in_flight_keeps_backlog_alive() {
    harness::init_tracing();
    let transport = Transport::default();
    let server = transport.process(Credentials::root());
    let client = transport.process(Credentials::new(7, 7));

    let listener = server.open_endpoint(EndpointKind::Stream).expect("open");
    server.bind(listener, "/traveling-listener").expect("bind");
    server.listen(listener, 4).expect("listen");

    // Park one embryo connection in the backlog.
    let connecting = client.open_endpoint(EndpointKind::Stream).expect("open");
    client.connect(connecting, "/traveling-listener").expect("connect");

    // Ship the listener itself through a socket queue and drop the table
    // reference: the only path to the listener (and to its backlog child) is
    // now rights inside y's queue, which marking reaches in a second round.
    let (x, y) = server
        .open_endpoint_pair(EndpointKind::Stream)
        .expect("pair");
    send_with_rights(&server, x, b"", &[listener]).expect("send");
    server.close(listener).expect("close");
    audit(&transport);

    transport.collect_now();
    // The deferred rescan of the queued listener must have marked the
    // backlog child; nothing was eligible for reclamation.
    assert_eq!(transport.stats().objects_reclaimed, 0);
    audit(&transport);

    // The listener comes back out of the queue fully functional.
    let delivery = server.try_receive(y).expect("receive").expect("open");
    let listener_again = delivery.rights[0];
    let conn = server.try_accept(listener_again).expect("accept");

    client
        .try_send(connecting, b"hello", &SendOptions::new())
        .expect("send");
    assert_eq!(
        server.try_receive(conn).expect("receive").expect("open").data,
        b"hello"
    );
    audit(&transport);

    // Cleanup releases everything, backlog child included.
    for fd in [x, y, conn] {
        server.close(fd).expect("close");
    }
    server.close(listener_again).expect("close");
    client.close(connecting).expect("close");
    assert_eq!(transport.live_objects(), 0);
}

#[test]
fn test_cycle_through_a_listener_backlog_reclaimed() {
    let transport = Transport::default();
    let process = transport.process(Credentials::root());

    let listener = process.open_endpoint(EndpointKind::Stream).expect("open");
    process.bind(listener, "/doomed-listener").expect("bind");
    process.listen(listener, 4).expect("listen");
    let connecting = process.open_endpoint(EndpointKind::Stream).expect("open");
    process.connect(connecting, "/doomed-listener").expect("connect");

    // Build the ring: y's queue holds the listener, the listener's backlog
    // holds the embryo child, and the child's queue holds y.
    let (x, y) = process
        .open_endpoint_pair(EndpointKind::Stream)
        .expect("pair");
    send_with_rights(&process, x, b"", &[listener]).expect("send");
    send_with_rights(&process, connecting, b"", &[y]).expect("send");
    audit(&transport);

    process.close(listener).expect("close");
    assert_eq!(transport.stats().objects_reclaimed, 0);

    // Dropping y's table slot closes the ring: listener, child, and y are
    // now reachable only through each other's queues. The sweep must flush
    // the backlog along with the receive queues.
    process.close(y).expect("close");
    assert_eq!(transport.stats().objects_reclaimed, 3);
    assert_eq!(transport.live_objects(), 2);
    audit(&transport);

    // The connecting endpoint lost its embryo peer in the sweep.
    assert_eq!(process.try_receive(connecting), Ok(None));
    process.close(x).expect("close");
    process.close(connecting).expect("close");
    assert_eq!(transport.live_objects(), 0);
    assert_eq!(transport.stats().inflight_refs, 0);
}

#[test]
fn test_close_with_no_inflight_refs_skips_the_pass() {
    let transport = Transport::default();
    let process = transport.process(Credentials::root());
    let fd = process.open_plain().expect("open plain");

    process.close(fd).expect("close");
    assert_eq!(transport.stats().collector_passes, 0);
}

#[test]
fn test_close_with_unrelated_inflight_refs_runs_the_pass() {
    let pair = stream_pair();
    let passed = pair.client.open_plain().expect("open plain");
    send_with_rights(&pair.client, pair.client_fd, b"", &[passed]).expect("send");

    // Closing a descriptor that has nothing to do with the in-flight right
    // still arms the gate; the pass runs and finds nothing to take.
    let unrelated = pair.client.open_plain().expect("open plain");
    pair.client.close(unrelated).expect("close");
    assert_eq!(pair.transport.stats().collector_passes, 1);
    assert_eq!(pair.transport.stats().objects_reclaimed, 0);
    audit(&pair.transport);
}

#[test]
fn test_collect_now_on_quiet_transport_is_a_noop() {
    let transport = Transport::default();
    let process = transport.process(Credentials::root());
    let fd = process.open_plain().expect("open plain");

    transport.collect_now();
    assert_eq!(transport.stats().collector_passes, 1);
    assert_eq!(transport.stats().objects_reclaimed, 0);
    assert_eq!(transport.live_objects(), 1);
    process.close(fd).expect("close");
}

#[test]
fn test_ring_of_three_sockets_reclaimed() {
    let transport = Transport::default();
    let process = transport.process(Credentials::root());
    let (a1, a2) = process
        .open_endpoint_pair(EndpointKind::Stream)
        .expect("pair");
    let (b1, b2) = process
        .open_endpoint_pair(EndpointKind::Stream)
        .expect("pair");
    let (c1, c2) = process
        .open_endpoint_pair(EndpointKind::Stream)
        .expect("pair");

    // a1's queue holds b1, b1's queue holds c1, c1's queue holds a1: a ring
    // no single reference drop can dissolve.
    send_with_rights(&process, a2, b"", &[b1]).expect("send");
    send_with_rights(&process, b2, b"", &[c1]).expect("send");
    send_with_rights(&process, c2, b"", &[a1]).expect("send");

    process.close(a1).expect("close");
    process.close(b1).expect("close");
    assert_eq!(transport.stats().objects_reclaimed, 0);
    process.close(c1).expect("close");

    // The last close left the whole ring queue-held; one pass takes all
    // three members together.
    assert_eq!(transport.stats().objects_reclaimed, 3);
    assert_eq!(transport.live_objects(), 3);
    assert_eq!(transport.stats().inflight_refs, 0);
    audit(&transport);

    assert_eq!(process.try_receive(a2), Ok(None));
    for fd in [a2, b2, c2] {
        process.close(fd).expect("close");
    }
    assert_eq!(transport.live_objects(), 0);
}

#[test]
fn test_received_cycle_member_is_reachable_again() {
    let transport = Transport::default();
    let process = transport.process(Credentials::root());
    let (a, b) = process
        .open_endpoint_pair(EndpointKind::Stream)
        .expect("pair");

    send_with_rights(&process, a, b"", &[a]).expect("send");
    send_with_rights(&process, b, b"", &[b]).expect("send");

    // Delivering one of the queued rights converts it back to a table
    // reference; the would-be cycle is broken before anything closes.
    let delivery = process.try_receive(a).expect("receive").expect("open");
    assert_eq!(delivery.rights.len(), 1);
    audit(&transport);

    process.close(a).expect("close");
    process.close(b).expect("close");
    process.close(delivery.rights[0]).expect("close");
    assert_eq!(transport.live_objects(), 0);
    audit(&transport);
}

#[test]
fn test_closed_descriptor_stays_closed() {
    let pair = stream_pair();
    let passed = pair.client.open_plain().expect("open plain");
    send_with_rights(&pair.client, pair.client_fd, b"", &[passed]).expect("send");
    pair.client.close(passed).expect("close");

    // The close already dropped the table slot; the collector pass it
    // triggered must not have resurrected it.
    assert_eq!(
        pair.client.close(passed),
        Err(TransportError::BadDescriptor {
            fd: passed.as_raw()
        })
    );
}
