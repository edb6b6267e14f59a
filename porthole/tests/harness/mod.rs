//! Common utilities for transport integration tests.
//!
//! Provides connected-pair setup, rights-segment helpers, and an invariant
//! tracker for delivery ordering.

#![allow(dead_code)]

use porthole::{
    Credentials, EndpointKind, Fd, Process, SendOptions, Transport, TransportConfig,
};

/// Install the test subscriber; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A connected stream pair across two processes, built through the full
/// bind/listen/connect/accept handshake.
pub struct StreamPair {
    pub transport: Transport,
    pub server: Process,
    pub client: Process,
    /// The accepted connection on the server side.
    pub server_fd: Fd,
    /// The connecting endpoint on the client side.
    pub client_fd: Fd,
    /// The listener, still open and bound to [`LISTENER_NAME`].
    pub listener_fd: Fd,
}

/// Name the harness binds its listener to.
pub const LISTENER_NAME: &str = "/tmp/harness.sock";

/// Build a connected stream pair with default capacities.
pub fn stream_pair() -> StreamPair {
    stream_pair_with(TransportConfig::default())
}

/// Build a connected stream pair with the given capacities.
pub fn stream_pair_with(config: TransportConfig) -> StreamPair {
    let transport = Transport::new(config);
    let server = transport.process(Credentials::new(0, 0));
    let client = transport.process(Credentials::new(1000, 100));

    let listener_fd = server
        .open_endpoint(EndpointKind::Stream)
        .expect("open listener");
    server.bind(listener_fd, LISTENER_NAME).expect("bind");
    server.listen(listener_fd, 8).expect("listen");

    let client_fd = client
        .open_endpoint(EndpointKind::Stream)
        .expect("open client");
    client.connect(client_fd, LISTENER_NAME).expect("connect");
    let server_fd = server.try_accept(listener_fd).expect("accept");

    StreamPair {
        transport,
        server,
        client,
        server_fd,
        client_fd,
        listener_fd,
    }
}

/// Send `data` with a rights segment naming `rights`.
pub fn send_with_rights(
    process: &Process,
    fd: Fd,
    data: &[u8],
    rights: &[Fd],
) -> porthole::Result<()> {
    let raw: Vec<u32> = rights.iter().map(Fd::as_raw).collect();
    let control = porthole::wire::encode_rights(&raw).expect("encode rights");
    process.try_send(fd, data, &SendOptions::new().with_control(&control))
}

/// Assert the books still balance.
pub fn audit(transport: &Transport) {
    if let Err(violation) = transport.check_accounting() {
        panic!("accounting audit failed: {violation}");
    }
}

/// Tracks sent and received sequence ids to verify ordered, lossless,
/// duplicate-free delivery.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    sent: Vec<u64>,
    received: Vec<u64>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, sequence_id: u64) {
        self.sent.push(sequence_id);
    }

    pub fn record_received(&mut self, sequence_id: u64) {
        self.received.push(sequence_id);
    }

    /// Every sent message arrived, in order, exactly once.
    pub fn assert_exact_delivery(&self) {
        assert_eq!(
            self.sent, self.received,
            "delivered sequence must equal sent sequence"
        );
    }
}

/// Encode a sequence id as a payload.
pub fn seq_payload(sequence_id: u64) -> Vec<u8> {
    sequence_id.to_le_bytes().to_vec()
}

/// Decode a sequence id from a payload.
pub fn seq_of(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    u64::from_le_bytes(bytes)
}
