//! Per-socket protocol state.

use std::collections::HashSet;

use bitflags::bitflags;

use crate::arena::Key;
use crate::message::ReceiveQueue;
use crate::object::ObjectKey;

/// Key into the endpoint table.
///
/// Peer links and datagram back-references are stored as these; they are
/// non-owning, and every dereference re-checks the key against the table
/// because the peer can be torn down between enqueue and access.
pub(crate) type EndpointKey = Key<Endpoint>;

/// Transport mode of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Connection-oriented, ordered byte/message stream between two peers.
    Stream,
    /// Connectionless; `connect` only rebinds the default destination.
    Datagram,
}

bitflags! {
    /// Directions closed by `shutdown`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Shutdown: u8 {
        /// No further receives; an empty queue reads as end-of-stream.
        const RECV = 1 << 0;
        /// No further sends from this endpoint.
        const SEND = 1 << 1;
    }
}

/// One socket's local-transport state.
///
/// Owned by its creating process; every field is guarded by the transport's
/// single exclusive-access domain.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) kind: EndpointKind,
    /// The registry entry this endpoint lives behind.
    pub(crate) object: ObjectKey,
    /// Bound name, owned exclusively; unregistered at teardown.
    pub(crate) address: Option<String>,
    /// Stream: the connected peer. Datagram: the default destination.
    pub(crate) peer: Option<EndpointKey>,
    /// A stream endpoint that has ever been paired; distinguishes
    /// end-of-stream from never-connected on receive.
    pub(crate) was_connected: bool,
    pub(crate) listening: bool,
    pub(crate) backlog: usize,
    /// Not-yet-accepted children, oldest first. Each entry holds an
    /// in-transit reference on the child's object, so the collector walks
    /// backlog entries exactly like queued rights.
    pub(crate) accept_queue: std::collections::VecDeque<EndpointKey>,
    /// Datagram endpoints whose default destination is this one; lets
    /// disconnect and teardown unlink the correct side without a scan.
    pub(crate) pending_peer_refs: HashSet<EndpointKey>,
    /// When set, the next stream message sent here must be preceded by the
    /// sender's credentials.
    pub(crate) wants_credentials: bool,
    /// Latch: a connection delivers credentials at most once.
    pub(crate) credentials_delivered: bool,
    pub(crate) shutdown: Shutdown,
    /// Set once teardown has begun; peers that still hold our key treat the
    /// link as gone.
    pub(crate) closing: bool,
    pub(crate) queue: ReceiveQueue,
}

impl Endpoint {
    pub(crate) fn new(kind: EndpointKind, object: ObjectKey) -> Self {
        Self {
            kind,
            object,
            address: None,
            peer: None,
            was_connected: false,
            listening: false,
            backlog: 0,
            accept_queue: std::collections::VecDeque::new(),
            pending_peer_refs: HashSet::new(),
            wants_credentials: false,
            credentials_delivered: false,
            shutdown: Shutdown::empty(),
            closing: false,
            queue: ReceiveQueue::default(),
        }
    }

    pub(crate) fn is_stream(&self) -> bool {
        self.kind == EndpointKind::Stream
    }
}
