//! Messages and control segments.

use std::collections::VecDeque;

use crate::object::ObjectKey;

/// Numeric identity attached to a credentials segment.
///
/// Captured from the sending process when the receiving endpoint has asked
/// for it; never taken from sender-supplied control bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Real user id.
    pub uid: u32,
    /// Effective user id.
    pub euid: u32,
    /// Real group id.
    pub gid: u32,
    /// Effective group id.
    pub egid: u32,
    /// Supplementary groups.
    pub groups: Vec<u32>,
}

impl Credentials {
    /// Identity with matching real/effective ids and no supplementary
    /// groups.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            euid: uid,
            gid,
            egid: gid,
            groups: Vec::new(),
        }
    }

    /// The superuser identity.
    pub fn root() -> Self {
        Self::new(0, 0)
    }
}

/// One ordered unit in an endpoint's receive queue.
///
/// The rights references are the sender-controlled half of the ancillary
/// data, already internalized and unique within the message. Credentials
/// never come from the sender (a sender-supplied credentials segment is
/// rejected as forgery), so the only identity a message can carry is the one
/// the engine synthesized, and it precedes the rights in the delivered view.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) data: Vec<u8>,
    /// In-transit object references, in segment order.
    pub(crate) rights: Vec<ObjectKey>,
    pub(crate) credentials: Option<Credentials>,
}

/// Receive queue plus the two backpressure counters the flow-control layer
/// reads.
#[derive(Debug, Default)]
pub(crate) struct ReceiveQueue {
    pub(crate) messages: VecDeque<Message>,
    /// Payload bytes currently queued.
    pub(crate) bytes_in_flight: usize,
    /// Rights references currently queued.
    pub(crate) refs_in_flight: usize,
}

impl ReceiveQueue {
    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Account and append a message.
    pub(crate) fn push(&mut self, message: Message) {
        self.bytes_in_flight += message.data.len();
        self.refs_in_flight += message.rights.len();
        self.messages.push_back(message);
    }

    /// Dequeue the oldest message without touching the counters; the caller
    /// settles accounting once delivery is final.
    pub(crate) fn pop(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    /// Put a dequeued message back at the head, e.g. after a failed
    /// delivery that must leave the queue as it was.
    pub(crate) fn push_front(&mut self, message: Message) {
        self.messages.push_front(message);
    }

    /// Settle the counters for a message that left the queue for good.
    pub(crate) fn settle(&mut self, data_len: usize, rights_len: usize) {
        self.bytes_in_flight -= data_len;
        self.refs_in_flight -= rights_len;
    }
}
