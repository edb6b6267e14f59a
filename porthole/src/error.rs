//! Error types for transport operations.

use thiserror::Error;

/// Errors surfaced by transport operations.
///
/// None of these are recovered internally; every failure is unwound to the
/// state before the call and handed to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint already has an established peer.
    #[error("endpoint is already connected")]
    AlreadyConnected,

    /// The operation requires an established peer and there is none.
    #[error("endpoint is not connected")]
    NotConnected,

    /// No listening endpoint is attached to the target name, or the
    /// listener cannot take another pending connection.
    #[error("connection refused: {name}")]
    ConnectionRefused {
        /// The name the connect attempt resolved.
        name: String,
    },

    /// The endpoint already carries a bound address.
    #[error("endpoint is already bound")]
    AlreadyBound,

    /// Another endpoint is already attached to the requested name.
    #[error("name already in use: {name}")]
    NameInUse {
        /// The contested name.
        name: String,
    },

    /// A rights segment names a descriptor that is not open in the sender.
    #[error("bad descriptor: {fd}")]
    BadDescriptor {
        /// The raw descriptor integer that failed to resolve.
        fd: u32,
    },

    /// A rights segment carries more descriptors than the transport passes
    /// in one message, or the receiver's table cannot grow far enough to
    /// hold them.
    #[error("too many descriptors: {count} (max {max})")]
    TooManyDescriptors {
        /// Descriptors requested.
        count: usize,
        /// Hard per-message or per-table limit.
        max: usize,
    },

    /// The payload exceeds the receive queue's total capacity and could
    /// never be delivered.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Payload size in bytes.
        size: usize,
        /// Queue capacity in bytes.
        max: usize,
    },

    /// Malformed or mixed control segment, or an argument outside the
    /// operation's domain.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Details about the rejected input.
        reason: String,
    },

    /// An endpoint or object allocation failed. The operation is fully
    /// unwound; no half-constructed object stays reachable.
    #[error("out of resources: {resource}")]
    OutOfResources {
        /// Which allocation failed.
        resource: &'static str,
    },

    /// A blocking call was aborted by a raised signal token.
    #[error("operation interrupted")]
    Interrupted,

    /// A non-blocking call found the queue empty (receive/accept) or at
    /// capacity (send).
    #[error("operation would block")]
    WouldBlock,
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
