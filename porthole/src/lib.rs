//! # Porthole
//!
//! Local (same-host) socket transport with in-band transfer of open file
//! references and reclamation of the reference cycles that transfer can
//! create.
//!
//! This crate provides:
//! - **Endpoints**: stream and datagram sockets sharing one ownership model
//! - **Connection management**: naming, listening, peer pairing, backlogs
//! - **Descriptor passing**: rights segments that carry live object
//!   references across a process boundary, with exact refcount bookkeeping
//! - **Cycle collection**: a mark-and-sweep pass that frees objects whose
//!   only references sit inside undelivered messages
//!
//! # Concurrency model
//!
//! Many cooperating threads, one exclusive-access domain: endpoint state,
//! object reference counts, and collector mark state are all guarded by a
//! single mutex. Blocking `send`/`receive`/`accept` suspend on a condvar and
//! can be aborted through a [`SignalToken`]. The collector runs inside the
//! same domain and therefore never races a mutator.
//!
//! # Example
//!
//! ```
//! use porthole::{Credentials, EndpointKind, SendOptions, Transport};
//!
//! let transport = Transport::default();
//! let process = transport.process(Credentials::new(1000, 100));
//!
//! let (a, b) = process.open_endpoint_pair(EndpointKind::Stream)?;
//! process.try_send(a, b"hello", &SendOptions::new())?;
//! let delivery = process.try_receive(b)?.expect("stream is open");
//! assert_eq!(delivery.data, b"hello");
//! # Ok::<(), porthole::TransportError>(())
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

mod arena;
mod endpoint;
mod message;
mod object;
mod table;
mod transport;

/// Error types for transport operations.
pub mod error;

/// Bit-compatible control-segment codec.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Error exports
pub use error::{Result, TransportError};

// Endpoint exports
pub use endpoint::{EndpointKind, Shutdown};

// Descriptor and identity exports
pub use message::Credentials;
pub use table::Fd;

// Transport exports
pub use transport::{
    AccountingError, Delivery, Process, SendOptions, SignalToken, Transport, TransportConfig,
    TransportStats,
};
