//! Public transport surface: the exclusive-access domain, process handles,
//! and the blocking/signal plumbing around the operation core.

mod collector;
mod conn;
mod core;
mod xfer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::endpoint::{EndpointKind, Shutdown};
use crate::error::{Result, TransportError};
use crate::message::Credentials;
use crate::table::Fd;

use self::core::{Core, ProcessKey};

/// Tunables for queue capacities and table sizing.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Payload bytes one receive queue holds before senders suspend.
    pub queue_capacity_bytes: usize,

    /// In-transit rights one receive queue holds before senders suspend.
    pub queue_capacity_refs: usize,

    /// Upper bound any `listen` backlog is clamped to.
    pub max_backlog: usize,

    /// Descriptor-table slots a process starts with.
    pub initial_table_slots: usize,

    /// Hard cap a descriptor table grows to before allocation fails.
    pub max_table_slots: usize,

    /// Hard cap on simultaneously live endpoints.
    pub max_endpoints: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_capacity_bytes: 64 * 1024,
            queue_capacity_refs: 256,
            max_backlog: 128,
            initial_table_slots: 16,
            max_table_slots: 1024,
            max_endpoints: 4096,
        }
    }
}

impl TransportConfig {
    /// Tiny capacities that make backpressure and table exhaustion easy to
    /// reach in tests.
    pub fn small_queues() -> Self {
        Self {
            queue_capacity_bytes: 64,
            queue_capacity_refs: 4,
            max_backlog: 4,
            initial_table_slots: 2,
            max_table_slots: 8,
            max_endpoints: 64,
        }
    }
}

/// Snapshot of transport-wide counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStats {
    /// Live endpoints.
    pub endpoints: usize,
    /// Live file objects (sockets included).
    pub objects: usize,
    /// In-transit references system-wide; the collector's gate counter.
    pub inflight_refs: u64,
    /// Messages accepted onto some receive queue.
    pub messages_queued: u64,
    /// Messages handed to a receiver.
    pub messages_delivered: u64,
    /// Rights successfully landed in a receiver's table.
    pub rights_passed: u64,
    /// Collection passes run.
    pub collector_passes: u64,
    /// Objects examined across all passes.
    pub objects_scanned: u64,
    /// Objects freed by the collector.
    pub objects_reclaimed: u64,
}

/// Reference accounting drifted from what the tables and queues hold.
#[derive(Debug, Error)]
#[error("reference accounting violated: {details}")]
pub struct AccountingError {
    details: String,
}

impl AccountingError {
    /// Human-readable description of the first violation found.
    pub fn details(&self) -> &str {
        &self.details
    }
}

pub(crate) struct Shared {
    core: Mutex<Core>,
    /// One condvar covers every suspension point; state changes broadcast.
    wakeups: Condvar,
}

/// Cancellation handle for blocking calls.
///
/// Raising a token makes every blocking call that was handed it give up with
/// [`TransportError::Interrupted`], the transport's rendition of a pending
/// signal aborting a sleep.
#[derive(Clone)]
pub struct SignalToken {
    raised: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl SignalToken {
    /// Raise the signal and wake every suspended call so it can notice.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        if let Some(shared) = self.shared.upgrade() {
            shared.wakeups.notify_all();
        }
    }

    /// Lower the signal again so the token can be reused.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    /// Whether the signal is currently raised.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

/// The local transport: one exclusive-access domain shared by every process
/// handle created from it.
pub struct Transport {
    shared: Arc<Shared>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Transport {
    /// Create a transport with the given tunables.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core::new(config)),
                wakeups: Condvar::new(),
            }),
        }
    }

    /// Register a process with the given identity and hand back its handle.
    pub fn process(&self, creds: Credentials) -> Process {
        let key = self.shared.core.lock().register_process(creds.clone());
        Process {
            shared: Arc::clone(&self.shared),
            key,
            creds,
        }
    }

    /// A fresh cancellation token for blocking calls on this transport.
    pub fn signal_token(&self) -> SignalToken {
        SignalToken {
            raised: Arc::new(AtomicBool::new(false)),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Snapshot the transport-wide counters.
    pub fn stats(&self) -> TransportStats {
        let core = self.shared.core.lock();
        TransportStats {
            endpoints: core.endpoints.len(),
            objects: core.objects.len(),
            inflight_refs: core.inflight_refs,
            messages_queued: core.counters.messages_queued,
            messages_delivered: core.counters.messages_delivered,
            rights_passed: core.counters.rights_passed,
            collector_passes: core.counters.collector_passes,
            objects_scanned: core.counters.objects_scanned,
            objects_reclaimed: core.counters.objects_reclaimed,
        }
    }

    /// Number of live file objects.
    pub fn live_objects(&self) -> usize {
        self.shared.core.lock().objects.len()
    }

    /// Recompute every object's reference counts from the tables and queues
    /// and compare against the books.
    ///
    /// # Errors
    ///
    /// Describes the first object whose counts disagree with what actually
    /// names it.
    pub fn check_accounting(&self) -> std::result::Result<(), AccountingError> {
        self.shared
            .core
            .lock()
            .audit()
            .map_err(|details| AccountingError { details })
    }

    /// Run a collection pass unconditionally, bypassing the close-time gate.
    pub fn collect_now(&self) {
        self.shared.core.lock().collect();
        self.shared.wakeups.notify_all();
    }
}

/// Options for a single send.
#[derive(Debug, Default, Clone, Copy)]
pub struct SendOptions<'a> {
    pub(crate) control: Option<&'a [u8]>,
    pub(crate) destination: Option<&'a str>,
    pub(crate) want_credentials: bool,
}

impl<'a> SendOptions<'a> {
    /// No control data, default destination.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an encoded control buffer (see [`crate::wire`]). Senders may
    /// supply at most one rights segment and nothing else.
    pub fn with_control(mut self, control: &'a [u8]) -> Self {
        self.control = Some(control);
        self
    }

    /// Send to a bound name instead of the default destination. Datagram
    /// endpoints only.
    pub fn with_destination(mut self, name: &'a str) -> Self {
        self.destination = Some(name);
        self
    }

    /// Ask that the peer's next message to this endpoint carry its
    /// credentials. Honored at most once per connection.
    pub fn with_credentials_request(mut self) -> Self {
        self.want_credentials = true;
        self
    }
}

/// One received message.
#[derive(Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Payload bytes, exactly as sent.
    pub data: Vec<u8>,
    /// Descriptors freshly installed in the receiver's table, in segment
    /// order.
    pub rights: Vec<Fd>,
    /// The sender's identity, present on the first message after this
    /// endpoint requested it.
    pub credentials: Option<Credentials>,
}

/// Handle to one process's view of the transport: a descriptor table plus
/// the identity used for credentials segments.
///
/// Clones share the same process.
#[derive(Clone)]
pub struct Process {
    shared: Arc<Shared>,
    key: ProcessKey,
    creds: Credentials,
}

impl Process {
    /// The identity this process stamps into credentials segments.
    pub fn credentials(&self) -> Credentials {
        self.creds.clone()
    }

    /// Open an endpoint of the given kind.
    ///
    /// # Errors
    ///
    /// `OutOfResources` when the endpoint table is exhausted,
    /// `TooManyDescriptors` when this process's table is.
    pub fn open_endpoint(&self, kind: EndpointKind) -> Result<Fd> {
        self.mutate(|core| core.op_open_endpoint(self.key, kind))
    }

    /// Open two endpoints born connected to each other.
    pub fn open_endpoint_pair(&self, kind: EndpointKind) -> Result<(Fd, Fd)> {
        self.mutate(|core| core.op_open_endpoint_pair(self.key, kind))
    }

    /// Open an ordinary transferable object with no transport behavior.
    pub fn open_plain(&self) -> Result<Fd> {
        self.mutate(|core| core.op_open_plain(self.key))
    }

    /// Duplicate a descriptor into a fresh slot of the same table.
    pub fn duplicate(&self, fd: Fd) -> Result<Fd> {
        self.mutate(|core| core.op_duplicate(self.key, fd))
    }

    /// Attach a name to an endpoint. Fails `AlreadyBound` on a second bind
    /// and `NameInUse` when the name is taken.
    pub fn bind(&self, fd: Fd, name: &str) -> Result<()> {
        self.mutate(|core| core.op_bind(self.key, fd, name))
    }

    /// Mark a bound stream endpoint as accepting connections.
    pub fn listen(&self, fd: Fd, backlog: usize) -> Result<()> {
        self.mutate(|core| core.op_listen(self.key, fd, backlog))
    }

    /// Stream: pair with a listener at `name`. Datagram: rebind the default
    /// destination; returns immediately and a later connect resets it.
    pub fn connect(&self, fd: Fd, name: &str) -> Result<()> {
        self.mutate(|core| core.op_connect(self.key, fd, name))
    }

    /// Pop the oldest pending connection, suspending while the backlog is
    /// empty.
    pub fn accept(&self, fd: Fd, signal: &SignalToken) -> Result<Fd> {
        self.block_on(signal, |core| core.op_try_accept(self.key, fd))
    }

    /// Non-blocking [`Process::accept`]; `WouldBlock` when the backlog is
    /// empty.
    pub fn try_accept(&self, fd: Fd) -> Result<Fd> {
        self.mutate(|core| core.op_try_accept(self.key, fd))
    }

    /// Send one message, suspending while the destination queue is at
    /// capacity.
    pub fn send(&self, fd: Fd, data: &[u8], opts: &SendOptions<'_>, signal: &SignalToken) -> Result<()> {
        self.block_on(signal, |core| core.op_try_send(self.key, fd, data, opts))
    }

    /// Non-blocking [`Process::send`]; `WouldBlock` instead of suspending.
    pub fn try_send(&self, fd: Fd, data: &[u8], opts: &SendOptions<'_>) -> Result<()> {
        self.mutate(|core| core.op_try_send(self.key, fd, data, opts))
    }

    /// Receive one message, suspending while the queue is empty. `Ok(None)`
    /// is end-of-stream.
    pub fn receive(&self, fd: Fd, signal: &SignalToken) -> Result<Option<Delivery>> {
        self.block_on(signal, |core| core.op_try_receive(self.key, fd))
    }

    /// Non-blocking [`Process::receive`]; `WouldBlock` when nothing is
    /// queued.
    pub fn try_receive(&self, fd: Fd) -> Result<Option<Delivery>> {
        self.mutate(|core| core.op_try_receive(self.key, fd))
    }

    /// Close one or both directions of an endpoint.
    pub fn shutdown(&self, fd: Fd, how: Shutdown) -> Result<()> {
        self.mutate(|core| core.op_shutdown(self.key, fd, how))
    }

    /// Unlink a stream pair (both sides at once) or clear a datagram
    /// default destination.
    pub fn disconnect(&self, fd: Fd) -> Result<()> {
        self.mutate(|core| core.op_disconnect(self.key, fd))
    }

    /// Close a descriptor. Runs a collection pass when in-transit
    /// references exist anywhere in the system.
    pub fn close(&self, fd: Fd) -> Result<()> {
        self.mutate(|core| core.op_close(self.key, fd))
    }

    /// Close every descriptor of this process, the exit path.
    pub fn close_all(&self) {
        let _ = self.mutate(|core| {
            core.op_close_all(self.key);
            Ok(())
        });
    }

    /// The name this endpoint is bound to.
    pub fn local_name(&self, fd: Fd) -> Result<Option<String>> {
        let core = self.shared.core.lock();
        core.op_local_name(self.key, fd)
    }

    /// The name the live peer is bound to.
    pub fn peer_name(&self, fd: Fd) -> Result<Option<String>> {
        let core = self.shared.core.lock();
        core.op_peer_name(self.key, fd)
    }

    /// Run a mutating operation under the lock, then wake every suspended
    /// call so it can re-check its condition.
    fn mutate<T>(&self, op: impl FnOnce(&mut Core) -> Result<T>) -> Result<T> {
        let result = {
            let mut core = self.shared.core.lock();
            op(&mut core)
        };
        self.shared.wakeups.notify_all();
        result
    }

    /// Retry an operation until it stops reporting `WouldBlock`, sleeping
    /// on the transport condvar between attempts. A raised signal token
    /// aborts the wait.
    fn block_on<T>(
        &self,
        signal: &SignalToken,
        mut attempt: impl FnMut(&mut Core) -> Result<T>,
    ) -> Result<T> {
        let mut core = self.shared.core.lock();
        loop {
            if signal.is_raised() {
                return Err(TransportError::Interrupted);
            }
            match attempt(&mut core) {
                Err(TransportError::WouldBlock) => self.shared.wakeups.wait(&mut core),
                Ok(value) => {
                    drop(core);
                    self.shared.wakeups.notify_all();
                    return Ok(value);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
