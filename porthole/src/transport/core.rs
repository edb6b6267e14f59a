//! Shared mutable state behind the transport's single exclusive-access
//! domain.
//!
//! Everything a mutator or the collector can touch lives here: the object
//! registry, the endpoint table, the name registry, every process's
//! descriptor table, and the global in-transit reference counter that gates
//! collection. One `parking_lot::Mutex` around this struct is the whole
//! concurrency story; see the crate docs.

use std::collections::HashMap;

use crate::arena::{Arena, Key};
use crate::endpoint::{Endpoint, EndpointKey, EndpointKind};
use crate::error::{Result, TransportError};
use crate::message::Credentials;
use crate::object::{FileObject, ObjectKey, ObjectKind};
use crate::table::{DescriptorTable, Fd};

use super::TransportConfig;

/// A process as the transport sees it: one descriptor table and an
/// identity for credentials segments.
pub(crate) struct ProcessState {
    pub(crate) table: DescriptorTable,
    pub(crate) creds: Credentials,
}

/// Key identifying a registered process.
pub(crate) type ProcessKey = Key<ProcessState>;

/// Operation counters, snapshotted into [`super::TransportStats`].
#[derive(Debug, Default, Clone)]
pub(crate) struct Counters {
    pub(crate) messages_queued: u64,
    pub(crate) messages_delivered: u64,
    pub(crate) rights_passed: u64,
    pub(crate) collector_passes: u64,
    pub(crate) objects_scanned: u64,
    pub(crate) objects_reclaimed: u64,
}

/// The exclusive-access domain.
pub(crate) struct Core {
    pub(crate) config: TransportConfig,
    pub(crate) objects: Arena<FileObject>,
    pub(crate) endpoints: Arena<Endpoint>,
    pub(crate) processes: Arena<ProcessState>,
    /// Bound path-like names, owned by the endpoint they point at.
    pub(crate) names: HashMap<String, EndpointKey>,
    /// System-wide count of in-transit references. Non-zero at descriptor
    /// close is what arms a collection pass; checking it costs one load,
    /// not a scan.
    pub(crate) inflight_refs: u64,
    pub(crate) counters: Counters,
}

impl Core {
    pub(crate) fn new(config: TransportConfig) -> Self {
        Self {
            config,
            objects: Arena::new(),
            endpoints: Arena::new(),
            processes: Arena::new(),
            names: HashMap::new(),
            inflight_refs: 0,
            counters: Counters::default(),
        }
    }

    pub(crate) fn register_process(&mut self, creds: Credentials) -> ProcessKey {
        let table = DescriptorTable::new(
            self.config.initial_table_slots,
            self.config.max_table_slots,
        );
        self.processes.insert(ProcessState { table, creds })
    }

    // =========================================================================
    // Descriptor resolution
    // =========================================================================

    pub(crate) fn resolve_fd(&self, proc_key: ProcessKey, fd: Fd) -> Result<ObjectKey> {
        self.processes
            .get(proc_key)
            .and_then(|p| p.table.get(fd))
            .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })
    }

    /// Resolve a descriptor that must name a socket object.
    pub(crate) fn resolve_socket(&self, proc_key: ProcessKey, fd: Fd) -> Result<EndpointKey> {
        let okey = self.resolve_fd(proc_key, fd)?;
        let object = self
            .objects
            .get(okey)
            .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
        object.endpoint().ok_or_else(|| TransportError::InvalidArgument {
            reason: format!("{fd} is not a socket"),
        })
    }

    /// A peer key is only as good as the endpoint behind it: the peer may
    /// have been torn down since the key was stored.
    pub(crate) fn live_endpoint(&self, key: EndpointKey) -> Option<&Endpoint> {
        self.endpoints.get(key).filter(|ep| !ep.closing)
    }

    // =========================================================================
    // Reference bookkeeping
    // =========================================================================

    /// Record a descriptor-table reference.
    pub(crate) fn add_table_ref(&mut self, okey: ObjectKey) {
        if let Some(object) = self.objects.get_mut(okey) {
            object.total_refs += 1;
        }
    }

    /// Record an in-transit reference (a queued rights slot or a backlog
    /// entry).
    pub(crate) fn add_queue_ref(&mut self, okey: ObjectKey) {
        if let Some(object) = self.objects.get_mut(okey) {
            object.total_refs += 1;
            object.message_refs += 1;
        }
        self.inflight_refs += 1;
    }

    /// Drop an in-transit reference; objects that hit zero are appended to
    /// `dead` for the caller's worklist.
    pub(crate) fn drop_queue_ref(&mut self, okey: ObjectKey, dead: &mut Vec<ObjectKey>) {
        self.inflight_refs -= 1;
        if let Some(object) = self.objects.get_mut(okey) {
            debug_assert!(object.message_refs > 0 && object.total_refs > 0);
            object.message_refs -= 1;
            object.total_refs -= 1;
            if object.total_refs == 0 {
                dead.push(okey);
            }
        }
    }

    /// Drop a descriptor-table reference and reap whatever dies.
    pub(crate) fn drop_table_ref(&mut self, okey: ObjectKey) {
        let dead = {
            let object = match self.objects.get_mut(okey) {
                Some(object) => object,
                None => return,
            };
            debug_assert!(object.total_refs > 0);
            object.total_refs -= 1;
            object.total_refs == 0
        };
        if dead {
            self.reap(vec![okey]);
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Destroy every object on the worklist, plus everything their queues
    /// were keeping alive. Iterative on purpose: two sockets queued inside
    /// each other must not turn destruction into recursion.
    pub(crate) fn reap(&mut self, mut dead: Vec<ObjectKey>) {
        while let Some(okey) = dead.pop() {
            let object = match self.objects.remove(okey) {
                Some(object) => object,
                None => continue,
            };
            debug_assert_eq!(object.total_refs, 0);
            if let ObjectKind::Socket(ekey) = object.kind {
                self.teardown_endpoint(ekey, &mut dead);
            }
            tracing::debug!("object {:?} destroyed", okey);
        }
    }

    /// Release everything an endpoint holds and remove it.
    ///
    /// Order matters: unbind the name first (no new connects), unlink the
    /// peer pair as one step, then hand queued data to the discard path.
    fn teardown_endpoint(&mut self, ekey: EndpointKey, dead: &mut Vec<ObjectKey>) {
        if let Some(ep) = self.endpoints.get_mut(ekey) {
            ep.closing = true;
        } else {
            return;
        }

        if let Some(name) = self
            .endpoints
            .get_mut(ekey)
            .and_then(|ep| ep.address.take())
        {
            self.names.remove(&name);
        }

        self.unlink_peer(ekey);
        self.flush_endpoint(ekey, dead);
        self.endpoints.remove(ekey);
        tracing::debug!("endpoint {:?} torn down", ekey);
    }

    /// Unlink both directions of a peer relationship as one atomic step.
    ///
    /// For a stream pair this clears both `peer` fields; for a datagram
    /// endpoint it also detaches every endpoint that used this one as its
    /// default destination, which is exactly what `pending_peer_refs` is
    /// for.
    pub(crate) fn unlink_peer(&mut self, ekey: EndpointKey) {
        let (peer, kind, pending): (Option<EndpointKey>, EndpointKind, Vec<EndpointKey>) = {
            let ep = match self.endpoints.get_mut(ekey) {
                Some(ep) => ep,
                None => return,
            };
            (
                ep.peer.take(),
                ep.kind,
                ep.pending_peer_refs.drain().collect(),
            )
        };

        if let Some(peer_key) = peer {
            if let Some(peer_ep) = self.endpoints.get_mut(peer_key) {
                match kind {
                    EndpointKind::Stream => {
                        peer_ep.peer = None;
                    }
                    EndpointKind::Datagram => {
                        peer_ep.pending_peer_refs.remove(&ekey);
                    }
                }
            }
        }
        for referrer in pending {
            if let Some(ref_ep) = self.endpoints.get_mut(referrer) {
                if ref_ep.peer == Some(ekey) {
                    ref_ep.peer = None;
                }
            }
        }
    }

    /// Discard an endpoint's receive queue and accept backlog, releasing
    /// every in-transit reference they hold. Used by teardown and by the
    /// collector's sweep stage.
    pub(crate) fn flush_endpoint(&mut self, ekey: EndpointKey, dead: &mut Vec<ObjectKey>) {
        let (messages, backlog) = {
            let ep = match self.endpoints.get_mut(ekey) {
                Some(ep) => ep,
                None => return,
            };
            let messages: Vec<_> = ep.queue.messages.drain(..).collect();
            ep.queue.bytes_in_flight = 0;
            ep.queue.refs_in_flight = 0;
            let backlog: Vec<_> = ep.accept_queue.drain(..).collect();
            (messages, backlog)
        };

        for message in &messages {
            for &okey in &message.rights {
                self.drop_queue_ref(okey, dead);
            }
        }
        for child in backlog {
            if let Some(child_obj) = self.endpoints.get(child).map(|ep| ep.object) {
                self.drop_queue_ref(child_obj, dead);
            }
        }
    }

    // =========================================================================
    // Accounting audit
    // =========================================================================

    /// Recompute every object's expected counts from the tables and queues
    /// and compare against the books.
    pub(crate) fn audit(&self) -> std::result::Result<(), String> {
        let mut table_refs: HashMap<ObjectKey, u32> = HashMap::new();
        let mut queue_refs: HashMap<ObjectKey, u32> = HashMap::new();

        for (_, process) in self.processes.iter() {
            for (_, okey) in process.table.iter() {
                *table_refs.entry(okey).or_default() += 1;
            }
        }
        for (_, ep) in self.endpoints.iter() {
            for message in &ep.queue.messages {
                for &okey in &message.rights {
                    *queue_refs.entry(okey).or_default() += 1;
                }
            }
            for &child in &ep.accept_queue {
                if let Some(child_ep) = self.endpoints.get(child) {
                    *queue_refs.entry(child_ep.object).or_default() += 1;
                }
            }
        }

        let mut inflight_total = 0u64;
        for (okey, object) in self.objects.iter() {
            let tables = table_refs.get(&okey).copied().unwrap_or(0);
            let queues = queue_refs.get(&okey).copied().unwrap_or(0);
            inflight_total += u64::from(object.message_refs);
            if object.total_refs != tables + queues {
                return Err(format!(
                    "object {:?}: total_refs {} but {} table + {} queue slots name it",
                    okey, object.total_refs, tables, queues
                ));
            }
            if object.message_refs != queues {
                return Err(format!(
                    "object {:?}: message_refs {} but {} queue slots name it",
                    okey, object.message_refs, queues
                ));
            }
        }
        if self.inflight_refs != inflight_total {
            return Err(format!(
                "global in-flight counter {} but objects account for {}",
                self.inflight_refs, inflight_total
            ));
        }
        Ok(())
    }
}
