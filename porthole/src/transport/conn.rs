//! Connection management: naming, listening, pairing, and teardown of the
//! links that make two endpoints peers.

use crate::endpoint::{Endpoint, EndpointKey, EndpointKind, Shutdown};
use crate::error::{Result, TransportError};
use crate::object::{FileObject, ObjectKey, ObjectKind};
use crate::table::Fd;

use super::core::{Core, ProcessKey};

impl Core {
    /// Allocate a socket object + endpoint pair and return the endpoint.
    ///
    /// The object starts with zero references; the caller records the first
    /// one (a table slot for `open`, an accept-queue entry for `connect`).
    pub(crate) fn alloc_endpoint(&mut self, kind: EndpointKind) -> Result<EndpointKey> {
        if self.endpoints.len() >= self.config.max_endpoints {
            return Err(TransportError::OutOfResources {
                resource: "endpoint table",
            });
        }
        // Wired up immediately below; the placeholder kind is never observable.
        let okey = self.objects.insert(FileObject::new(ObjectKind::Plain));
        let ekey = self.endpoints.insert(Endpoint::new(kind, okey));
        if let Some(object) = self.objects.get_mut(okey) {
            object.kind = ObjectKind::Socket(ekey);
        }
        Ok(ekey)
    }

    pub(crate) fn op_open_endpoint(&mut self, proc_key: ProcessKey, kind: EndpointKind) -> Result<Fd> {
        let ekey = self.alloc_endpoint(kind)?;
        let okey = self
            .endpoints
            .get(ekey)
            .map(|ep| ep.object)
            .ok_or(TransportError::OutOfResources {
                resource: "endpoint table",
            })?;
        let fd = self.install_fd(proc_key, okey, ekey)?;
        tracing::debug!("opened {:?} endpoint {:?} as {}", kind, ekey, fd);
        Ok(fd)
    }

    /// Two endpoints born connected, the conventional socketpair bring-up.
    pub(crate) fn op_open_endpoint_pair(
        &mut self,
        proc_key: ProcessKey,
        kind: EndpointKind,
    ) -> Result<(Fd, Fd)> {
        let a = self.alloc_endpoint(kind)?;
        let b = match self.alloc_endpoint(kind) {
            Ok(b) => b,
            Err(e) => {
                self.discard_unreferenced_endpoint(a);
                return Err(e);
            }
        };

        for (this, that) in [(a, b), (b, a)] {
            if let Some(ep) = self.endpoints.get_mut(this) {
                ep.peer = Some(that);
                ep.was_connected = true;
                if kind == EndpointKind::Datagram {
                    ep.pending_peer_refs.insert(that);
                }
            }
        }

        let obj_a = self.endpoints.get(a).map(|ep| ep.object);
        let obj_b = self.endpoints.get(b).map(|ep| ep.object);
        let (obj_a, obj_b) = match (obj_a, obj_b) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return Err(TransportError::OutOfResources {
                    resource: "endpoint table",
                })
            }
        };

        let fd_a = self.install_fd(proc_key, obj_a, a)?;
        let fd_b = match self.install_fd(proc_key, obj_b, b) {
            Ok(fd) => fd,
            Err(e) => {
                // Unwind the first slot too; no half-constructed pair
                // stays reachable.
                if let Some(process) = self.processes.get_mut(proc_key) {
                    process.table.remove(fd_a);
                }
                self.drop_table_ref(obj_a);
                return Err(e);
            }
        };
        tracing::debug!("opened {:?} pair ({}, {})", kind, fd_a, fd_b);
        Ok((fd_a, fd_b))
    }

    /// An ordinary transferable object with no queue of its own.
    pub(crate) fn op_open_plain(&mut self, proc_key: ProcessKey) -> Result<Fd> {
        let okey = self.objects.insert(FileObject::new(ObjectKind::Plain));
        let process = self
            .processes
            .get_mut(proc_key)
            .ok_or(TransportError::OutOfResources { resource: "process" })?;
        let fd = match process.table.insert(okey) {
            Some(fd) => fd,
            None => {
                self.objects.remove(okey);
                return Err(TransportError::TooManyDescriptors {
                    count: 1,
                    max: self.config.max_table_slots,
                });
            }
        };
        self.add_table_ref(okey);
        Ok(fd)
    }

    pub(crate) fn op_duplicate(&mut self, proc_key: ProcessKey, fd: Fd) -> Result<Fd> {
        let okey = self.resolve_fd(proc_key, fd)?;
        let process = self
            .processes
            .get_mut(proc_key)
            .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
        let dup = process
            .table
            .insert(okey)
            .ok_or(TransportError::TooManyDescriptors {
                count: 1,
                max: self.config.max_table_slots,
            })?;
        self.add_table_ref(okey);
        Ok(dup)
    }

    pub(crate) fn op_bind(&mut self, proc_key: ProcessKey, fd: Fd, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(TransportError::InvalidArgument {
                reason: "empty name".to_string(),
            });
        }
        let ekey = self.resolve_socket(proc_key, fd)?;
        let ep = self
            .endpoints
            .get(ekey)
            .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
        if ep.address.is_some() {
            return Err(TransportError::AlreadyBound);
        }
        if self.names.contains_key(name) {
            return Err(TransportError::NameInUse {
                name: name.to_string(),
            });
        }
        self.names.insert(name.to_string(), ekey);
        if let Some(ep) = self.endpoints.get_mut(ekey) {
            ep.address = Some(name.to_string());
        }
        tracing::debug!("bound {:?} to {name:?}", ekey);
        Ok(())
    }

    pub(crate) fn op_listen(&mut self, proc_key: ProcessKey, fd: Fd, backlog: usize) -> Result<()> {
        let ekey = self.resolve_socket(proc_key, fd)?;
        let max_backlog = self.config.max_backlog;
        let ep = self
            .endpoints
            .get_mut(ekey)
            .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
        if ep.kind != EndpointKind::Stream {
            return Err(TransportError::InvalidArgument {
                reason: "listen on a datagram endpoint".to_string(),
            });
        }
        if ep.peer.is_some() || ep.was_connected {
            return Err(TransportError::AlreadyConnected);
        }
        ep.listening = true;
        ep.backlog = backlog.clamp(1, max_backlog);
        Ok(())
    }

    pub(crate) fn op_connect(&mut self, proc_key: ProcessKey, fd: Fd, name: &str) -> Result<()> {
        let ekey = self.resolve_socket(proc_key, fd)?;
        let kind = self
            .endpoints
            .get(ekey)
            .map(|ep| ep.kind)
            .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
        match kind {
            EndpointKind::Stream => self.connect_stream(ekey, name),
            EndpointKind::Datagram => self.connect_datagram(ekey, name),
        }
    }

    /// Resolve `name` to a listening endpoint and pair the caller with a
    /// freshly allocated child. The listener itself never becomes anyone's
    /// peer; what lands in its backlog is the child.
    fn connect_stream(&mut self, ekey: EndpointKey, name: &str) -> Result<()> {
        {
            let ep = self.endpoints.get(ekey).ok_or(TransportError::NotConnected)?;
            if ep.listening {
                return Err(TransportError::InvalidArgument {
                    reason: "connect on a listening endpoint".to_string(),
                });
            }
            if ep.peer.is_some() || ep.was_connected {
                return Err(TransportError::AlreadyConnected);
            }
        }

        let refused = || TransportError::ConnectionRefused {
            name: name.to_string(),
        };
        let listener = self.names.get(name).copied().ok_or_else(refused)?;
        {
            let listener_ep = self.live_endpoint(listener).ok_or_else(refused)?;
            if !listener_ep.listening || listener_ep.kind != EndpointKind::Stream {
                return Err(refused());
            }
            if listener_ep.accept_queue.len() >= listener_ep.backlog {
                tracing::debug!("backlog full on {:?}, refusing {:?}", listener, ekey);
                return Err(refused());
            }
        }

        let child = self.alloc_endpoint(EndpointKind::Stream).map_err(|_| refused())?;
        let child_obj = match self.endpoints.get(child) {
            Some(ep) => ep.object,
            None => return Err(refused()),
        };

        // Link both directions as one step, then park the child in the
        // backlog. The accept-queue entry is an in-transit reference: the
        // collector reaches embryo queues through it.
        if let Some(ep) = self.endpoints.get_mut(child) {
            ep.peer = Some(ekey);
            ep.was_connected = true;
        }
        if let Some(ep) = self.endpoints.get_mut(ekey) {
            ep.peer = Some(child);
            ep.was_connected = true;
        }
        self.add_queue_ref(child_obj);
        if let Some(listener_ep) = self.endpoints.get_mut(listener) {
            listener_ep.accept_queue.push_back(child);
        }
        tracing::debug!("{:?} connected to {name:?} via child {:?}", ekey, child);
        Ok(())
    }

    /// Non-blocking rebind of the default destination; a second connect
    /// resets it.
    fn connect_datagram(&mut self, ekey: EndpointKey, name: &str) -> Result<()> {
        let target = self
            .names
            .get(name)
            .copied()
            .ok_or_else(|| TransportError::ConnectionRefused {
                name: name.to_string(),
            })?;
        let target_kind = self
            .live_endpoint(target)
            .map(|ep| ep.kind)
            .ok_or_else(|| TransportError::ConnectionRefused {
                name: name.to_string(),
            })?;
        if target_kind != EndpointKind::Datagram {
            return Err(TransportError::ConnectionRefused {
                name: name.to_string(),
            });
        }

        let old = {
            let ep = self.endpoints.get_mut(ekey).ok_or(TransportError::NotConnected)?;
            ep.peer.replace(target)
        };
        if let Some(old_target) = old {
            if old_target != target {
                if let Some(old_ep) = self.endpoints.get_mut(old_target) {
                    old_ep.pending_peer_refs.remove(&ekey);
                }
            }
        }
        if let Some(target_ep) = self.endpoints.get_mut(target) {
            target_ep.pending_peer_refs.insert(ekey);
        }
        Ok(())
    }

    /// Pop the oldest pending connection off a listener.
    pub(crate) fn op_try_accept(&mut self, proc_key: ProcessKey, fd: Fd) -> Result<Fd> {
        let ekey = self.resolve_socket(proc_key, fd)?;
        {
            let ep = self
                .endpoints
                .get(ekey)
                .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
            if !ep.listening {
                return Err(TransportError::InvalidArgument {
                    reason: "accept on a non-listening endpoint".to_string(),
                });
            }
            if ep.accept_queue.is_empty() {
                return Err(TransportError::WouldBlock);
            }
        }

        let child = match self
            .endpoints
            .get_mut(ekey)
            .and_then(|ep| ep.accept_queue.pop_front())
        {
            Some(child) => child,
            None => return Err(TransportError::WouldBlock),
        };
        let child_obj = match self.endpoints.get(child) {
            Some(ep) => ep.object,
            None => return Err(TransportError::WouldBlock),
        };

        let new_fd = self.install_fd(proc_key, child_obj, child).map_err(|e| {
            // The child goes back where it was; accept either completes or
            // changes nothing.
            if let Some(ep) = self.endpoints.get_mut(ekey) {
                ep.accept_queue.push_front(child);
            }
            e
        })?;

        // The backlog's in-transit reference became the new table slot.
        let mut dead = Vec::new();
        self.drop_queue_ref(child_obj, &mut dead);
        debug_assert!(dead.is_empty());
        tracing::debug!("accepted {:?} off {:?} as {}", child, ekey, new_fd);
        Ok(new_fd)
    }

    pub(crate) fn op_disconnect(&mut self, proc_key: ProcessKey, fd: Fd) -> Result<()> {
        let ekey = self.resolve_socket(proc_key, fd)?;
        let (is_stream, peer) = {
            let ep = self
                .endpoints
                .get(ekey)
                .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
            (ep.is_stream(), ep.peer)
        };
        if peer.is_none() {
            return Err(TransportError::NotConnected);
        }
        if is_stream {
            // Both halves of the pair stop carrying traffic together.
            self.unlink_peer(ekey);
            for key in [Some(ekey), peer].into_iter().flatten() {
                if let Some(side) = self.endpoints.get_mut(key) {
                    side.shutdown |= Shutdown::SEND;
                }
            }
        } else {
            // Only this endpoint's default destination goes away; endpoints
            // that target *us* keep theirs.
            let old = self
                .endpoints
                .get_mut(ekey)
                .and_then(|ep| ep.peer.take());
            if let Some(target) = old {
                if let Some(target_ep) = self.endpoints.get_mut(target) {
                    target_ep.pending_peer_refs.remove(&ekey);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn op_shutdown(&mut self, proc_key: ProcessKey, fd: Fd, how: Shutdown) -> Result<()> {
        let ekey = self.resolve_socket(proc_key, fd)?;
        let ep = self
            .endpoints
            .get_mut(ekey)
            .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
        ep.shutdown |= how;
        Ok(())
    }

    /// The name this endpoint is bound to, if any.
    pub(crate) fn op_local_name(&self, proc_key: ProcessKey, fd: Fd) -> Result<Option<String>> {
        let ekey = self.resolve_socket(proc_key, fd)?;
        Ok(self.endpoints.get(ekey).and_then(|ep| ep.address.clone()))
    }

    /// The name the peer is bound to, if there is a live peer and it has
    /// one.
    pub(crate) fn op_peer_name(&self, proc_key: ProcessKey, fd: Fd) -> Result<Option<String>> {
        let ekey = self.resolve_socket(proc_key, fd)?;
        let peer = self
            .endpoints
            .get(ekey)
            .and_then(|ep| ep.peer)
            .and_then(|peer| self.live_endpoint(peer));
        Ok(peer.and_then(|ep| ep.address.clone()))
    }

    /// Close one descriptor. This is the gate point for the cycle
    /// collector: if in-transit references exist anywhere in the system
    /// once the slot is gone, a pass runs.
    pub(crate) fn op_close(&mut self, proc_key: ProcessKey, fd: Fd) -> Result<()> {
        let okey = self
            .processes
            .get_mut(proc_key)
            .and_then(|p| p.table.remove(fd))
            .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
        self.drop_table_ref(okey);
        self.maybe_collect();
        Ok(())
    }

    /// Close every descriptor of a process (the exit path).
    pub(crate) fn op_close_all(&mut self, proc_key: ProcessKey) {
        let taken = match self.processes.get_mut(proc_key) {
            Some(process) => process.table.drain(),
            None => return,
        };
        for (_, okey) in taken {
            self.drop_table_ref(okey);
        }
        self.maybe_collect();
    }

    // =========================================================================
    // Small helpers
    // =========================================================================

    /// Install an object into a process table and record the reference.
    fn install_fd(&mut self, proc_key: ProcessKey, okey: ObjectKey, ekey: EndpointKey) -> Result<Fd> {
        let process = self
            .processes
            .get_mut(proc_key)
            .ok_or(TransportError::OutOfResources { resource: "process" })?;
        match process.table.insert(okey) {
            Some(fd) => {
                self.add_table_ref(okey);
                Ok(fd)
            }
            None => {
                // A socket object nobody references yet: drop it outright.
                self.discard_unreferenced_endpoint(ekey);
                Err(TransportError::TooManyDescriptors {
                    count: 1,
                    max: self.config.max_table_slots,
                })
            }
        }
    }

    /// Remove an endpoint + object pair that never acquired a reference.
    fn discard_unreferenced_endpoint(&mut self, ekey: EndpointKey) {
        let okey = match self.endpoints.get(ekey) {
            Some(ep) => ep.object,
            None => return,
        };
        let unreferenced = self.objects.get(okey).is_some_and(|o| o.total_refs == 0);
        if unreferenced {
            self.unlink_peer(ekey);
            self.endpoints.remove(ekey);
            self.objects.remove(okey);
        }
    }
}
