//! Transfer engine: data + control movement between peers, and the
//! descriptor-passing conversions at each end of the queue.

use std::collections::HashSet;

use crate::endpoint::{EndpointKey, EndpointKind, Shutdown};
use crate::error::{Result, TransportError};
use crate::message::Message;
use crate::object::ObjectKey;
use crate::table::Fd;
use crate::wire::{self, Segment};

use super::core::{Core, ProcessKey};
use super::{Delivery, SendOptions};

impl Core {
    /// Queue one message on the destination's receive queue.
    ///
    /// Everything (control bytes, destination, rights, capacity) is
    /// validated before a single reference is taken, so any error leaves
    /// the system exactly as it was.
    pub(crate) fn op_try_send(
        &mut self,
        proc_key: ProcessKey,
        fd: Fd,
        data: &[u8],
        opts: &SendOptions<'_>,
    ) -> Result<()> {
        let ekey = self.resolve_socket(proc_key, fd)?;
        let (kind, shut, peer) = {
            let ep = self
                .endpoints
                .get(ekey)
                .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
            (ep.kind, ep.shutdown, ep.peer)
        };
        if shut.contains(Shutdown::SEND) {
            return Err(TransportError::NotConnected);
        }

        let raw_rights = match opts.control {
            Some(bytes) => validate_sender_control(bytes)?,
            None => None,
        };

        let dest = self.resolve_destination(kind, peer, opts.destination)?;

        // Resolve descriptor integers against the sender's table. References
        // within one segment must be unique; two descriptors naming the same
        // object is the same reference twice.
        let rights_keys = match &raw_rights {
            Some(fds) => {
                let mut keys = Vec::with_capacity(fds.len());
                let mut seen = HashSet::with_capacity(fds.len());
                for &raw in fds {
                    let okey = self.resolve_fd(proc_key, Fd::from_raw(raw))?;
                    if !seen.insert(okey) {
                        return Err(TransportError::InvalidArgument {
                            reason: format!("descriptor {raw} repeats an object in the segment"),
                        });
                    }
                    keys.push(okey);
                }
                Some(keys)
            }
            None => None,
        };
        let nrights = rights_keys.as_ref().map_or(0, Vec::len);

        // Backpressure: the destination queue's two counters mirror what the
        // sender consumes, so both sides' high-water marks stay meaningful.
        let cap_bytes = self.config.queue_capacity_bytes;
        let cap_refs = self.config.queue_capacity_refs;
        if data.len() > cap_bytes {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: cap_bytes,
            });
        }
        if nrights > cap_refs {
            return Err(TransportError::TooManyDescriptors {
                count: nrights,
                max: cap_refs,
            });
        }
        {
            let dest_ep = self.endpoints.get(dest).ok_or(TransportError::NotConnected)?;
            if dest_ep.queue.bytes_in_flight + data.len() > cap_bytes
                || dest_ep.queue.refs_in_flight + nrights > cap_refs
            {
                return Err(TransportError::WouldBlock);
            }
        }

        // Credentials ride at most once per connection, on the first message
        // after the receiver asked.
        let credentials = if kind == EndpointKind::Stream && self.should_attach_credentials(dest) {
            self.processes.get(proc_key).map(|p| p.creds.clone())
        } else {
            None
        };

        // Point of no return: record the in-transit references and queue.
        if let Some(keys) = &rights_keys {
            for &okey in keys {
                self.add_queue_ref(okey);
            }
        }
        let message = Message {
            data: data.to_vec(),
            rights: rights_keys.unwrap_or_default(),
            credentials,
        };
        if let Some(dest_ep) = self.endpoints.get_mut(dest) {
            dest_ep.queue.push(message);
        }
        self.counters.messages_queued += 1;
        tracing::debug!(
            "queued {} bytes, {} rights from {:?} onto {:?}",
            data.len(),
            nrights,
            ekey,
            dest
        );

        if opts.want_credentials {
            // Arm our own endpoint: the peer's next message to us must carry
            // its identity.
            if let Some(ep) = self.endpoints.get_mut(ekey) {
                if ep.is_stream() {
                    ep.wants_credentials = true;
                }
            }
        }
        Ok(())
    }

    /// Dequeue one message, landing any passed rights in the caller's
    /// descriptor table. `Ok(None)` is end-of-stream.
    pub(crate) fn op_try_receive(
        &mut self,
        proc_key: ProcessKey,
        fd: Fd,
    ) -> Result<Option<Delivery>> {
        let ekey = self.resolve_socket(proc_key, fd)?;
        {
            let ep = self
                .endpoints
                .get(ekey)
                .ok_or(TransportError::BadDescriptor { fd: fd.as_raw() })?;
            if ep.listening {
                return Err(TransportError::InvalidArgument {
                    reason: "receive on a listening endpoint".to_string(),
                });
            }
            if ep.queue.is_empty() {
                if ep.shutdown.contains(Shutdown::RECV) {
                    return Ok(None);
                }
                match ep.kind {
                    EndpointKind::Stream => {
                        if !ep.was_connected {
                            return Err(TransportError::NotConnected);
                        }
                        match ep.peer.and_then(|peer| self.live_endpoint(peer)) {
                            Some(peer_ep) if !peer_ep.shutdown.contains(Shutdown::SEND) => {
                                return Err(TransportError::WouldBlock)
                            }
                            // Peer torn down or done sending: end of stream.
                            _ => return Ok(None),
                        }
                    }
                    EndpointKind::Datagram => return Err(TransportError::WouldBlock),
                }
            }
        }

        let message = match self.endpoints.get_mut(ekey).and_then(|ep| ep.queue.pop()) {
            Some(message) => message,
            None => return Err(TransportError::WouldBlock),
        };
        self.externalize(proc_key, ekey, message)
    }

    /// Land a dequeued message in the receiving process.
    ///
    /// Slot filling takes a fresh table reference per right; only once every
    /// slot is filled are the in-transit references dropped. A failure rolls
    /// the filled slots back, releases each exactly once, and restores the
    /// message to the head of the queue; the table and every count end as
    /// they were.
    fn externalize(
        &mut self,
        proc_key: ProcessKey,
        ekey: EndpointKey,
        message: Message,
    ) -> Result<Option<Delivery>> {
        let rights_keys: Vec<ObjectKey> = message.rights.clone();
        let mut fds: Vec<Fd> = Vec::with_capacity(rights_keys.len());

        for &okey in &rights_keys {
            let slot = self
                .processes
                .get_mut(proc_key)
                .and_then(|p| p.table.insert(okey));
            match slot {
                Some(new_fd) => {
                    self.add_table_ref(okey);
                    fds.push(new_fd);
                }
                None => {
                    for (filled_fd, &filled_key) in fds.iter().zip(&rights_keys) {
                        if let Some(process) = self.processes.get_mut(proc_key) {
                            process.table.remove(*filled_fd);
                        }
                        // Cannot reap: the in-transit reference still holds
                        // the object.
                        self.drop_table_ref(filled_key);
                    }
                    if let Some(ep) = self.endpoints.get_mut(ekey) {
                        ep.queue.push_front(message);
                    }
                    return Err(TransportError::TooManyDescriptors {
                        count: rights_keys.len(),
                        max: self.config.max_table_slots,
                    });
                }
            }
        }

        // Ownership transferred, not duplicated: the queue slots die, the
        // table slots live on.
        let mut dead = Vec::new();
        for &okey in &rights_keys {
            self.drop_queue_ref(okey, &mut dead);
        }
        debug_assert!(dead.is_empty());

        let data_len = message.data.len();
        if let Some(ep) = self.endpoints.get_mut(ekey) {
            ep.queue.settle(data_len, rights_keys.len());
        }
        self.counters.messages_delivered += 1;
        self.counters.rights_passed += rights_keys.len() as u64;
        tracing::debug!(
            "delivered {} bytes, {} rights to {:?}",
            data_len,
            rights_keys.len(),
            ekey
        );

        Ok(Some(Delivery {
            data: message.data,
            rights: fds,
            credentials: message.credentials,
        }))
    }

    fn resolve_destination(
        &self,
        kind: EndpointKind,
        peer: Option<EndpointKey>,
        destination: Option<&str>,
    ) -> Result<EndpointKey> {
        let dest = match kind {
            EndpointKind::Stream => {
                if destination.is_some() {
                    return Err(TransportError::InvalidArgument {
                        reason: "explicit destination on a stream endpoint".to_string(),
                    });
                }
                peer.ok_or(TransportError::NotConnected)?
            }
            EndpointKind::Datagram => match destination {
                Some(name) => {
                    let refused = || TransportError::ConnectionRefused {
                        name: name.to_string(),
                    };
                    let target = self.names.get(name).copied().ok_or_else(refused)?;
                    let target_ep = self.live_endpoint(target).ok_or_else(refused)?;
                    if target_ep.kind != EndpointKind::Datagram {
                        return Err(refused());
                    }
                    target
                }
                None => peer.ok_or(TransportError::NotConnected)?,
            },
        };

        let dest_ep = self.live_endpoint(dest).ok_or(TransportError::NotConnected)?;
        if dest_ep.shutdown.contains(Shutdown::RECV) {
            return Err(TransportError::NotConnected);
        }
        Ok(dest)
    }

    /// Check-and-clear of the destination's credentials request.
    fn should_attach_credentials(&mut self, dest: EndpointKey) -> bool {
        match self.endpoints.get_mut(dest) {
            Some(dest_ep) if dest_ep.wants_credentials && !dest_ep.credentials_delivered => {
                dest_ep.wants_credentials = false;
                dest_ep.credentials_delivered = true;
                true
            }
            _ => false,
        }
    }
}

/// Parse a sender-supplied control buffer.
///
/// A sender may supply at most one rights segment and nothing else; in
/// particular a credentials segment is rejected outright, since identity is
/// only ever synthesized by the engine.
fn validate_sender_control(bytes: &[u8]) -> Result<Option<Vec<u32>>> {
    let mut rights = None;
    for segment in wire::decode_segments(bytes)? {
        match segment {
            Segment::Rights(fds) => {
                if rights.is_some() {
                    return Err(TransportError::InvalidArgument {
                        reason: "more than one rights segment".to_string(),
                    });
                }
                rights = Some(fds);
            }
            Segment::Credentials(_) => {
                return Err(TransportError::InvalidArgument {
                    reason: "credentials segment in sender control data".to_string(),
                });
            }
        }
    }
    Ok(rights)
}
