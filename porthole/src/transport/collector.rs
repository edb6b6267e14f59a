//! Cycle collector: mark-and-sweep over the object registry and every
//! endpoint's pending queues.
//!
//! Reference counting alone cannot free two sockets whose queues hold each
//! other's rights. This pass finds objects whose every reference is
//! in-transit and unreachable from any descriptor table, then frees them in
//! two stages so that flushing one victim's queue can never finally close
//! another victim mid-scan.
//!
//! The pass runs entirely inside the exclusive-access domain: no connect,
//! send, receive, or close can mutate the graph while it walks. That mutual
//! exclusion is what makes the fixpoint sound; do not weaken it without
//! re-proving the algorithm.

use std::collections::HashMap;

use crate::object::{ObjectKey, ObjectKind};

use super::core::Core;

/// Transient per-object state, built fresh for each pass. Deliberately not a
/// field of the object itself.
#[derive(Debug, Default, Clone, Copy)]
struct Mark {
    marked: bool,
    deferred: bool,
}

impl Core {
    /// Collection gate: a pass runs only while in-transit references exist
    /// anywhere in the system. One counter load, no scan.
    pub(crate) fn maybe_collect(&mut self) {
        if self.inflight_refs > 0 {
            self.collect();
        }
    }

    /// One full Idle → Marking → Sweeping → Idle pass.
    pub(crate) fn collect(&mut self) {
        self.counters.collector_passes += 1;
        self.counters.objects_scanned += self.objects.len() as u64;

        // ---- Marking ----
        //
        // Seed with everything process-reachable, then propagate through
        // socket queues. Socket objects reached via a queue are deferred to
        // the next round instead of recursed into, which bounds the work of
        // each round; the loop runs until no object carries the deferred
        // bit.
        let mut marks: HashMap<ObjectKey, Mark> = HashMap::new();
        let mut pending: Vec<ObjectKey> = Vec::new();

        for (okey, object) in self.objects.iter() {
            debug_assert!(object.message_refs <= object.total_refs);
            if object.process_reachable() {
                let mark = marks.entry(okey).or_default();
                mark.marked = true;
                if matches!(object.kind, ObjectKind::Socket(_)) {
                    mark.deferred = true;
                    pending.push(okey);
                }
            }
        }

        while let Some(sock) = pending.pop() {
            if let Some(mark) = marks.get_mut(&sock) {
                mark.deferred = false;
            }
            let ekey = match self.objects.get(sock).and_then(|o| o.endpoint()) {
                Some(ekey) => ekey,
                None => continue,
            };

            // Everything queued inside this socket: rights in its receive
            // queue, plus backlog children. Backlog entries get the same
            // scan priority as delivered messages.
            let mut queued: Vec<ObjectKey> = Vec::new();
            if let Some(ep) = self.endpoints.get(ekey) {
                for message in &ep.queue.messages {
                    queued.extend_from_slice(&message.rights);
                }
                for &child in &ep.accept_queue {
                    if let Some(child_ep) = self.endpoints.get(child) {
                        queued.push(child_ep.object);
                    }
                }
            }

            for okey in queued {
                let mark = marks.entry(okey).or_default();
                if mark.marked {
                    continue;
                }
                mark.marked = true;
                let is_socket = self
                    .objects
                    .get(okey)
                    .is_some_and(|o| matches!(o.kind, ObjectKind::Socket(_)));
                if is_socket {
                    mark.deferred = true;
                    pending.push(okey);
                }
            }
        }

        // ---- Sweeping ----
        let mut selected: Vec<ObjectKey> = Vec::new();
        for (okey, object) in self.objects.iter() {
            let marked = marks.get(&okey).is_some_and(|m| m.marked);
            if !marked && object.collector_eligible() {
                selected.push(okey);
            }
        }
        if selected.is_empty() {
            return;
        }
        tracing::debug!("collection pass selected {} objects", selected.len());

        // Stage one: hold every victim with an extra reference, then flush
        // their queues through the ordinary discard path. The holds keep the
        // flushes from reaching a victim's final close while its own queue
        // is still live.
        for &okey in &selected {
            match self.objects.get_mut(okey) {
                Some(object) if object.total_refs > 0 => object.total_refs += 1,
                _ => panic!(
                    "collector selected {:?} with a zero reference count; \
                     reference accounting is corrupt",
                    okey
                ),
            }
        }
        let mut dead = Vec::new();
        for &okey in &selected {
            if let Some(ekey) = self.objects.get(okey).and_then(|o| o.endpoint()) {
                self.flush_endpoint(ekey, &mut dead);
            }
        }
        // Every victim is pinned and everything else keeps a table
        // reference, so the flushes cannot have finished anyone off.
        debug_assert!(dead.is_empty());
        self.reap(dead);

        // Stage two: drop the holds. With the queues flushed this is the
        // real, final close.
        let mut reclaim = Vec::new();
        for &okey in &selected {
            if let Some(object) = self.objects.get_mut(okey) {
                object.total_refs -= 1;
                if object.total_refs == 0 {
                    reclaim.push(okey);
                }
            }
        }
        let reclaimed = reclaim.len();
        self.reap(reclaim);
        self.counters.objects_reclaimed += reclaimed as u64;
        tracing::debug!("collection pass reclaimed {reclaimed} objects");
    }
}
