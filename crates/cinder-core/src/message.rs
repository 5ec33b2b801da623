//! The message model: arena-allocated request/response units with
//! fragment bookkeeping.
//!
//! Messages live in a slab-style arena owned by their connection task
//! and are addressed by [`MsgId`] (slot index + generation). Queues hold
//! ids, never references, and per-queue membership is tracked on the
//! message itself so a message can be in at most one queue per kind;
//! double insertion and double removal are structurally impossible.
//!
//! Request/response pairing and fragment-owner links are id-based
//! relation lookups: releasing one side clears the back-link on the
//! other, so no link ever dangles.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use cinder_protocol::{Command, KeyType};

use crate::error::RelayError;

/// Arena address of a message: slot index plus generation. A stale id
/// (slot since reused) fails lookup instead of aliasing a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId {
    index: u32,
    gen: u32,
}

/// Whether a message is a request or its paired response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Request,
    Response,
}

/// The queues a message can be a member of, one membership per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Client-side inbound tracking queue (fragment siblings live here).
    ClientIn = 0,
    /// Client-side pending-reply queue.
    ClientOut = 1,
    /// Backend-side pending-send queue.
    BackendIn = 2,
}

/// One logical request or response unit.
#[derive(Debug)]
pub struct Message {
    /// Monotonically increasing id, used for backend correlation.
    pub id: u64,
    pub role: Role,
    pub command: Command,
    /// Sequence number from the unit header.
    pub seq: u8,
    pub payload: Bytes,
    /// Extracted key positions (byte range into `payload`) and types.
    pub keys: Vec<(Range<usize>, KeyType)>,
    /// Backend index selected by routing, once known.
    pub backend: Option<u16>,
    /// Fragment group id; 0 means unfragmented.
    pub frag_id: u64,
    /// Owner of the fragment group this message belongs to. The owner
    /// points at itself.
    pub frag_owner: Option<MsgId>,
    /// Total fragments in the group (tracked on the owner).
    pub nfrag: u32,
    /// Fragments completed so far (tracked on the owner, never exceeds
    /// `nfrag`).
    pub nfrag_done: u32,
    /// The paired request/response, if any.
    pub peer: Option<MsgId>,
    /// Set at most once; never cleared.
    pub done: bool,
    pub error: bool,
    pub err: Option<RelayError>,
    /// Cached "all siblings done" result.
    frag_done: bool,
    /// Cached "some sibling errored" result.
    frag_error: bool,
    in_queue: [bool; 3],
    /// End-to-end deadline for this request.
    pub deadline: Instant,
}

impl Message {
    /// Marks the message done. Monotone: there is no way to clear it.
    pub fn mark_done(&mut self) {
        self.done = true;
    }

    /// Marks the message done with an error.
    pub fn mark_error(&mut self, err: RelayError) {
        self.done = true;
        self.error = true;
        self.err = Some(err);
    }

    /// Whether the message is in the given queue kind.
    pub fn queued_in(&self, kind: QueueKind) -> bool {
        self.in_queue[kind as usize]
    }
}

struct Slot {
    gen: u32,
    msg: Option<Message>,
}

/// Owning arena for one connection's messages.
pub struct MessageArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Shared per-worker id source; ids stay unique across connections
    /// because backend correlation maps are keyed by them.
    unit_ids: Arc<AtomicU64>,
    next_frag_id: u64,
    live: usize,
}

impl MessageArena {
    pub fn new(unit_ids: Arc<AtomicU64>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            unit_ids,
            next_frag_id: 1,
            live: 0,
        }
    }

    /// Number of live messages.
    pub fn live(&self) -> usize {
        self.live
    }

    fn alloc(&mut self, msg: Message) -> MsgId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.msg.is_none());
            slot.msg = Some(msg);
            return MsgId {
                index,
                gen: slot.gen,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { gen: 0, msg: Some(msg) });
        MsgId { index, gen: 0 }
    }

    /// Allocates a new request message.
    pub fn insert_request(
        &mut self,
        command: Command,
        seq: u8,
        payload: Bytes,
        deadline: Instant,
    ) -> MsgId {
        let id = self.unit_ids.fetch_add(1, Ordering::Relaxed);
        self.alloc(Message {
            id,
            role: Role::Request,
            command,
            seq,
            payload,
            keys: Vec::new(),
            backend: None,
            frag_id: 0,
            frag_owner: None,
            nfrag: 0,
            nfrag_done: 0,
            peer: None,
            done: false,
            error: false,
            err: None,
            frag_done: false,
            frag_error: false,
            in_queue: [false; 3],
            deadline,
        })
    }

    /// Allocates a response and pairs it with `request` in both
    /// directions.
    pub fn insert_response(&mut self, request: MsgId, seq: u8, payload: Bytes) -> Option<MsgId> {
        let (command, deadline) = {
            let req = self.get(request)?;
            debug_assert_eq!(req.role, Role::Request);
            (req.command, req.deadline)
        };
        let id = self.unit_ids.fetch_add(1, Ordering::Relaxed);
        let rsp = self.alloc(Message {
            id,
            role: Role::Response,
            command,
            seq,
            payload,
            keys: Vec::new(),
            backend: None,
            frag_id: 0,
            frag_owner: None,
            nfrag: 0,
            nfrag_done: 0,
            peer: Some(request),
            done: false,
            error: false,
            err: None,
            frag_done: false,
            frag_error: false,
            in_queue: [false; 3],
            deadline,
        });
        self.get_mut(request).expect("request exists").peer = Some(rsp);
        Some(rsp)
    }

    pub fn get(&self, id: MsgId) -> Option<&Message> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.msg.as_ref()
    }

    pub fn get_mut(&mut self, id: MsgId) -> Option<&mut Message> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.msg.as_mut()
    }

    /// Releases a message, clearing the peer back-link so nothing
    /// dangles. The caller must have dequeued it from every queue.
    pub fn release(&mut self, id: MsgId) -> Option<Message> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let msg = slot.msg.take()?;
        debug_assert!(msg.in_queue.iter().all(|&q| !q), "released while queued");
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;

        if let Some(peer) = msg.peer {
            if let Some(p) = self.get_mut(peer) {
                p.peer = None;
            }
        }
        Some(msg)
    }

    /// Inserts `id` at the tail of `queue` for the given kind.
    ///
    /// Returns `false` (and does nothing) if the message is already a
    /// member of a queue of this kind.
    pub fn enqueue(&mut self, queue: &mut VecDeque<MsgId>, kind: QueueKind, id: MsgId) -> bool {
        let Some(msg) = self.get_mut(id) else {
            return false;
        };
        if msg.in_queue[kind as usize] {
            return false;
        }
        msg.in_queue[kind as usize] = true;
        queue.push_back(id);
        true
    }

    /// Removes `id` from `queue` for the given kind.
    ///
    /// Returns `false` if the message was not a member.
    pub fn dequeue(&mut self, queue: &mut VecDeque<MsgId>, kind: QueueKind, id: MsgId) -> bool {
        let Some(msg) = self.get_mut(id) else {
            return false;
        };
        if !msg.in_queue[kind as usize] {
            return false;
        }
        msg.in_queue[kind as usize] = false;
        if let Some(pos) = queue.iter().position(|&m| m == id) {
            queue.remove(pos);
        }
        true
    }

    /// Splits `owner` into a fragment group of `total` child requests.
    ///
    /// The owner joins its own group (it carries the counters and the
    /// shared fragment id); children link back to it. Payloads and key
    /// positions of the children are the caller's to fill in.
    pub fn make_fragments(&mut self, owner: MsgId, total: u32) -> Vec<MsgId> {
        let frag_id = self.next_frag_id;
        self.next_frag_id += 1;

        let (command, deadline) = {
            let o = self.get_mut(owner).expect("fragment owner exists");
            o.frag_id = frag_id;
            o.frag_owner = Some(owner);
            o.nfrag = total;
            o.nfrag_done = 0;
            (o.command, o.deadline)
        };

        (0..total)
            .map(|_| {
                let child = self.insert_request(command, 0, Bytes::new(), deadline);
                let c = self.get_mut(child).expect("child exists");
                c.frag_id = frag_id;
                c.frag_owner = Some(owner);
                child
            })
            .collect()
    }

    /// Records one fragment of `id`'s group as completed on the owner.
    /// The completed counter saturates at the group total.
    pub fn fragment_completed(&mut self, id: MsgId) {
        let Some(owner) = self.get(id).and_then(|m| m.frag_owner) else {
            return;
        };
        if let Some(o) = self.get_mut(owner) {
            if o.nfrag_done < o.nfrag {
                o.nfrag_done += 1;
            }
        }
    }

    /// Whether the request (and, if fragmented, its whole sibling group)
    /// is done.
    ///
    /// The first time the group completes, the scan walks siblings in
    /// both directions from `id` within the client inbound queue and
    /// caches the result on every sibling, making repeat checks O(1).
    /// Once true, the cached result never reverts.
    pub fn request_done(&mut self, inbound: &VecDeque<MsgId>, id: MsgId) -> bool {
        let Some(msg) = self.get(id) else {
            return false;
        };
        if !msg.done {
            return false;
        }
        let frag_id = msg.frag_id;
        if frag_id == 0 {
            return true;
        }
        if msg.frag_done {
            return true;
        }

        // fast gate: the owner's counters say the group can't be done yet
        if let Some(owner) = msg.frag_owner {
            if let Some(o) = self.get(owner) {
                if o.nfrag_done < o.nfrag {
                    return false;
                }
            }
        }

        let siblings = self.sibling_run(inbound, id, frag_id);
        for &sib in &siblings {
            match self.get(sib) {
                Some(m) if m.done => {}
                _ => return false,
            }
        }

        for sib in siblings {
            if let Some(m) = self.get_mut(sib) {
                m.frag_done = true;
            }
        }
        true
    }

    /// Whether the request is in error, directly or through any
    /// fragment sibling. Caches the positive result on every sibling.
    ///
    /// Only meaningful once [`Self::request_done`] is true.
    pub fn request_error(&mut self, inbound: &VecDeque<MsgId>, id: MsgId) -> bool {
        let Some(msg) = self.get(id) else {
            return false;
        };
        if msg.error {
            return true;
        }
        let frag_id = msg.frag_id;
        if frag_id == 0 {
            return false;
        }
        if msg.frag_error {
            return true;
        }

        let siblings = self.sibling_run(inbound, id, frag_id);
        let any_error = siblings
            .iter()
            .any(|&sib| self.get(sib).is_some_and(|m| m.error));
        if !any_error {
            return false;
        }

        for sib in siblings {
            if let Some(m) = self.get_mut(sib) {
                m.frag_error = true;
            }
        }
        true
    }

    /// Collects the contiguous run of fragment siblings around `id` in
    /// the inbound queue (both directions, same fragment id), including
    /// `id` itself.
    fn sibling_run(&self, inbound: &VecDeque<MsgId>, id: MsgId, frag_id: u64) -> Vec<MsgId> {
        let Some(pos) = inbound.iter().position(|&m| m == id) else {
            return vec![id];
        };
        let mut run = vec![id];
        for i in (0..pos).rev() {
            match self.get(inbound[i]) {
                Some(m) if m.frag_id == frag_id => run.push(inbound[i]),
                _ => break,
            }
        }
        for i in pos + 1..inbound.len() {
            match self.get(inbound[i]) {
                Some(m) if m.frag_id == frag_id => run.push(inbound[i]),
                _ => break,
            }
        }
        run
    }

    /// Force-completes every live message with `err`. Used on fatal
    /// connection teardown so nothing is left dangling in a queue.
    /// Returns how many messages were still pending.
    pub fn force_complete(&mut self, err: RelayError) -> usize {
        let mut pending = 0;
        for slot in &mut self.slots {
            if let Some(msg) = slot.msg.as_mut() {
                if !msg.done {
                    msg.mark_error(err);
                    pending += 1;
                }
                msg.in_queue = [false; 3];
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> MessageArena {
        MessageArena::new(Arc::new(AtomicU64::new(1)))
    }

    fn deadline() -> Instant {
        Instant::now() + std::time::Duration::from_secs(5)
    }

    fn new_request(a: &mut MessageArena) -> MsgId {
        a.insert_request(Command::Query, 0, Bytes::from_static(b"\x03x"), deadline())
    }

    #[test]
    fn ids_are_monotonic() {
        let mut a = arena();
        let m1 = new_request(&mut a);
        let m2 = new_request(&mut a);
        assert!(a.get(m2).unwrap().id > a.get(m1).unwrap().id);
    }

    #[test]
    fn stale_id_fails_lookup_after_reuse() {
        let mut a = arena();
        let m1 = new_request(&mut a);
        a.release(m1).unwrap();
        let m2 = new_request(&mut a);
        // slot reused, generation bumped
        assert!(a.get(m1).is_none());
        assert!(a.get(m2).is_some());
    }

    #[test]
    fn response_pairing_is_bidirectional_until_release() {
        let mut a = arena();
        let req = new_request(&mut a);
        let rsp = a.insert_response(req, 1, Bytes::from_static(b"ok")).unwrap();

        assert_eq!(a.get(req).unwrap().peer, Some(rsp));
        assert_eq!(a.get(rsp).unwrap().peer, Some(req));

        a.release(rsp).unwrap();
        assert_eq!(a.get(req).unwrap().peer, None);
    }

    #[test]
    fn queue_membership_prevents_double_insertion() {
        let mut a = arena();
        let m = new_request(&mut a);
        let mut q = VecDeque::new();

        assert!(a.enqueue(&mut q, QueueKind::ClientIn, m));
        assert!(!a.enqueue(&mut q, QueueKind::ClientIn, m));
        assert_eq!(q.len(), 1);

        // other kinds are independent memberships
        let mut out = VecDeque::new();
        assert!(a.enqueue(&mut out, QueueKind::ClientOut, m));
        let mut srv = VecDeque::new();
        assert!(a.enqueue(&mut srv, QueueKind::BackendIn, m));
        assert!(a.dequeue(&mut srv, QueueKind::BackendIn, m));

        assert!(a.dequeue(&mut q, QueueKind::ClientIn, m));
        assert!(!a.dequeue(&mut q, QueueKind::ClientIn, m));
        assert!(q.is_empty());
    }

    #[test]
    fn unfragmented_done_is_just_the_done_flag() {
        let mut a = arena();
        let m = new_request(&mut a);
        let q = VecDeque::new();

        assert!(!a.request_done(&q, m));
        a.get_mut(m).unwrap().mark_done();
        assert!(a.request_done(&q, m));
    }

    #[test]
    fn fragmented_done_requires_every_sibling() {
        let mut a = arena();
        let owner = new_request(&mut a);
        let children = a.make_fragments(owner, 2);
        let mut q = VecDeque::new();
        a.enqueue(&mut q, QueueKind::ClientIn, owner);
        for &c in &children {
            a.enqueue(&mut q, QueueKind::ClientIn, c);
        }

        a.get_mut(owner).unwrap().mark_done();
        a.get_mut(children[0]).unwrap().mark_done();
        a.fragment_completed(children[0]);
        assert!(!a.request_done(&q, children[0]));

        a.get_mut(children[1]).unwrap().mark_done();
        a.fragment_completed(children[1]);
        assert!(a.request_done(&q, children[1]));

        // cached on every sibling: repeat checks short-circuit
        assert!(a.get(owner).unwrap().frag_done);
        assert!(a.get(children[0]).unwrap().frag_done);
        assert!(a.request_done(&q, owner));
    }

    #[test]
    fn done_cache_is_monotone() {
        let mut a = arena();
        let owner = new_request(&mut a);
        let children = a.make_fragments(owner, 1);
        let mut q = VecDeque::new();
        a.enqueue(&mut q, QueueKind::ClientIn, owner);
        a.enqueue(&mut q, QueueKind::ClientIn, children[0]);

        a.get_mut(owner).unwrap().mark_done();
        a.get_mut(children[0]).unwrap().mark_done();
        a.fragment_completed(children[0]);
        assert!(a.request_done(&q, owner));
        // once true it stays true, without rescanning
        assert!(a.request_done(&q, owner));
        assert!(a.request_done(&q, children[0]));
    }

    #[test]
    fn completed_counter_never_exceeds_total() {
        let mut a = arena();
        let owner = new_request(&mut a);
        let children = a.make_fragments(owner, 2);
        for _ in 0..5 {
            a.fragment_completed(children[0]);
        }
        let o = a.get(owner).unwrap();
        assert_eq!(o.nfrag_done, o.nfrag);
    }

    #[test]
    fn sibling_error_propagates_and_caches() {
        let mut a = arena();
        let owner = new_request(&mut a);
        let children = a.make_fragments(owner, 2);
        let mut q = VecDeque::new();
        a.enqueue(&mut q, QueueKind::ClientIn, owner);
        for &c in &children {
            a.enqueue(&mut q, QueueKind::ClientIn, c);
        }

        a.get_mut(owner).unwrap().mark_done();
        a.get_mut(children[0]).unwrap().mark_done();
        a.get_mut(children[1]).unwrap().mark_error(RelayError::Timeout);

        assert!(a.request_error(&q, children[0]));
        // cached on the scanned siblings
        assert!(a.get(owner).unwrap().frag_error);
    }

    #[test]
    fn force_complete_counts_pending_only() {
        let mut a = arena();
        let m1 = new_request(&mut a);
        let _m2 = new_request(&mut a);
        a.get_mut(m1).unwrap().mark_done();

        let pending = a.force_complete(RelayError::UpstreamUnavailable);
        assert_eq!(pending, 1);
        assert!(a.get(m1).unwrap().done);
    }
}
