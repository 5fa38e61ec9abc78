//! # Received-Message Queues
//!
//! Received messages wait in FIFO queues until the application drains them.
//! A message can sit in up to two queues at once: its connection's queue,
//! and (for accepted connections) the parent listen socket's queue. Either
//! drain path must remove the message from both.
//!
//! The classic layout for this is a pair of intrusive doubly-linked lists.
//! Here every live message occupies a slot in a [`MessageStore`] pool, each
//! slot carries one link record per queue membership, and queues are
//! `first`/`last` slot indices. All operations are O(1); draining `n`
//! messages is O(n).
//!
//! ## Invariants
//!
//! - A message is linked into a given queue through exactly one of its two
//!   link records; unlinking one record never disturbs the other.
//! - A message is released back to the pool only after both links are clear.
//! - A destroyed queue is empty.

use std::collections::HashMap;

use crate::identity::NetIdentity;

/// Opaque handle to a live message slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgId(u32);

/// Opaque handle to a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueTag(u32);

/// Which of a message's two link records an operation uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueLink {
    /// Membership in the owning connection's receive queue.
    Connection = 0,
    /// Membership in the parent listen socket's receive queue.
    ListenSocket = 1,
}

/// A fully assembled received message, as handed to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Handle of the connection that received it.
    pub conn: u32,
    /// Authenticated identity of the sender.
    pub sender: NetIdentity,
    /// Message body.
    pub payload: Vec<u8>,
    /// Per-connection message number, starting at 1.
    pub msg_num: i64,
    /// Receive timestamp, microseconds.
    pub time_received: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct LinkRecord {
    queue: Option<QueueTag>,
    prev: Option<MsgId>,
    next: Option<MsgId>,
}

struct Slot {
    msg: ReceivedMessage,
    links: [LinkRecord; 2],
}

#[derive(Clone, Copy, Debug, Default)]
struct QueueState {
    first: Option<MsgId>,
    last: Option<MsgId>,
    len: usize,
}

/// Pool of live messages plus every queue threading through them.
///
/// Owned by the scheduler task; nothing here is thread-safe by itself.
pub struct MessageStore {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    queues: HashMap<QueueTag, QueueState>,
    next_tag: u32,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            queues: HashMap::new(),
            next_tag: 1,
        }
    }

    pub fn create_queue(&mut self) -> QueueTag {
        let tag = QueueTag(self.next_tag);
        self.next_tag += 1;
        self.queues.insert(tag, QueueState::default());
        tag
    }

    /// Drop an empty queue. Purge it first; destroying a non-empty queue is
    /// a bookkeeping bug upstream.
    pub fn destroy_queue(&mut self, tag: QueueTag) {
        let state = self.queues.remove(&tag);
        debug_assert!(
            state.map_or(true, |s| s.first.is_none()),
            "destroyed queue still holds messages"
        );
    }

    /// Move a message into the pool. It belongs to no queue yet.
    pub fn insert(&mut self, msg: ReceivedMessage) -> MsgId {
        let slot = Slot {
            msg,
            links: [LinkRecord::default(); 2],
        };
        match self.free.pop() {
            Some(idx) => {
                debug_assert!(self.slots[idx as usize].is_none());
                self.slots[idx as usize] = Some(slot);
                MsgId(idx)
            }
            None => {
                self.slots.push(Some(slot));
                MsgId((self.slots.len() - 1) as u32)
            }
        }
    }

    fn slot(&self, id: MsgId) -> &Slot {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("stale message id")
    }

    fn slot_mut(&mut self, id: MsgId) -> &mut Slot {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale message id")
    }

    /// Append to a queue's tail through the given link record.
    pub fn link_tail(&mut self, id: MsgId, link: QueueLink, tag: QueueTag) {
        let li = link as usize;
        debug_assert!(
            self.slot(id).links[li].queue.is_none(),
            "message already linked through this record"
        );
        let state = *self.queues.get(&tag).expect("unknown queue");

        if let Some(old_last) = state.last {
            self.slot_mut(old_last).links[li].next = Some(id);
        }
        {
            let rec = &mut self.slot_mut(id).links[li];
            rec.prev = state.last;
            rec.next = None;
            rec.queue = Some(tag);
        }
        let state = self.queues.get_mut(&tag).expect("unknown queue");
        if state.first.is_none() {
            state.first = Some(id);
        }
        state.last = Some(id);
        state.len += 1;
    }

    /// Detach one link record. The other record, if linked, is untouched.
    pub fn unlink(&mut self, id: MsgId, link: QueueLink) {
        let li = link as usize;
        let rec = self.slot(id).links[li];
        let Some(tag) = rec.queue else {
            return;
        };

        match rec.prev {
            Some(prev) => self.slot_mut(prev).links[li].next = rec.next,
            None => self.queues.get_mut(&tag).expect("unknown queue").first = rec.next,
        }
        match rec.next {
            Some(next) => self.slot_mut(next).links[li].prev = rec.prev,
            None => self.queues.get_mut(&tag).expect("unknown queue").last = rec.prev,
        }
        self.queues.get_mut(&tag).expect("unknown queue").len -= 1;
        self.slot_mut(id).links[li] = LinkRecord::default();
    }

    /// Detach both link records and return the message to the caller,
    /// freeing the slot.
    pub fn release(&mut self, id: MsgId) -> ReceivedMessage {
        self.unlink(id, QueueLink::Connection);
        self.unlink(id, QueueLink::ListenSocket);
        let slot = self.slots[id.0 as usize]
            .take()
            .expect("stale message id");
        self.free.push(id.0);
        slot.msg
    }

    /// Unlink and discard every message in the queue.
    pub fn purge(&mut self, tag: QueueTag, link: QueueLink) {
        while let Some(head) = self.queues.get(&tag).and_then(|q| q.first) {
            debug_assert_eq!(self.slot(head).links[link as usize].queue, Some(tag));
            let _ = self.release(head);
        }
    }

    /// Drain up to `max` messages from the head, in order.
    pub fn remove_up_to(&mut self, tag: QueueTag, max: usize) -> Vec<ReceivedMessage> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(head) = self.queues.get(&tag).and_then(|q| q.first) else {
                break;
            };
            out.push(self.release(head));
        }
        out
    }

    pub fn queue_len(&self, tag: QueueTag) -> usize {
        self.queues.get(&tag).map_or(0, |q| q.len)
    }

    pub fn queue_is_empty(&self, tag: QueueTag) -> bool {
        self.queue_len(tag) == 0
    }

    /// Which queue a link record currently threads into, if any.
    #[cfg(test)]
    pub(crate) fn linked_queue(&self, id: MsgId, link: QueueLink) -> Option<QueueTag> {
        self.slot(id).links[link as usize].queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: i64) -> ReceivedMessage {
        ReceivedMessage {
            conn: 7,
            sender: NetIdentity::LocalHost,
            payload: format!("m{n}").into_bytes(),
            msg_num: n,
            time_received: 0,
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut store = MessageStore::new();
        let q = store.create_queue();
        for n in 1..=5 {
            let id = store.insert(msg(n));
            store.link_tail(id, QueueLink::Connection, q);
        }
        let drained = store.remove_up_to(q, 10);
        let nums: Vec<i64> = drained.iter().map(|m| m.msg_num).collect();
        assert_eq!(nums, vec![1, 2, 3, 4, 5]);
        assert!(store.queue_is_empty(q));
    }

    #[test]
    fn remove_up_to_respects_the_cap() {
        let mut store = MessageStore::new();
        let q = store.create_queue();
        for n in 1..=5 {
            let id = store.insert(msg(n));
            store.link_tail(id, QueueLink::Connection, q);
        }
        assert_eq!(store.remove_up_to(q, 2).len(), 2);
        assert_eq!(store.queue_len(q), 3);
    }

    #[test]
    fn dual_membership_unlinks_independently() {
        let mut store = MessageStore::new();
        let conn_q = store.create_queue();
        let sock_q = store.create_queue();

        let id = store.insert(msg(1));
        store.link_tail(id, QueueLink::Connection, conn_q);
        store.link_tail(id, QueueLink::ListenSocket, sock_q);

        // Unlinking from the connection queue must leave the listen-socket
        // membership intact.
        store.unlink(id, QueueLink::Connection);
        assert_eq!(store.linked_queue(id, QueueLink::Connection), None);
        assert_eq!(store.linked_queue(id, QueueLink::ListenSocket), Some(sock_q));
        assert!(store.queue_is_empty(conn_q));
        assert_eq!(store.queue_len(sock_q), 1);

        store.unlink(id, QueueLink::ListenSocket);
        let m = store.release(id);
        assert_eq!(m.msg_num, 1);
    }

    #[test]
    fn draining_one_queue_removes_from_both() {
        let mut store = MessageStore::new();
        let conn_q = store.create_queue();
        let sock_q = store.create_queue();

        for n in 1..=3 {
            let id = store.insert(msg(n));
            store.link_tail(id, QueueLink::Connection, conn_q);
            store.link_tail(id, QueueLink::ListenSocket, sock_q);
        }

        // Drain via the listen socket; the connection queue must shrink too.
        let drained = store.remove_up_to(sock_q, 2);
        assert_eq!(drained.len(), 2);
        assert_eq!(store.queue_len(conn_q), 1);
        assert_eq!(store.queue_len(sock_q), 1);
    }

    #[test]
    fn unlink_middle_of_queue_keeps_neighbors_connected() {
        let mut store = MessageStore::new();
        let q = store.create_queue();
        let ids: Vec<MsgId> = (1..=3)
            .map(|n| {
                let id = store.insert(msg(n));
                store.link_tail(id, QueueLink::Connection, q);
                id
            })
            .collect();

        store.unlink(ids[1], QueueLink::Connection);
        let _ = store.release(ids[1]);

        let remaining: Vec<i64> = store
            .remove_up_to(q, 10)
            .iter()
            .map(|m| m.msg_num)
            .collect();
        assert_eq!(remaining, vec![1, 3]);
    }

    #[test]
    fn purge_empties_shared_queues_without_double_free() {
        let mut store = MessageStore::new();
        let conn_q = store.create_queue();
        let sock_q = store.create_queue();
        for n in 1..=4 {
            let id = store.insert(msg(n));
            store.link_tail(id, QueueLink::Connection, conn_q);
            store.link_tail(id, QueueLink::ListenSocket, sock_q);
        }

        store.purge(conn_q, QueueLink::Connection);
        assert!(store.queue_is_empty(conn_q));
        assert!(
            store.queue_is_empty(sock_q),
            "purged messages must leave every queue they were in"
        );
        store.destroy_queue(conn_q);
        store.destroy_queue(sock_q);
    }

    #[test]
    fn slots_are_reused_after_release() {
        let mut store = MessageStore::new();
        let q = store.create_queue();
        let a = store.insert(msg(1));
        store.link_tail(a, QueueLink::Connection, q);
        store.unlink(a, QueueLink::Connection);
        let _ = store.release(a);

        let b = store.insert(msg(2));
        assert_eq!(a, b, "freed slot should be recycled");
    }
}
