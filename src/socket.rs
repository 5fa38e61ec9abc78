//! # Listen Sockets
//!
//! A listen socket owns the connections accepted through it. Children are
//! keyed by `(remote identity, remote connection ID)` so a retransmitted
//! connect request finds its existing child instead of spawning another.
//!
//! Every message a child receives is also linked into the socket's own
//! receive queue, so the application can drain per-connection or
//! per-socket, whichever fits its loop.
//!
//! Ownership forms a cycle: the socket's child map points at connections,
//! and each child carries a weak back-pointer (the socket handle). Teardown
//! discipline: detaching a child clears the back-pointer *before* the map
//! entry, and destroying a socket destroys every child first.

use std::collections::HashMap;

use crate::connection::ConnectionConfig;
use crate::identity::NetIdentity;
use crate::queue::QueueTag;

pub(crate) struct ListenSocket {
    pub(crate) handle: u32,
    pub(crate) virtual_port: u32,
    /// Template applied to accepted children.
    pub(crate) config: ConnectionConfig,
    /// Secondary receive queue fed by every child.
    pub(crate) recv_queue: QueueTag,
    /// (remote identity, remote connection ID) -> child connection handle.
    children: HashMap<(NetIdentity, u32), u16>,
}

impl ListenSocket {
    pub(crate) fn new(
        handle: u32,
        virtual_port: u32,
        config: ConnectionConfig,
        recv_queue: QueueTag,
    ) -> Self {
        Self {
            handle,
            virtual_port,
            config,
            recv_queue,
            children: HashMap::new(),
        }
    }

    pub(crate) fn find_child(&self, identity: &NetIdentity, remote_cid: u32) -> Option<u16> {
        self.children.get(&(identity.clone(), remote_cid)).copied()
    }

    pub(crate) fn insert_child(&mut self, identity: NetIdentity, remote_cid: u32, child: u16) {
        let prev = self.children.insert((identity, remote_cid), child);
        debug_assert!(prev.is_none(), "duplicate child for the same remote");
    }

    /// Remove the map entry for a child. The caller must already have
    /// cleared the child's back-pointer.
    pub(crate) fn remove_child(&mut self, identity: &NetIdentity, remote_cid: u32) {
        self.children.remove(&(identity.clone(), remote_cid));
    }

    pub(crate) fn child_handles(&self) -> Vec<u16> {
        self.children.values().copied().collect()
    }

    pub(crate) fn child_count(&self) -> usize {
        self.children.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MessageStore;

    #[test]
    fn child_map_keys_on_identity_and_remote_cid() {
        let mut store = MessageStore::new();
        let q = store.create_queue();
        let mut socket = ListenSocket::new(1, 7, ConnectionConfig::default(), q);

        let alice = NetIdentity::Str("alice".into());
        let bob = NetIdentity::Str("bob".into());
        socket.insert_child(alice.clone(), 0x1001, 10);
        socket.insert_child(alice.clone(), 0x2002, 11);
        socket.insert_child(bob.clone(), 0x1001, 12);

        assert_eq!(socket.find_child(&alice, 0x1001), Some(10));
        assert_eq!(socket.find_child(&alice, 0x2002), Some(11));
        assert_eq!(socket.find_child(&bob, 0x1001), Some(12));
        assert_eq!(socket.find_child(&bob, 0x2002), None);
        assert_eq!(socket.child_count(), 3);

        socket.remove_child(&alice, 0x1001);
        assert_eq!(socket.find_child(&alice, 0x1001), None);
        assert_eq!(socket.child_count(), 2);
    }
}
