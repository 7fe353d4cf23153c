/*
 * socket.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Tagliacarte, a cross-platform email client.
 *
 * Tagliacarte is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Tagliacarte is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Tagliacarte.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The socket registry: id allocation and the two lookup indices
//! (`(local, remote) -> connected socket` and `local -> listening socket`)
//! that `mailbox_impl.rs` consults on every inbound packet. Registry
//! mutation is always taken before a given socket's own context lock.

use super::context::SocketContext;
use super::endpoint::Endpoint;
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque handle returned to callers of the public socket API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub u64);

/// What a listener decides to do with a queued inbound connection, handed
/// to `Mailbox::accept`.
pub enum AcceptDecision {
    /// Reject the connection; it is dropped and never acked.
    Reject,
    /// Accept as a new plain connection.
    Accept,
    /// Accept as a new secure connection, providing this side's signing
    /// key and the peer's published verification key.
    AcceptSecure {
        own_sign_key: [u8; 32],
        peer_sign_pub: [u8; 32],
    },
    /// Splice in a previously dumped socket (see `Mailbox::socket_dump`)
    /// instead of starting fresh -- used to resume a connection across a
    /// process restart. The pickle key must match the one the dump was
    /// made with.
    Restore { dump: Vec<u8>, pickle_key: [u8; 32] },
}

/// Mailbox-wide bookkeeping: every socket's id and context, plus the two
/// indices used to route inbound packets. Always locked before an
/// individual socket's own `SocketContext`.
pub struct SocketRegistry {
    next_id: u64,
    contexts: HashMap<u64, Arc<SocketContext>>,
    listening: HashMap<u64, Endpoint>,
    connected: HashMap<(Endpoint, Endpoint), u64>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            contexts: HashMap::new(),
            listening: HashMap::new(),
            connected: HashMap::new(),
        }
    }

    pub fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, id: u64, context: Arc<SocketContext>) {
        self.contexts.insert(id, context);
    }

    pub fn get(&self, id: u64) -> Option<Arc<SocketContext>> {
        self.contexts.get(&id).cloned()
    }

    pub fn remove(&mut self, id: u64) -> Option<Arc<SocketContext>> {
        self.listening.remove(&id);
        self.connected.retain(|_, sid| *sid != id);
        self.contexts.remove(&id)
    }

    pub fn register_listening(&mut self, id: u64, endpoint: Endpoint) {
        self.listening.insert(id, endpoint);
    }

    pub fn listening_endpoint_in_use(&self, endpoint: &Endpoint) -> bool {
        self.listening.values().any(|e| e.intersects(endpoint))
    }

    pub fn listener_for(&self, to: &Endpoint) -> Option<u64> {
        self.listening
            .iter()
            .find(|(_, endpoint)| endpoint.matches(to))
            .map(|(sid, _)| *sid)
    }

    pub fn register_connected(&mut self, pair: (Endpoint, Endpoint), id: u64) {
        self.connected.insert(pair, id);
    }

    pub fn unregister_connected(&mut self, pair: &(Endpoint, Endpoint)) {
        self.connected.remove(pair);
    }

    pub fn connected_endpoint_in_use(&self, pair: &(Endpoint, Endpoint)) -> bool {
        self.connected.contains_key(pair)
    }

    pub fn connected_socket_for(&self, pair: &(Endpoint, Endpoint)) -> Option<u64> {
        self.connected.get(pair).copied()
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(a: &str, p: &str) -> Endpoint {
        Endpoint::new(a, p)
    }

    #[test]
    fn allocate_ids_are_unique_and_increasing() {
        let mut reg = SocketRegistry::new();
        let a = reg.allocate();
        let b = reg.allocate();
        assert!(b > a);
    }

    #[test]
    fn listening_endpoint_conflict_detection() {
        let mut reg = SocketRegistry::new();
        reg.register_listening(1, ep("@x.com", ""));
        assert!(reg.listening_endpoint_in_use(&ep("a@x.com", "9000")));
        assert!(!reg.listening_endpoint_in_use(&ep("a@y.com", "9000")));
    }

    #[test]
    fn connected_lookup_round_trips() {
        let mut reg = SocketRegistry::new();
        let pair = (ep("a@x.com", "1"), ep("b@x.com", "1"));
        reg.register_connected(pair.clone(), 5);
        assert_eq!(reg.connected_socket_for(&pair), Some(5));
        reg.unregister_connected(&pair);
        assert_eq!(reg.connected_socket_for(&pair), None);
    }
}
