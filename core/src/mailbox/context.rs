/*
 * context.rs
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

//! The per-socket state machine: `Created` -> `Listening`/`Connected` ->
//! closed. All mutation here is pure bookkeeping (sequence numbers, ack
//! sets, receive buffers); transport I/O and timer scheduling live in
//! `transport.rs`/`scheduler.rs` and are driven by `mailbox_impl.rs`.
//!
//! Every `Connected`/`Listening` socket is wrapped in its own
//! `Mutex`+`Condvar` pair (`SocketContext`) so that callers blocked in
//! `recv`/`accept` don't hold the mailbox-wide registry lock. Lock order is
//! always registry (in `socket.rs`) before an individual context's mutex.

use super::endpoint::Endpoint;
use super::packet::PacketId;
use super::ratchet::{RatchetEngine, RatchetSnapshot};
use super::MailboxError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

/// A cached outbound packet. Retransmission re-derives a `Plain` packet's
/// envelope (attempt number, piggy-backed acks change every attempt) but
/// replays a `Secure` packet's ciphertext verbatim -- the Double Ratchet
/// message key was already consumed when it was first encrypted. The
/// signature is never cached here: it must cover the piggy-backed `acks`
/// of the specific transmission attempt, so it is (re)computed in
/// `build_transmission` immediately before the packet is serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutgoingPacket {
    Plain {
        payload: Vec<u8>,
        is_syn: bool,
    },
    Secure {
        ciphertext: Vec<u8>,
        is_syn: bool,
        dh_pub: Option<Vec<u8>>,
        n: u32,
        pn: Option<u32>,
    },
}

/// An inbound packet queued on a listening socket's pending connection,
/// before `accept()` has decided whether (and how) to admit it.
/// `payload` carries the plaintext for a plain-socket queue entry, or the
/// still-encrypted ciphertext for a secure one (it can't be decrypted
/// until `accept()` supplies the session key material). `n`/`pn`/`dh_pub`/
/// `signature` are meaningless for a plain-socket entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedPacket {
    pub seq: i64,
    pub attempt: u32,
    pub acks: BTreeSet<PacketId>,
    pub payload: Vec<u8>,
    pub is_syn: bool,
    pub dh_pub: Option<Vec<u8>>,
    pub n: u32,
    pub pn: Option<u32>,
    pub signature: Vec<u8>,
}

/// Outcome of feeding an inbound packet into a `Connected` socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchResult {
    pub became_readable: bool,
    pub handshake_completed: bool,
}

/// Secure-socket-only ratchet state, separated from `ConnectedState` so a
/// plain socket carries none of it.
pub struct SecureState {
    pub ratchet: RatchetEngine,
    pub handshaked: bool,
}

/// Serializable form of `SecureState`, used by socket dump/restore. The
/// ratchet itself is pickled with the key store's pickle key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureStateDump {
    pub snapshot: RatchetSnapshot,
    pub handshaked: bool,
}

/// The live state of a connected (possibly still mid-handshake) socket.
pub struct ConnectedState {
    pub local_endpoint: Endpoint,
    pub remote_endpoint: Endpoint,
    pub next_seq: i64,
    pub recv_cursor: (i64, usize),
    pub pending_local: BTreeMap<i64, OutgoingPacket>,
    pub pending_remote: BTreeMap<i64, Vec<u8>>,
    pub sent_acks: HashMap<(i64, u32), BTreeSet<PacketId>>,
    pub attempts: HashMap<i64, u32>,
    pub to_ack: BTreeSet<PacketId>,
    /// The sequence number that still carries the SYN flag, if the initial
    /// handshake/connect packet hasn't been acked yet.
    pub syn_seq: Option<i64>,
    pub ack_scheduled: bool,
    /// Packets queued on a listener-side pending connection before
    /// `accept()` ran; drained into `process_inbound` once admitted.
    pub pending_packets: Vec<QueuedPacket>,
    pub closed: bool,
    pub repolls: HashSet<u64>,
    pub xepolls: HashSet<u64>,
    pub secure: Option<SecureState>,
}

/// Serializable subset of `ConnectedState` (mirrors the Python
/// implementation's `__getstate__`/`__setstate__` pair): volatile fields
/// like `ack_scheduled` and `pending_packets` are not persisted and are
/// reset to their initial value on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedDump {
    pub local_endpoint: Endpoint,
    pub remote_endpoint: Endpoint,
    pub next_seq: i64,
    pub recv_cursor: (i64, usize),
    pub pending_local: BTreeMap<i64, OutgoingPacket>,
    pub pending_remote: BTreeMap<i64, Vec<u8>>,
    pub sent_acks: Vec<((i64, u32), BTreeSet<PacketId>)>,
    pub attempts: Vec<(i64, u32)>,
    pub to_ack: BTreeSet<PacketId>,
    pub syn_seq: Option<i64>,
    pub secure: Option<SecureStateDump>,
}

impl ConnectedState {
    pub fn new(local_endpoint: Endpoint, remote_endpoint: Endpoint) -> Self {
        Self {
            local_endpoint,
            remote_endpoint,
            next_seq: 0,
            recv_cursor: (0, 0),
            pending_local: BTreeMap::new(),
            pending_remote: BTreeMap::new(),
            sent_acks: HashMap::new(),
            attempts: HashMap::new(),
            to_ack: BTreeSet::new(),
            syn_seq: None,
            ack_scheduled: false,
            pending_packets: Vec::new(),
            closed: false,
            repolls: HashSet::new(),
            xepolls: HashSet::new(),
            secure: None,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.secure.is_some()
    }

    pub fn is_handshaked(&self) -> bool {
        self.secure.as_ref().map(|s| s.handshaked).unwrap_or(true)
    }

    /// Queue a new outbound payload; returns the seq it was assigned so the
    /// caller can hand it to the transport/scheduler. Piggy-backs the
    /// current ack set, as every freshly queued packet does.
    pub fn prepare_send(&mut self, payload: Vec<u8>) -> Result<i64, MailboxError> {
        if self.closed {
            return Err(MailboxError::Closed);
        }
        if let Some(secure) = &self.secure {
            if !secure.handshaked {
                return Err(MailboxError::NotHandshaked);
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let is_syn = Some(seq) == self.syn_seq;
        self.pending_local.insert(seq, OutgoingPacket::Plain { payload, is_syn });
        Ok(seq)
    }

    /// Record that this socket has been asked to close (shutdown). Returns
    /// the set of seqs that were still outstanding (for the caller to
    /// cancel any further retransmission bookkeeping).
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Remove an acked seq from the outstanding set and release any acks it
    /// was piggy-backing, mirroring the reference's ack garbage collection.
    pub fn process_ack(&mut self, seq: i64, attempt: u32) {
        let Some(&total_attempts) = self.attempts.get(&seq) else {
            return; // duplicate ack
        };
        self.pending_local.remove(&seq);
        if let Some(carried) = self.sent_acks.remove(&(seq, attempt)) {
            for a in carried {
                self.to_ack.remove(&a);
            }
        }
        for i in 0..=total_attempts {
            self.sent_acks.remove(&(seq, i));
        }
        self.attempts.remove(&seq);
    }

    /// Feed one inbound data/ack packet into an already-admitted connected
    /// socket.
    pub fn dispatch(&mut self, seq: i64, attempt: u32, acks: &BTreeSet<PacketId>, payload: Vec<u8>) -> DispatchResult {
        for ack in acks {
            self.process_ack(ack.seq, ack.attempt);
            if self.syn_seq == Some(ack.seq) {
                self.syn_seq = None;
            }
        }

        let mut became_readable = false;
        let mut handshake_completed = false;

        if seq != -1 && seq >= self.recv_cursor.0 {
            self.pending_remote.insert(seq, payload);
            self.to_ack.insert(PacketId { seq, attempt });

            let (mut cursor_seq, _) = self.recv_cursor;
            while self.pending_remote.get(&cursor_seq).map(|p| p.is_empty()).unwrap_or(false) {
                self.pending_remote.remove(&cursor_seq);
                cursor_seq += 1;
            }
            self.recv_cursor = (cursor_seq, if cursor_seq == self.recv_cursor.0 { self.recv_cursor.1 } else { 0 });

            if self
                .pending_remote
                .get(&self.recv_cursor.0)
                .map(|p| !p.is_empty())
                .unwrap_or(false)
            {
                became_readable = true;
            } else if self.is_secure() && seq == 0 {
                // Handshake response: the SYN packet itself carries no
                // payload once decrypted, so it never becomes readable.
                self.attempts.remove(&0);
                self.pending_local.remove(&0);
                if let Some(secure) = &mut self.secure {
                    secure.handshaked = true;
                }
                handshake_completed = true;
            }
        }

        DispatchResult {
            became_readable,
            handshake_completed,
        }
    }

    /// Consume up to `max_size` bytes from the front of the receive queue.
    pub fn recv(&mut self, max_size: usize) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let mut remaining = max_size;
        let (mut seq, mut off) = self.recv_cursor;

        while remaining > 0 {
            let Some(payload) = self.pending_remote.get(&seq) else {
                break;
            };
            let end = (off + remaining).min(payload.len());
            out.extend_from_slice(&payload[off..end]);
            remaining -= end - off;
            off = end;
            if off >= payload.len() {
                self.pending_remote.remove(&seq);
                seq += 1;
                off = 0;
            } else {
                break;
            }
        }
        while self.pending_remote.get(&seq).map(|p| p.is_empty()).unwrap_or(false) {
            self.pending_remote.remove(&seq);
            seq += 1;
        }
        self.recv_cursor = (seq, off);
        let still_readable = self.pending_remote.get(&seq).map(|p| !p.is_empty()).unwrap_or(false);
        (out, still_readable)
    }

    pub fn to_dump(&self, pickle_key: &[u8; 32]) -> Result<ConnectedDump, MailboxError> {
        let secure = match &self.secure {
            Some(s) => Some(SecureStateDump {
                snapshot: s.ratchet.export(pickle_key)?,
                handshaked: s.handshaked,
            }),
            None => None,
        };
        Ok(ConnectedDump {
            local_endpoint: self.local_endpoint.clone(),
            remote_endpoint: self.remote_endpoint.clone(),
            next_seq: self.next_seq,
            recv_cursor: self.recv_cursor,
            pending_local: self.pending_local.clone(),
            pending_remote: self.pending_remote.clone(),
            sent_acks: self.sent_acks.clone().into_iter().collect(),
            attempts: self.attempts.clone().into_iter().collect(),
            to_ack: self.to_ack.clone(),
            syn_seq: self.syn_seq,
            secure,
        })
    }

    pub fn from_dump(dump: ConnectedDump, pickle_key: &[u8; 32]) -> Result<Self, MailboxError> {
        let secure = match dump.secure {
            Some(s) => Some(SecureState {
                ratchet: RatchetEngine::import(&s.snapshot, pickle_key)?,
                handshaked: s.handshaked,
            }),
            None => None,
        };
        let syn_seq = if dump.pending_local.is_empty() {
            Some(dump.next_seq)
        } else {
            dump.pending_local.keys().next().copied()
        };
        Ok(Self {
            local_endpoint: dump.local_endpoint,
            remote_endpoint: dump.remote_endpoint,
            next_seq: dump.next_seq,
            recv_cursor: dump.recv_cursor,
            pending_local: dump.pending_local,
            pending_remote: dump.pending_remote,
            sent_acks: dump.sent_acks.into_iter().collect(),
            attempts: dump.attempts.into_iter().collect(),
            to_ack: dump.to_ack,
            syn_seq: syn_seq.or(dump.syn_seq),
            ack_scheduled: false,
            pending_packets: Vec::new(),
            closed: false,
            repolls: HashSet::new(),
            xepolls: HashSet::new(),
            secure,
        })
    }
}

/// A listening socket: queues fully-formed `Connected` contexts until
/// `accept()` drains them.
pub struct ListeningState {
    pub local_endpoint: Endpoint,
    pub queue: VecDeque<u64>,
    pub connected_sockets: HashMap<(Endpoint, Endpoint), u64>,
    pub sockets: HashMap<u64, ConnectedState>,
    pub closed: bool,
    pub repolls: HashSet<u64>,
    pub xepolls: HashSet<u64>,
}

impl ListeningState {
    pub fn new(local_endpoint: Endpoint) -> Self {
        Self {
            local_endpoint,
            queue: VecDeque::new(),
            connected_sockets: HashMap::new(),
            sockets: HashMap::new(),
            closed: false,
            repolls: HashSet::new(),
            xepolls: HashSet::new(),
        }
    }
}

/// What state a socket is currently in. `Created` sockets haven't committed
/// to a role yet (`connect`/`listen` picks one); everything afterwards is
/// either `Listening` or `Connected`.
pub enum SocketState {
    Created,
    Listening(ListeningState),
    Connected(ConnectedState),
}

/// A socket's mutex-protected state plus its condition variable, matching
/// the reference implementation's `Waitable`/`Epollable` mixins collapsed
/// into one type since Rust has no multiple inheritance.
pub struct SocketContext {
    pub state: Mutex<SocketState>,
    pub cv: Condvar,
}

impl SocketContext {
    pub fn created() -> Self {
        Self {
            state: Mutex::new(SocketState::Created),
            cv: Condvar::new(),
        }
    }

    pub fn new(state: SocketState) -> Self {
        Self {
            state: Mutex::new(state),
            cv: Condvar::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(a: &str, p: &str) -> Endpoint {
        Endpoint::new(a, p)
    }

    #[test]
    fn pure_ack_of_syn_clears_syn_seq() {
        let mut conn = ConnectedState::new(ep("a@x", "1"), ep("b@x", "1"));
        conn.syn_seq = Some(0);
        let seq = conn.prepare_send(Vec::new()).unwrap();
        assert_eq!(seq, 0);
        conn.attempts.insert(0, 0);
        conn.sent_acks.insert((0, 0), BTreeSet::new());

        let acks: BTreeSet<PacketId> = [PacketId { seq: 0, attempt: 0 }].into_iter().collect();
        conn.dispatch(-1, 0, &acks, Vec::new());
        assert_eq!(conn.syn_seq, None);
    }

    #[test]
    fn send_then_ack_clears_pending_local() {
        let mut conn = ConnectedState::new(ep("a@x", "1"), ep("b@x", "1"));
        conn.syn_seq = Some(0);
        let seq = conn.prepare_send(b"hello".to_vec()).unwrap();
        assert_eq!(seq, 0);
        conn.attempts.insert(0, 0);
        conn.sent_acks.insert((0, 0), BTreeSet::new());

        conn.process_ack(0, 0);
        assert!(conn.pending_local.is_empty());
        assert!(conn.attempts.is_empty());
    }

    #[test]
    fn dispatch_makes_in_order_payload_readable() {
        let mut conn = ConnectedState::new(ep("a@x", "1"), ep("b@x", "1"));
        let result = conn.dispatch(0, 0, &BTreeSet::new(), b"payload".to_vec());
        assert!(result.became_readable);
        let (data, more) = conn.recv(100);
        assert_eq!(data, b"payload");
        assert!(!more);
    }

    #[test]
    fn dispatch_skips_empty_pure_ack_segments() {
        let mut conn = ConnectedState::new(ep("a@x", "1"), ep("b@x", "1"));
        conn.dispatch(0, 0, &BTreeSet::new(), Vec::new());
        let result = conn.dispatch(1, 0, &BTreeSet::new(), b"data".to_vec());
        assert!(result.became_readable);
        let (data, _) = conn.recv(100);
        assert_eq!(data, b"data");
    }

    #[test]
    fn recv_splits_across_multiple_calls() {
        let mut conn = ConnectedState::new(ep("a@x", "1"), ep("b@x", "1"));
        conn.dispatch(0, 0, &BTreeSet::new(), b"abcdef".to_vec());
        let (first, more1) = conn.recv(3);
        assert_eq!(first, b"abc");
        assert!(more1);
        let (second, more2) = conn.recv(10);
        assert_eq!(second, b"def");
        assert!(!more2);
    }

    #[test]
    fn send_before_handshake_on_secure_socket_is_rejected() {
        let mut conn = ConnectedState::new(ep("a@x", "1"), ep("b@x", "1"));
        conn.secure = Some(SecureState {
            ratchet: RatchetEngine::new(),
            handshaked: false,
        });
        assert!(matches!(
            conn.prepare_send(b"x".to_vec()),
            Err(MailboxError::NotHandshaked)
        ));
    }
}
