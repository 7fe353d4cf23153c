/*
 * listener.rs
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

//! The inbound listener thread: IDLE-wait, pull UNSEEN messages, parse and
//! route each to either an already-connected socket or a listening
//! socket's accept queue, then mark whatever was successfully routed
//! \Seen. A signature failure on a secure packet is logged and the
//! message is left UNSEEN, on the chance a future resync lets it decrypt.

use super::context::{DispatchResult, QueuedPacket, SocketContext, SocketState};
use super::endpoint::Endpoint;
use super::packet::{self, PacketId};
use super::socket::SocketRegistry;
use super::transport::InboundSource;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A parsed inbound packet, decoupled from whether it came over a plain or
/// secure wire encoding.
struct Parsed {
    from: Endpoint,
    to: Endpoint,
    seq: i64,
    attempt: u32,
    acks: BTreeSet<PacketId>,
    is_syn: bool,
    secure: bool,
    /// Plaintext payload for a plain packet; ciphertext for a secure one
    /// (decrypted later, once a session exists).
    payload: Vec<u8>,
    dh_pub: Option<Vec<u8>>,
    n: u32,
    pn: Option<u32>,
    signature: Vec<u8>,
}

fn try_parse(raw: &[u8], x_mailer: &str) -> Option<Parsed> {
    if let Ok(p) = packet::decode_plain_message(raw, x_mailer) {
        return Some(Parsed {
            from: p.from,
            to: p.to,
            seq: p.seq,
            attempt: p.attempt,
            acks: p.acks,
            is_syn: p.is_syn,
            secure: false,
            payload: p.payload,
            dh_pub: None,
            n: 0,
            pn: None,
            signature: Vec::new(),
        });
    }
    if let Ok(p) = packet::decode_secure_message(raw, x_mailer) {
        return Some(Parsed {
            from: p.from,
            to: p.to,
            seq: -1, // resolved only after decryption for secure packets
            attempt: 0,
            acks: p.acks,
            is_syn: p.is_syn,
            secure: true,
            payload: p.ciphertext,
            dh_pub: p.dh_pub,
            n: p.n,
            pn: p.pn,
            signature: p.signature,
        });
    }
    None
}

/// Route one parsed packet to an already-`Connected` socket. Returns
/// `true` if it was consumed (including a signature failure that was
/// logged but whose message should still count as "handled" for the
/// purposes of routing -- SEEN marking is decided by the caller).
fn dispatch_to_connected(registry: &Mutex<SocketRegistry>, parsed: &Parsed) -> Option<bool> {
    let pair = (parsed.to.clone(), parsed.from.clone());
    let context = {
        let registry = registry.lock().unwrap();
        let sid = registry.connected_socket_for(&pair)?;
        registry.get(sid)?
    };
    let mut state = context.state.lock().unwrap();
    let SocketState::Connected(conn) = &mut *state else {
        return None;
    };
    if conn.is_secure() != parsed.secure {
        return None;
    }

    let (seq, attempt, payload) = if parsed.secure {
        let secure = conn.secure.as_mut().unwrap();
        let peer_key = match secure.ratchet.peer_sign_key() {
            Some(k) => k,
            None => return Some(false),
        };
        let signable = packet::secure_signable_bytes(
            parsed.is_syn,
            &parsed.acks,
            &parsed.dh_pub,
            parsed.n,
            parsed.pn,
            &parsed.payload,
        );
        if !super::ratchet::RatchetEngine::verify(peer_key, &signable, &parsed.signature) {
            tracing::warn!(from = %parsed.from, to = %parsed.to, "dropping secure packet with invalid signature");
            return Some(false);
        }
        let plaintext = match secure.ratchet.decrypt(&parsed.payload) {
            Ok(pt) => pt,
            Err(e) => {
                tracing::warn!(error = %e, "ratchet decrypt failed, leaving message unseen");
                return Some(false);
            }
        };
        let (id, body) = match packet::decode_secure_body(&plaintext) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "malformed secure packet body");
                return Some(false);
            }
        };
        (id.seq, id.attempt, body)
    } else {
        (parsed.seq, parsed.attempt, parsed.payload.clone())
    };

    let result: DispatchResult = conn.dispatch(seq, attempt, &parsed.acks, payload);
    drop(state);
    if result.became_readable || result.handshake_completed {
        context.cv.notify_all();
    }
    Some(true)
}

/// Route one parsed SYN/data packet to a `Listening` socket's accept
/// queue, creating a fresh pending `Connected` context on the first SYN
/// for a given remote peer.
fn dispatch_to_listening(registry: &Mutex<SocketRegistry>, parsed: &Parsed) -> bool {
    let (listener_sid, context) = {
        let registry = registry.lock().unwrap();
        let Some(sid) = registry.listener_for(&parsed.to) else {
            return false;
        };
        let Some(context) = registry.get(sid) else {
            return false;
        };
        (sid, context)
    };
    let mut state = context.state.lock().unwrap();
    let SocketState::Listening(listening) = &mut *state else {
        return false;
    };

    let pair = (parsed.to.clone(), parsed.from.clone());
    let queued = QueuedPacket {
        seq: parsed.seq,
        attempt: parsed.attempt,
        acks: parsed.acks.clone(),
        payload: parsed.payload.clone(),
        is_syn: parsed.is_syn,
        dh_pub: parsed.dh_pub.clone(),
        n: parsed.n,
        pn: parsed.pn,
        signature: parsed.signature.clone(),
    };

    if let Some(&conn_sid) = listening.connected_sockets.get(&pair) {
        if let Some(conn) = listening.sockets.get_mut(&conn_sid) {
            if conn.is_secure() != parsed.secure {
                return false;
            }
            conn.pending_packets.push(queued);
            return true;
        }
        return false;
    }

    if !parsed.is_syn {
        return false;
    }

    use super::context::ConnectedState;
    let mut conn = ConnectedState::new(parsed.to.clone(), parsed.from.clone());
    if parsed.secure {
        conn.secure = Some(super::context::SecureState {
            ratchet: super::ratchet::RatchetEngine::new(),
            handshaked: false,
        });
    }
    conn.pending_packets.push(queued);

    let conn_sid = {
        let mut registry = registry.lock().unwrap();
        registry.allocate()
    };
    listening.connected_sockets.insert(pair, conn_sid);
    listening.sockets.insert(conn_sid, conn);
    listening.queue.push_back(conn_sid);
    let _ = listener_sid;
    context.cv.notify_all();
    true
}

/// Run one IDLE/poll cycle: wait for new mail, fetch and route everything
/// UNSEEN, mark whatever was successfully routed \Seen.
fn poll_once(
    source: &mut dyn InboundSource,
    registry: &Mutex<SocketRegistry>,
    x_mailer: &str,
    idle_timeout: Duration,
) -> std::io::Result<()> {
    if !source.wait_for_new_mail(idle_timeout)? {
        return Ok(());
    }
    let messages = source.fetch_unseen()?;
    let mut seen = Vec::new();
    for (uid, raw) in messages {
        let Some(parsed) = try_parse(&raw, x_mailer) else {
            continue;
        };
        let routed = dispatch_to_connected(registry, &parsed)
            .unwrap_or_else(|| dispatch_to_listening(registry, &parsed));
        if routed {
            seen.push(uid);
        }
    }
    if !seen.is_empty() {
        source.mark_seen(&seen)?;
    }
    Ok(())
}

/// Spawn the listener thread. Runs until `source.wait_for_new_mail`
/// returns an error (the caller closes the mailbox by dropping the
/// source's underlying connection, which surfaces as an I/O error here).
pub fn spawn(
    mut source: Box<dyn InboundSource>,
    registry: Arc<Mutex<SocketRegistry>>,
    x_mailer: String,
    idle_timeout: Duration,
    stop: Arc<std::sync::atomic::AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(std::sync::atomic::Ordering::Relaxed) {
            if let Err(e) = poll_once(source.as_mut(), &registry, &x_mailer, idle_timeout) {
                tracing::warn!(error = %e, "listener poll failed, retrying");
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::context::ConnectedState;
    use crate::mailbox::packet::{encode_plain_message, PlainPacket};
    use crate::mailbox::transport::in_memory::{InMemoryBus, InMemorySink, InMemorySource};
    use crate::mailbox::transport::OutboundSink;

    #[test]
    fn syn_packet_queues_a_new_pending_connection() {
        let bus = InMemoryBus::new();
        let sink = InMemorySink::new(bus.clone());
        let mut source = InMemorySource::new(bus);

        let from = Endpoint::new("a@x.com", "1");
        let to = Endpoint::new("b@x.com", "2");
        let packet = PlainPacket {
            from: from.clone(),
            to: to.clone(),
            seq: 0,
            attempt: 0,
            acks: BTreeSet::new(),
            payload: Vec::new(),
            is_syn: true,
        };
        let raw = encode_plain_message(&packet, "mailim/1.0");
        sink.send(&from.address, &to.address, &raw).unwrap();

        let registry = Arc::new(Mutex::new(SocketRegistry::new()));
        let listener_sid = {
            let mut reg = registry.lock().unwrap();
            let id = reg.allocate();
            reg.register_listening(id, Endpoint::new("b@x.com", ""));
            reg.insert(
                id,
                Arc::new(SocketContext::new(SocketState::Listening(
                    super::super::context::ListeningState::new(Endpoint::new("b@x.com", "")),
                ))),
            );
            id
        };

        poll_once(&mut source, &registry, "mailim/1.0", Duration::from_millis(50)).unwrap();

        let reg = registry.lock().unwrap();
        let context = reg.get(listener_sid).unwrap();
        let state = context.state.lock().unwrap();
        let SocketState::Listening(listening) = &*state else {
            panic!("expected listening state")
        };
        assert_eq!(listening.queue.len(), 1);
        let _ = ConnectedState::new(from, to); // keep the import exercised
    }
}
