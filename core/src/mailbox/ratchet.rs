/*
 * ratchet.rs
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

//! Double Ratchet + signature adapter for secure sockets.
//!
//! Backed by `vodozemac`'s Olm account/session (the same ratchet engine the
//! Matrix crypto machine already carries). The signature contract ("XEdDSA":
//! sign with the identity key that also drives the DH ratchet) is satisfied
//! by the account's native Ed25519 identity key, generated alongside its
//! Curve25519 identity key for every `Account`.
//!
//! `SecurePacket.ciphertext` carries the whole serialized `OlmMessage`
//! (vodozemac already encodes the ratchet header — sender key, counters —
//! inside that message), prefixed with one byte distinguishing a pre-key
//! message (first message of a session) from a normal one. `dh_pub` is only
//! used for the initial handshake bundle, not per-message ratchet stepping.

use super::error::MailboxError;
use serde::{Deserialize, Serialize};
use vodozemac::olm::{Account, AccountPickle, OlmMessage, Session, SessionConfig, SessionPickle};
use vodozemac::Curve25519PublicKey;

const OLM_MSG_PREKEY: u8 = 0;
const OLM_MSG_NORMAL: u8 = 1;

/// Public material one side publishes so the other can start a session:
/// a long-term identity key (Curve25519, also the DH-ratchet root) and a
/// single one-time prekey, plus the Ed25519 identity key used for XEdDSA
/// signatures. Persisted via the key store's `local_keys`/`remote_keys`.
#[derive(Debug, Clone)]
pub struct HandshakeBundle {
    pub identity_key: [u8; 32],
    pub one_time_key: [u8; 32],
    pub sign_key: [u8; 32],
}

impl HandshakeBundle {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(&self.identity_key);
        out.extend_from_slice(&self.one_time_key);
        out.extend_from_slice(&self.sign_key);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MailboxError> {
        if bytes.len() != 96 {
            return Err(MailboxError::InvalidPacket(
                "malformed handshake bundle".into(),
            ));
        }
        let mut identity_key = [0u8; 32];
        let mut one_time_key = [0u8; 32];
        let mut sign_key = [0u8; 32];
        identity_key.copy_from_slice(&bytes[0..32]);
        one_time_key.copy_from_slice(&bytes[32..64]);
        sign_key.copy_from_slice(&bytes[64..96]);
        Ok(Self {
            identity_key,
            one_time_key,
            sign_key,
        })
    }
}

/// One side of a secure socket's ratchet state. `Created` until either
/// `start_outbound` (connector) or `accept_inbound` (listener, on the first
/// received pre-key message) establishes a live session.
pub struct RatchetEngine {
    account: Account,
    session: Option<Session>,
    peer_sign_key: Option<[u8; 32]>,
}

impl RatchetEngine {
    pub fn new() -> Self {
        Self {
            account: Account::new(),
            session: None,
            peer_sign_key: None,
        }
    }

    /// Publish our identity + a fresh one-time key + our signing key, so the
    /// peer (or the key store, ahead of a future connect) can start a
    /// session to us.
    pub fn handshake_bundle(&mut self) -> HandshakeBundle {
        self.account.generate_one_time_keys(1);
        let otk = *self
            .account
            .one_time_keys()
            .values()
            .next()
            .expect("just generated one one-time key");
        HandshakeBundle {
            identity_key: self.account.curve25519_key().to_bytes(),
            one_time_key: otk.to_bytes(),
            sign_key: self.account.ed25519_key().to_bytes(),
        }
    }

    /// Connector side: start an outbound session to a peer's published
    /// bundle. Must be called before the first `encrypt`.
    pub fn start_outbound(&mut self, peer: &HandshakeBundle) -> Result<(), MailboxError> {
        let identity = Curve25519PublicKey::from_bytes(peer.identity_key);
        let otk = Curve25519PublicKey::from_bytes(peer.one_time_key);
        let session = self
            .account
            .create_outbound_session(SessionConfig::version_2(), identity, otk);
        self.session = Some(session);
        self.peer_sign_key = Some(peer.sign_key);
        Ok(())
    }

    /// Listener side: the first inbound ciphertext establishes the session.
    /// Returns the decrypted handshake plaintext (empty for a mailim
    /// handshake packet, whose body is never serialized).
    pub fn accept_inbound(
        &mut self,
        peer_identity: [u8; 32],
        peer_sign_key: [u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, MailboxError> {
        let (msg_type, body) = split_tagged_message(ciphertext)?;
        if msg_type != OLM_MSG_PREKEY {
            return Err(MailboxError::InvalidPacket(
                "first secure message was not a pre-key message".into(),
            ));
        }
        let olm_message = OlmMessage::from_parts(0, &body)
            .map_err(|e| MailboxError::InvalidPacket(format!("malformed pre-key message: {e}")))?;
        let pre_key = match &olm_message {
            OlmMessage::PreKey(pk) => pk,
            OlmMessage::Normal(_) => {
                return Err(MailboxError::InvalidPacket(
                    "expected pre-key message".into(),
                ))
            }
        };
        let identity = Curve25519PublicKey::from_bytes(peer_identity);
        let result = self
            .account
            .create_inbound_session(identity, pre_key)
            .map_err(|e| MailboxError::InvalidPacket(format!("inbound session: {e}")))?;
        self.session = Some(result.session);
        self.peer_sign_key = Some(peer_sign_key);
        Ok(result.plaintext)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Encrypt plaintext to the wire's `ciphertext` field (pre-key-tagged
    /// while the session is still on its first outbound message).
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let session = self.session.as_mut().ok_or(MailboxError::NotHandshaked)?;
        let message = session.encrypt(plaintext);
        Ok(tag_message(&message))
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let session = self.session.as_mut().ok_or(MailboxError::NotHandshaked)?;
        let (msg_type, body) = split_tagged_message(ciphertext)?;
        let olm_message = OlmMessage::from_parts(msg_type as usize, &body)
            .map_err(|e| MailboxError::InvalidPacket(format!("malformed ratchet message: {e}")))?;
        session
            .decrypt(&olm_message)
            .map_err(|e| MailboxError::InvalidPacket(format!("ratchet decrypt failed: {e}")))
    }

    /// XEdDSA-shaped signature: our account's Ed25519 identity key signs an
    /// arbitrary byte string (the canonical signed-part serialization).
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(data);
        self.account.sign(&text).to_base64().into_bytes()
    }

    pub fn verify(peer_sign_key: [u8; 32], data: &[u8], signature: &[u8]) -> bool {
        let key = match vodozemac::Ed25519PublicKey::from_slice(&peer_sign_key) {
            Ok(k) => k,
            Err(_) => return false,
        };
        let sig_str = match std::str::from_utf8(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let sig = match vodozemac::Ed25519Signature::from_base64(sig_str) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let text = String::from_utf8_lossy(data);
        key.verify(&text, &sig).is_ok()
    }

    pub fn identity_key(&self) -> [u8; 32] {
        self.account.curve25519_key().to_bytes()
    }

    pub fn sign_key(&self) -> [u8; 32] {
        self.account.ed25519_key().to_bytes()
    }

    pub fn peer_sign_key(&self) -> Option<[u8; 32]> {
        self.peer_sign_key
    }

    /// Export account + session state for a socket dump, encrypted at rest
    /// with the key store's own pickle key (vodozemac's own persistence
    /// mechanism, the same one `matrix-sdk-crypto` relies on).
    pub fn export(&self, pickle_key: &[u8; 32]) -> Result<RatchetSnapshot, MailboxError> {
        let session = self.session.as_ref().ok_or(MailboxError::NotHandshaked)?;
        Ok(RatchetSnapshot {
            account: self.account.pickle().encrypt(pickle_key),
            session: session.pickle().encrypt(pickle_key),
            peer_sign_key: self.peer_sign_key,
        })
    }

    pub fn import(snapshot: &RatchetSnapshot, pickle_key: &[u8; 32]) -> Result<Self, MailboxError> {
        let account_pickle = AccountPickle::from_encrypted(&snapshot.account, pickle_key)
            .map_err(|e| MailboxError::InvalidDump(format!("ratchet account pickle: {e}")))?;
        let session_pickle = SessionPickle::from_encrypted(&snapshot.session, pickle_key)
            .map_err(|e| MailboxError::InvalidDump(format!("ratchet session pickle: {e}")))?;
        Ok(Self {
            account: Account::from_pickle(account_pickle),
            session: Some(Session::from_pickle(session_pickle)),
            peer_sign_key: snapshot.peer_sign_key,
        })
    }
}

/// Encrypted-at-rest serialization of a live ratchet session, suitable for
/// embedding in a socket dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetSnapshot {
    account: String,
    session: String,
    peer_sign_key: Option<[u8; 32]>,
}

impl Default for RatchetEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn tag_message(message: &OlmMessage) -> Vec<u8> {
    let (tag, body) = match message {
        OlmMessage::PreKey(pk) => (OLM_MSG_PREKEY, pk.to_base64()),
        OlmMessage::Normal(nm) => (OLM_MSG_NORMAL, nm.to_base64()),
    };
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(body.as_bytes());
    out
}

fn split_tagged_message(bytes: &[u8]) -> Result<(u8, String), MailboxError> {
    let (tag, rest) = bytes
        .split_first()
        .ok_or_else(|| MailboxError::InvalidPacket("empty ratchet ciphertext".into()))?;
    let body = std::str::from_utf8(rest)
        .map_err(|e| MailboxError::InvalidPacket(format!("ratchet message not utf8: {e}")))?
        .to_string();
    Ok((*tag, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_then_bidirectional_messages() {
        let mut alice = RatchetEngine::new();
        let mut bob = RatchetEngine::new();
        let bob_bundle = bob.handshake_bundle();

        alice.start_outbound(&bob_bundle).unwrap();
        let ct = alice.encrypt(b"hello bob").unwrap();

        let plaintext = bob
            .accept_inbound(alice.identity_key(), alice.sign_key(), &ct)
            .unwrap();
        assert_eq!(plaintext, b"hello bob");

        let ct2 = bob.encrypt(b"hi alice").unwrap();
        let got = alice.decrypt(&ct2).unwrap();
        assert_eq!(got, b"hi alice");
    }

    #[test]
    fn export_then_import_preserves_the_session() {
        let mut alice = RatchetEngine::new();
        let mut bob = RatchetEngine::new();
        let bob_bundle = bob.handshake_bundle();
        alice.start_outbound(&bob_bundle).unwrap();
        let ct = alice.encrypt(b"before dump").unwrap();
        bob.accept_inbound(alice.identity_key(), alice.sign_key(), &ct)
            .unwrap();

        let pickle_key = [7u8; 32];
        let snapshot = alice.export(&pickle_key).unwrap();
        let mut restored = RatchetEngine::import(&snapshot, &pickle_key).unwrap();

        let ct2 = restored.encrypt(b"after restore").unwrap();
        let got = bob.decrypt(&ct2).unwrap();
        assert_eq!(got, b"after restore");
    }

    #[test]
    fn signatures_verify_with_the_signer_identity_key() {
        let alice = RatchetEngine::new();
        let sig = alice.sign(b"signed part");
        assert!(RatchetEngine::verify(alice.sign_key(), b"signed part", &sig));
        assert!(!RatchetEngine::verify(alice.sign_key(), b"tampered", &sig));
    }
}
