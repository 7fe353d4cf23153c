/*
 * packet.rs
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

//! Wire format: plain/secure packets as RFC 5322 messages carrying a
//! base64-encoded protobuf body. Port label rides in the From/To display
//! name, the address in the mailbox part.

use super::endpoint::Endpoint;
use super::error::MailboxError;
use super::wire;
use prost::Message;
use rand::RngCore;
use std::collections::BTreeSet;

/// Body is padded before encryption so ciphertext length leaks only the
/// nearest multiple of this many bytes, never the exact payload size.
/// SPEC note: the size obfuscation target is a 4 KiB multiple; see DESIGN.md
/// for why this differs from the reference implementation's own constant.
pub const OBFUSCATION_BLOCK: usize = 4096;

pub const CONTENT_TYPE_PLAIN: &str = "application/x-mailim-packet";
pub const CONTENT_TYPE_SECURE: &str = "application/x-mailim-packet-secure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId {
    pub seq: i64,
    pub attempt: u32,
}

impl PacketId {
    pub fn new(seq: i64, attempt: u32) -> Self {
        Self { seq, attempt }
    }

    pub fn is_pure_ack(&self) -> bool {
        self.seq == -1
    }
}

#[derive(Debug, Clone)]
pub struct PlainPacket {
    pub from: Endpoint,
    pub to: Endpoint,
    pub seq: i64,
    pub attempt: u32,
    pub acks: BTreeSet<PacketId>,
    pub payload: Vec<u8>,
    pub is_syn: bool,
}

impl PlainPacket {
    pub fn is_pure_ack(&self) -> bool {
        self.seq == -1
    }

    fn to_wire(&self) -> wire::PlainPacket {
        wire::PlainPacket {
            header: Some(wire::PlainHeader {
                is_syn: self.is_syn,
                acks: self.acks.iter().map(ack_to_wire).collect(),
            }),
            body: if self.is_pure_ack() {
                None
            } else {
                Some(wire::PlainBody {
                    seq: self.seq,
                    attempt: self.attempt,
                    payload: self.payload.clone(),
                })
            },
        }
    }

    fn from_wire(
        from: Endpoint,
        to: Endpoint,
        w: wire::PlainPacket,
    ) -> Result<Self, MailboxError> {
        let header = w
            .header
            .ok_or_else(|| MailboxError::InvalidPacket("missing plain header".into()))?;
        let acks = header.acks.iter().map(ack_from_wire).collect();
        match w.body {
            None => Ok(Self {
                from,
                to,
                seq: -1,
                attempt: 0,
                acks,
                payload: Vec::new(),
                is_syn: false,
            }),
            Some(body) => Ok(Self {
                from,
                to,
                seq: body.seq,
                attempt: body.attempt,
                acks,
                payload: body.payload,
                is_syn: header.is_syn,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurePacket {
    pub from: Endpoint,
    pub to: Endpoint,
    pub acks: BTreeSet<PacketId>,
    /// Ratchet sender public key; absent for pure-ACK packets.
    pub dh_pub: Option<Vec<u8>>,
    pub n: u32,
    pub pn: Option<u32>,
    pub signature: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub is_syn: bool,
}

impl SecurePacket {
    pub fn is_pure_ack(&self) -> bool {
        self.ciphertext.is_empty() && self.dh_pub.is_none()
    }

    pub fn is_handshake(&self) -> bool {
        self.ciphertext.is_empty() && self.is_syn && self.dh_pub.is_some()
    }

    fn to_wire(&self) -> wire::SecurePacket {
        wire::SecurePacket {
            header: Some(wire::SecureHeader {
                is_syn: self.is_syn,
                acks: self.acks.iter().map(ack_to_wire).collect(),
                dh_pub: self.dh_pub.clone().unwrap_or_default(),
                n: self.n,
                pn: self.pn.map(|p| p as i64).unwrap_or(-1),
                signature: self.signature.clone(),
            }),
            ciphertext: self.ciphertext.clone(),
        }
    }

    fn from_wire(from: Endpoint, to: Endpoint, w: wire::SecurePacket) -> Result<Self, MailboxError> {
        let header = w
            .header
            .ok_or_else(|| MailboxError::InvalidPacket("missing secure header".into()))?;
        let acks = header.acks.iter().map(ack_from_wire).collect();
        let dh_pub = if header.dh_pub.is_empty() {
            None
        } else {
            Some(header.dh_pub)
        };
        let pn = if header.pn < 0 {
            None
        } else {
            Some(header.pn as u32)
        };
        Ok(Self {
            from,
            to,
            acks,
            dh_pub,
            n: header.n,
            pn,
            signature: header.signature,
            ciphertext: w.ciphertext,
            is_syn: header.is_syn,
        })
    }
}

/// Canonical bytes covered by a secure packet's signature: the header
/// (with `signature` cleared) concatenated with the ciphertext. Signer and
/// verifier both build this the same way, so tampering with any header
/// field in transit -- `acks`, `is_syn`, `dh_pub`, `n`, `pn` -- invalidates
/// the signature along with the ciphertext.
pub fn secure_signable_bytes(
    is_syn: bool,
    acks: &BTreeSet<PacketId>,
    dh_pub: &Option<Vec<u8>>,
    n: u32,
    pn: Option<u32>,
    ciphertext: &[u8],
) -> Vec<u8> {
    let header = wire::SecureHeader {
        is_syn,
        acks: acks.iter().map(ack_to_wire).collect(),
        dh_pub: dh_pub.clone().unwrap_or_default(),
        n,
        pn: pn.map(|p| p as i64).unwrap_or(-1),
        signature: Vec::new(),
    };
    let mut buf = header.encode_to_vec();
    buf.extend_from_slice(ciphertext);
    buf
}

fn ack_to_wire(id: &PacketId) -> wire::AckId {
    wire::AckId {
        seq: id.seq,
        attempt: id.attempt,
    }
}

fn ack_from_wire(w: &wire::AckId) -> PacketId {
    PacketId::new(w.seq, w.attempt)
}

/// Serialize a `(PacketId, payload)` pair into a padded `SecurePacketBody`,
/// as the plaintext handed to the ratchet's `encrypt`. Padding is random
/// bytes appended to bring the serialized message up to the next multiple
/// of [`OBFUSCATION_BLOCK`] bytes.
pub fn encode_secure_body(id: PacketId, payload: &[u8]) -> Vec<u8> {
    let unpadded = wire::SecurePacketBody {
        id: Some(ack_to_wire(&id)),
        payload: payload.to_vec(),
        obfuscation: Vec::new(),
    };
    let base_len = unpadded.encoded_len();
    let target = next_multiple(base_len, OBFUSCATION_BLOCK);
    let mut pad_len = target.saturating_sub(base_len);
    // Growing `obfuscation` grows the varint length prefix too; re-measure
    // once so the final encoded size still lands on the boundary.
    loop {
        let mut padding = vec![0u8; pad_len];
        rand::thread_rng().fill_bytes(&mut padding);
        let body = wire::SecurePacketBody {
            id: Some(ack_to_wire(&id)),
            payload: payload.to_vec(),
            obfuscation: padding,
        };
        let len = body.encoded_len();
        if len <= target {
            pad_len += target - len;
            if len == target {
                return body.encode_to_vec();
            }
            continue;
        }
        // Overshot because of varint growth; shrink and retry.
        pad_len = pad_len.saturating_sub(len - target);
    }
}

/// Inverse of [`encode_secure_body`]: returns `(id, payload)`, discarding
/// the obfuscation padding.
pub fn decode_secure_body(bytes: &[u8]) -> Result<(PacketId, Vec<u8>), MailboxError> {
    let body = wire::SecurePacketBody::decode(bytes)
        .map_err(|e| MailboxError::InvalidPacket(format!("secure body: {e}")))?;
    let id = body
        .id
        .map(|w| ack_from_wire(&w))
        .ok_or_else(|| MailboxError::InvalidPacket("secure body missing id".into()))?;
    Ok((id, body.payload))
}

fn next_multiple(n: usize, block: usize) -> usize {
    if n % block == 0 {
        n + block
    } else {
        ((n / block) + 1) * block
    }
}

// ---------------------------------------------------------------------
// RFC 5322 envelope
// ---------------------------------------------------------------------

fn split_address(addr: &str) -> (String, Option<String>) {
    match addr.split_once('@') {
        Some((local, domain)) => (local.to_string(), Some(domain.to_string())),
        None => (addr.to_string(), None),
    }
}

fn format_mailbox_header(endpoint: &Endpoint) -> String {
    let (local, domain) = split_address(&endpoint.address);
    let mailbox = match domain {
        Some(d) => format!("{}@{}", local, d),
        None => local,
    };
    format!("\"{}\" <{}>", endpoint.port.replace('"', "'"), mailbox)
}

fn parse_mailbox_header(header: &str) -> Result<Endpoint, MailboxError> {
    let header = header.trim();
    let (display, rest) = if let Some(stripped) = header.strip_prefix('"') {
        let end = stripped
            .find('"')
            .ok_or_else(|| MailboxError::InvalidPacket("unterminated display name".into()))?;
        (stripped[..end].to_string(), stripped[end + 1..].trim())
    } else if let Some(idx) = header.find('<') {
        (header[..idx].trim().to_string(), &header[idx..])
    } else {
        (String::new(), header)
    };
    let address = if let (Some(start), Some(end)) = (rest.find('<'), rest.find('>')) {
        rest[start + 1..end].trim().to_string()
    } else {
        rest.trim().to_string()
    };
    if address.is_empty() {
        return Err(MailboxError::InvalidPacket(format!(
            "no address in header: {header}"
        )));
    }
    Ok(Endpoint::new(address, display))
}

fn rfc2822_date_now() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S +0000").to_string()
}

fn extract_header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("\n{}:", name.to_lowercase());
    let lower = headers.to_lowercase();
    let idx = if headers.to_lowercase().starts_with(&format!("{}:", name.to_lowercase())) {
        0
    } else {
        lower.find(&needle)? + 1
    };
    let rest = &headers[idx..];
    let colon = rest.find(':')?;
    let line_end = rest.find('\n').unwrap_or(rest.len());
    Some(rest[colon + 1..line_end].trim())
}

fn base64_wrap(data: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    encoded
        .as_bytes()
        .chunks(76)
        .map(|c| std::str::from_utf8(c).unwrap())
        .collect::<Vec<_>>()
        .join("\r\n")
}

fn build_envelope(
    from: &Endpoint,
    to: &Endpoint,
    content_type: &str,
    x_mailer: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("Date: {}\r\n", rfc2822_date_now()));
    out.push_str(&format!("From: {}\r\n", format_mailbox_header(from)));
    out.push_str(&format!("To: {}\r\n", format_mailbox_header(to)));
    out.push_str(&format!("X-Mailer: {}\r\n", x_mailer));
    out.push_str(&format!("Content-Type: {}\r\n", content_type));
    out.push_str("Content-Transfer-Encoding: base64\r\n");
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str("\r\n");
    out.push_str(&base64_wrap(body));
    out.push_str("\r\n");
    out.into_bytes()
}

struct ParsedEnvelope {
    from: Endpoint,
    to: Endpoint,
    body: Vec<u8>,
}

fn parse_envelope(
    raw: &[u8],
    expected_content_type: &str,
    x_mailer: &str,
) -> Result<ParsedEnvelope, MailboxError> {
    let text = String::from_utf8_lossy(raw);
    let split = text
        .find("\r\n\r\n")
        .map(|i| (i, 4))
        .or_else(|| text.find("\n\n").map(|i| (i, 2)))
        .ok_or_else(|| MailboxError::InvalidPacket("no header/body separator".into()))?;
    let headers = text[..split.0].replace("\r\n", "\n");
    let headers = format!("\n{}", headers);
    let body_text = &text[split.0 + split.1..];

    let mailer = extract_header(&headers, "X-Mailer")
        .ok_or_else(|| MailboxError::InvalidPacket("missing X-Mailer".into()))?;
    if mailer != x_mailer {
        return Err(MailboxError::InvalidPacket(format!(
            "unexpected X-Mailer: {mailer}"
        )));
    }
    let content_type = extract_header(&headers, "Content-Type")
        .ok_or_else(|| MailboxError::InvalidPacket("missing Content-Type".into()))?;
    if !content_type.starts_with(expected_content_type) {
        return Err(MailboxError::InvalidPacket(format!(
            "unexpected Content-Type: {content_type}"
        )));
    }
    let from_header = extract_header(&headers, "From")
        .ok_or_else(|| MailboxError::InvalidPacket("missing From".into()))?;
    let to_header = extract_header(&headers, "To")
        .ok_or_else(|| MailboxError::InvalidPacket("missing To".into()))?;
    let from = parse_mailbox_header(from_header)?;
    let to = parse_mailbox_header(to_header)?;

    let b64: String = body_text.chars().filter(|c| !c.is_whitespace()).collect();
    use base64::Engine;
    let body = base64::engine::general_purpose::STANDARD
        .decode(b64.as_bytes())
        .map_err(|e| MailboxError::InvalidPacket(format!("bad base64 body: {e}")))?;

    Ok(ParsedEnvelope { from, to, body })
}

pub fn encode_plain_message(packet: &PlainPacket, x_mailer: &str) -> Vec<u8> {
    let body = packet.to_wire().encode_to_vec();
    build_envelope(&packet.from, &packet.to, CONTENT_TYPE_PLAIN, x_mailer, &body)
}

pub fn decode_plain_message(raw: &[u8], x_mailer: &str) -> Result<PlainPacket, MailboxError> {
    let parsed = parse_envelope(raw, CONTENT_TYPE_PLAIN, x_mailer)?;
    let wire = wire::PlainPacket::decode(parsed.body.as_slice())
        .map_err(|e| MailboxError::InvalidPacket(format!("plain body: {e}")))?;
    PlainPacket::from_wire(parsed.from, parsed.to, wire)
}

pub fn encode_secure_message(packet: &SecurePacket, x_mailer: &str) -> Vec<u8> {
    let body = packet.to_wire().encode_to_vec();
    build_envelope(&packet.from, &packet.to, CONTENT_TYPE_SECURE, x_mailer, &body)
}

pub fn decode_secure_message(raw: &[u8], x_mailer: &str) -> Result<SecurePacket, MailboxError> {
    let parsed = parse_envelope(raw, CONTENT_TYPE_SECURE, x_mailer)?;
    let wire = wire::SecurePacket::decode(parsed.body.as_slice())
        .map_err(|e| MailboxError::InvalidPacket(format!("secure body: {e}")))?;
    SecurePacket::from_wire(parsed.from, parsed.to, wire)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(a: &str, p: &str) -> Endpoint {
        Endpoint::new(a, p)
    }

    #[test]
    fn plain_round_trip_preserves_fields_and_line_endings() {
        let packet = PlainPacket {
            from: ep("alice@example.com", "9000"),
            to: ep("bob@example.com", "9001"),
            seq: 3,
            attempt: 1,
            acks: [PacketId::new(1, 0), PacketId::new(2, 0)].into_iter().collect(),
            payload: b"hello\r\nworld\n".to_vec(),
            is_syn: false,
        };
        let raw = encode_plain_message(&packet, "mailim/1.0");
        let decoded = decode_plain_message(&raw, "mailim/1.0").unwrap();
        assert_eq!(decoded.from, packet.from);
        assert_eq!(decoded.to, packet.to);
        assert_eq!(decoded.seq, 3);
        assert_eq!(decoded.attempt, 1);
        assert_eq!(decoded.acks, packet.acks);
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn pure_ack_has_no_body() {
        let packet = PlainPacket {
            from: ep("a@x.com", "1"),
            to: ep("b@x.com", "1"),
            seq: -1,
            attempt: 0,
            acks: [PacketId::new(0, 0)].into_iter().collect(),
            payload: Vec::new(),
            is_syn: false,
        };
        let raw = encode_plain_message(&packet, "mailim/1.0");
        let decoded = decode_plain_message(&raw, "mailim/1.0").unwrap();
        assert!(decoded.is_pure_ack());
        assert_eq!(decoded.acks, packet.acks);
    }

    #[test]
    fn wrong_mailer_is_rejected() {
        let packet = PlainPacket {
            from: ep("a@x.com", "1"),
            to: ep("b@x.com", "1"),
            seq: 0,
            attempt: 0,
            acks: BTreeSet::new(),
            payload: b"hi".to_vec(),
            is_syn: true,
        };
        let raw = encode_plain_message(&packet, "other-mailer/2.0");
        assert!(decode_plain_message(&raw, "mailim/1.0").is_err());
    }

    #[test]
    fn secure_body_padding_lands_on_block_boundary() {
        let id = PacketId::new(5, 0);
        let encoded = encode_secure_body(id, b"short payload");
        assert_eq!(encoded.len() % OBFUSCATION_BLOCK, 0);
        let (decoded_id, payload) = decode_secure_body(&encoded).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(payload, b"short payload");
    }

    #[test]
    fn secure_round_trip_preserves_header_fields() {
        let packet = SecurePacket {
            from: ep("a@x.com", "1"),
            to: ep("b@x.com", "1"),
            acks: [PacketId::new(4, 2)].into_iter().collect(),
            dh_pub: Some(vec![1, 2, 3, 4]),
            n: 7,
            pn: Some(3),
            signature: vec![9; 64],
            ciphertext: vec![5; 128],
            is_syn: false,
        };
        let raw = encode_secure_message(&packet, "mailim/1.0");
        let decoded = decode_secure_message(&raw, "mailim/1.0").unwrap();
        assert_eq!(decoded.dh_pub, packet.dh_pub);
        assert_eq!(decoded.n, 7);
        assert_eq!(decoded.pn, Some(3));
        assert_eq!(decoded.signature, packet.signature);
        assert_eq!(decoded.ciphertext, packet.ciphertext);
    }

    #[test]
    fn signable_bytes_change_when_any_header_field_changes() {
        let base = secure_signable_bytes(false, &BTreeSet::new(), &None, 0, None, b"ct");
        assert_ne!(base, secure_signable_bytes(true, &BTreeSet::new(), &None, 0, None, b"ct"));
        assert_ne!(
            base,
            secure_signable_bytes(false, &[PacketId::new(0, 0)].into_iter().collect(), &None, 0, None, b"ct")
        );
        assert_ne!(base, secure_signable_bytes(false, &BTreeSet::new(), &Some(vec![1; 32]), 0, None, b"ct"));
        assert_ne!(base, secure_signable_bytes(false, &BTreeSet::new(), &None, 1, None, b"ct"));
        assert_ne!(base, secure_signable_bytes(false, &BTreeSet::new(), &None, 0, Some(2), b"ct"));
        assert_ne!(base, secure_signable_bytes(false, &BTreeSet::new(), &None, 0, None, b"other"));
    }

    #[test]
    fn pure_ack_and_handshake_are_distinguished() {
        let ack = SecurePacket {
            from: ep("a@x.com", "1"),
            to: ep("b@x.com", "1"),
            acks: [PacketId::new(0, 0)].into_iter().collect(),
            dh_pub: None,
            n: 0,
            pn: None,
            signature: Vec::new(),
            ciphertext: Vec::new(),
            is_syn: false,
        };
        assert!(ack.is_pure_ack());
        assert!(!ack.is_handshake());

        let handshake = SecurePacket {
            dh_pub: Some(vec![1; 32]),
            is_syn: true,
            ..ack.clone()
        };
        assert!(!handshake.is_pure_ack());
        assert!(handshake.is_handshake());
    }
}
