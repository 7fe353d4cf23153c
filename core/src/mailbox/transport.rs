/*
 * transport.rs
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

//! Transport adapters: the mailbox's two seams to the outside world. The
//! scheduler/listener threads are plain synchronous code (see
//! `scheduler.rs`/`listener.rs`); each adapter owns a small current-thread
//! `tokio::runtime::Runtime` and bridges into it with `block_on`, since the
//! SMTP/IMAP clients underneath are async.

use crate::protocol::imap::client::{connect_and_authenticate, AuthenticatedSession};
use crate::protocol::smtp::client::send_message_async;
use crate::sasl::SaslMechanism;
use crate::store::{Address, Envelope};
use std::collections::HashMap;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Credentials + connection parameters for one mail account.
#[derive(Debug, Clone)]
pub struct MailCredential {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_implicit_tls: bool,
    pub use_starttls: bool,
}

/// Sends a raw RFC 5322 message (already built by `packet.rs`) to a single
/// recipient address, SMTP-envelope-only -- `from`/`to` come from the
/// packet's own From/To headers, this just needs the bare addresses for
/// `MAIL FROM`/`RCPT TO`.
pub trait OutboundSink: Send {
    fn send(&self, from_address: &str, to_address: &str, message: &[u8]) -> std::io::Result<()>;
}

/// Pulls unseen messages from the inbox and marks the ones the caller
/// consumed. One polling cycle corresponds to one IMAP IDLE wake.
pub trait InboundSource: Send {
    /// Block until new mail might be present, or `timeout` elapses. Returns
    /// `true` if the wake was a real EXISTS/RECENT notification.
    fn wait_for_new_mail(&mut self, timeout: Duration) -> std::io::Result<bool>;

    /// Fetch every UNSEEN message body, keyed by UID.
    fn fetch_unseen(&mut self) -> std::io::Result<HashMap<u32, Vec<u8>>>;

    /// Mark the given UIDs \Seen.
    fn mark_seen(&mut self, uids: &[u32]) -> std::io::Result<()>;
}

fn to_io_err<E: std::fmt::Display>(e: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

fn address(addr: &str) -> Address {
    match addr.split_once('@') {
        Some((local, domain)) => Address {
            display_name: None,
            local_part: local.to_string(),
            domain: Some(domain.to_string()),
        },
        None => Address {
            display_name: None,
            local_part: addr.to_string(),
            domain: None,
        },
    }
}

/// Sends outbound packets over SMTP, one connection per send (matches the
/// reference's one-shot `send_message_async` call pattern rather than
/// holding a long-lived SMTP session, since outbound traffic is bursty and
/// retransmissions are already rare after the first attempt).
pub struct SmtpOutboundSink {
    credential: MailCredential,
    runtime: Runtime,
}

impl SmtpOutboundSink {
    pub fn new(credential: MailCredential) -> std::io::Result<Self> {
        let runtime = Runtime::new()?;
        Ok(Self { credential, runtime })
    }
}

impl OutboundSink for SmtpOutboundSink {
    fn send(&self, from_address: &str, to_address: &str, message: &[u8]) -> std::io::Result<()> {
        let envelope = Envelope {
            from: vec![address(from_address)],
            to: vec![address(to_address)],
            ..Default::default()
        };
        let auth = Some((
            self.credential.username.as_str(),
            self.credential.password.as_str(),
            SaslMechanism::Plain,
        ));
        self.runtime
            .block_on(send_message_async(
                &self.credential.host,
                self.credential.port,
                self.credential.use_implicit_tls,
                self.credential.use_starttls,
                auth,
                &self.credential.host,
                message,
                &envelope,
            ))
            .map_err(to_io_err)
    }
}

/// IMAP IDLE-driven inbound source. Owns one authenticated session with
/// `INBOX` selected, reused across polling cycles.
pub struct ImapInboundSource {
    runtime: Runtime,
    session: AuthenticatedSession,
}

impl ImapInboundSource {
    pub fn connect(credential: &MailCredential) -> std::io::Result<Self> {
        let runtime = Runtime::new()?;
        let auth = Some((
            credential.username.as_str(),
            credential.password.as_str(),
            SaslMechanism::Plain,
        ));
        let mut session = runtime
            .block_on(connect_and_authenticate(
                &credential.host,
                credential.port,
                credential.use_implicit_tls,
                credential.use_starttls,
                auth,
            ))
            .map_err(to_io_err)?;
        runtime
            .block_on(session.select("INBOX"))
            .map_err(to_io_err)?;
        Ok(Self { runtime, session })
    }
}

impl InboundSource for ImapInboundSource {
    fn wait_for_new_mail(&mut self, timeout: Duration) -> std::io::Result<bool> {
        let session = &mut self.session;
        self.runtime.block_on(async move {
            let tag = session.idle_start().await.map_err(to_io_err)?;
            let woke = session.idle_wait(timeout).await.map_err(to_io_err)?;
            session.idle_done(&tag).await.map_err(to_io_err)?;
            Ok(woke)
        })
    }

    fn fetch_unseen(&mut self) -> std::io::Result<HashMap<u32, Vec<u8>>> {
        let session = &mut self.session;
        self.runtime.block_on(async move {
            session.noop().await.map_err(to_io_err)?;
            let uids = session.search_unseen().await.map_err(to_io_err)?;
            session.fetch_bodies_peek(&uids).await.map_err(to_io_err)
        })
    }

    fn mark_seen(&mut self, uids: &[u32]) -> std::io::Result<()> {
        let session = &mut self.session;
        self.runtime
            .block_on(async move { session.mark_seen_batch(uids).await.map_err(to_io_err) })
    }
}

#[cfg(test)]
pub mod in_memory {
    //! An in-process `OutboundSink`/`InboundSource` pair, wired together
    //! through a shared queue, so the socket state machine can be tested
    //! end to end without real SMTP/IMAP servers.
    use super::*;
    use std::sync::{Arc, Condvar, Mutex};

    struct Mailroom {
        next_uid: u32,
        unseen: HashMap<u32, Vec<u8>>,
        seen: Vec<u32>,
    }

    pub struct InMemoryBus {
        inner: Mutex<Mailroom>,
        cv: Condvar,
    }

    impl InMemoryBus {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(Mailroom {
                    next_uid: 1,
                    unseen: HashMap::new(),
                    seen: Vec::new(),
                }),
                cv: Condvar::new(),
            })
        }
    }

    pub struct InMemorySink {
        bus: Arc<InMemoryBus>,
    }

    impl InMemorySink {
        pub fn new(bus: Arc<InMemoryBus>) -> Self {
            Self { bus }
        }
    }

    impl OutboundSink for InMemorySink {
        fn send(&self, _from_address: &str, _to_address: &str, message: &[u8]) -> std::io::Result<()> {
            let mut room = self.bus.inner.lock().unwrap();
            let uid = room.next_uid;
            room.next_uid += 1;
            room.unseen.insert(uid, message.to_vec());
            drop(room);
            self.bus.cv.notify_all();
            Ok(())
        }
    }

    pub struct InMemorySource {
        bus: Arc<InMemoryBus>,
    }

    impl InMemorySource {
        pub fn new(bus: Arc<InMemoryBus>) -> Self {
            Self { bus }
        }
    }

    impl InboundSource for InMemorySource {
        fn wait_for_new_mail(&mut self, timeout: Duration) -> std::io::Result<bool> {
            let room = self.bus.inner.lock().unwrap();
            let (room, timeout_result) = self
                .bus
                .cv
                .wait_timeout_while(room, timeout, |r| r.unseen.is_empty())
                .unwrap();
            Ok(!timeout_result.timed_out() && !room.unseen.is_empty())
        }

        fn fetch_unseen(&mut self) -> std::io::Result<HashMap<u32, Vec<u8>>> {
            let room = self.bus.inner.lock().unwrap();
            Ok(room.unseen.clone())
        }

        fn mark_seen(&mut self, uids: &[u32]) -> std::io::Result<()> {
            let mut room = self.bus.inner.lock().unwrap();
            for uid in uids {
                room.unseen.remove(uid);
                room.seen.push(*uid);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::in_memory::*;
    use super::*;

    #[test]
    fn in_memory_sink_and_source_round_trip() {
        let bus = InMemoryBus::new();
        let sink = InMemorySink::new(bus.clone());
        let mut source = InMemorySource::new(bus);

        sink.send("a@x.com", "b@x.com", b"hello").unwrap();
        assert!(source.wait_for_new_mail(Duration::from_secs(1)).unwrap());

        let unseen = source.fetch_unseen().unwrap();
        assert_eq!(unseen.len(), 1);
        let uid = *unseen.keys().next().unwrap();
        assert_eq!(unseen[&uid], b"hello");

        source.mark_seen(&[uid]).unwrap();
        assert!(source.fetch_unseen().unwrap().is_empty());
    }
}
