/*
 * mod.rs
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

//! Reliable connection-oriented transport over SMTP/IMAP: endpoints, the
//! packet wire codec, the optional Double-Ratchet secure channel, the
//! per-socket state machine, the retransmission scheduler, the inbound IMAP
//! listener, the epoll-like readiness multiplexer, and the mailbox facade
//! that owns all of it.

pub mod config;
pub mod context;
pub mod endpoint;
pub mod epoll;
pub mod error;
pub mod keystore;
pub mod listener;
mod mailbox_impl;
pub mod packet;
pub mod ratchet;
pub mod scheduler;
pub mod socket;
pub mod transport;

pub use config::MailboxConfig;
pub use endpoint::Endpoint;
pub use error::MailboxError;
pub use mailbox_impl::Mailbox;
pub use socket::{AcceptDecision, SocketHandle};

// Generated protobuf types for the wire codec (prost).
pub(crate) mod wire {
    include!(concat!(env!("OUT_DIR"), "/mailim.packet.rs"));
}
