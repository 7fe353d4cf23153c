/*
 * error.rs
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

//! Mailbox error hierarchy.

use crate::mailbox::endpoint::Endpoint;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("invalid state for this operation")]
    InvalidState,

    #[error("address already in use: {local} <-> {remote}")]
    AddressInUse { local: Endpoint, remote: Endpoint },

    #[error("socket is closed")]
    Closed,

    #[error("secure handshake timed out")]
    HandshakeTimeout,

    #[error("secure socket has not completed its handshake yet")]
    NotHandshaked,

    #[error("operation timed out")]
    Timeout,

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("invalid snapshot: {0}")]
    InvalidDump(String),

    #[error(transparent)]
    KeyStore(#[from] crate::mailbox::keystore::KeyStoreError),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type MailboxResult<T> = Result<T, MailboxError>;
