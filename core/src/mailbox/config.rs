/*
 * config.rs
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

//! Mailbox runtime configuration: timer constants and the mailer identity.
//! Layered defaults -> optional TOML file -> environment variables, in that
//! order of increasing precedence.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const X_MAILER: &str = "mailim/1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Retransmit timeout in milliseconds.
    pub rto_ms: u64,
    /// Delayed-ACK timeout in milliseconds.
    pub ato_ms: u64,
    /// Retransmit attempts before a socket is force-closed.
    pub max_attempts: u32,
    /// Bound on the Double Ratchet skipped-message-key cache.
    pub max_msg_keys: u32,
    /// `X-Mailer` header value stamped on every outbound packet and checked
    /// on every inbound one.
    pub x_mailer: String,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            rto_ms: 1000,
            ato_ms: 1000,
            max_attempts: 10,
            max_msg_keys: 1000,
            x_mailer: X_MAILER.to_string(),
        }
    }
}

impl MailboxConfig {
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms)
    }

    pub fn ato(&self) -> Duration {
        Duration::from_millis(self.ato_ms)
    }

    /// Load defaults, overlay an optional TOML file, then overlay environment
    /// variables (`MAILIM_RTO_MS`, `MAILIM_ATO_MS`, `MAILIM_MAX_ATTEMPTS`,
    /// `MAILIM_MAX_MSG_KEYS`, `MAILIM_X_MAILER`).
    pub fn load(toml_path: Option<&Path>) -> Self {
        let mut cfg = Self::default();

        if let Some(path) = toml_path {
            if let Ok(text) = std::fs::read_to_string(path) {
                match toml::from_str::<MailboxConfig>(&text) {
                    Ok(parsed) => cfg = parsed,
                    Err(e) => {
                        tracing::warn!(error = %e, path = %path.display(), "ignoring malformed mailbox config file");
                    }
                }
            }
        }

        if let Ok(v) = std::env::var("MAILIM_RTO_MS") {
            if let Ok(n) = v.parse() {
                cfg.rto_ms = n;
            }
        }
        if let Ok(v) = std::env::var("MAILIM_ATO_MS") {
            if let Ok(n) = v.parse() {
                cfg.ato_ms = n;
            }
        }
        if let Ok(v) = std::env::var("MAILIM_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                cfg.max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("MAILIM_MAX_MSG_KEYS") {
            if let Ok(n) = v.parse() {
                cfg.max_msg_keys = n;
            }
        }
        if let Ok(v) = std::env::var("MAILIM_X_MAILER") {
            cfg.x_mailer = v;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_wire_contract() {
        let cfg = MailboxConfig::default();
        assert_eq!(cfg.rto_ms, 1000);
        assert_eq!(cfg.ato_ms, 1000);
        assert_eq!(cfg.max_attempts, 10);
        assert_eq!(cfg.max_msg_keys, 1000);
        assert_eq!(cfg.x_mailer, X_MAILER);
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("MAILIM_RTO_MS", "250");
        let cfg = MailboxConfig::load(None);
        assert_eq!(cfg.rto_ms, 250);
        std::env::remove_var("MAILIM_RTO_MS");
    }
}
