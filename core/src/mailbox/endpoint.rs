/*
 * endpoint.rs
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

//! Endpoint addressing: (address, port-label) with wildcard matching.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One side of a socket: a mail address plus a port label (an arbitrary
/// string distinguishing multiple channels to the same address). Either
/// field may be a wildcard: an empty address or port matches anything on
/// that axis, and an address beginning with `@` matches any address whose
/// suffix equals the text after the `@` (domain-suffix matching, like a
/// bare domain wildcard).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: port.into(),
        }
    }

    /// A complete endpoint names one address and one port with no wildcards.
    pub fn is_complete(&self) -> bool {
        !self.address.is_empty() && !self.address.starts_with('@') && !self.port.is_empty()
    }

    fn address_matches(&self, other: &Endpoint) -> bool {
        if self.address.is_empty() {
            return true;
        }
        if self.address == other.address {
            return true;
        }
        if let Some(suffix) = self.address.strip_prefix('@') {
            return other.address.ends_with(suffix);
        }
        false
    }

    fn port_matches(&self, other: &Endpoint) -> bool {
        self.port.is_empty() || self.port == other.port
    }

    /// True if `self` (typically the subscription/listening side) matches the
    /// concrete `other` endpoint (typically a packet's `to`/`from`).
    pub fn matches(&self, other: &Endpoint) -> bool {
        self.address_matches(other) && self.port_matches(other)
    }

    fn address_intersects(&self, other: &Endpoint) -> bool {
        if self.address.is_empty() || other.address.is_empty() {
            return true;
        }
        if self.address == other.address {
            return true;
        }
        match (self.address.strip_prefix('@'), other.address.strip_prefix('@')) {
            (Some(a), Some(b)) => a.ends_with(b) || b.ends_with(a),
            (Some(a), None) => other.address.ends_with(a),
            (None, Some(b)) => self.address.ends_with(b),
            (None, None) => false,
        }
    }

    fn port_intersects(&self, other: &Endpoint) -> bool {
        self.port.is_empty() || other.port.is_empty() || self.port == other.port
    }

    /// True if there exists some complete endpoint matched by both `self`
    /// and `other`. Used to reject overlapping `listen()` registrations.
    pub fn intersects(&self, other: &Endpoint) -> bool {
        self.address_intersects(other) && self.port_intersects(other)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(a: &str, p: &str) -> Endpoint {
        Endpoint::new(a, p)
    }

    #[test]
    fn exact_match() {
        assert!(ep("a@x.com", "9000").matches(&ep("a@x.com", "9000")));
        assert!(!ep("a@x.com", "9000").matches(&ep("b@x.com", "9000")));
    }

    #[test]
    fn wildcard_address_and_port() {
        assert!(ep("", "").matches(&ep("a@x.com", "9000")));
        assert!(ep("a@x.com", "").matches(&ep("a@x.com", "9000")));
        assert!(ep("", "9000").matches(&ep("a@x.com", "9000")));
    }

    #[test]
    fn domain_suffix_wildcard() {
        assert!(ep("@x.com", "9000").matches(&ep("a@sub.x.com", "9000")));
        assert!(!ep("@x.com", "9000").matches(&ep("a@y.com", "9000")));
    }

    #[test]
    fn completeness() {
        assert!(ep("a@x.com", "9000").is_complete());
        assert!(!ep("", "9000").is_complete());
        assert!(!ep("a@x.com", "").is_complete());
        assert!(!ep("@x.com", "9000").is_complete());
    }

    #[test]
    fn intersection_is_symmetric_and_catches_overlap() {
        let listener_a = ep("@x.com", "");
        let listener_b = ep("a@x.com", "9000");
        assert!(listener_a.intersects(&listener_b));
        assert!(listener_b.intersects(&listener_a));

        let disjoint = ep("@y.com", "");
        assert!(!listener_a.intersects(&disjoint));
    }
}
