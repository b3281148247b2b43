//! Admission policy: bypass list and kicked-identity registry.
//!
//! Three limits gate session creation (all enforced in
//! [`SessionManager`](super::SessionManager), which owns the counts):
//!
//! 1. `max_sessions` — unique UUIDs across the whole node.
//! 2. `max_sessions_per_ip` — unique UUIDs per client IP.
//! 3. The kick list — identities blocked until a TTL expires.
//!
//! The bypass list exempts an IP (or an `(ip, password)` pair) from the
//! limits and from the automatic inactivity/lifetime kicks. It does *not*
//! shield against administrative kicks, and a kicked identity stays blocked
//! even when bypassed. Internal sessions (empty client IP) skip admission
//! entirely.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::BypassEntry;

/// Compiled bypass list.
#[derive(Debug, Default)]
pub struct BypassPolicy {
    entries: Vec<BypassEntry>,
}

impl BypassPolicy {
    pub fn new(entries: Vec<BypassEntry>) -> Self {
        Self { entries }
    }

    /// Whether `ip` bypasses the automatic limits, given the password the
    /// client presented at handshake (empty when none).
    pub fn is_bypassed(&self, ip: &str, password: &str) -> bool {
        if ip.is_empty() {
            return false;
        }
        self.entries.iter().any(|entry| {
            entry.ip == ip
                && entry
                    .password
                    .as_deref()
                    .is_none_or(|required| required == password)
        })
    }
}

/// Kicked identities with their block expiry.
///
/// Not independently locked — lives inside the manager's state under its
/// lock, reachable from both the handshake path and the sweeps.
#[derive(Debug, Default)]
pub struct KickRegistry {
    kicked_until: HashMap<String, Instant>,
}

impl KickRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `uuid` from reconnecting for `ttl` starting at `now`.
    /// Re-kicking extends the block.
    pub fn insert(&mut self, uuid: &str, ttl: Duration, now: Instant) {
        self.kicked_until.insert(uuid.to_string(), now + ttl);
    }

    /// True while an unexpired entry exists.
    pub fn is_kicked(&self, uuid: &str, now: Instant) -> bool {
        self.kicked_until
            .get(uuid)
            .is_some_and(|expiry| *expiry > now)
    }

    /// Drop expired entries. Returns how many were collected.
    pub fn gc(&mut self, now: Instant) -> usize {
        let before = self.kicked_until.len();
        self.kicked_until.retain(|_, expiry| *expiry > now);
        before - self.kicked_until.len()
    }

    pub fn len(&self) -> usize {
        self.kicked_until.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kicked_until.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ip_bypasses_any_password() {
        let policy = BypassPolicy::new(vec![BypassEntry::ip("10.0.0.1")]);
        assert!(policy.is_bypassed("10.0.0.1", ""));
        assert!(policy.is_bypassed("10.0.0.1", "whatever"));
        assert!(!policy.is_bypassed("10.0.0.2", ""));
    }

    #[test]
    fn password_entry_requires_match() {
        let policy = BypassPolicy::new(vec![BypassEntry::ip_with_password("10.0.0.1", "s3cret")]);
        assert!(policy.is_bypassed("10.0.0.1", "s3cret"));
        assert!(!policy.is_bypassed("10.0.0.1", ""));
        assert!(!policy.is_bypassed("10.0.0.1", "wrong"));
    }

    #[test]
    fn empty_ip_never_bypasses() {
        let policy = BypassPolicy::new(vec![BypassEntry::ip("")]);
        assert!(!policy.is_bypassed("", ""));
    }

    #[test]
    fn kick_expires_after_ttl() {
        let now = Instant::now();
        let mut kicks = KickRegistry::new();
        kicks.insert("u1", Duration::from_secs(60), now);

        assert!(kicks.is_kicked("u1", now));
        assert!(kicks.is_kicked("u1", now + Duration::from_secs(59)));
        assert!(!kicks.is_kicked("u1", now + Duration::from_secs(61)));
        assert!(!kicks.is_kicked("u2", now));
    }

    #[test]
    fn gc_drops_only_expired() {
        let now = Instant::now();
        let mut kicks = KickRegistry::new();
        kicks.insert("old", Duration::from_secs(10), now);
        kicks.insert("fresh", Duration::from_secs(120), now);

        let collected = kicks.gc(now + Duration::from_secs(60));
        assert_eq!(collected, 1);
        assert_eq!(kicks.len(), 1);
        assert!(kicks.is_kicked("fresh", now + Duration::from_secs(60)));
    }

    #[test]
    fn rekick_extends_block() {
        let now = Instant::now();
        let mut kicks = KickRegistry::new();
        kicks.insert("u1", Duration::from_secs(10), now);
        kicks.insert("u1", Duration::from_secs(10), now + Duration::from_secs(8));
        assert!(kicks.is_kicked("u1", now + Duration::from_secs(15)));
    }
}
