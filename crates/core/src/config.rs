//! Multiplexer configuration.
//!
//! All values are plain data — parsing them from a file or CLI flags is the
//! embedding application's job (see `crates/cli`). Durations of zero disable
//! the corresponding limit.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

/// Default TTL for kicked identities (one hour).
pub const DEFAULT_KICKED_TTL: Duration = Duration::from_secs(3600);

/// A bypass list entry: an IP alone bypasses unconditionally, an
/// `(ip, password)` pair bypasses only when the client presented the
/// matching password at handshake.
///
/// Bypass exempts an identity from the automatic inactivity and lifetime
/// kicks and from the admission limits. It does **not** protect against
/// administrative kicks.
#[derive(Debug, Clone)]
pub struct BypassEntry {
    /// Client IP address, compared textually against both the forwarded
    /// client IP and the socket source IP.
    pub ip: String,
    /// Required password, if any.
    pub password: Option<String>,
}

impl BypassEntry {
    /// Unconditional bypass for an address.
    pub fn ip(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            password: None,
        }
    }

    /// Bypass only when `password` was presented at handshake.
    pub fn ip_with_password(ip: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            password: Some(password.into()),
        }
    }
}

/// Parameters for the internal wideband spectrum channel created at startup.
#[derive(Debug, Clone)]
pub struct SpectrumDefaults {
    pub center_hz: u64,
    pub bin_count: u32,
    pub bin_bw_hz: f32,
}

impl Default for SpectrumDefaults {
    fn default() -> Self {
        Self {
            center_hz: 15_000_000,
            bin_count: 8192,
            bin_bw_hz: 2000.0,
        }
    }
}

/// Top-level configuration for the session and routing plane.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Cap on concurrently connected unique UUIDs. Must be > 0.
    pub max_sessions: usize,
    /// Cap on unique UUIDs per client IP. Zero disables the limit.
    pub max_sessions_per_ip: usize,
    /// Maximum interval of inactivity before a UUID is kicked.
    /// Zero disables. Wide-IQ sessions are exempt.
    pub session_timeout: Duration,
    /// Absolute lifetime of a UUID from first sight. Zero disables.
    pub max_session_time: Duration,
    /// How long a kicked identity stays blocked from reconnecting.
    pub kicked_ttl: Duration,
    /// IP / (IP, password) entries exempt from limits and timer kicks.
    pub bypass: Vec<BypassEntry>,
    /// Defaults for the internal wideband spectrum session.
    pub default_spectrum: SpectrumDefaults,
    /// Multicast group carrying audio RTP from the radio engine.
    pub multicast_audio_addr: SocketAddrV4,
    /// Multicast group carrying spectrum RTP from the radio engine.
    pub multicast_spectrum_addr: SocketAddrV4,
    /// Local interface address to join the groups on. The loopback
    /// interface is always joined in addition.
    pub interface_addr: Option<Ipv4Addr>,
    /// Capacity of each audio session's delivery queue. On overflow the
    /// producer drops (audio is best-effort).
    pub audio_queue_capacity: usize,
    /// Capacity of each spectrum session's delivery queue.
    pub spectrum_queue_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            max_sessions_per_ip: 0,
            session_timeout: Duration::ZERO,
            max_session_time: Duration::ZERO,
            kicked_ttl: DEFAULT_KICKED_TTL,
            bypass: Vec::new(),
            default_spectrum: SpectrumDefaults::default(),
            multicast_audio_addr: SocketAddrV4::new(Ipv4Addr::new(239, 1, 2, 3), 5004),
            multicast_spectrum_addr: SocketAddrV4::new(Ipv4Addr::new(239, 1, 2, 4), 5006),
            interface_addr: None,
            audio_queue_capacity: 256,
            spectrum_queue_capacity: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = MuxConfig::default();
        assert!(cfg.max_sessions > 0);
        assert_eq!(cfg.max_sessions_per_ip, 0);
        assert!(cfg.session_timeout.is_zero());
        assert_eq!(cfg.kicked_ttl, DEFAULT_KICKED_TTL);
        assert!(cfg.multicast_audio_addr.ip().is_multicast());
        assert!(cfg.multicast_spectrum_addr.ip().is_multicast());
    }

    #[test]
    fn bypass_entry_constructors() {
        let plain = BypassEntry::ip("10.0.0.1");
        assert!(plain.password.is_none());

        let with_pw = BypassEntry::ip_with_password("10.0.0.2", "hunter2");
        assert_eq!(with_pw.password.as_deref(), Some("hunter2"));
    }
}
