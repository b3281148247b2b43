//! Structured activity events and counters.
//!
//! Two consumers care about session churn: log aggregation (one structured
//! event per listener appearing/leaving, with the bands and modes they
//! visited) and live counters for the admin surface. Both are fed by the
//! session manager, always **outside** its lock — a slow sink can delay an
//! event but never block admission or routing.
//!
//! Event semantics:
//!
//! - `session_created` fires when a new UUID appears, or when a known UUID
//!   adds its first audio (or first spectrum) session. A reconnect that
//!   replaces an existing session is not a new event.
//! - `session_destroyed` fires when a UUID drops to zero sessions, carrying
//!   the band/mode history accumulated across all of that UUID's sessions.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::SessionKind;

/// Why a kick happened, for per-reason counters and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickReason {
    IdleAudio,
    IdleSpectrum,
    IdleMixed,
    Lifetime,
    Admin,
}

impl KickReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleAudio => "idle-audio",
            Self::IdleSpectrum => "idle-spectrum",
            Self::IdleMixed => "idle-mixed",
            Self::Lifetime => "lifetime",
            Self::Admin => "admin",
        }
    }
}

/// Payload of a birth/death event.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_uuid: String,
    pub kind: SessionKind,
    pub client_ip: String,
    pub user_agent: String,
    pub country_code: String,
    /// Bands the UUID visited, lifetime-accumulated. Populated on destroy.
    pub bands: Vec<String>,
    /// Modes the UUID used, lifetime-accumulated. Populated on destroy.
    pub modes: Vec<String>,
}

/// Receiver of session birth/death events.
///
/// Called without the manager lock held; implementations may call back
/// into the manager's read-only surface.
pub trait ActivitySink: Send + Sync {
    fn session_created(&self, event: &SessionEvent);
    fn session_destroyed(&self, event: &SessionEvent);
}

/// Default sink: structured tracing events.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ActivitySink for TracingSink {
    fn session_created(&self, event: &SessionEvent) {
        tracing::info!(
            uuid = %event.session_uuid,
            kind = %event.kind,
            client_ip = %event.client_ip,
            country = %event.country_code,
            user_agent = %event.user_agent,
            "listener joined"
        );
    }

    fn session_destroyed(&self, event: &SessionEvent) {
        tracing::info!(
            uuid = %event.session_uuid,
            kind = %event.kind,
            client_ip = %event.client_ip,
            country = %event.country_code,
            bands = ?event.bands,
            modes = ?event.modes,
            "listener left"
        );
    }
}

/// Process-wide counters. All relaxed atomics — readers want cheap
/// monotonic totals, not a consistent cut.
#[derive(Debug, Default)]
pub struct Metrics {
    sessions_created: AtomicU64,
    sessions_destroyed: AtomicU64,
    kicks_idle_audio: AtomicU64,
    kicks_idle_spectrum: AtomicU64,
    kicks_idle_mixed: AtomicU64,
    kicks_lifetime: AtomicU64,
    kicks_admin: AtomicU64,
    rtp_routed: AtomicU64,
    rtp_dropped_queue_full: AtomicU64,
    rtp_unknown_ssrc: AtomicU64,
    rtp_malformed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_destroyed(&self) {
        self.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kick(&self, reason: KickReason) {
        let counter = match reason {
            KickReason::IdleAudio => &self.kicks_idle_audio,
            KickReason::IdleSpectrum => &self.kicks_idle_spectrum,
            KickReason::IdleMixed => &self.kicks_idle_mixed,
            KickReason::Lifetime => &self.kicks_lifetime,
            KickReason::Admin => &self.kicks_admin,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rtp_routed(&self) {
        self.rtp_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rtp_dropped_queue_full(&self) {
        self.rtp_dropped_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rtp_unknown_ssrc(&self) {
        self.rtp_unknown_ssrc.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rtp_malformed(&self) {
        self.rtp_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            kicks_idle_audio: self.kicks_idle_audio.load(Ordering::Relaxed),
            kicks_idle_spectrum: self.kicks_idle_spectrum.load(Ordering::Relaxed),
            kicks_idle_mixed: self.kicks_idle_mixed.load(Ordering::Relaxed),
            kicks_lifetime: self.kicks_lifetime.load(Ordering::Relaxed),
            kicks_admin: self.kicks_admin.load(Ordering::Relaxed),
            rtp_routed: self.rtp_routed.load(Ordering::Relaxed),
            rtp_dropped_queue_full: self.rtp_dropped_queue_full.load(Ordering::Relaxed),
            rtp_unknown_ssrc: self.rtp_unknown_ssrc.load(Ordering::Relaxed),
            rtp_malformed: self.rtp_malformed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Metrics`] for the admin surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub kicks_idle_audio: u64,
    pub kicks_idle_spectrum: u64,
    pub kicks_idle_mixed: u64,
    pub kicks_lifetime: u64,
    pub kicks_admin: u64,
    pub rtp_routed: u64,
    pub rtp_dropped_queue_full: u64,
    pub rtp_unknown_ssrc: u64,
    pub rtp_malformed: u64,
}
