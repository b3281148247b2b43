//! Background maintenance loops.
//!
//! Three independent threads tick against the manager:
//!
//! - **Inactivity sweep** (30 s): kicks UUIDs whose non-wide-IQ sessions
//!   sat idle past `session_timeout`. Also garbage-collects expired kick
//!   entries and stale user-agent records.
//! - **Lifetime sweep** (1 s): kicks UUIDs that exceeded
//!   `max_session_time` since first sight, then forgets their first-seen
//!   timestamp so the kick fires once.
//! - **Orphan sweep** (60 s): disables engine channels whose SSRC the
//!   manager does not know — leftovers of a crash/restart race.
//!
//! Each loop polls a run flag between short sleeps so shutdown joins
//! promptly. The sweep bodies take an explicit `now` where time matters,
//! which is also what the tests drive them with.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use crate::activity::KickReason;
use crate::engine::EngineChannel;
use crate::session::SessionKind;

use super::{SessionManager, State};

pub const INACTIVITY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const LIFETIME_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// User-agent records for UUIDs with no live session are kept this long.
const USER_AGENT_TTL: Duration = Duration::from_secs(300);

/// Run-flag poll granularity inside the sweep threads.
const POLL_SLICE: Duration = Duration::from_millis(250);

/// Kick reason for an idle UUID, by which session kinds went idle.
pub(crate) fn idle_reason(audio: bool, spectrum: bool) -> KickReason {
    match (audio, spectrum) {
        (true, false) => KickReason::IdleAudio,
        (false, true) => KickReason::IdleSpectrum,
        _ => KickReason::IdleMixed,
    }
}

impl SessionManager {
    /// Spawn the three sweep loops. They run until [`shutdown`] flips the
    /// run flag and joins them.
    ///
    /// [`shutdown`]: SessionManager::shutdown
    pub fn start_background(&self) {
        let mut sweepers = self.inner.sweepers.lock();
        sweepers.push(self.spawn_loop("inactivity", INACTIVITY_SWEEP_INTERVAL, |m| {
            m.sweep_inactive(Instant::now());
        }));
        sweepers.push(self.spawn_loop("lifetime", LIFETIME_SWEEP_INTERVAL, |m| {
            m.sweep_lifetime(Instant::now());
        }));
        sweepers.push(self.spawn_loop("orphans", ORPHAN_SWEEP_INTERVAL, |m| {
            m.sweep_orphans();
        }));
        tracing::debug!("background sweeps started");
    }

    fn spawn_loop(
        &self,
        name: &'static str,
        period: Duration,
        tick: fn(&SessionManager),
    ) -> thread::JoinHandle<()> {
        let manager = self.clone();
        thread::spawn(move || {
            let mut next = Instant::now() + period;
            while manager.inner.running.load(Ordering::SeqCst) {
                thread::sleep(POLL_SLICE);
                if Instant::now() >= next {
                    tick(&manager);
                    next = Instant::now() + period;
                }
            }
            tracing::debug!(sweep = name, "sweep loop exited");
        })
    }

    /// One inactivity-sweep tick at `now`.
    ///
    /// Wide-IQ sessions are exempt (they stream continuously and have no
    /// interactive activity to measure); bypassed and internal identities
    /// are exempt from all timer kicks.
    pub fn sweep_inactive(&self, now: Instant) {
        let collected = self.inner.state.write().kicks.gc(now);
        if collected > 0 {
            tracing::debug!(collected, "expired kick entries dropped");
        }
        self.gc_user_agents(now);

        let timeout = self.inner.config.session_timeout;
        if timeout.is_zero() {
            return;
        }

        // (audio idle, spectrum idle) per UUID, plus orphan UUID-less ids.
        let mut idle: HashMap<String, (bool, bool)> = HashMap::new();
        let mut anonymous = Vec::new();
        {
            let state = self.inner.state.read();
            for session in state.by_id.values() {
                if session.identity.is_internal() {
                    continue;
                }
                if session.kind == SessionKind::Audio && session.is_wide_iq() {
                    continue;
                }
                if session.idle_for(now) <= timeout {
                    continue;
                }
                if self.inner.bypass.is_bypassed(
                    &session.identity.client_ip,
                    &session.identity.bypass_password,
                ) {
                    continue;
                }
                let uuid = &session.identity.session_uuid;
                if uuid.is_empty() {
                    anonymous.push(session.id.clone());
                    continue;
                }
                let entry = idle.entry(uuid.clone()).or_insert((false, false));
                match session.kind {
                    SessionKind::Audio => entry.0 = true,
                    SessionKind::Spectrum => entry.1 = true,
                }
            }
        }

        for (uuid, (audio, spectrum)) in idle {
            tracing::info!(uuid = %uuid, "kicking idle identity");
            let _ = self.kick_uuid_with_reason(&uuid, idle_reason(audio, spectrum));
        }
        for id in anonymous {
            let _ = self.destroy_session(&id);
        }
    }

    /// One lifetime-sweep tick at `now`. A UUID past `max_session_time`
    /// is kicked once; its first-seen record is dropped afterwards so the
    /// next connection starts a fresh clock (after the kick TTL).
    pub fn sweep_lifetime(&self, now: Instant) {
        let max = self.inner.config.max_session_time;
        if max.is_zero() {
            return;
        }

        let expired: Vec<String> = {
            let state = self.inner.state.read();
            state
                .first_seen
                .iter()
                .filter(|(_, first)| now.saturating_duration_since(**first) > max)
                .filter(|(uuid, _)| !state.kicks.is_kicked(uuid, now))
                .filter(|(uuid, _)| !Self::uuid_is_bypassed(&self.inner.bypass, &state, uuid))
                .map(|(uuid, _)| uuid.clone())
                .collect()
        };

        for uuid in expired {
            tracing::info!(uuid = %uuid, "identity exceeded maximum session time");
            let _ = self.kick_uuid_with_reason(&uuid, KickReason::Lifetime);
            self.inner.state.write().first_seen.remove(&uuid);
        }
    }

    /// A UUID is shielded from timer kicks when any of its live sessions
    /// is internal or comes from a bypassed address.
    fn uuid_is_bypassed(
        bypass: &super::admission::BypassPolicy,
        state: &State,
        uuid: &str,
    ) -> bool {
        state.by_id.values().any(|s| {
            s.identity.session_uuid == uuid
                && (s.identity.is_internal()
                    || bypass.is_bypassed(&s.identity.client_ip, &s.identity.bypass_password))
        })
    }

    /// One orphan-sweep tick: enumerate engine channels and soft-disable
    /// any SSRC the manager has no session for. The channel may belong to
    /// a forgotten session after a crash/restart; disabling (rather than
    /// terminating) keeps a co-tenant's channel recoverable.
    pub fn sweep_orphans(&self) {
        let channels = match self.inner.engine.active_channels() {
            Ok(channels) => channels,
            Err(e) => {
                tracing::warn!(error = %e, "orphan sweep could not enumerate engine channels");
                return;
            }
        };

        let orphans: Vec<EngineChannel> = {
            let state = self.inner.state.read();
            channels
                .into_iter()
                .filter(|c| !state.by_ssrc.contains_key(&c.ssrc))
                .collect()
        };

        for channel in orphans {
            tracing::warn!(
                name = %channel.name,
                ssrc = format_args!("{:#010X}", channel.ssrc),
                "disabling orphaned engine channel"
            );
            if let Err(e) = self
                .inner
                .engine
                .disable_channel(&channel.name, channel.ssrc)
            {
                tracing::warn!(
                    ssrc = format_args!("{:#010X}", channel.ssrc),
                    error = %e,
                    "failed to disable orphaned channel"
                );
            }
        }
    }

    /// Drop user-agent records whose UUID has no live session and whose
    /// last sighting is older than five minutes.
    fn gc_user_agents(&self, now: Instant) {
        let mut state = self.inner.state.write();
        let State {
            user_agent_by_uuid,
            user_agent_seen,
            uuid_count,
            ..
        } = &mut *state;
        user_agent_by_uuid.retain(|uuid, _| {
            uuid_count.contains_key(uuid)
                || user_agent_seen
                    .get(uuid)
                    .is_some_and(|seen| now.saturating_duration_since(*seen) <= USER_AGENT_TTL)
        });
        user_agent_seen.retain(|uuid, seen| {
            uuid_count.contains_key(uuid)
                || now.saturating_duration_since(*seen) <= USER_AGENT_TTL
        });
    }
}
