//! Session manager: creation, cross-indexed lookup, admission, teardown.
//!
//! The manager owns every map that relates sessions to each other and to
//! the outside world, all guarded by a single coarse reader-writer lock:
//!
//! | Index | Keyed by | Answers |
//! |-------|----------|---------|
//! | `by_id` | session id | the session itself |
//! | `by_ssrc` | SSRC | RTP routing, O(1) per datagram |
//! | `audio_of_uuid` / `spectrum_of_uuid` | UUID | replacement targets |
//! | `uuid_count` | UUID | unique-user admission, death events |
//! | `uuids_per_ip` | client IP | per-IP admission |
//! | `first_seen` | UUID | lifetime enforcement |
//! | `kicks` | UUID | reconnect blocking |
//! | `bands_by_uuid` / `modes_by_uuid` | UUID | activity history |
//!
//! ## Lock discipline
//!
//! The radio engine and the activity sink are **never** called while the
//! lock is held. Creates run admission and SSRC minting under the lock,
//! release it for the engine exchange, then reacquire and re-validate
//! before inserting. Destroys snapshot the death event under the lock,
//! release to emit, reacquire to unlink. The replacement path releases
//! before destroying the superseded session. Breaking any of these rules
//! deadlocks against a sink that reads sessions, or stalls routing behind
//! a slow engine.

pub mod admission;
pub mod sweeps;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rand::RngExt;

use crate::activity::{ActivitySink, KickReason, Metrics, SessionEvent, TracingSink};
use crate::bands::band_for_frequency;
use crate::config::MuxConfig;
use crate::engine::{FrontendStatus, RadioEngine, is_wide_iq, mode_channels, mode_sample_rate};
use crate::error::{MuxError, Result};
use crate::session::{
    ClientIdentity, Session, SessionHandle, SessionKind, SpectrumSettings, Tuning,
};
use admission::{BypassPolicy, KickRegistry};

/// Country resolution for kick-by-country. Treated as a pure function;
/// lookups happen outside the manager lock.
pub trait GeoIp: Send + Sync {
    fn country_code(&self, ip: &str) -> Option<String>;
}

/// How many random draws the SSRC minter makes before giving up.
const SSRC_MINT_ATTEMPTS: u32 = 100;

/// The mode string spectrum sessions report; never recorded as a visited
/// mode.
const SPECTRUM_MODE: &str = "spectrum";

pub(crate) struct State {
    pub(crate) by_id: HashMap<String, Arc<Session>>,
    pub(crate) by_ssrc: HashMap<u32, Arc<Session>>,
    pub(crate) audio_of_uuid: HashMap<String, String>,
    pub(crate) spectrum_of_uuid: HashMap<String, String>,
    pub(crate) uuid_count: HashMap<String, usize>,
    pub(crate) uuids_per_ip: HashMap<String, HashSet<String>>,
    pub(crate) first_seen: HashMap<String, Instant>,
    pub(crate) kicks: KickRegistry,
    pub(crate) user_agent_by_uuid: HashMap<String, String>,
    pub(crate) user_agent_seen: HashMap<String, Instant>,
    pub(crate) bands_by_uuid: HashMap<String, HashSet<String>>,
    pub(crate) modes_by_uuid: HashMap<String, HashSet<String>>,
    pub(crate) wideband_id: Option<String>,
}

impl State {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_ssrc: HashMap::new(),
            audio_of_uuid: HashMap::new(),
            spectrum_of_uuid: HashMap::new(),
            uuid_count: HashMap::new(),
            uuids_per_ip: HashMap::new(),
            first_seen: HashMap::new(),
            kicks: KickRegistry::new(),
            user_agent_by_uuid: HashMap::new(),
            user_agent_seen: HashMap::new(),
            bands_by_uuid: HashMap::new(),
            modes_by_uuid: HashMap::new(),
            wideband_id: None,
        }
    }

    fn kind_index(&self, kind: SessionKind) -> &HashMap<String, String> {
        match kind {
            SessionKind::Audio => &self.audio_of_uuid,
            SessionKind::Spectrum => &self.spectrum_of_uuid,
        }
    }

    fn kind_index_mut(&mut self, kind: SessionKind) -> &mut HashMap<String, String> {
        match kind {
            SessionKind::Audio => &mut self.audio_of_uuid,
            SessionKind::Spectrum => &mut self.spectrum_of_uuid,
        }
    }
}

pub(crate) struct ManagerInner {
    pub(crate) config: MuxConfig,
    pub(crate) engine: Arc<dyn RadioEngine>,
    pub(crate) sink: Arc<dyn ActivitySink>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) geoip: Option<Arc<dyn GeoIp>>,
    pub(crate) bypass: BypassPolicy,
    pub(crate) state: RwLock<State>,
    pub(crate) running: AtomicBool,
    pub(crate) sweepers: Mutex<Vec<JoinHandle<()>>>,
}

/// Thread-safe handle to the session plane. Cheap to clone; all clones
/// share one state.
#[derive(Clone)]
pub struct SessionManager {
    pub(crate) inner: Arc<ManagerInner>,
}

/// One row of the admin session listing.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    /// SSRC rendered as `0x`-prefixed hex, the form operators grep logs for.
    pub ssrc: String,
    pub kind: SessionKind,
    pub frequency_hz: u64,
    pub mode: String,
    pub center_hz: u64,
    pub bin_count: u32,
    pub session_uuid: String,
    pub client_ip: String,
    pub source_ip: String,
    pub user_agent: String,
    pub country_code: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub audio_kbps: u64,
    pub audio_kbps_avg: u64,
    pub waterfall_kbps: u64,
    pub waterfall_kbps_avg: u64,
    pub bypassed: bool,
    /// RF front-end telemetry, present only for the designated wideband
    /// spectrum session.
    pub frontend: Option<FrontendStatus>,
}

impl SessionManager {
    /// Create a manager with the default tracing sink and fresh metrics.
    pub fn new(config: MuxConfig, engine: Arc<dyn RadioEngine>) -> Self {
        Self::with_collaborators(config, engine, Arc::new(TracingSink), Arc::new(Metrics::new()), None)
    }

    /// Create a manager with explicit collaborators.
    pub fn with_collaborators(
        config: MuxConfig,
        engine: Arc<dyn RadioEngine>,
        sink: Arc<dyn ActivitySink>,
        metrics: Arc<Metrics>,
        geoip: Option<Arc<dyn GeoIp>>,
    ) -> Self {
        let bypass = BypassPolicy::new(config.bypass.clone());
        Self {
            inner: Arc::new(ManagerInner {
                config,
                engine,
                sink,
                metrics,
                geoip,
                bypass,
                state: RwLock::new(State::new()),
                running: AtomicBool::new(true),
                sweepers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create an audio session: admission, reconnect replacement, engine
    /// channel registration, index insertion, in that order. On engine
    /// failure nothing has been inserted and nothing needs compensation.
    pub fn create_audio_session(
        &self,
        frequency_hz: u64,
        mode: &str,
        bandwidth_hz: u32,
        identity: ClientIdentity,
    ) -> Result<SessionHandle> {
        let tuning = Tuning::from_request(frequency_hz, mode, bandwidth_hz);
        self.admit_and_replace(&identity, SessionKind::Audio)?;

        let (id, ssrc) = self.mint_ids()?;
        let channel_name = format!("sdrmux-{id}");

        // Wide-IQ bandwidth is delegated to the engine's mode preset.
        let engine_bw = if is_wide_iq(&tuning.mode) { 0 } else { bandwidth_hz };
        self.inner.engine.create_channel(
            &channel_name,
            frequency_hz,
            &tuning.mode,
            tuning.sample_rate_hz,
            ssrc,
            engine_bw,
        )?;

        let handle = Session::new_audio(
            id,
            channel_name,
            ssrc,
            identity,
            tuning,
            self.inner.config.audio_queue_capacity,
        );
        self.insert_session(&handle)?;
        Ok(handle)
    }

    /// Create a spectrum session from the configured defaults. At most one
    /// spectrum session exists per UUID; a reconnect replaces the old one
    /// without counting against the per-IP limit.
    pub fn create_spectrum_session(&self, identity: ClientIdentity) -> Result<SessionHandle> {
        let defaults = &self.inner.config.default_spectrum;
        let settings = SpectrumSettings {
            center_hz: defaults.center_hz,
            bin_count: defaults.bin_count,
            bin_bw_hz: defaults.bin_bw_hz,
        };
        self.admit_and_replace(&identity, SessionKind::Spectrum)?;

        let (id, ssrc) = self.mint_ids()?;
        let channel_name = format!("sdrmux-{id}");

        self.inner.engine.create_spectrum_channel(
            &channel_name,
            settings.center_hz,
            settings.bin_count,
            settings.bin_bw_hz,
            ssrc,
        )?;

        let handle = Session::new_spectrum(
            id,
            channel_name,
            ssrc,
            identity,
            settings,
            self.inner.config.spectrum_queue_capacity,
        );
        self.insert_session(&handle)?;
        Ok(handle)
    }

    /// Admission checks under the write lock, then replacement of a
    /// same-kind session for the same UUID with the lock released.
    fn admit_and_replace(&self, identity: &ClientIdentity, kind: SessionKind) -> Result<()> {
        let now = Instant::now();
        let uuid = &identity.session_uuid;

        let existing = {
            let mut state = self.inner.state.write();
            if !identity.is_internal() {
                if !uuid.is_empty() {
                    state.first_seen.entry(uuid.clone()).or_insert(now);
                }
                self.check_admission(&state, identity, now)?;
            }
            if uuid.is_empty() {
                None
            } else {
                state.kind_index(kind).get(uuid).cloned()
            }
        };

        // Reconnect: the fresh session supersedes the stale one. The
        // destroy talks to the engine, so the lock must already be gone.
        if let Some(old_id) = existing {
            tracing::debug!(uuid = %uuid, kind = %kind, old_id, "replacing session on reconnect");
            let _ = self.destroy_session(&old_id);
        }
        Ok(())
    }

    fn check_admission(&self, state: &State, identity: &ClientIdentity, now: Instant) -> Result<()> {
        let uuid = &identity.session_uuid;
        if state.kicks.is_kicked(uuid, now) {
            return Err(MuxError::Kicked(uuid.clone()));
        }
        // Kicks bind even for bypassed addresses; the limits do not.
        if self
            .inner
            .bypass
            .is_bypassed(&identity.client_ip, &identity.bypass_password)
        {
            return Ok(());
        }

        let known = state.uuid_count.contains_key(uuid);
        if !known && state.uuid_count.len() >= self.inner.config.max_sessions {
            return Err(MuxError::MaxUsers);
        }

        let per_ip = self.inner.config.max_sessions_per_ip;
        if per_ip > 0
            && let Some(set) = state.uuids_per_ip.get(&identity.client_ip)
            && !set.contains(uuid)
            && set.len() >= per_ip
        {
            return Err(MuxError::MaxUsersPerIp(identity.client_ip.clone()));
        }
        Ok(())
    }

    /// Mint a fresh session id and a free SSRC under the lock.
    fn mint_ids(&self) -> Result<(String, u32)> {
        let state = self.inner.state.read();
        let id = format!("{:016x}", rand::rng().random::<u64>());
        for _ in 0..SSRC_MINT_ATTEMPTS {
            let ssrc: u32 = rand::rng().random();
            if ssrc == 0 || ssrc == u32::MAX {
                continue;
            }
            if !state.by_ssrc.contains_key(&ssrc) {
                return Ok((id, ssrc));
            }
        }
        Err(MuxError::SsrcSpaceExhausted(SSRC_MINT_ATTEMPTS))
    }

    /// Insert a freshly created session into every index, re-validating
    /// what may have changed while the engine call ran without the lock.
    fn insert_session(&self, handle: &SessionHandle) -> Result<()> {
        let session = &handle.session;
        let identity = &session.identity;
        let uuid = identity.session_uuid.clone();
        let now = Instant::now();

        let mut attempts = 0;
        let event = loop {
            let mut state = self.inner.state.write();

            // The UUID may have been kicked while the engine call ran.
            if !identity.is_internal() && state.kicks.is_kicked(&uuid, now) {
                drop(state);
                self.unwind_engine_channel(session);
                return Err(MuxError::Kicked(uuid));
            }
            // A random SSRC collision across the unlocked window is
            // astronomically unlikely but would corrupt routing.
            if state.by_ssrc.contains_key(&session.ssrc) {
                drop(state);
                self.unwind_engine_channel(session);
                return Err(MuxError::Internal(format!(
                    "SSRC {:#010X} taken during create",
                    session.ssrc
                )));
            }
            // A concurrent create for the same UUID and kind landed while
            // the lock was released: ours is newer, theirs gets replaced.
            let conflict = if uuid.is_empty() {
                None
            } else {
                state.kind_index(session.kind).get(&uuid).cloned()
            };
            match conflict {
                None => break Self::apply_insert(&mut state, session, now),
                Some(old_id) => {
                    drop(state);
                    attempts += 1;
                    if attempts > 2 {
                        self.unwind_engine_channel(session);
                        return Err(MuxError::Internal(format!(
                            "persistent concurrent create for UUID {uuid}"
                        )));
                    }
                    let _ = self.destroy_session(&old_id);
                }
            }
        };

        self.inner.metrics.record_session_created();
        tracing::info!(
            session_id = %session.id,
            ssrc = format_args!("{:#010X}", session.ssrc),
            kind = %session.kind,
            uuid = %uuid,
            client_ip = %identity.client_ip,
            total_sessions = self.session_count(),
            "session created"
        );
        if let Some(event) = event {
            self.inner.sink.session_created(&event);
        }
        Ok(())
    }

    /// Pure index mutation, caller holds the write lock. Returns the
    /// birth event when this is a new listener (new UUID, or first
    /// session of this kind for a known UUID).
    fn apply_insert(state: &mut State, session: &Arc<Session>, now: Instant) -> Option<SessionEvent> {
        let identity = &session.identity;
        let uuid = &identity.session_uuid;

        state.by_id.insert(session.id.clone(), session.clone());
        state.by_ssrc.insert(session.ssrc, session.clone());

        if uuid.is_empty() {
            return None;
        }

        let uuid_is_new = !state.uuid_count.contains_key(uuid);
        let first_of_kind = !state.kind_index(session.kind).contains_key(uuid);

        state
            .kind_index_mut(session.kind)
            .insert(uuid.clone(), session.id.clone());
        *state.uuid_count.entry(uuid.clone()).or_insert(0) += 1;

        if !identity.client_ip.is_empty() {
            state
                .uuids_per_ip
                .entry(identity.client_ip.clone())
                .or_default()
                .insert(uuid.clone());
        }
        if !identity.user_agent.is_empty() {
            state
                .user_agent_by_uuid
                .insert(uuid.clone(), identity.user_agent.clone());
        }
        state.user_agent_seen.insert(uuid.clone(), now);

        if session.kind == SessionKind::Audio {
            let tuning = session.tuning();
            if let Some(band) = band_for_frequency(tuning.frequency_hz) {
                session.record_band(band);
                state
                    .bands_by_uuid
                    .entry(uuid.clone())
                    .or_default()
                    .insert(band.to_string());
            }
            if !tuning.mode.is_empty() && tuning.mode != SPECTRUM_MODE {
                session.record_mode(&tuning.mode);
                state
                    .modes_by_uuid
                    .entry(uuid.clone())
                    .or_default()
                    .insert(tuning.mode.clone());
            }
        }

        (uuid_is_new || first_of_kind).then(|| SessionEvent {
            session_uuid: uuid.clone(),
            kind: session.kind,
            client_ip: identity.client_ip.clone(),
            user_agent: identity.user_agent.clone(),
            country_code: identity.country_code.clone(),
            bands: Vec::new(),
            modes: Vec::new(),
        })
    }

    /// Best-effort teardown of an engine channel whose session never made
    /// it into the indices.
    fn unwind_engine_channel(&self, session: &Arc<Session>) {
        if let Err(e) = self
            .inner
            .engine
            .terminate_channel(&session.channel_name, session.ssrc)
        {
            tracing::warn!(
                session_id = %session.id,
                error = %e,
                "failed to unwind engine channel after aborted create"
            );
        }
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// In-place retune. Zero frequency / empty mode / zero bandwidth leave
    /// the respective field unchanged. On engine failure the in-memory
    /// tuning rolls back and the session stays on its old settings.
    pub fn update_session(
        &self,
        id: &str,
        frequency_hz: u64,
        mode: &str,
        bandwidth_hz: u32,
    ) -> Result<()> {
        let half = (bandwidth_hz / 2) as i32;
        self.retune(id, frequency_hz, mode, -half, half, bandwidth_hz != 0, false)
    }

    /// Retune with explicit filter edges. Unlike [`update_session`], a
    /// mode change here also updates the sample rate and channel count
    /// (I/Q modes are stereo, everything else mono).
    pub fn update_session_with_edges(
        &self,
        id: &str,
        frequency_hz: u64,
        mode: &str,
        bw_low_hz: i32,
        bw_high_hz: i32,
        send_bw: bool,
    ) -> Result<()> {
        self.retune(id, frequency_hz, mode, bw_low_hz, bw_high_hz, send_bw, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn retune(
        &self,
        id: &str,
        frequency_hz: u64,
        mode: &str,
        bw_low_hz: i32,
        bw_high_hz: i32,
        send_bw: bool,
        adjust_rate: bool,
    ) -> Result<()> {
        let session = self.expect_kind(id, SessionKind::Audio)?;

        let prior = session.tuning();
        let mut next = prior.clone();
        if frequency_hz != 0 {
            next.frequency_hz = frequency_hz;
        }
        let mode_changed = !mode.is_empty() && !mode.eq_ignore_ascii_case(&prior.mode);
        if mode_changed {
            next.mode = mode.to_ascii_lowercase();
            if adjust_rate {
                next.sample_rate_hz = mode_sample_rate(&next.mode);
                next.channels = mode_channels(&next.mode);
            }
        }
        if send_bw {
            next.bw_low_hz = bw_low_hz;
            next.bw_high_hz = bw_high_hz;
        }

        session.set_tuning(next.clone());
        // An unchanged mode is withheld from the wire so the engine keeps
        // its loaded preset.
        let wire_mode = if mode_changed { next.mode.as_str() } else { "" };
        if let Err(e) = self.inner.engine.update_channel(
            session.ssrc,
            next.frequency_hz,
            wire_mode,
            next.bw_low_hz,
            next.bw_high_hz,
            send_bw,
        ) {
            session.set_tuning(prior);
            return Err(e);
        }

        session.touch();
        self.record_visits(
            &session,
            (next.frequency_hz != prior.frequency_hz).then_some(next.frequency_hz),
            mode_changed.then_some(next.mode.as_str()),
        );
        tracing::debug!(
            session_id = %id,
            frequency_hz = next.frequency_hz,
            mode = %next.mode,
            "session retuned"
        );
        Ok(())
    }

    /// Record band/mode history on both the session and its UUID.
    fn record_visits(&self, session: &Arc<Session>, frequency: Option<u64>, mode: Option<&str>) {
        let band = frequency.and_then(band_for_frequency);
        let mode = mode.filter(|m| !m.is_empty() && *m != SPECTRUM_MODE);
        if band.is_none() && mode.is_none() {
            return;
        }

        if let Some(band) = band {
            session.record_band(band);
        }
        if let Some(mode) = mode {
            session.record_mode(mode);
        }

        let uuid = &session.identity.session_uuid;
        if uuid.is_empty() {
            return;
        }
        let mut state = self.inner.state.write();
        if let Some(band) = band {
            state
                .bands_by_uuid
                .entry(uuid.clone())
                .or_default()
                .insert(band.to_string());
        }
        if let Some(mode) = mode {
            state
                .modes_by_uuid
                .entry(uuid.clone())
                .or_default()
                .insert(mode.to_string());
        }
    }

    /// Adjust squelch thresholds. Audio sessions only.
    pub fn update_squelch(&self, id: &str, open_db: f32, close_db: f32) -> Result<()> {
        let session = self.expect_kind(id, SessionKind::Audio)?;
        self.inner
            .engine
            .update_squelch(session.ssrc, open_db, close_db)?;
        session.touch();
        Ok(())
    }

    /// Re-center or re-resolve a spectrum session. Zero parameters leave
    /// the respective field unchanged; a bin count change is flagged to
    /// the engine so it can rebuild the FFT.
    pub fn update_spectrum_session(
        &self,
        id: &str,
        center_hz: u64,
        bin_bw_hz: f32,
        bin_count: u32,
    ) -> Result<()> {
        let session = self.expect_kind(id, SessionKind::Spectrum)?;

        let prior = session.spectrum_settings();
        let mut next = prior.clone();
        if center_hz != 0 {
            next.center_hz = center_hz;
        }
        if bin_bw_hz != 0.0 {
            next.bin_bw_hz = bin_bw_hz;
        }
        let bin_count_changed = bin_count != 0 && bin_count != prior.bin_count;
        if bin_count_changed {
            next.bin_count = bin_count;
        }

        session.set_spectrum_settings(next.clone());
        if let Err(e) = self.inner.engine.update_spectrum_channel(
            session.ssrc,
            next.center_hz,
            next.bin_bw_hz,
            next.bin_count,
            bin_count_changed,
        ) {
            session.set_spectrum_settings(prior);
            return Err(e);
        }
        session.touch();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Destruction
    // ------------------------------------------------------------------

    /// Destroy a session. Idempotent at this boundary: only the first
    /// caller succeeds, later ones get `SessionNotFound`.
    ///
    /// After this returns, the SSRC routes nowhere, the transport and the
    /// delivery queue are closed, `done` has fired, and the engine has
    /// been asked to terminate the channel.
    pub fn destroy_session(&self, id: &str) -> Result<()> {
        let session = {
            let state = self.inner.state.read();
            state.by_id.get(id).cloned()
        }
        .ok_or_else(|| MuxError::SessionNotFound(id.to_string()))?;

        if !session.begin_destroy() {
            return Err(MuxError::SessionNotFound(id.to_string()));
        }

        let uuid = session.identity.session_uuid.clone();

        // Death-event decision happens before the indices shrink: the
        // event wants the accumulated band/mode history that the index
        // removal is about to delete.
        let event = {
            let state = self.inner.state.write();
            if !state.by_id.contains_key(id) {
                None
            } else if !uuid.is_empty() && state.uuid_count.get(&uuid).copied() == Some(1) {
                Some(SessionEvent {
                    session_uuid: uuid.clone(),
                    kind: session.kind,
                    client_ip: session.identity.client_ip.clone(),
                    user_agent: session.identity.user_agent.clone(),
                    country_code: session.identity.country_code.clone(),
                    bands: state
                        .bands_by_uuid
                        .get(&uuid)
                        .map(|s| {
                            let mut v: Vec<_> = s.iter().cloned().collect();
                            v.sort();
                            v
                        })
                        .unwrap_or_default(),
                    modes: state
                        .modes_by_uuid
                        .get(&uuid)
                        .map(|s| {
                            let mut v: Vec<_> = s.iter().cloned().collect();
                            v.sort();
                            v
                        })
                        .unwrap_or_default(),
                })
            } else {
                None
            }
        };
        // Emitted between the two lock scopes — the sink may read sessions.
        if let Some(event) = &event {
            self.inner.sink.session_destroyed(event);
        }

        {
            let mut state = self.inner.state.write();
            // Re-check after the unlocked emission; a racing shutdown may
            // have unlinked the session already.
            if state.by_id.remove(id).is_some() {
                state.by_ssrc.remove(&session.ssrc);
                if !uuid.is_empty() {
                    Self::unlink_uuid(&mut state, &session, &uuid, id);
                }
            }
        }

        session.close_transport();
        session.signal_done();
        // Engine failure here is logged, never propagated: the session is
        // already gone locally and the orphan sweep covers the remainder.
        if let Err(e) = self
            .inner
            .engine
            .terminate_channel(&session.channel_name, session.ssrc)
        {
            tracing::warn!(
                session_id = %id,
                ssrc = format_args!("{:#010X}", session.ssrc),
                error = %e,
                "engine terminate failed during destroy"
            );
        }
        session.close_delivery();

        self.inner.metrics.record_session_destroyed();
        tracing::info!(
            session_id = %id,
            ssrc = format_args!("{:#010X}", session.ssrc),
            kind = %session.kind,
            uuid = %uuid,
            "session destroyed"
        );
        Ok(())
    }

    /// Remove a dying session from every UUID-keyed map. Caller holds the
    /// write lock and has already removed it from `by_id`/`by_ssrc`.
    fn unlink_uuid(state: &mut State, session: &Arc<Session>, uuid: &str, id: &str) {
        if let Some(count) = state.uuid_count.get_mut(uuid) {
            *count -= 1;
            if *count == 0 {
                state.uuid_count.remove(uuid);
                state.bands_by_uuid.remove(uuid);
                state.modes_by_uuid.remove(uuid);
            }
        }

        let kind_index = state.kind_index_mut(session.kind);
        if kind_index.get(uuid).map(String::as_str) == Some(id) {
            kind_index.remove(uuid);
        }

        let ip = &session.identity.client_ip;
        if !ip.is_empty() {
            let uuid_still_on_ip = state
                .by_id
                .values()
                .any(|s| s.identity.session_uuid == uuid && s.identity.client_ip == *ip);
            if !uuid_still_on_ip
                && let Some(set) = state.uuids_per_ip.get_mut(ip)
            {
                set.remove(uuid);
                if set.is_empty() {
                    state.uuids_per_ip.remove(ip);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Kicks
    // ------------------------------------------------------------------

    /// Destroy every session of `uuid` and block it from reconnecting for
    /// the configured TTL. Returns how many sessions were destroyed.
    pub fn kick_by_uuid(&self, uuid: &str) -> Result<usize> {
        self.kick_uuid_with_reason(uuid, KickReason::Admin)
    }

    pub(crate) fn kick_uuid_with_reason(&self, uuid: &str, reason: KickReason) -> Result<usize> {
        if uuid.is_empty() {
            return Err(MuxError::Internal("refusing to kick an empty UUID".into()));
        }

        let ids: Vec<String> = {
            let mut state = self.inner.state.write();
            state
                .kicks
                .insert(uuid, self.inner.config.kicked_ttl, Instant::now());
            state
                .by_id
                .values()
                .filter(|s| s.identity.session_uuid == uuid)
                .map(|s| s.id.clone())
                .collect()
        };

        self.inner.metrics.record_kick(reason);
        tracing::info!(
            uuid,
            reason = reason.as_str(),
            sessions = ids.len(),
            "kicking identity"
        );

        let mut destroyed = 0;
        for id in ids {
            if self.destroy_session(&id).is_ok() {
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }

    /// Kick every identity seen from `ip` (forwarded or socket address).
    pub fn kick_by_ip(&self, ip: &str) -> usize {
        let (uuids, anonymous): (HashSet<String>, Vec<String>) = {
            let state = self.inner.state.read();
            let mut uuids = HashSet::new();
            let mut anonymous = Vec::new();
            for session in state.by_id.values() {
                if session.identity.client_ip != ip && session.identity.source_ip != ip {
                    continue;
                }
                if session.identity.session_uuid.is_empty() {
                    anonymous.push(session.id.clone());
                } else {
                    uuids.insert(session.identity.session_uuid.clone());
                }
            }
            (uuids, anonymous)
        };

        let mut destroyed = 0;
        for uuid in &uuids {
            destroyed += self
                .kick_uuid_with_reason(uuid, KickReason::Admin)
                .unwrap_or(0);
        }
        for id in anonymous {
            if self.destroy_session(&id).is_ok() {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Kick every identity whose GeoIP country matches `code`.
    /// Fails when no GeoIP resolver is configured.
    pub fn kick_by_country(&self, code: &str) -> Result<usize> {
        let geoip = self
            .inner
            .geoip
            .clone()
            .ok_or(MuxError::GeoIpUnavailable)?;

        // Country resolution runs outside the lock.
        let candidates: Vec<(String, String, String)> = {
            let state = self.inner.state.read();
            state
                .by_id
                .values()
                .map(|s| {
                    (
                        s.identity.session_uuid.clone(),
                        s.identity.client_ip.clone(),
                        s.identity.country_code.clone(),
                    )
                })
                .collect()
        };

        let mut uuids = HashSet::new();
        for (uuid, ip, country) in candidates {
            let resolved = if country.is_empty() {
                geoip.country_code(&ip)
            } else {
                Some(country)
            };
            if resolved.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(code)) && !uuid.is_empty()
            {
                uuids.insert(uuid);
            }
        }

        let mut destroyed = 0;
        for uuid in &uuids {
            destroyed += self
                .kick_uuid_with_reason(uuid, KickReason::Admin)
                .unwrap_or(0);
        }
        Ok(destroyed)
    }

    // ------------------------------------------------------------------
    // Probes and counts
    // ------------------------------------------------------------------

    /// True while `uuid` has an unexpired kick entry.
    pub fn is_uuid_kicked(&self, uuid: &str) -> bool {
        self.inner
            .state
            .read()
            .kicks
            .is_kicked(uuid, Instant::now())
    }

    /// Cheap handshake-time probe: would a session for `uuid` pass the
    /// global limits right now?
    pub fn can_accept_new_uuid(&self, uuid: &str) -> bool {
        let state = self.inner.state.read();
        if state.kicks.is_kicked(uuid, Instant::now()) {
            return false;
        }
        state.uuid_count.contains_key(uuid)
            || state.uuid_count.len() < self.inner.config.max_sessions
    }

    /// Cheap handshake-time probe for the per-IP limit. An already-known
    /// UUID never counts as new, which is what exempts reconnects.
    pub fn can_accept_new_ip(&self, ip: &str, uuid: &str) -> bool {
        let per_ip = self.inner.config.max_sessions_per_ip;
        if per_ip == 0 || self.inner.bypass.is_bypassed(ip, "") {
            return true;
        }
        let state = self.inner.state.read();
        state
            .uuids_per_ip
            .get(ip)
            .is_none_or(|set| set.contains(uuid) || set.len() < per_ip)
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.read().by_id.len()
    }

    pub fn unique_user_count(&self) -> usize {
        self.inner.state.read().uuid_count.len()
    }

    /// Unique users excluding bypassed and internal identities.
    pub fn non_bypassed_user_count(&self) -> usize {
        let state = self.inner.state.read();
        state
            .uuid_count
            .keys()
            .filter(|uuid| {
                state.by_id.values().any(|s| {
                    s.identity.session_uuid == **uuid
                        && !s.identity.is_internal()
                        && !self
                            .inner
                            .bypass
                            .is_bypassed(&s.identity.client_ip, &s.identity.bypass_password)
                })
            })
            .count()
    }

    /// RTP routing lookup: O(1), read lock only.
    pub fn session_by_ssrc(&self, ssrc: u32) -> Option<Arc<Session>> {
        self.inner.state.read().by_ssrc.get(&ssrc).cloned()
    }

    pub fn session_by_id(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.state.read().by_id.get(id).cloned()
    }

    fn expect_kind(&self, id: &str, kind: SessionKind) -> Result<Arc<Session>> {
        let session = self
            .session_by_id(id)
            .ok_or_else(|| MuxError::SessionNotFound(id.to_string()))?;
        if session.kind != kind {
            return Err(MuxError::WrongKind {
                id: id.to_string(),
                kind: session.kind.as_str(),
            });
        }
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Admin surface
    // ------------------------------------------------------------------

    /// Designate the internal wideband spectrum session whose listing row
    /// carries front-end telemetry.
    pub fn mark_wideband(&self, id: &str) -> Result<()> {
        let mut state = self.inner.state.write();
        let session = state
            .by_id
            .get(id)
            .ok_or_else(|| MuxError::SessionNotFound(id.to_string()))?;
        if session.kind != SessionKind::Spectrum {
            return Err(MuxError::WrongKind {
                id: id.to_string(),
                kind: session.kind.as_str(),
            });
        }
        state.wideband_id = Some(id.to_string());
        Ok(())
    }

    /// Snapshot of every live session for the admin surface.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let (sessions, wideband_id) = {
            let state = self.inner.state.read();
            let mut sessions: Vec<Arc<Session>> = state.by_id.values().cloned().collect();
            sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            (sessions, state.wideband_id.clone())
        };

        let now = Instant::now();
        sessions
            .iter()
            .map(|session| {
                let tuning = session.tuning();
                let spectrum = session.spectrum_settings();
                let frontend = (wideband_id.as_deref() == Some(session.id.as_str()))
                    .then(|| self.inner.engine.frontend_status(session.ssrc).ok())
                    .flatten();
                SessionInfo {
                    id: session.id.clone(),
                    ssrc: format!("{:#010X}", session.ssrc),
                    kind: session.kind,
                    frequency_hz: tuning.frequency_hz,
                    mode: tuning.mode,
                    center_hz: spectrum.center_hz,
                    bin_count: spectrum.bin_count,
                    session_uuid: session.identity.session_uuid.clone(),
                    client_ip: session.identity.client_ip.clone(),
                    source_ip: session.identity.source_ip.clone(),
                    user_agent: session.identity.user_agent.clone(),
                    country_code: session.identity.country_code.clone(),
                    age_secs: now.saturating_duration_since(session.created_at).as_secs(),
                    idle_secs: session.idle_for(now).as_secs(),
                    audio_kbps: session.audio_kbps(now).round() as u64,
                    audio_kbps_avg: session.audio_kbps_average(now).round() as u64,
                    waterfall_kbps: session.waterfall_kbps(now).round() as u64,
                    waterfall_kbps_avg: session.waterfall_kbps_average(now).round() as u64,
                    bypassed: self
                        .inner
                        .bypass
                        .is_bypassed(&session.identity.client_ip, &session.identity.bypass_password),
                    frontend,
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop the background loops and destroy every remaining session.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let sweepers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.sweepers.lock());
        for handle in sweepers {
            let _ = handle.join();
        }

        let ids: Vec<String> = {
            let state = self.inner.state.read();
            state.by_id.keys().cloned().collect()
        };
        for id in &ids {
            let _ = self.destroy_session(id);
        }
        tracing::info!(destroyed = ids.len(), "session manager stopped");
    }
}
