//! Per-client session state.
//!
//! A session is the multiplexer-side handle for one logical receiver held by
//! one client: a demodulator (audio) or FFT (spectrum) channel on the radio
//! engine, identified by SSRC, plus the delivery queue its payloads are
//! pushed onto. It tracks:
//!
//! - The channel name and SSRC handed to the radio engine at creation.
//! - Current tuning (frequency, mode, filter edges) or spectrum settings.
//! - The client identity (UUID, IPs, user agent) admission decisions key on.
//! - Activity and throughput bookkeeping for the timeout sweeps and the
//!   admin surface.
//!
//! ## Lifecycle
//!
//! ```text
//! create  -> engine channel exists, indices populated, queue open
//! update  -> in-place retune, no channel churn
//! destroy -> transport closed, done signalled, engine terminate, queue closed
//! ```
//!
//! Sessions are shared as `Arc<Session>` between the manager's indices and
//! the RTP router; interior mutability via `parking_lot` locks keeps the
//! shared reference immutable. Destruction is decided exactly once through
//! the `destroying` flag — later destroyers see "not found".

pub mod throughput;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};

use crate::engine::{is_wide_iq, mode_channels, mode_sample_rate};
pub use throughput::ThroughputMeter;

/// Whether a session carries demodulated audio or spectrum frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Audio,
    Spectrum,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Spectrum => "spectrum",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Demodulator tuning for an audio session.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuning {
    pub frequency_hz: u64,
    /// Demodulation mode ("usb", "cw", "iq192", ...). Lowercase.
    pub mode: String,
    /// Lower filter edge relative to the carrier.
    pub bw_low_hz: i32,
    /// Upper filter edge relative to the carrier.
    pub bw_high_hz: i32,
    pub sample_rate_hz: i32,
    /// 1 for demodulated audio, 2 for wide-IQ streams.
    pub channels: u8,
}

impl Tuning {
    /// Initial tuning from a create request. A single bandwidth collapses
    /// to symmetric filter edges; the engine applies the mode's real shape.
    pub fn from_request(frequency_hz: u64, mode: &str, bandwidth_hz: u32) -> Self {
        let half = (bandwidth_hz / 2) as i32;
        Self {
            frequency_hz,
            mode: mode.to_ascii_lowercase(),
            bw_low_hz: -half,
            bw_high_hz: half,
            sample_rate_hz: mode_sample_rate(mode),
            channels: mode_channels(mode),
        }
    }
}

/// FFT parameters for a spectrum session.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumSettings {
    pub center_hz: u64,
    pub bin_count: u32,
    pub bin_bw_hz: f32,
}

/// Who is behind a session. Minted client-side except for the country code.
///
/// `session_uuid` groups one client's audio + spectrum sessions; all limits
/// apply per UUID. `client_ip` comes from a forwarded header and may differ
/// from `source_ip` (the socket peer). An empty `client_ip` marks an
/// internal session, exempt from all limits.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub session_uuid: String,
    pub client_ip: String,
    pub source_ip: String,
    pub user_agent: String,
    pub bypass_password: String,
    pub country_code: String,
}

impl ClientIdentity {
    /// Internal sessions are created by the multiplexer itself and carry no
    /// client IP.
    pub fn is_internal(&self) -> bool {
        self.client_ip.is_empty()
    }
}

/// One audio payload as delivered to the session's queue.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    /// Big-endian signed 16-bit PCM, copied out of the receive buffer.
    pub pcm: Vec<u8>,
    /// RTP media clock timestamp from the packet header.
    pub rtp_timestamp: u32,
    /// Wall-clock arrival time at the multiplexer, nanoseconds since the
    /// Unix epoch. Authoritative for GPS-aligned delivery downstream.
    pub ingress_ts_ns: u64,
}

/// One spectrum frame: `bin_count` power values as raw payload bytes.
#[derive(Debug, Clone)]
pub struct SpectrumFrame {
    pub data: Vec<u8>,
    pub rtp_timestamp: u32,
    pub ingress_ts_ns: u64,
}

/// Non-owning handle to the client connection, kept so the manager can
/// force-close the transport on kick. The transport side holds the session
/// *id*, never the `Arc`, so it cannot extend a session's lifetime.
pub trait TransportHandle: Send + Sync {
    fn close(&self);
}

/// Receiver ends handed to the caller of a create operation. The writer
/// task (outside this crate) pulls payloads from the queue and selects on
/// `done`, which disconnects when the session is destroyed.
pub struct SessionHandle {
    pub session: Arc<Session>,
    pub audio: Option<Receiver<AudioPacket>>,
    pub spectrum: Option<Receiver<SpectrumFrame>>,
    pub done: Receiver<()>,
}

/// A single live session.
pub struct Session {
    /// Opaque unique id (16-char hex), minted at creation.
    pub id: String,
    pub kind: SessionKind,
    /// Channel name registered with the radio engine.
    pub channel_name: String,
    /// Routing key for inbound RTP. Unique across live sessions.
    pub ssrc: u32,
    pub identity: ClientIdentity,
    pub created_at: Instant,

    last_active: RwLock<Instant>,
    tuning: RwLock<Tuning>,
    spectrum_settings: RwLock<SpectrumSettings>,
    visited_bands: RwLock<HashSet<String>>,
    visited_modes: RwLock<HashSet<String>>,

    audio_tx: Mutex<Option<Sender<AudioPacket>>>,
    spectrum_tx: Mutex<Option<Sender<SpectrumFrame>>>,
    done_tx: Mutex<Option<Sender<()>>>,

    audio_meter: Mutex<ThroughputMeter>,
    waterfall_meter: Mutex<ThroughputMeter>,
    dropped_payloads: AtomicU64,

    transport: Mutex<Option<Box<dyn TransportHandle>>>,
    destroying: AtomicBool,
}

impl Session {
    /// Create an audio session and its delivery queue.
    pub fn new_audio(
        id: String,
        channel_name: String,
        ssrc: u32,
        identity: ClientIdentity,
        tuning: Tuning,
        queue_capacity: usize,
    ) -> SessionHandle {
        let (audio_tx, audio_rx) = bounded(queue_capacity);
        let (done_tx, done_rx) = bounded(0);
        let session = Arc::new(Self {
            id,
            kind: SessionKind::Audio,
            channel_name,
            ssrc,
            identity,
            created_at: Instant::now(),
            last_active: RwLock::new(Instant::now()),
            tuning: RwLock::new(tuning),
            spectrum_settings: RwLock::new(SpectrumSettings {
                center_hz: 0,
                bin_count: 0,
                bin_bw_hz: 0.0,
            }),
            visited_bands: RwLock::new(HashSet::new()),
            visited_modes: RwLock::new(HashSet::new()),
            audio_tx: Mutex::new(Some(audio_tx)),
            spectrum_tx: Mutex::new(None),
            done_tx: Mutex::new(Some(done_tx)),
            audio_meter: Mutex::new(ThroughputMeter::new()),
            waterfall_meter: Mutex::new(ThroughputMeter::new()),
            dropped_payloads: AtomicU64::new(0),
            transport: Mutex::new(None),
            destroying: AtomicBool::new(false),
        });
        SessionHandle {
            session,
            audio: Some(audio_rx),
            spectrum: None,
            done: done_rx,
        }
    }

    /// Create a spectrum session and its delivery queue.
    pub fn new_spectrum(
        id: String,
        channel_name: String,
        ssrc: u32,
        identity: ClientIdentity,
        settings: SpectrumSettings,
        queue_capacity: usize,
    ) -> SessionHandle {
        let (spectrum_tx, spectrum_rx) = bounded(queue_capacity);
        let (done_tx, done_rx) = bounded(0);
        let session = Arc::new(Self {
            id,
            kind: SessionKind::Spectrum,
            channel_name,
            ssrc,
            identity,
            created_at: Instant::now(),
            last_active: RwLock::new(Instant::now()),
            tuning: RwLock::new(Tuning {
                frequency_hz: 0,
                mode: String::new(),
                bw_low_hz: 0,
                bw_high_hz: 0,
                sample_rate_hz: 0,
                channels: 1,
            }),
            spectrum_settings: RwLock::new(settings),
            visited_bands: RwLock::new(HashSet::new()),
            visited_modes: RwLock::new(HashSet::new()),
            audio_tx: Mutex::new(None),
            spectrum_tx: Mutex::new(Some(spectrum_tx)),
            done_tx: Mutex::new(Some(done_tx)),
            audio_meter: Mutex::new(ThroughputMeter::new()),
            waterfall_meter: Mutex::new(ThroughputMeter::new()),
            dropped_payloads: AtomicU64::new(0),
            transport: Mutex::new(None),
            destroying: AtomicBool::new(false),
        });
        SessionHandle {
            session,
            audio: None,
            spectrum: Some(spectrum_rx),
            done: done_rx,
        }
    }

    /// Mark client activity now. `last_active` never moves backwards.
    pub fn touch(&self) {
        let now = Instant::now();
        let mut last = self.last_active.write();
        if now > *last {
            *last = now;
        }
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.read()
    }

    /// How long the session has been idle as of `now`.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(*self.last_active.read())
    }

    /// Snapshot of the current tuning.
    pub fn tuning(&self) -> Tuning {
        self.tuning.read().clone()
    }

    pub fn set_tuning(&self, tuning: Tuning) {
        *self.tuning.write() = tuning;
    }

    pub fn spectrum_settings(&self) -> SpectrumSettings {
        self.spectrum_settings.read().clone()
    }

    pub fn set_spectrum_settings(&self, settings: SpectrumSettings) {
        *self.spectrum_settings.write() = settings;
    }

    /// Wide-IQ sessions stream raw I/Q and are exempt from the inactivity
    /// timeout.
    pub fn is_wide_iq(&self) -> bool {
        is_wide_iq(&self.tuning.read().mode)
    }

    pub fn record_band(&self, band: &str) {
        self.visited_bands.write().insert(band.to_string());
    }

    pub fn record_mode(&self, mode: &str) {
        self.visited_modes.write().insert(mode.to_string());
    }

    pub fn visited_bands(&self) -> HashSet<String> {
        self.visited_bands.read().clone()
    }

    pub fn visited_modes(&self) -> HashSet<String> {
        self.visited_modes.read().clone()
    }

    /// Try to enqueue an audio payload. Non-blocking: a full or closed
    /// queue drops the payload and returns `false`. Bytes are accounted on
    /// successful enqueue only.
    pub fn enqueue_audio(&self, packet: AudioPacket) -> bool {
        let len = packet.pcm.len() as u64;
        let tx = self.audio_tx.lock();
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        match tx.try_send(packet) {
            Ok(()) => {
                self.add_audio_bytes(len);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped_payloads.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Try to enqueue a spectrum frame. Same drop semantics as audio.
    pub fn enqueue_spectrum(&self, frame: SpectrumFrame) -> bool {
        let len = frame.data.len() as u64;
        let tx = self.spectrum_tx.lock();
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => {
                self.add_waterfall_bytes(len);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped_payloads.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn add_audio_bytes(&self, bytes: u64) {
        self.audio_meter.lock().record(bytes, Instant::now());
    }

    pub fn add_waterfall_bytes(&self, bytes: u64) {
        self.waterfall_meter.lock().record(bytes, Instant::now());
    }

    pub fn audio_bytes(&self) -> u64 {
        self.audio_meter.lock().cumulative()
    }

    pub fn waterfall_bytes(&self) -> u64 {
        self.waterfall_meter.lock().cumulative()
    }

    pub fn audio_kbps(&self, now: Instant) -> f64 {
        self.audio_meter.lock().instantaneous_kbps(now)
    }

    pub fn waterfall_kbps(&self, now: Instant) -> f64 {
        self.waterfall_meter.lock().instantaneous_kbps(now)
    }

    pub fn audio_kbps_average(&self, now: Instant) -> f64 {
        self.audio_meter.lock().average_kbps(self.created_at, now)
    }

    pub fn waterfall_kbps_average(&self, now: Instant) -> f64 {
        self.waterfall_meter
            .lock()
            .average_kbps(self.created_at, now)
    }

    /// Payloads dropped because the delivery queue was full or closed.
    pub fn dropped_payloads(&self) -> u64 {
        self.dropped_payloads.load(Ordering::Relaxed)
    }

    /// Attach the client connection so a kick can close it.
    pub fn set_transport(&self, handle: Box<dyn TransportHandle>) {
        *self.transport.lock() = Some(handle);
    }

    /// Force-close the client connection, if attached. Idempotent.
    pub fn close_transport(&self) {
        if let Some(handle) = self.transport.lock().take() {
            handle.close();
            tracing::debug!(session_id = %self.id, "transport closed");
        }
    }

    /// Publish the one-shot `done` signal: the receiver end disconnects.
    pub fn signal_done(&self) {
        self.done_tx.lock().take();
    }

    /// Close the delivery queue. Dropping the sender disconnects the
    /// writer's receiver; the `Option` guarantees exactly-once.
    pub fn close_delivery(&self) {
        match self.kind {
            SessionKind::Audio => {
                self.audio_tx.lock().take();
            }
            SessionKind::Spectrum => {
                self.spectrum_tx.lock().take();
            }
        }
    }

    /// Claim the right to destroy this session. Only the first caller wins;
    /// everyone else must treat the session as already gone.
    pub(crate) fn begin_destroy(&self) -> bool {
        !self.destroying.swap(true, Ordering::SeqCst)
    }

    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ssrc", &format_args!("{:#010X}", self.ssrc))
            .field("uuid", &self.identity.session_uuid)
            .finish_non_exhaustive()
    }
}
