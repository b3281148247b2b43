//! Radio engine control surface.
//!
//! The engine is a separate daemon hosting N demodulator channels in
//! parallel; the multiplexer mints channels on demand and retunes them in
//! place. This module defines the [`RadioEngine`] trait the session manager
//! programs against, the mode preset table, and the sanitized front-end
//! telemetry type. The concrete UDP/TLV client lives in [`control`].
//!
//! ## Channel lifecycle on the engine
//!
//! | Operation | Wire effect |
//! |-----------|-------------|
//! | create    | new demod/FFT channel keyed by caller-supplied SSRC |
//! | update    | in-place retune, no audio gap |
//! | terminate | demod-type sentinel `-1`, channel fully reclaimed |
//! | disable   | frequency `0`, channel muted but kept (orphan sweep) |

pub mod control;

pub use control::ControlClient;

use crate::error::Result;

/// Raw I/Q streaming modes. The engine owns their bandwidth presets, and
/// the inactivity sweep leaves them alone.
pub const WIDE_IQ_MODES: [&str; 4] = ["iq48", "iq96", "iq192", "iq384"];

/// Whether `mode` is a wide-IQ streaming mode.
pub fn is_wide_iq(mode: &str) -> bool {
    WIDE_IQ_MODES
        .iter()
        .any(|m| mode.eq_ignore_ascii_case(m))
}

/// Output sample rate for a demodulation mode.
///
/// Wide-IQ modes stream at their nominal rate; every demodulated mode
/// produces 12 kHz mono audio.
pub fn mode_sample_rate(mode: &str) -> i32 {
    match mode.to_ascii_lowercase().as_str() {
        "iq48" => 48_000,
        "iq96" => 96_000,
        "iq192" => 192_000,
        "iq384" => 384_000,
        _ => 12_000,
    }
}

/// Channel count for a mode: I/Q streams are stereo, audio is mono.
pub fn mode_channels(mode: &str) -> u8 {
    if is_wide_iq(mode) { 2 } else { 1 }
}

/// One live channel as enumerated by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineChannel {
    pub name: String,
    pub ssrc: u32,
}

/// RF front-end telemetry snapshot.
///
/// The engine reports floats that can be NaN or infinite while the
/// front end settles; those are sanitized to `None` before they reach
/// any admin consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontendStatus {
    pub lna_gain_db: Option<f64>,
    pub mixer_gain_db: Option<f64>,
    pub if_gain_db: Option<f64>,
    pub if_power_db: Option<f64>,
    pub ad_overranges: Option<u64>,
    pub samples_since_overrange: Option<u64>,
}

/// Report a float only when it is finite.
pub(crate) fn sanitize_float(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Control surface the session manager drives.
///
/// All operations complete (or fail) after the control exchange; none of
/// them block on audio arrival. Failures map to the engine variants of
/// [`MuxError`](crate::MuxError): `EngineUnreachable`, `EngineTimeout`,
/// `EngineRejected`, `InvalidSsrc`. Retry policy is the caller's.
///
/// Implementations must be callable from multiple threads; the manager
/// never holds its own lock across a call.
pub trait RadioEngine: Send + Sync {
    /// Register a new demod channel with a caller-supplied SSRC.
    ///
    /// A `bandwidth_hz` of zero tells the engine to apply its preset for
    /// `mode` (used for wide-IQ modes).
    fn create_channel(
        &self,
        name: &str,
        frequency_hz: u64,
        mode: &str,
        sample_rate_hz: i32,
        ssrc: u32,
        bandwidth_hz: u32,
    ) -> Result<()>;

    /// Register a new spectrum (FFT) channel.
    fn create_spectrum_channel(
        &self,
        name: &str,
        center_hz: u64,
        bin_count: u32,
        bin_bw_hz: f32,
        ssrc: u32,
    ) -> Result<()>;

    /// Retune a channel in place.
    ///
    /// An empty `mode` is not sent at all, which avoids an engine-side
    /// preset reload. When `send_bw` is false the filter edges are omitted.
    fn update_channel(
        &self,
        ssrc: u32,
        frequency_hz: u64,
        mode: &str,
        bw_low_hz: i32,
        bw_high_hz: i32,
        send_bw: bool,
    ) -> Result<()>;

    /// Re-center or re-resolve a spectrum channel. `bin_count_changed`
    /// tells the engine whether the FFT must be rebuilt.
    fn update_spectrum_channel(
        &self,
        ssrc: u32,
        center_hz: u64,
        bin_bw_hz: f32,
        bin_count: u32,
        bin_count_changed: bool,
    ) -> Result<()>;

    /// Set squelch open/close thresholds in dB.
    fn update_squelch(&self, ssrc: u32, open_db: f32, close_db: f32) -> Result<()>;

    /// Strongly delete a channel so the engine reclaims its resources.
    fn terminate_channel(&self, name: &str, ssrc: u32) -> Result<()>;

    /// Soft-disable a channel by zeroing its frequency. Used by the orphan
    /// sweep, where the multiplexer does not own the channel record.
    fn disable_channel(&self, name: &str, ssrc: u32) -> Result<()>;

    /// Enumerate the channels currently live on the engine.
    fn active_channels(&self) -> Result<Vec<EngineChannel>>;

    /// Snapshot of RF front-end telemetry for the given channel.
    fn frontend_status(&self, ssrc: u32) -> Result<FrontendStatus>;
}
