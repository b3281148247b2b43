//! UDP/TLV control client for the radio engine.
//!
//! Channel control commands are tag-length-value records in a single UDP
//! datagram: `[tag u8][length u8][payload, big-endian]`, terminated by a
//! zero tag. Every command carries a random `COMMAND_TAG`; the engine's
//! status reply echoes it, which is how replies are matched to commands on
//! a shared socket.
//!
//! Two sentinels drive channel teardown (see the engine protocol notes in
//! [`super`]): `DEMOD_TYPE = -1` terminates a channel outright, and
//! `FREQUENCY_HZ = 0` merely disables it.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngExt;

use crate::engine::{EngineChannel, FrontendStatus, RadioEngine, sanitize_float};
use crate::error::{MuxError, Result};

/// Field tags of the control record.
pub mod tag {
    pub const EOL: u8 = 0x00;
    pub const CHANNEL_NAME: u8 = 0x01;
    pub const SSRC: u8 = 0x02;
    pub const DEMOD_TYPE: u8 = 0x03;
    pub const FREQUENCY_HZ: u8 = 0x04;
    pub const SAMPLE_RATE_HZ: u8 = 0x05;
    pub const FILTER_LOW_HZ: u8 = 0x06;
    pub const FILTER_HIGH_HZ: u8 = 0x07;
    pub const SQUELCH_OPEN_DB: u8 = 0x08;
    pub const SQUELCH_CLOSE_DB: u8 = 0x09;
    pub const BIN_COUNT: u8 = 0x0A;
    pub const BIN_BW_HZ: u8 = 0x0B;
    pub const COMMAND_TAG: u8 = 0x0C;
    pub const ACK: u8 = 0x0D;
    pub const ERROR_TEXT: u8 = 0x0E;
    pub const LIST_CHANNELS: u8 = 0x0F;
    pub const STATUS_REQUEST: u8 = 0x10;
    pub const LNA_GAIN_DB: u8 = 0x11;
    pub const MIXER_GAIN_DB: u8 = 0x12;
    pub const IF_GAIN_DB: u8 = 0x13;
    pub const IF_POWER_DB: u8 = 0x14;
    pub const AD_OVERRANGES: u8 = 0x15;
    pub const SAMPLES_SINCE_OVERRANGE: u8 = 0x16;
}

/// Demod-type sentinel meaning "terminate the channel".
pub const DEMOD_TERMINATE: i32 = -1;

const DEMOD_LINEAR: i32 = 0;
const DEMOD_FM: i32 = 1;
const DEMOD_WFM: i32 = 2;
const DEMOD_SPECTRUM: i32 = 3;

/// Engine demodulator type for a mode string.
pub fn demod_type_for_mode(mode: &str) -> i32 {
    match mode.to_ascii_lowercase().as_str() {
        "fm" | "nfm" | "pm" => DEMOD_FM,
        "wfm" => DEMOD_WFM,
        "spectrum" => DEMOD_SPECTRUM,
        _ => DEMOD_LINEAR,
    }
}

/// TLV record builder.
#[derive(Debug, Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&mut self, tag: u8, payload: &[u8]) -> &mut Self {
        debug_assert!(payload.len() <= u8::MAX as usize);
        self.buf.push(tag);
        self.buf.push(payload.len() as u8);
        self.buf.extend_from_slice(payload);
        self
    }

    pub fn put_u8(&mut self, tag: u8, value: u8) -> &mut Self {
        self.put(tag, &[value])
    }

    pub fn put_u32(&mut self, tag: u8, value: u32) -> &mut Self {
        self.put(tag, &value.to_be_bytes())
    }

    pub fn put_u64(&mut self, tag: u8, value: u64) -> &mut Self {
        self.put(tag, &value.to_be_bytes())
    }

    pub fn put_i32(&mut self, tag: u8, value: i32) -> &mut Self {
        self.put(tag, &value.to_be_bytes())
    }

    pub fn put_f32(&mut self, tag: u8, value: f32) -> &mut Self {
        self.put(tag, &value.to_be_bytes())
    }

    /// String payloads are capped at 255 bytes on the wire.
    pub fn put_str(&mut self, tag: u8, value: &str) -> &mut Self {
        let bytes = value.as_bytes();
        let end = bytes.len().min(u8::MAX as usize);
        self.put(tag, &bytes[..end])
    }

    /// Terminate the record and return the datagram.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(tag::EOL);
        self.buf
    }
}

/// Iterator over the TLV fields of one datagram. Stops at the zero tag or
/// at any truncated field.
pub struct TlvReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let t = *self.buf.get(self.pos)?;
        if t == tag::EOL {
            return None;
        }
        let len = *self.buf.get(self.pos + 1)? as usize;
        let start = self.pos + 2;
        let payload = self.buf.get(start..start + len)?;
        self.pos = start + len;
        Some((t, payload))
    }
}

pub fn decode_u32(payload: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(payload.try_into().ok()?))
}

pub fn decode_u64(payload: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(payload.try_into().ok()?))
}

pub fn decode_f32(payload: &[u8]) -> Option<f32> {
    Some(f32::from_be_bytes(payload.try_into().ok()?))
}

/// UDP control client.
///
/// One socket, one in-flight command at a time: the exchange lock
/// serializes transactions so a reply cannot be consumed by the wrong
/// caller. Replies that do not echo the expected command tag are ignored
/// (they belong to status broadcasts or co-tenant pollers).
pub struct ControlClient {
    socket: UdpSocket,
    timeout: Duration,
    next_tag: AtomicU32,
    exchange: Mutex<()>,
}

/// Poll granularity of the reply wait loop.
const RECV_SLICE: Duration = Duration::from_millis(100);

/// Default control exchange timeout.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// How long after the last channel-list reply the enumeration is
/// considered complete.
const LIST_QUIET_PERIOD: Duration = Duration::from_millis(300);

impl ControlClient {
    /// Connect to the engine's control endpoint.
    pub fn new(control_addr: SocketAddr) -> Result<Self> {
        Self::with_timeout(control_addr, DEFAULT_CONTROL_TIMEOUT)
    }

    pub fn with_timeout(control_addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(control_addr)?;
        socket.set_read_timeout(Some(RECV_SLICE))?;
        tracing::info!(engine = %control_addr, "control client connected");
        Ok(Self {
            socket,
            timeout,
            next_tag: AtomicU32::new(rand::rng().random::<u32>()),
            exchange: Mutex::new(()),
        })
    }

    /// Send a command and wait for the reply echoing its command tag.
    /// Returns the reply's decoded fields.
    fn transact(&self, mut writer: TlvWriter) -> Result<Vec<(u8, Vec<u8>)>> {
        let _guard = self.exchange.lock();

        let command_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        writer.put_u32(tag::COMMAND_TAG, command_tag);
        let datagram = writer.finish();

        self.socket
            .send(&datagram)
            .map_err(|e| MuxError::EngineUnreachable(e.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 2048];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    let fields: Vec<(u8, Vec<u8>)> = TlvReader::new(&buf[..n])
                        .map(|(t, p)| (t, p.to_vec()))
                        .collect();
                    let echoed = fields
                        .iter()
                        .find(|(t, _)| *t == tag::COMMAND_TAG)
                        .and_then(|(_, p)| decode_u32(p));
                    if echoed != Some(command_tag) {
                        continue;
                    }
                    return Self::check_ack(fields);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return Err(MuxError::EngineTimeout);
                    }
                }
                Err(e) => return Err(MuxError::EngineUnreachable(e.to_string())),
            }
        }
    }

    fn check_ack(fields: Vec<(u8, Vec<u8>)>) -> Result<Vec<(u8, Vec<u8>)>> {
        let acked = fields
            .iter()
            .find(|(t, _)| *t == tag::ACK)
            .map(|(_, p)| p.first().copied() == Some(1));
        match acked {
            Some(true) | None => Ok(fields),
            Some(false) => {
                let reason = fields
                    .iter()
                    .find(|(t, _)| *t == tag::ERROR_TEXT)
                    .map(|(_, p)| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_else(|| "command rejected".to_string());
                Err(MuxError::EngineRejected(reason))
            }
        }
    }
}

impl RadioEngine for ControlClient {
    fn create_channel(
        &self,
        name: &str,
        frequency_hz: u64,
        mode: &str,
        sample_rate_hz: i32,
        ssrc: u32,
        bandwidth_hz: u32,
    ) -> Result<()> {
        let mut w = TlvWriter::new();
        w.put_str(tag::CHANNEL_NAME, name)
            .put_u32(tag::SSRC, ssrc)
            .put_i32(tag::DEMOD_TYPE, demod_type_for_mode(mode))
            .put_u64(tag::FREQUENCY_HZ, frequency_hz)
            .put_i32(tag::SAMPLE_RATE_HZ, sample_rate_hz);
        if bandwidth_hz != 0 {
            let half = (bandwidth_hz / 2) as i32;
            w.put_i32(tag::FILTER_LOW_HZ, -half)
                .put_i32(tag::FILTER_HIGH_HZ, half);
        }
        tracing::debug!(
            name,
            ssrc = format_args!("{:#010X}", ssrc),
            frequency_hz,
            mode,
            bandwidth_hz,
            "engine create channel"
        );
        self.transact(w).map(drop)
    }

    fn create_spectrum_channel(
        &self,
        name: &str,
        center_hz: u64,
        bin_count: u32,
        bin_bw_hz: f32,
        ssrc: u32,
    ) -> Result<()> {
        let mut w = TlvWriter::new();
        w.put_str(tag::CHANNEL_NAME, name)
            .put_u32(tag::SSRC, ssrc)
            .put_i32(tag::DEMOD_TYPE, DEMOD_SPECTRUM)
            .put_u64(tag::FREQUENCY_HZ, center_hz)
            .put_u32(tag::BIN_COUNT, bin_count)
            .put_f32(tag::BIN_BW_HZ, bin_bw_hz);
        tracing::debug!(
            name,
            ssrc = format_args!("{:#010X}", ssrc),
            center_hz,
            bin_count,
            "engine create spectrum channel"
        );
        self.transact(w).map(drop)
    }

    fn update_channel(
        &self,
        ssrc: u32,
        frequency_hz: u64,
        mode: &str,
        bw_low_hz: i32,
        bw_high_hz: i32,
        send_bw: bool,
    ) -> Result<()> {
        let mut w = TlvWriter::new();
        w.put_u32(tag::SSRC, ssrc)
            .put_u64(tag::FREQUENCY_HZ, frequency_hz);
        // An absent mode keeps the engine from reloading its preset.
        if !mode.is_empty() {
            w.put_i32(tag::DEMOD_TYPE, demod_type_for_mode(mode));
        }
        if send_bw {
            w.put_i32(tag::FILTER_LOW_HZ, bw_low_hz)
                .put_i32(tag::FILTER_HIGH_HZ, bw_high_hz);
        }
        self.transact(w).map(drop)
    }

    fn update_spectrum_channel(
        &self,
        ssrc: u32,
        center_hz: u64,
        bin_bw_hz: f32,
        bin_count: u32,
        bin_count_changed: bool,
    ) -> Result<()> {
        let mut w = TlvWriter::new();
        w.put_u32(tag::SSRC, ssrc)
            .put_u64(tag::FREQUENCY_HZ, center_hz)
            .put_f32(tag::BIN_BW_HZ, bin_bw_hz);
        if bin_count_changed {
            w.put_u32(tag::BIN_COUNT, bin_count);
        }
        self.transact(w).map(drop)
    }

    fn update_squelch(&self, ssrc: u32, open_db: f32, close_db: f32) -> Result<()> {
        let mut w = TlvWriter::new();
        w.put_u32(tag::SSRC, ssrc)
            .put_f32(tag::SQUELCH_OPEN_DB, open_db)
            .put_f32(tag::SQUELCH_CLOSE_DB, close_db);
        self.transact(w).map(drop)
    }

    fn terminate_channel(&self, name: &str, ssrc: u32) -> Result<()> {
        let mut w = TlvWriter::new();
        w.put_str(tag::CHANNEL_NAME, name)
            .put_u32(tag::SSRC, ssrc)
            .put_i32(tag::DEMOD_TYPE, DEMOD_TERMINATE);
        tracing::debug!(
            name,
            ssrc = format_args!("{:#010X}", ssrc),
            "engine terminate channel"
        );
        self.transact(w).map(drop)
    }

    fn disable_channel(&self, name: &str, ssrc: u32) -> Result<()> {
        let mut w = TlvWriter::new();
        w.put_str(tag::CHANNEL_NAME, name)
            .put_u32(tag::SSRC, ssrc)
            .put_u64(tag::FREQUENCY_HZ, 0);
        tracing::debug!(
            name,
            ssrc = format_args!("{:#010X}", ssrc),
            "engine disable channel"
        );
        self.transact(w).map(drop)
    }

    fn active_channels(&self) -> Result<Vec<EngineChannel>> {
        let _guard = self.exchange.lock();

        let command_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let mut w = TlvWriter::new();
        w.put_u8(tag::LIST_CHANNELS, 1)
            .put_u32(tag::COMMAND_TAG, command_tag);
        self.socket
            .send(&w.finish())
            .map_err(|e| MuxError::EngineUnreachable(e.to_string()))?;

        // The engine streams the channel list over one or more datagrams
        // with no explicit terminator; a quiet period ends the collection.
        let deadline = Instant::now() + self.timeout;
        let mut last_reply = None::<Instant>;
        let mut channels = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    let fields: Vec<(u8, &[u8])> = TlvReader::new(&buf[..n]).collect();
                    let echoed = fields
                        .iter()
                        .find(|(t, _)| *t == tag::COMMAND_TAG)
                        .and_then(|(_, p)| decode_u32(p));
                    if echoed != Some(command_tag) {
                        continue;
                    }
                    last_reply = Some(Instant::now());
                    let mut name = String::new();
                    for (t, payload) in fields {
                        match t {
                            tag::CHANNEL_NAME => {
                                name = String::from_utf8_lossy(payload).into_owned();
                            }
                            tag::SSRC => {
                                if let Some(ssrc) = decode_u32(payload) {
                                    channels.push(EngineChannel {
                                        name: std::mem::take(&mut name),
                                        ssrc,
                                    });
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    let now = Instant::now();
                    match last_reply {
                        Some(t) if now.duration_since(t) >= LIST_QUIET_PERIOD => {
                            return Ok(channels);
                        }
                        None if now >= deadline => return Err(MuxError::EngineTimeout),
                        _ if now >= deadline => return Ok(channels),
                        _ => {}
                    }
                }
                Err(e) => return Err(MuxError::EngineUnreachable(e.to_string())),
            }
        }
    }

    fn frontend_status(&self, ssrc: u32) -> Result<FrontendStatus> {
        let mut w = TlvWriter::new();
        w.put_u8(tag::STATUS_REQUEST, 1).put_u32(tag::SSRC, ssrc);
        let fields = self.transact(w).map_err(|e| match e {
            MuxError::EngineRejected(_) => MuxError::InvalidSsrc(ssrc),
            other => other,
        })?;

        let mut status = FrontendStatus::default();
        for (t, payload) in &fields {
            match *t {
                tag::LNA_GAIN_DB => {
                    status.lna_gain_db = decode_f32(payload).and_then(|v| sanitize_float(v as f64));
                }
                tag::MIXER_GAIN_DB => {
                    status.mixer_gain_db =
                        decode_f32(payload).and_then(|v| sanitize_float(v as f64));
                }
                tag::IF_GAIN_DB => {
                    status.if_gain_db = decode_f32(payload).and_then(|v| sanitize_float(v as f64));
                }
                tag::IF_POWER_DB => {
                    status.if_power_db = decode_f32(payload).and_then(|v| sanitize_float(v as f64));
                }
                tag::AD_OVERRANGES => status.ad_overranges = decode_u64(payload),
                tag::SAMPLES_SINCE_OVERRANGE => {
                    status.samples_since_overrange = decode_u64(payload);
                }
                _ => {}
            }
        }
        Ok(status)
    }
}
