//! # sdrmux — session and routing plane for a streaming SDR multiplexer
//!
//! Sits between a single radio demodulation daemon (the "radio engine",
//! which produces PCM audio and spectrum frames as RTP over IP multicast)
//! and many concurrent remote listeners, each holding an independent
//! receiver (frequency, mode, filter bandwidth). The engine hosts N
//! demodulator channels in parallel, each identified by an RTP SSRC; this
//! crate mints those channels on demand, routes inbound multicast RTP by
//! SSRC to the right client, enforces fair usage, and tears everything
//! down when clients leave or misbehave.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP | Inbound packet parsing, SSRC routing, SSRC generation rules |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Embedding app (WebSocket front door, admin)  │
//! ├───────────────────────────────────────────────┤
//! │  SessionManager — indices, admission, sweeps  │
//! │  Session        — tuning, queue, counters     │
//! ├───────────────────────────────────────────────┤
//! │  RtpReceiver    — multicast in, SSRC demux    │
//! │  ControlClient  — engine TLV control out      │
//! ├───────────────────────────────────────────────┤
//! │  ActivitySink / Metrics — events, counters    │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sdrmux::{ControlClient, MuxConfig, RtpReceiver, SessionManager};
//!
//! let config = MuxConfig::default();
//! let engine = Arc::new(ControlClient::new("127.0.0.1:5005".parse().unwrap()).unwrap());
//! let manager = SessionManager::new(config, engine);
//! manager.start_background();
//!
//! let mut receiver = RtpReceiver::new(manager.clone());
//! receiver.start().unwrap();
//!
//! // Handshake path: admission-check, then mint a receiver per client.
//! // let handle = manager.create_audio_session(14_074_000, "usb", 2700, identity)?;
//! ```
//!
//! ## Crate layout
//!
//! - [`manager`] — [`SessionManager`]: cross-indexed session maps,
//!   admission limits, kicks, background sweeps, admin snapshot.
//! - [`session`] — [`Session`] state, delivery queues, throughput meters.
//! - [`rtp`] — RFC 3550 parsing and the multicast [`RtpReceiver`].
//! - [`engine`] — [`RadioEngine`] trait and the UDP/TLV [`ControlClient`].
//! - [`activity`] — structured birth/death events and process counters.
//! - [`bands`] — frequency → amateur band classification.
//! - [`config`] — [`MuxConfig`] and friends.
//! - [`error`] — [`MuxError`] enum and [`Result`] alias.

pub mod activity;
pub mod bands;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod rtp;
pub mod session;

pub use activity::{ActivitySink, KickReason, Metrics, MetricsSnapshot, SessionEvent};
pub use config::{BypassEntry, MuxConfig, SpectrumDefaults};
pub use engine::{ControlClient, EngineChannel, FrontendStatus, RadioEngine};
pub use error::{MuxError, Result};
pub use manager::{GeoIp, SessionInfo, SessionManager};
pub use rtp::{RtpPacket, RtpReceiver};
pub use session::{
    AudioPacket, ClientIdentity, Session, SessionHandle, SessionKind, SpectrumFrame,
    SpectrumSettings, TransportHandle, Tuning,
};
