//! End-to-end session-plane scenarios against a scripted engine.
//!
//! Covers the full create → route → destroy flow, admission limits,
//! reconnect replacement, kicks, the timeout sweeps, and engine-failure
//! rollback, all driven through the public API with a recording engine
//! standing in for the radio daemon.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use sdrmux::rtp::receiver::route_datagram;
use sdrmux::{
    ActivitySink, BypassEntry, ClientIdentity, EngineChannel, FrontendStatus, GeoIp, MuxConfig,
    MuxError, RadioEngine, SessionEvent, SessionKind, SessionManager, TransportHandle,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Create {
        ssrc: u32,
        frequency_hz: u64,
        mode: String,
        bandwidth_hz: u32,
    },
    CreateSpectrum {
        ssrc: u32,
    },
    Update {
        ssrc: u32,
        frequency_hz: u64,
    },
    Terminate {
        ssrc: u32,
    },
    Disable {
        ssrc: u32,
    },
}

/// Engine double: records every control call, can be told to reject the
/// next create/update, and serves a scripted channel list.
#[derive(Default)]
struct RecordingEngine {
    calls: Mutex<Vec<Call>>,
    fail_next_create: AtomicBool,
    fail_next_update: AtomicBool,
    channels: Mutex<Vec<EngineChannel>>,
}

impl RecordingEngine {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn terminates(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Terminate { ssrc } => Some(ssrc),
                _ => None,
            })
            .collect()
    }

    fn disables(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Disable { ssrc } => Some(ssrc),
                _ => None,
            })
            .collect()
    }
}

impl RadioEngine for RecordingEngine {
    fn create_channel(
        &self,
        _name: &str,
        frequency_hz: u64,
        mode: &str,
        _sample_rate_hz: i32,
        ssrc: u32,
        bandwidth_hz: u32,
    ) -> sdrmux::Result<()> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(MuxError::EngineRejected("scripted create failure".into()));
        }
        self.calls.lock().unwrap().push(Call::Create {
            ssrc,
            frequency_hz,
            mode: mode.to_string(),
            bandwidth_hz,
        });
        Ok(())
    }

    fn create_spectrum_channel(
        &self,
        _name: &str,
        _center_hz: u64,
        _bin_count: u32,
        _bin_bw_hz: f32,
        ssrc: u32,
    ) -> sdrmux::Result<()> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(MuxError::EngineRejected("scripted create failure".into()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(Call::CreateSpectrum { ssrc });
        Ok(())
    }

    fn update_channel(
        &self,
        ssrc: u32,
        frequency_hz: u64,
        _mode: &str,
        _bw_low_hz: i32,
        _bw_high_hz: i32,
        _send_bw: bool,
    ) -> sdrmux::Result<()> {
        if self.fail_next_update.swap(false, Ordering::SeqCst) {
            return Err(MuxError::EngineRejected("scripted update failure".into()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(Call::Update { ssrc, frequency_hz });
        Ok(())
    }

    fn update_spectrum_channel(
        &self,
        ssrc: u32,
        _center_hz: u64,
        _bin_bw_hz: f32,
        _bin_count: u32,
        _bin_count_changed: bool,
    ) -> sdrmux::Result<()> {
        if self.fail_next_update.swap(false, Ordering::SeqCst) {
            return Err(MuxError::EngineRejected("scripted update failure".into()));
        }
        self.calls
            .lock()
            .unwrap()
            .push(Call::Update {
                ssrc,
                frequency_hz: 0,
            });
        Ok(())
    }

    fn update_squelch(&self, _ssrc: u32, _open_db: f32, _close_db: f32) -> sdrmux::Result<()> {
        Ok(())
    }

    fn terminate_channel(&self, _name: &str, ssrc: u32) -> sdrmux::Result<()> {
        self.calls.lock().unwrap().push(Call::Terminate { ssrc });
        Ok(())
    }

    fn disable_channel(&self, _name: &str, ssrc: u32) -> sdrmux::Result<()> {
        self.calls.lock().unwrap().push(Call::Disable { ssrc });
        Ok(())
    }

    fn active_channels(&self) -> sdrmux::Result<Vec<EngineChannel>> {
        Ok(self.channels.lock().unwrap().clone())
    }

    fn frontend_status(&self, _ssrc: u32) -> sdrmux::Result<FrontendStatus> {
        Ok(FrontendStatus::default())
    }
}

/// Sink double: collects emitted events.
#[derive(Default)]
struct RecordingSink {
    created: Mutex<Vec<SessionEvent>>,
    destroyed: Mutex<Vec<SessionEvent>>,
}

impl ActivitySink for RecordingSink {
    fn session_created(&self, event: &SessionEvent) {
        self.created.lock().unwrap().push(event.clone());
    }

    fn session_destroyed(&self, event: &SessionEvent) {
        self.destroyed.lock().unwrap().push(event.clone());
    }
}

struct ClosableTransport(Arc<AtomicBool>);

impl TransportHandle for ClosableTransport {
    fn close(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct StubGeoIp;

impl GeoIp for StubGeoIp {
    fn country_code(&self, ip: &str) -> Option<String> {
        match ip {
            "5.6.7.8" => Some("DE".to_string()),
            _ => Some("US".to_string()),
        }
    }
}

fn setup(config: MuxConfig) -> (SessionManager, Arc<RecordingEngine>, Arc<RecordingSink>) {
    let engine = Arc::new(RecordingEngine::default());
    let sink = Arc::new(RecordingSink::default());
    let manager = SessionManager::with_collaborators(
        config,
        engine.clone(),
        sink.clone(),
        Arc::new(sdrmux::Metrics::new()),
        Some(Arc::new(StubGeoIp)),
    );
    (manager, engine, sink)
}

fn identity(uuid: &str, ip: &str) -> ClientIdentity {
    ClientIdentity {
        session_uuid: uuid.to_string(),
        client_ip: ip.to_string(),
        source_ip: ip.to_string(),
        user_agent: "scenario-test".to_string(),
        ..Default::default()
    }
}

fn rtp_datagram(ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf[0] = 2 << 6;
    buf[1] = 97;
    buf[2..4].copy_from_slice(&1u16.to_be_bytes());
    buf[4..8].copy_from_slice(&960u32.to_be_bytes());
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[test]
fn create_route_destroy_audio_session() {
    let (manager, engine, _) = setup(MuxConfig::default());
    let handle = manager
        .create_audio_session(14_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();
    let ssrc = handle.session.ssrc;

    // Engine saw the create with the session's SSRC.
    assert!(engine.calls().iter().any(|c| matches!(
        c,
        Call::Create { ssrc: s, frequency_hz: 14_074_000, .. } if *s == ssrc
    )));

    // An inbound datagram with that SSRC lands on the delivery queue.
    route_datagram(
        &manager,
        SessionKind::Audio,
        &rtp_datagram(ssrc, b"\x01\x02\x03\x04"),
        42,
    );
    let rx = handle.audio.as_ref().unwrap();
    let packet = rx.try_recv().expect("payload routed to session");
    assert_eq!(packet.pcm, b"\x01\x02\x03\x04");
    assert_eq!(packet.rtp_timestamp, 960);
    assert_eq!(packet.ingress_ts_ns, 42);

    manager.destroy_session(&handle.session.id).unwrap();
    assert_eq!(engine.terminates(), vec![ssrc]);
    assert!(manager.session_by_ssrc(ssrc).is_none());
    // Queue is closed: nothing buffered, then disconnected.
    assert!(rx.try_recv().is_err());

    // Packets for the dead SSRC no longer route anywhere.
    route_datagram(&manager, SessionKind::Audio, &rtp_datagram(ssrc, b"x"), 43);
    assert_eq!(manager.metrics().snapshot().rtp_unknown_ssrc, 1);
}

#[test]
fn foreign_ssrc_dropped_silently() {
    let (manager, _, _) = setup(MuxConfig::default());
    route_datagram(
        &manager,
        SessionKind::Audio,
        &rtp_datagram(0xDEAD_BEEF, b"zz"),
        0,
    );
    let snap = manager.metrics().snapshot();
    assert_eq!(snap.rtp_unknown_ssrc, 1);
    assert_eq!(snap.rtp_routed, 0);
}

#[test]
fn ssrc_space_survives_churn() {
    let (manager, _, _) = setup(MuxConfig {
        max_sessions: 500,
        ..MuxConfig::default()
    });
    for i in 0..200 {
        let handle = manager
            .create_audio_session(
                7_074_000,
                "usb",
                2700,
                identity(&format!("u{i}"), "1.2.3.4"),
            )
            .unwrap_or_else(|e| panic!("create {i} failed: {e}"));
        manager.destroy_session(&handle.session.id).unwrap();
    }
    assert_eq!(manager.session_count(), 0);
}

#[test]
fn max_users_counts_uuids_not_sessions() {
    let (manager, _, _) = setup(MuxConfig {
        max_sessions: 2,
        ..MuxConfig::default()
    });

    let u1_audio = manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.1.1.1"))
        .unwrap();
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u2", "2.2.2.2"))
        .unwrap();

    // Third unique UUID bounces.
    assert!(matches!(
        manager.create_audio_session(7_074_000, "usb", 2700, identity("u3", "3.3.3.3")),
        Err(MuxError::MaxUsers)
    ));

    // A second session for a known UUID is free.
    let u1_spectrum = manager
        .create_spectrum_session(identity("u1", "1.1.1.1"))
        .unwrap();
    assert_eq!(manager.unique_user_count(), 2);

    // u1 keeps its slot while any of its sessions lives.
    manager.destroy_session(&u1_audio.session.id).unwrap();
    assert_eq!(manager.unique_user_count(), 2);
    assert!(matches!(
        manager.create_audio_session(7_074_000, "usb", 2700, identity("u3", "3.3.3.3")),
        Err(MuxError::MaxUsers)
    ));

    // Last u1 session gone: the slot frees up.
    manager.destroy_session(&u1_spectrum.session.id).unwrap();
    assert_eq!(manager.unique_user_count(), 1);
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u3", "3.3.3.3"))
        .unwrap();
}

#[test]
fn audio_reconnect_replaces_old_session() {
    let (manager, engine, _) = setup(MuxConfig::default());

    let first = manager
        .create_audio_session(14_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();
    let first_ssrc = first.session.ssrc;

    let second = manager
        .create_audio_session(14_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();

    // Exactly the first session's channel was terminated.
    assert_eq!(engine.terminates(), vec![first_ssrc]);
    // One UUID, one live session, and it is the new one.
    assert_eq!(manager.unique_user_count(), 1);
    assert_eq!(manager.session_count(), 1);
    assert!(manager.session_by_id(&second.session.id).is_some());
    assert!(manager.session_by_id(&first.session.id).is_none());
}

#[test]
fn per_ip_limit_exempts_reconnects() {
    let (manager, _, _) = setup(MuxConfig {
        max_sessions_per_ip: 1,
        ..MuxConfig::default()
    });

    manager
        .create_spectrum_session(identity("u1", "9.9.9.9"))
        .unwrap();

    // A second UUID from the same IP bounces.
    assert!(matches!(
        manager.create_spectrum_session(identity("u2", "9.9.9.9")),
        Err(MuxError::MaxUsersPerIp(ip)) if ip == "9.9.9.9"
    ));

    // The same UUID reconnecting is a replacement, not a new user.
    let reconnect = manager
        .create_spectrum_session(identity("u1", "9.9.9.9"))
        .unwrap();
    assert_eq!(manager.session_count(), 1);
    assert!(manager.session_by_id(&reconnect.session.id).is_some());

    // The probe agrees with the real admission path.
    assert!(manager.can_accept_new_ip("9.9.9.9", "u1"));
    assert!(!manager.can_accept_new_ip("9.9.9.9", "u2"));
    assert!(manager.can_accept_new_ip("8.8.8.8", "u2"));
}

#[test]
fn kick_boots_and_blocks_reconnect() {
    let (manager, _, _) = setup(MuxConfig {
        kicked_ttl: Duration::from_millis(80),
        ..MuxConfig::default()
    });

    let handle = manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();
    let closed = Arc::new(AtomicBool::new(false));
    handle
        .session
        .set_transport(Box::new(ClosableTransport(closed.clone())));

    let destroyed = manager.kick_by_uuid("u1").unwrap();
    assert_eq!(destroyed, 1);
    assert!(closed.load(Ordering::SeqCst), "transport force-closed");
    assert_eq!(manager.session_count(), 0);
    assert!(manager.is_uuid_kicked("u1"));

    // Reconnects bounce while the TTL runs...
    assert!(matches!(
        manager.create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4")),
        Err(MuxError::Kicked(_))
    ));
    assert!(!manager.can_accept_new_uuid("u1"));

    // ...and succeed after it expires.
    std::thread::sleep(Duration::from_millis(120));
    assert!(!manager.is_uuid_kicked("u1"));
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();
}

#[test]
fn kick_by_ip_matches_source_and_client() {
    let (manager, _, _) = setup(MuxConfig::default());
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u2", "1.2.3.4"))
        .unwrap();
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u3", "5.5.5.5"))
        .unwrap();

    let destroyed = manager.kick_by_ip("1.2.3.4");
    assert_eq!(destroyed, 2);
    assert_eq!(manager.session_count(), 1);
    assert!(manager.is_uuid_kicked("u1"));
    assert!(manager.is_uuid_kicked("u2"));
    assert!(!manager.is_uuid_kicked("u3"));
}

#[test]
fn kick_by_country_uses_geoip() {
    let (manager, _, _) = setup(MuxConfig::default());
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "5.6.7.8"))
        .unwrap();
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u2", "1.2.3.4"))
        .unwrap();

    let destroyed = manager.kick_by_country("de").unwrap();
    assert_eq!(destroyed, 1);
    assert!(manager.is_uuid_kicked("u1"));
    assert!(!manager.is_uuid_kicked("u2"));
}

#[test]
fn kick_by_country_requires_geoip() {
    let engine = Arc::new(RecordingEngine::default());
    let manager = SessionManager::new(MuxConfig::default(), engine);
    assert!(matches!(
        manager.kick_by_country("DE"),
        Err(MuxError::GeoIpUnavailable)
    ));
}

#[test]
fn inactivity_sweep_spares_wide_iq_and_bypassed() {
    let (manager, _, _) = setup(MuxConfig {
        session_timeout: Duration::from_secs(5),
        bypass: vec![BypassEntry::ip("7.7.7.7")],
        ..MuxConfig::default()
    });

    manager
        .create_audio_session(7_074_000, "iq192", 0, identity("u-iq", "1.1.1.1"))
        .unwrap();
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u-usb", "2.2.2.2"))
        .unwrap();
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u-vip", "7.7.7.7"))
        .unwrap();

    // Everyone has been idle for 10 s.
    manager.sweep_inactive(Instant::now() + Duration::from_secs(10));

    assert!(manager.is_uuid_kicked("u-usb"));
    assert!(!manager.is_uuid_kicked("u-iq"), "wide-IQ is exempt");
    assert!(!manager.is_uuid_kicked("u-vip"), "bypassed IP is exempt");
    assert_eq!(manager.session_count(), 2);

    let snap = manager.metrics().snapshot();
    assert_eq!(snap.kicks_idle_audio, 1);
    assert_eq!(snap.kicks_idle_mixed, 0);
}

#[test]
fn idle_uuid_with_both_kinds_counts_as_mixed() {
    let (manager, _, _) = setup(MuxConfig {
        session_timeout: Duration::from_secs(5),
        ..MuxConfig::default()
    });
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.1.1.1"))
        .unwrap();
    manager
        .create_spectrum_session(identity("u1", "1.1.1.1"))
        .unwrap();

    manager.sweep_inactive(Instant::now() + Duration::from_secs(10));

    assert!(manager.is_uuid_kicked("u1"));
    assert_eq!(manager.metrics().snapshot().kicks_idle_mixed, 1);
}

#[test]
fn lifetime_sweep_kicks_once() {
    let (manager, _, _) = setup(MuxConfig {
        max_session_time: Duration::from_secs(60),
        ..MuxConfig::default()
    });
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();

    // Not yet expired.
    manager.sweep_lifetime(Instant::now() + Duration::from_secs(30));
    assert_eq!(manager.session_count(), 1);

    // Expired: kicked and forgotten.
    manager.sweep_lifetime(Instant::now() + Duration::from_secs(61));
    assert_eq!(manager.session_count(), 0);
    assert!(manager.is_uuid_kicked("u1"));

    // First-seen record is gone, so the sweep does not fire again.
    manager.sweep_lifetime(Instant::now() + Duration::from_secs(120));
    assert_eq!(manager.metrics().snapshot().kicks_lifetime, 1);
}

#[test]
fn engine_failure_rolls_back_tuning() {
    let (manager, engine, _) = setup(MuxConfig::default());
    let handle = manager
        .create_audio_session(14_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();

    engine.fail_next_update.store(true, Ordering::SeqCst);
    let err = manager
        .update_session(&handle.session.id, 7_074_000, "", 0)
        .unwrap_err();
    assert!(matches!(err, MuxError::EngineRejected(_)));

    // In-memory tuning reads back unchanged and the failed band was never
    // recorded.
    let tuning = handle.session.tuning();
    assert_eq!(tuning.frequency_hz, 14_074_000);
    let bands = handle.session.visited_bands();
    assert!(bands.contains("20m"));
    assert!(!bands.contains("40m"));

    // The session is still alive and retunable.
    manager
        .update_session(&handle.session.id, 7_074_000, "", 0)
        .unwrap();
    assert_eq!(handle.session.tuning().frequency_hz, 7_074_000);
    assert!(handle.session.visited_bands().contains("40m"));
}

#[test]
fn engine_failure_during_create_leaves_no_trace() {
    let (manager, engine, _) = setup(MuxConfig::default());
    engine.fail_next_create.store(true, Ordering::SeqCst);

    assert!(matches!(
        manager.create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4")),
        Err(MuxError::EngineRejected(_))
    ));
    assert_eq!(manager.session_count(), 0);
    assert_eq!(manager.unique_user_count(), 0);
    assert!(engine.terminates().is_empty(), "nothing to compensate");

    // The UUID is not burned; the next attempt succeeds.
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();
}

#[test]
fn orphan_sweep_disables_unknown_ssrcs() {
    let (manager, engine, _) = setup(MuxConfig::default());
    let handle = manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();

    *engine.channels.lock().unwrap() = vec![
        EngineChannel {
            name: format!("sdrmux-{}", handle.session.id),
            ssrc: handle.session.ssrc,
        },
        EngineChannel {
            name: "forgotten".to_string(),
            ssrc: 0x0BAD_CAFE,
        },
    ];

    manager.sweep_orphans();
    assert_eq!(engine.disables(), vec![0x0BAD_CAFE]);
    assert!(manager.session_by_ssrc(handle.session.ssrc).is_some());
}

#[test]
fn wide_iq_create_delegates_bandwidth_to_preset() {
    let (manager, engine, _) = setup(MuxConfig::default());
    manager
        .create_audio_session(7_074_000, "iq96", 96_000, identity("u1", "1.2.3.4"))
        .unwrap();
    assert!(engine.calls().iter().any(|c| matches!(
        c,
        Call::Create { mode, bandwidth_hz: 0, .. } if mode == "iq96"
    )));
}

#[test]
fn activity_events_follow_uuid_lifecycle() {
    let (manager, _, sink) = setup(MuxConfig::default());

    let audio = manager
        .create_audio_session(14_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();
    // New UUID: one created event.
    assert_eq!(sink.created.lock().unwrap().len(), 1);

    let spectrum = manager
        .create_spectrum_session(identity("u1", "1.2.3.4"))
        .unwrap();
    // First spectrum for a known UUID: another created event.
    assert_eq!(sink.created.lock().unwrap().len(), 2);

    manager
        .update_session(&audio.session.id, 7_030_000, "cw", 500)
        .unwrap();

    // Destroying one of two sessions is not a departure.
    manager.destroy_session(&audio.session.id).unwrap();
    assert!(sink.destroyed.lock().unwrap().is_empty());

    // The last session's destruction carries the accumulated history.
    manager.destroy_session(&spectrum.session.id).unwrap();
    let destroyed = sink.destroyed.lock().unwrap();
    assert_eq!(destroyed.len(), 1);
    assert_eq!(destroyed[0].session_uuid, "u1");
    assert_eq!(destroyed[0].bands, vec!["20m", "40m"]);
    assert_eq!(destroyed[0].modes, vec!["cw", "usb"]);
}

#[test]
fn reconnect_does_not_announce_twice() {
    let (manager, _, sink) = setup(MuxConfig::default());
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();
    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();

    // The replacement destroyed the only session, so the UUID technically
    // departed and re-arrived.
    assert_eq!(sink.destroyed.lock().unwrap().len(), 1);
    assert_eq!(sink.created.lock().unwrap().len(), 2);
    assert_eq!(manager.unique_user_count(), 1);
}

#[test]
fn shutdown_destroys_everything() {
    let (manager, engine, _) = setup(MuxConfig::default());
    let a = manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();
    let b = manager
        .create_spectrum_session(identity("u2", "5.5.5.5"))
        .unwrap();

    manager.shutdown();
    assert_eq!(manager.session_count(), 0);
    let terminated = engine.terminates();
    assert!(terminated.contains(&a.session.ssrc));
    assert!(terminated.contains(&b.session.ssrc));
}

#[test]
fn bypass_skips_limits_but_not_kicks() {
    let (manager, _, _) = setup(MuxConfig {
        max_sessions: 1,
        bypass: vec![BypassEntry::ip_with_password("7.7.7.7", "s3cret")],
        ..MuxConfig::default()
    });

    manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.1.1.1"))
        .unwrap();

    // Wrong password: the limit applies.
    let mut wrong = identity("u2", "7.7.7.7");
    wrong.bypass_password = "nope".to_string();
    assert!(matches!(
        manager.create_audio_session(7_074_000, "usb", 2700, wrong),
        Err(MuxError::MaxUsers)
    ));

    // Right password: admitted past the full house.
    let mut vip = identity("u2", "7.7.7.7");
    vip.bypass_password = "s3cret".to_string();
    manager
        .create_audio_session(7_074_000, "usb", 2700, vip.clone())
        .unwrap();
    assert_eq!(manager.non_bypassed_user_count(), 1);

    // An admin kick still lands and still blocks the reconnect.
    manager.kick_by_uuid("u2").unwrap();
    assert!(matches!(
        manager.create_audio_session(7_074_000, "usb", 2700, vip),
        Err(MuxError::Kicked(_))
    ));
}

#[test]
fn edge_retune_adjusts_rate_on_mode_change() {
    let (manager, _, _) = setup(MuxConfig::default());
    let handle = manager
        .create_audio_session(14_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();

    manager
        .update_session_with_edges(&handle.session.id, 14_100_000, "iq192", -96_000, 96_000, true)
        .unwrap();

    let tuning = handle.session.tuning();
    assert_eq!(tuning.mode, "iq192");
    assert_eq!(tuning.sample_rate_hz, 192_000);
    assert_eq!(tuning.channels, 2);
    assert_eq!(tuning.bw_low_hz, -96_000);
    assert!(handle.session.is_wide_iq());
}

#[test]
fn spectrum_update_rolls_back_on_failure() {
    let (manager, engine, _) = setup(MuxConfig::default());
    let handle = manager
        .create_spectrum_session(identity("u1", "1.2.3.4"))
        .unwrap();
    let before = handle.session.spectrum_settings();

    engine.fail_next_update.store(true, Ordering::SeqCst);
    assert!(
        manager
            .update_spectrum_session(&handle.session.id, 7_000_000, 500.0, 4096)
            .is_err()
    );
    assert_eq!(handle.session.spectrum_settings(), before);

    manager
        .update_spectrum_session(&handle.session.id, 7_000_000, 0.0, 0)
        .unwrap();
    let after = handle.session.spectrum_settings();
    assert_eq!(after.center_hz, 7_000_000);
    assert_eq!(after.bin_count, before.bin_count, "zero leaves bins alone");
}

#[test]
fn queue_overflow_drops_without_error() {
    let (manager, _, _) = setup(MuxConfig {
        audio_queue_capacity: 2,
        ..MuxConfig::default()
    });
    let handle = manager
        .create_audio_session(7_074_000, "usb", 2700, identity("u1", "1.2.3.4"))
        .unwrap();
    let ssrc = handle.session.ssrc;

    for i in 0..5u8 {
        route_datagram(&manager, SessionKind::Audio, &rtp_datagram(ssrc, &[i]), 0);
    }
    let snap = manager.metrics().snapshot();
    assert_eq!(snap.rtp_routed, 2);
    assert_eq!(snap.rtp_dropped_queue_full, 3);
    // The session is unaffected.
    assert!(manager.session_by_ssrc(ssrc).is_some());
}
