use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sdrmux::{
    BypassEntry, ClientIdentity, ControlClient, MuxConfig, RtpReceiver, SessionManager,
};

#[derive(Parser)]
#[command(
    name = "sdrmux-server",
    about = "Streaming SDR multiplexer: session and routing plane"
)]
struct Args {
    /// Radio engine control endpoint (host:port)
    #[arg(long, default_value = "127.0.0.1:5005")]
    control: String,

    /// Multicast group carrying audio RTP
    #[arg(long, default_value = "239.1.2.3:5004")]
    multicast_audio: String,

    /// Multicast group carrying spectrum RTP
    #[arg(long, default_value = "239.1.2.4:5006")]
    multicast_spectrum: String,

    /// Interface to join the multicast groups on (loopback is always joined)
    #[arg(long)]
    interface: Option<String>,

    /// Maximum concurrent unique users (UUIDs)
    #[arg(long, default_value_t = 50)]
    max_sessions: usize,

    /// Maximum unique users per IP, 0 = unlimited
    #[arg(long, default_value_t = 0)]
    max_sessions_ip: usize,

    /// Inactivity timeout in seconds, 0 = disabled
    #[arg(long, default_value_t = 0)]
    session_timeout: u64,

    /// Absolute per-user lifetime in seconds, 0 = disabled
    #[arg(long, default_value_t = 0)]
    max_session_time: u64,

    /// How long kicked users stay blocked, in seconds
    #[arg(long, default_value_t = 3600)]
    kicked_ttl: u64,

    /// Bypass entry, "ip" or "ip:password" (repeatable)
    #[arg(long = "bypass")]
    bypass: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let control_addr = match args.control.parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("Invalid control address: {}", args.control);
            return;
        }
    };
    let multicast_audio_addr: SocketAddrV4 = match args.multicast_audio.parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("Invalid audio multicast address: {}", args.multicast_audio);
            return;
        }
    };
    let multicast_spectrum_addr: SocketAddrV4 = match args.multicast_spectrum.parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!(
                "Invalid spectrum multicast address: {}",
                args.multicast_spectrum
            );
            return;
        }
    };
    let interface_addr = match &args.interface {
        Some(name) => match interface_ipv4(name) {
            Some(addr) => Some(addr),
            None => {
                eprintln!("No IPv4 address found on interface {name}");
                return;
            }
        },
        None => None,
    };

    let config = MuxConfig {
        max_sessions: args.max_sessions,
        max_sessions_per_ip: args.max_sessions_ip,
        session_timeout: Duration::from_secs(args.session_timeout),
        max_session_time: Duration::from_secs(args.max_session_time),
        kicked_ttl: Duration::from_secs(args.kicked_ttl),
        bypass: args.bypass.iter().map(|entry| parse_bypass(entry)).collect(),
        multicast_audio_addr,
        multicast_spectrum_addr,
        interface_addr,
        ..MuxConfig::default()
    };

    let engine = match ControlClient::new(control_addr) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("Failed to reach radio engine: {e}");
            return;
        }
    };

    let manager = SessionManager::new(config, engine);
    manager.start_background();

    let mut receiver = RtpReceiver::new(manager.clone());
    if let Err(e) = receiver.start() {
        eprintln!("Failed to start RTP receiver: {e}");
        manager.shutdown();
        return;
    }

    // The shared wideband waterfall everyone's overview is rendered from.
    let _wideband = match manager.create_spectrum_session(ClientIdentity {
        session_uuid: "wideband".to_string(),
        ..Default::default()
    }) {
        Ok(handle) => {
            if let Err(e) = manager.mark_wideband(&handle.session.id) {
                tracing::warn!(error = %e, "could not mark wideband session");
            }
            Some(handle)
        }
        Err(e) => {
            tracing::warn!(error = %e, "wideband spectrum session not created");
            None
        }
    };

    println!(
        "sdrmux on {} / {} — press Enter to stop",
        args.multicast_audio, args.multicast_spectrum
    );
    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();

    receiver.stop();
    manager.shutdown();
}

/// "ip" or "ip:password".
fn parse_bypass(entry: &str) -> BypassEntry {
    match entry.split_once(':') {
        Some((ip, password)) => BypassEntry::ip_with_password(ip, password),
        None => BypassEntry::ip(entry),
    }
}

/// First IPv4 address of the named interface.
fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    get_if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .filter(|iface| iface.name == name)
        .find_map(|iface| match iface.addr {
            get_if_addrs::IfAddr::V4(v4) => Some(v4.ip),
            _ => None,
        })
}
