//! Multicast RTP receiver and SSRC router.
//!
//! One reader thread per multicast group (audio, spectrum). Each thread
//! owns its socket and buffer; per-datagram work is a header parse, one
//! O(1) index lookup, a payload copy, and a non-blocking enqueue. The
//! reader never touches the radio engine and never blocks on per-session
//! state, so a slow client cannot back-pressure the multicast path.
//!
//! The groups are shared with co-tenant processes on the host, which is
//! why the sockets enable address + port reuse and why datagrams with an
//! unknown SSRC are dropped without noise.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Result;
use crate::manager::SessionManager;
use crate::rtp::RtpPacket;
use crate::session::{AudioPacket, SessionKind, SpectrumFrame};

/// Kernel receive buffer request. Spectrum frames burst at frame rate and
/// the reader shares a core with everything else; a generous buffer rides
/// out scheduling gaps.
const RECV_BUFFER_BYTES: usize = 1 << 20;

/// Socket read timeout, doubling as the run-flag poll interval.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Largest datagram the reader accepts (UDP maximum).
const MAX_DATAGRAM: usize = 65_536;

/// Multicast RTP receiver. Owns one reader thread per group.
pub struct RtpReceiver {
    manager: SessionManager,
    running: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl RtpReceiver {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        }
    }

    /// Join both multicast groups and start the reader threads.
    pub fn start(&mut self) -> Result<()> {
        let config = &self.manager.inner.config;
        let audio_socket = open_group_socket(config.multicast_audio_addr, config.interface_addr)?;
        let spectrum_socket =
            open_group_socket(config.multicast_spectrum_addr, config.interface_addr)?;

        self.running.store(true, Ordering::SeqCst);
        for (socket, kind, group) in [
            (audio_socket, SessionKind::Audio, config.multicast_audio_addr),
            (
                spectrum_socket,
                SessionKind::Spectrum,
                config.multicast_spectrum_addr,
            ),
        ] {
            tracing::info!(%group, kind = %kind, "RTP receiver listening");
            let manager = self.manager.clone();
            let running = self.running.clone();
            self.threads.push(thread::spawn(move || {
                reader_loop(socket, kind, manager, running);
            }));
        }
        Ok(())
    }

    /// Stop the reader threads and wait for them to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("RTP receiver stopped");
    }
}

impl Drop for RtpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open a UDP socket bound to `group` and join it on the configured
/// interface plus loopback.
///
/// Reuse options let several receivers (this process and co-tenants)
/// coexist on the same group and port. The loopback join covers an engine
/// running on the same host, whose multicast never leaves the machine.
fn open_group_socket(group: SocketAddrV4, interface: Option<Ipv4Addr>) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
        tracing::warn!(error = %e, "could not grow receive buffer");
    }
    socket.bind(&SocketAddr::V4(group).into())?;

    let iface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.join_multicast_v4(group.ip(), &iface)?;
    if iface != Ipv4Addr::LOCALHOST
        && let Err(e) = socket.join_multicast_v4(group.ip(), &Ipv4Addr::LOCALHOST)
    {
        // Some hosts refuse a second membership on lo; not fatal.
        tracing::debug!(%group, error = %e, "loopback group join failed");
    }

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    Ok(socket)
}

fn reader_loop(
    socket: UdpSocket,
    kind: SessionKind,
    manager: SessionManager,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, _source)) => {
                // The engine stamps its own RTP clock, but arrival time at
                // the multiplexer is what downstream alignment keys on.
                route_datagram(&manager, kind, &buf[..len], unix_nanos());
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(kind = %kind, error = %e, "RTP socket read error");
                    thread::sleep(READ_TIMEOUT);
                }
            }
        }
    }
    tracing::debug!(kind = %kind, "RTP reader exited");
}

/// Route one datagram: parse, look up by SSRC, copy the payload out of
/// the reused receive buffer, enqueue without blocking.
///
/// Unknown SSRCs are expected — the groups carry packets for channels
/// owned by other processes — and are dropped silently (counted only).
pub fn route_datagram(
    manager: &SessionManager,
    kind: SessionKind,
    datagram: &[u8],
    ingress_ts_ns: u64,
) {
    let metrics = &manager.inner.metrics;

    let Some(packet) = RtpPacket::parse(datagram) else {
        metrics.record_rtp_malformed();
        return;
    };
    let Some(session) = manager.session_by_ssrc(packet.ssrc) else {
        metrics.record_rtp_unknown_ssrc();
        return;
    };
    if session.kind != kind {
        // SSRC known but on the wrong group; treat like a foreign packet.
        metrics.record_rtp_unknown_ssrc();
        return;
    }

    let delivered = match kind {
        SessionKind::Audio => session.enqueue_audio(AudioPacket {
            pcm: packet.payload.to_vec(),
            rtp_timestamp: packet.timestamp,
            ingress_ts_ns,
        }),
        SessionKind::Spectrum => session.enqueue_spectrum(SpectrumFrame {
            data: packet.payload.to_vec(),
            rtp_timestamp: packet.timestamp,
            ingress_ts_ns,
        }),
    };
    if delivered {
        metrics.record_rtp_routed();
    } else {
        metrics.record_rtp_dropped_queue_full();
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
