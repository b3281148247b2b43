//! Error types for the SDR multiplexer library.

/// Errors that can occur in the multiplexer core.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Admission**: [`MaxUsers`](Self::MaxUsers),
///   [`MaxUsersPerIp`](Self::MaxUsersPerIp), [`Kicked`](Self::Kicked) —
///   surfaced to the handshake with a reason the client can display.
/// - **Engine**: [`EngineUnreachable`](Self::EngineUnreachable),
///   [`EngineTimeout`](Self::EngineTimeout),
///   [`EngineRejected`](Self::EngineRejected) — control exchange with the
///   radio engine failed.
/// - **State**: [`SessionNotFound`](Self::SessionNotFound),
///   [`WrongKind`](Self::WrongKind) — e.g. squelch on a spectrum session.
/// - **Resource**: [`SsrcSpaceExhausted`](Self::SsrcSpaceExhausted).
/// - **Internal**: [`Io`](Self::Io), [`Internal`](Self::Internal) — logged,
///   never shown to clients verbatim.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The global unique-user limit has been reached (counted in UUIDs,
    /// not sessions — a second session for a known UUID is free).
    #[error("maximum number of users reached")]
    MaxUsers,

    /// The per-IP unique-UUID limit has been reached for this address.
    #[error("maximum number of users reached for IP {0}")]
    MaxUsersPerIp(String),

    /// The identity UUID is on the kick list and its TTL has not expired.
    #[error("identity is kicked: {0}")]
    Kicked(String),

    /// No session with the given ID exists in the
    /// [`SessionManager`](crate::manager::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The operation does not apply to this session kind
    /// (e.g. squelch on a spectrum session).
    #[error("operation not valid for {kind} session {id}")]
    WrongKind { id: String, kind: &'static str },

    /// Random SSRC generation kept colliding with live sessions.
    #[error("SSRC space exhausted after {0} attempts")]
    SsrcSpaceExhausted(u32),

    /// The control endpoint could not be reached at all.
    #[error("radio engine unreachable: {0}")]
    EngineUnreachable(String),

    /// The engine did not acknowledge a control command in time.
    #[error("radio engine control timeout")]
    EngineTimeout,

    /// The engine acknowledged the command with a rejection.
    #[error("radio engine rejected command: {0}")]
    EngineRejected(String),

    /// The engine reported an SSRC it has no channel for.
    #[error("engine has no channel with SSRC {0:#010X}")]
    InvalidSsrc(u32),

    /// Country kicks need a GeoIP resolver and none was configured.
    #[error("GeoIP lookup not available")]
    GeoIpUnavailable,

    /// Invariant violation or other bug-shaped failure. Logged server-side.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MuxError {
    /// Whether this error is an admission rejection (safe to surface to the
    /// client as a handshake close reason).
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::MaxUsers | Self::MaxUsersPerIp(_) | Self::Kicked(_)
        )
    }
}

/// Convenience alias for `Result<T, MuxError>`.
pub type Result<T> = std::result::Result<T, MuxError>;
