//! The proxy's request-level error taxonomy.

use thiserror::Error;

/// Terminal disposition of a failed request or connection.
///
/// `Protocol` is connection-fatal; everything else fails only the
/// request it is attached to, and the client connection survives.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    /// Malformed protocol unit. Tears down the sending connection.
    #[error("malformed protocol unit")]
    Protocol,

    /// A routable command arrived without any key material.
    #[error("request carries no routable key")]
    NoKey,

    /// Multi-key requests cannot be split across backends.
    #[error("multi-key fragmentation is not supported")]
    Fragment,

    /// Global or per-pool client ceiling reached; the socket was closed
    /// before any connection state existed, so no reply is possible.
    #[error("client connection ceiling reached")]
    ResourceExhausted,

    /// No healthy backend helper; retryable by the client.
    #[error("no available helper, upstream server may be offline")]
    UpstreamUnavailable,

    /// The request's deadline passed while queued or in flight.
    #[error("request deadline exceeded")]
    Timeout,

    /// Adaptive shedding or a saturated job queue rejected the request.
    #[error("backend is busy, request shed")]
    ServerBusy,
}

impl RelayError {
    /// Whether this error tears down the whole connection rather than
    /// one request.
    pub fn is_connection_fatal(self) -> bool {
        matches!(self, RelayError::Protocol)
    }

    /// Error number reported in the synthesized error unit.
    pub fn errno(self) -> u16 {
        match self {
            RelayError::Protocol => 1835,
            RelayError::NoKey => 1064,
            RelayError::Fragment => 1235,
            RelayError::ResourceExhausted => 1040,
            RelayError::UpstreamUnavailable => 1053,
            RelayError::Timeout => 1205,
            RelayError::ServerBusy => 1041,
        }
    }
}
