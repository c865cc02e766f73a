use std::io;

use thiserror::Error;

/// Errors surfaced by the QUIC transport bridge.
///
/// The type is `Clone` because a single session establishment may be awaited by
/// several dialers at once, and every one of them receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The QUIC handshake or protocol negotiation failed.
    #[error("session establishment failed: {0}")]
    Establishment(String),

    /// The peer's identity could not be verified against the trust policy.
    #[error("untrusted peer: {0}")]
    UntrustedPeer(String),

    /// A read, write or dial deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The caller canceled the dial before it completed.
    #[error("dial canceled")]
    DialCanceled,

    /// The owning session was torn down.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The stream was reset, either by the peer or locally.
    #[error("stream reset with code {code}")]
    StreamReset { code: u64 },

    /// The stream direction was already closed locally.
    #[error("stream already closed")]
    StreamClosed,

    /// The listener or dialer has been shut down.
    #[error("closed")]
    Closed,

    /// The dial target could not be parsed or resolved.
    #[error("invalid target '{0}'")]
    InvalidTarget(String),

    /// Invalid TLS or transport configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Application close code for an orderly session shutdown.
    pub const CODE_CLOSED: u32 = 0;
    /// Application close code used when no application protocol was negotiated.
    pub const CODE_NO_APPLICATION_PROTOCOL: u32 = 1;
    /// Application close code used when a session is evicted for idleness.
    pub const CODE_IDLE: u32 = 2;
    /// Stream reset code sent when a connection is dropped before finishing.
    pub const CODE_STREAM_CANCELED: u32 = 0x10;

    /// Recover the bridge error carried inside an `io::Error`, if any.
    ///
    /// `StreamConn` reports failures through `tokio::io` traits; the typed
    /// error stays attached as the inner error.
    pub fn from_io(err: &io::Error) -> Option<&Error> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
    }

    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::SessionClosed(_) | Error::StreamReset { .. }
        )
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::StreamReset { .. } => io::ErrorKind::ConnectionReset,
            Error::SessionClosed(_) => io::ErrorKind::ConnectionAborted,
            Error::StreamClosed | Error::Closed => io::ErrorKind::NotConnected,
            Error::DialCanceled => io::ErrorKind::Interrupted,
            Error::InvalidTarget(_) | Error::Config(_) => io::ErrorKind::InvalidInput,
            Error::UntrustedPeer(_) => io::ErrorKind::PermissionDenied,
            Error::Establishment(_) => io::ErrorKind::ConnectionRefused,
            Error::Io(_) => io::ErrorKind::Other,
        }
    }

    /// Classify a failure on an already established session.
    pub(crate) fn from_connection(err: quinn::ConnectionError) -> Self {
        use quinn::ConnectionError as E;

        match err {
            E::LocallyClosed => Error::SessionClosed("closed locally".to_string()),
            E::TimedOut => Error::SessionClosed("transport idle timeout".to_string()),
            E::ApplicationClosed(close) => {
                Error::SessionClosed(format!("closed by peer: {close}"))
            }
            E::ConnectionClosed(close) => Error::SessionClosed(format!("closed by peer: {close}")),
            E::Reset => Error::SessionClosed("reset by peer".to_string()),
            other => Error::SessionClosed(other.to_string()),
        }
    }

    /// Classify a failure that happened while the handshake was in progress.
    pub(crate) fn from_handshake(err: quinn::ConnectionError) -> Self {
        use quinn::ConnectionError as E;

        match err {
            E::TimedOut => Error::Timeout,
            E::TransportError(ref transport) if is_certificate_alert(transport.code.into()) => {
                Error::UntrustedPeer(transport.reason.clone())
            }
            E::ConnectionClosed(ref close) if is_certificate_alert(close.error_code.into()) => {
                Error::UntrustedPeer(close.to_string())
            }
            other => Error::Establishment(other.to_string()),
        }
    }

    pub(crate) fn from_connect(err: quinn::ConnectError) -> Self {
        use quinn::ConnectError as E;

        match err {
            E::InvalidServerName(name) => Error::InvalidTarget(name),
            E::InvalidRemoteAddress(addr) => Error::InvalidTarget(addr.to_string()),
            E::EndpointStopping => Error::Closed,
            other => Error::Establishment(other.to_string()),
        }
    }

    pub(crate) fn from_read(err: quinn::ReadError) -> Self {
        use quinn::ReadError as E;

        match err {
            E::Reset(code) => Error::StreamReset {
                code: code.into_inner(),
            },
            E::ConnectionLost(lost) => Error::from_connection(lost),
            E::ClosedStream => Error::StreamClosed,
            other => Error::Io(other.to_string()),
        }
    }

    pub(crate) fn from_write(err: quinn::WriteError) -> Self {
        use quinn::WriteError as E;

        match err {
            E::Stopped(code) => Error::StreamReset {
                code: code.into_inner(),
            },
            E::ConnectionLost(lost) => Error::from_connection(lost),
            E::ClosedStream => Error::StreamClosed,
            other => Error::Io(other.to_string()),
        }
    }

    /// Reclassify an `io::Error` produced by quinn's `AsyncRead` impl.
    pub(crate) fn from_read_io(err: io::Error) -> Self {
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<quinn::ReadError>()) {
            Some(Ok(read)) => Error::from_read(*read),
            Some(Err(other)) => Error::Io(other.to_string()),
            None => Error::Io(kind.to_string()),
        }
    }

    /// Reclassify an `io::Error` produced by quinn's `AsyncWrite` impl.
    pub(crate) fn from_write_io(err: io::Error) -> Self {
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<quinn::WriteError>()) {
            Some(Ok(write)) => Error::from_write(*write),
            Some(Err(other)) => Error::Io(other.to_string()),
            None => Error::Io(kind.to_string()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match Error::from_io(&err) {
            Some(inner) => inner.clone(),
            None => Error::Io(err.to_string()),
        }
    }
}

/// TLS alerts are carried in the QUIC CRYPTO_ERROR range (0x100 + alert).
const CRYPTO_ERROR_BASE: u64 = 0x100;

/// Alerts a TLS stack sends when certificate verification fails.
const CERTIFICATE_ALERTS: &[u64] = &[
    42, // bad_certificate
    43, // unsupported_certificate
    44, // certificate_revoked
    45, // certificate_expired
    46, // certificate_unknown
    48, // unknown_ca
    49, // access_denied
    51, // decrypt_error
    116, // certificate_required
];

pub(crate) fn is_certificate_alert(code: u64) -> bool {
    code.checked_sub(CRYPTO_ERROR_BASE)
        .is_some_and(|alert| CERTIFICATE_ALERTS.contains(&alert))
}
