use thiserror::Error;

/// Errors that can occur while speaking the Mumble wire protocol to an
/// upstream server (TLS control channel or UDP voice channel).
#[derive(Debug, Error)]
pub enum MumbleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("malformed control frame: {0}")]
    BadFrame(String),

    #[error("unknown control message type {0}")]
    UnknownMessageType(u16),

    #[error("server rejected the connection: {0}")]
    Rejected(String),

    #[error("handshake did not complete within the timeout")]
    HandshakeTimeout,

    #[error("lock poisoned")]
    Poisoned,
}

impl<T> From<std::sync::PoisonError<T>> for MumbleError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        MumbleError::Poisoned
    }
}

/// Errors surfaced to a browser peer as an `error{code,...}` envelope.
///
/// Variant names map 1:1 onto the `code` field documented in the gateway's
/// wire format; see [`ErrorCode::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    UnknownServer,
    ConnectFailed,
    MumbleReject,
    MumbleDenied,
    MumbleError,
    NotConnected,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::UnknownServer => "unknown_server",
            ErrorCode::ConnectFailed => "connect_failed",
            ErrorCode::MumbleReject => "mumble_reject",
            ErrorCode::MumbleDenied => "mumble_denied",
            ErrorCode::MumbleError => "mumble_error",
            ErrorCode::NotConnected => "not_connected",
            ErrorCode::Internal => "internal_error",
        }
    }
}
