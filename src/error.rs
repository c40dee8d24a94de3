//! Error types for the WebSocket endpoint library

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying socket
    Io(io::Error),
    /// A frame arrived with one of RSV1-3 set
    ReservedFlags,
    /// Unknown or reserved opcode
    InvalidOpcode(u8),
    /// Control frame longer than 125 bytes or fragmented
    LargeControl,
    /// Extended payload length not minimally encoded, or MSB set
    InvalidLength,
    /// Data frame arrived mid-fragmentation, or continuation with no message open
    InvalidFragmentation(&'static str),
    /// Frame masking did not match the endpoint role
    MaskViolation,
    /// Assembled message would exceed the configured maximum
    MessageTooLarge,
    /// Invalid UTF-8 in a text message
    InvalidUtf8,
    /// Close frame carried a code outside the accepted ranges
    InvalidCloseCode(u16),
    /// Request line is not `GET <path> HTTP/1.1`
    InvalidRequestLine,
    /// Malformed header line or header value
    InvalidHeader,
    /// More headers than the configured cap
    TooManyHeaders,
    /// `Upgrade` header missing or not `websocket`
    InvalidUpgrade,
    /// `Connection` header missing the `upgrade` token
    InvalidConnection,
    /// `Sec-WebSocket-Version` is not 13
    InvalidVersion,
    /// Required handshake headers absent once the request completed
    MissingHeaders,
    /// Handshake grew past the configured buffer cap
    RequestTooLarge,
    /// Handshake deadline exceeded
    Timeout,
    /// Response status line is not `HTTP/1.1 101`
    InvalidResponseLine,
    /// `Sec-WebSocket-Accept` does not match the expected digest
    InvalidWebsocketAcceptHeader,
    /// Client-side handshake failed for the named reason
    HandshakeFailed(&'static str),
    /// Connection closed normally (read returned 0)
    Closed,
    /// Connection reset by peer
    ConnectionReset,
    /// Broken pipe on write
    BrokenPipe,
    /// Would block (non-blocking I/O)
    WouldBlock,
    /// Error surfaced by an application handler
    App(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Close code to send to the peer before tearing the connection down.
    ///
    /// `None` means the transport is already unusable (or the failure is not
    /// a protocol violation) and no close frame should be attempted.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::ReservedFlags
            | Error::InvalidOpcode(_)
            | Error::LargeControl
            | Error::InvalidLength
            | Error::InvalidFragmentation(_)
            | Error::MaskViolation
            | Error::InvalidCloseCode(_) => Some(close_code::PROTOCOL_ERROR),
            Error::MessageTooLarge => Some(close_code::TOO_BIG),
            Error::InvalidUtf8 => Some(close_code::INVALID_PAYLOAD),
            _ => None,
        }
    }

    /// True for transport-level failures that warrant a silent close.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Closed | Error::ConnectionReset | Error::BrokenPipe
        )
    }

    /// Wrap an application error for propagation out of a handler callback.
    pub fn app<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::App(Box::new(err))
    }
}

/// Well-known close status codes (RFC 6455 §7.4.1)
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g. server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Invalid frame payload data
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::ReservedFlags => write!(f, "reserved frame flags must be zero"),
            Error::InvalidOpcode(op) => write!(f, "invalid opcode: {:#x}", op),
            Error::LargeControl => write!(f, "control frame too large or fragmented"),
            Error::InvalidLength => write!(f, "payload length not minimally encoded"),
            Error::InvalidFragmentation(msg) => write!(f, "invalid fragmentation: {}", msg),
            Error::MaskViolation => write!(f, "frame masking does not match endpoint role"),
            Error::MessageTooLarge => write!(f, "message too large"),
            Error::InvalidUtf8 => write!(f, "invalid UTF-8 in text message"),
            Error::InvalidCloseCode(code) => write!(f, "invalid close code: {}", code),
            Error::InvalidRequestLine => write!(f, "invalid request line"),
            Error::InvalidHeader => write!(f, "invalid header"),
            Error::TooManyHeaders => write!(f, "too many headers"),
            Error::InvalidUpgrade => write!(f, "missing or invalid Upgrade header"),
            Error::InvalidConnection => write!(f, "missing or invalid Connection header"),
            Error::InvalidVersion => write!(f, "unsupported Sec-WebSocket-Version"),
            Error::MissingHeaders => write!(f, "required handshake headers missing"),
            Error::RequestTooLarge => write!(f, "handshake request too large"),
            Error::Timeout => write!(f, "handshake timed out"),
            Error::InvalidResponseLine => write!(f, "expected HTTP/1.1 101 response"),
            Error::InvalidWebsocketAcceptHeader => {
                write!(f, "Sec-WebSocket-Accept digest mismatch")
            }
            Error::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
            Error::Closed => write!(f, "connection closed"),
            Error::ConnectionReset => write!(f, "connection reset by peer"),
            Error::BrokenPipe => write!(f, "broken pipe"),
            Error::WouldBlock => write!(f, "would block"),
            Error::App(e) => write!(f, "application error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::App(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe => Error::BrokenPipe,
            io::ErrorKind::UnexpectedEof => Error::Closed,
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, "would block"),
            Error::ConnectionReset => {
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
            }
            Error::Closed | Error::BrokenPipe => {
                io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
            }
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
