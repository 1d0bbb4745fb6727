//! Error types for the relay.

use std::io;

use thiserror::Error;

use super::constants::{
    CLOSE_AUTHENTICATION_FAILED, CLOSE_AUTHENTICATION_TIMEOUT, CLOSE_BAD_COMMAND,
    CLOSE_PROTOCOL_ERROR,
};
use crate::protocol::CodecError;

/// Application-level close codes carried by a connection close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CloseCode {
    /// Unexpected I/O failure.
    ProtocolError = CLOSE_PROTOCOL_ERROR,
    /// Bad authentication token.
    AuthenticationFailed = CLOSE_AUTHENTICATION_FAILED,
    /// No authentication in time.
    AuthenticationTimeout = CLOSE_AUTHENTICATION_TIMEOUT,
    /// Unknown or misordered command.
    BadCommand = CLOSE_BAD_COMMAND,
}

impl CloseCode {
    /// Wire value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a wire value.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            CLOSE_PROTOCOL_ERROR => Some(CloseCode::ProtocolError),
            CLOSE_AUTHENTICATION_FAILED => Some(CloseCode::AuthenticationFailed),
            CLOSE_AUTHENTICATION_TIMEOUT => Some(CloseCode::AuthenticationTimeout),
            CLOSE_BAD_COMMAND => Some(CloseCode::BadCommand),
            _ => None,
        }
    }

    /// Human-readable reason sent along with the code.
    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::ProtocolError => "protocol error",
            CloseCode::AuthenticationFailed => "authentication failed",
            CloseCode::AuthenticationTimeout => "authentication timeout",
            CloseCode::BadCommand => "bad command",
        }
    }
}

/// Top-level relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or truncated frame.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport or network failure. Fatal to the physical connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The client already carries its maximum number of logical streams.
    #[error("too many open streams (max {max})")]
    TooManyOpenStreams {
        /// Configured maximum.
        max: usize,
    },

    /// The client has been torn down and must be replaced.
    #[error("client closed")]
    ClientClosed,

    /// The server rejected our token, or a peer presented a bad one.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// No authentication arrived within the configured timeout.
    #[error("authentication timeout")]
    AuthenticationTimeout,

    /// The association has been dissociated or closed.
    #[error("association closed")]
    Closed,

    /// UDP payload too large to relay.
    #[error("udp packet too large ({size} > {max})")]
    PacketTooLarge {
        /// Payload size.
        size: usize,
        /// Largest accepted payload.
        max: usize,
    },

    /// Peer sent an unknown or misordered command.
    #[error("bad command: {0}")]
    BadCommand(String),

    /// Dial or authentication exceeded the request timeout.
    #[error("request timed out")]
    Timeout,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether this error came from the transport and must tear down the
    /// whole physical connection.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, RelayError::Io(_))
    }

    /// Whether the caller should retry on a fresh client.
    pub fn needs_new_connection(&self) -> bool {
        matches!(
            self,
            RelayError::TooManyOpenStreams { .. } | RelayError::ClientClosed
        )
    }

    /// Close code to use when this error ends a connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            RelayError::AuthenticationFailed => CloseCode::AuthenticationFailed,
            RelayError::AuthenticationTimeout => CloseCode::AuthenticationTimeout,
            RelayError::BadCommand(_) => CloseCode::BadCommand,
            RelayError::Codec(e) if e.is_bad_command() => CloseCode::BadCommand,
            _ => CloseCode::ProtocolError,
        }
    }

    /// Collapse into the plain I/O signal seen by proxied sessions.
    pub fn into_io(self) -> io::Error {
        match self {
            RelayError::Io(e) => e,
            RelayError::ClientClosed | RelayError::Closed => {
                io::Error::new(io::ErrorKind::ConnectionAborted, self)
            }
            other => io::Error::other(other),
        }
    }
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_round_trip() {
        for code in [
            CloseCode::ProtocolError,
            CloseCode::AuthenticationFailed,
            CloseCode::AuthenticationTimeout,
            CloseCode::BadCommand,
        ] {
            assert_eq!(CloseCode::from_u32(code.as_u32()), Some(code));
        }
        assert_eq!(CloseCode::from_u32(0), None);
        assert_eq!(CloseCode::AuthenticationFailed.as_u32(), 0xffff_fff1);
    }

    #[test]
    fn test_needs_new_connection() {
        assert!(RelayError::TooManyOpenStreams { max: 1 }.needs_new_connection());
        assert!(RelayError::ClientClosed.needs_new_connection());
        assert!(!RelayError::AuthenticationFailed.needs_new_connection());
        assert!(!RelayError::Closed.needs_new_connection());
    }

    #[test]
    fn test_transport_errors() {
        let err = RelayError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_transport_error());
        assert_eq!(err.close_code(), CloseCode::ProtocolError);
        assert!(!RelayError::PacketTooLarge { size: 2, max: 1 }.is_transport_error());
    }

    #[test]
    fn test_close_code_for_bad_command() {
        let err = RelayError::Codec(CodecError::UnknownCommand(9));
        assert_eq!(err.close_code(), CloseCode::BadCommand);
        assert_eq!(
            RelayError::AuthenticationTimeout.close_code(),
            CloseCode::AuthenticationTimeout
        );
    }

    #[test]
    fn test_into_io_kind() {
        assert_eq!(
            RelayError::ClientClosed.into_io().kind(),
            io::ErrorKind::ConnectionAborted
        );
    }
}
