//! Codec errors.

use std::io;

use thiserror::Error;

use super::command::CommandType;

/// Errors decoding or encoding command frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended early. More bytes may complete the frame.
    #[error("incomplete frame: expected {expected} bytes, got {actual}")]
    Incomplete {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Version byte is not the one we speak.
    #[error("version mismatch: expected {expected:#04x}, got {actual:#04x}")]
    VersionMismatch {
        /// Our version.
        expected: u8,
        /// Version on the wire.
        actual: u8,
    },

    /// Command type outside the known range.
    #[error("unknown command type: {0:#04x}")]
    UnknownCommand(u8),

    /// Valid command on a channel that does not carry it.
    #[error("unexpected command: {actual} where {expected} was expected")]
    UnexpectedCommand {
        /// What the channel carries.
        expected: &'static str,
        /// What arrived.
        actual: CommandType,
    },

    /// Address type byte outside the known range.
    #[error("unknown address type: {0:#04x}")]
    UnknownAddressType(u8),

    /// Domain is not valid UTF-8 or is empty.
    #[error("invalid domain name")]
    InvalidDomain,

    /// Domain longer than a length byte can describe.
    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    /// Packet payload larger than the size field allows.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Largest allowed.
        max: usize,
    },

    /// Splitting would need more fragments than fit in a byte.
    #[error("too many fragments: {0}")]
    TooManyFragments(usize),

    /// Fragment id not below fragment total.
    #[error("invalid fragment {id}/{total}")]
    InvalidFragment {
        /// Fragment id.
        id: u8,
        /// Fragment total.
        total: u8,
    },

    /// Bytes left over after a complete frame.
    #[error("trailing bytes after frame: {0}")]
    TrailingBytes(usize),

    /// A one-shot stream exceeded the frame size limit.
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    /// Reading the frame from a stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether more input could turn this into a valid frame.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Incomplete { .. })
    }

    /// Whether the peer sent something it must never send. Closes the
    /// connection with `BadCommand`.
    pub fn is_bad_command(&self) -> bool {
        matches!(
            self,
            CodecError::UnknownCommand(_) | CodecError::UnexpectedCommand { .. }
        )
    }

    /// Whether the underlying stream failed rather than the bytes on it.
    pub fn is_io(&self) -> bool {
        matches!(self, CodecError::Io(_))
    }

    pub(crate) fn incomplete(expected: usize, actual: usize) -> Self {
        CodecError::Incomplete { expected, actual }
    }
}
