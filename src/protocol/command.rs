//! Command frames.
//!
//! ```text
//! CommandHeader = version:u8, type:u8
//! Authenticate  = CommandHeader, client_id:[16]u8, token:[32]u8
//! Connect       = CommandHeader, Address
//! Packet        = CommandHeader, assoc_id:u16, packet_id:u16,
//!                 fragment_total:u8, fragment_id:u8, size:u16, Address, data
//! Dissociate    = CommandHeader, assoc_id:u16
//! Heartbeat     = CommandHeader
//! ```
//!
//! All integers are big-endian.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use super::address::Address;
use super::error::CodecError;
use super::read_exact_counted;
use crate::core::constants::{
    CLIENT_ID_SIZE, CMD_AUTHENTICATE, CMD_CONNECT, CMD_DISSOCIATE, CMD_HEARTBEAT, CMD_PACKET,
    HEADER_SIZE, MAX_PAYLOAD_SIZE, PACKET_FIXED_SIZE, TOKEN_SIZE, VERSION,
};

/// Command type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    /// Client authentication.
    Authenticate = CMD_AUTHENTICATE,
    /// Open a relayed TCP stream.
    Connect = CMD_CONNECT,
    /// Relay a UDP packet (or fragment).
    Packet = CMD_PACKET,
    /// Release a UDP association.
    Dissociate = CMD_DISSOCIATE,
    /// Keep-alive.
    Heartbeat = CMD_HEARTBEAT,
}

impl CommandType {
    /// Parse a type byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            CMD_AUTHENTICATE => Some(CommandType::Authenticate),
            CMD_CONNECT => Some(CommandType::Connect),
            CMD_PACKET => Some(CommandType::Packet),
            CMD_DISSOCIATE => Some(CommandType::Dissociate),
            CMD_HEARTBEAT => Some(CommandType::Heartbeat),
            _ => None,
        }
    }

    /// Type byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandType::Authenticate => "authenticate",
            CommandType::Connect => "connect",
            CommandType::Packet => "packet",
            CommandType::Dissociate => "dissociate",
            CommandType::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

/// Header preceding every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Protocol version.
    pub version: u8,
    /// Command type.
    pub command: CommandType,
}

impl CommandHeader {
    /// Header for `command` at our protocol version.
    pub fn new(command: CommandType) -> Self {
        Self {
            version: VERSION,
            command,
        }
    }

    /// Append the header to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.version);
        buf.put_u8(self.command.as_byte());
    }

    /// Decode a header, rejecting foreign versions and unknown types.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(CodecError::incomplete(HEADER_SIZE, buf.remaining()));
        }
        Self::from_bytes(buf.get_u8(), buf.get_u8())
    }

    /// Read a header from a stream, consuming exactly two bytes.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, CodecError> {
        let mut raw = [0u8; HEADER_SIZE];
        read_exact_counted(reader, &mut raw).await?;
        Self::from_bytes(raw[0], raw[1])
    }

    fn from_bytes(version: u8, kind: u8) -> Result<Self, CodecError> {
        if version != VERSION {
            return Err(CodecError::VersionMismatch {
                expected: VERSION,
                actual: version,
            });
        }
        let command = CommandType::from_byte(kind).ok_or(CodecError::UnknownCommand(kind))?;
        Ok(Self { version, command })
    }

    /// Fail unless this header carries `expected`.
    pub fn expect(self, expected: CommandType, channel: &'static str) -> Result<Self, CodecError> {
        if self.command != expected {
            return Err(CodecError::UnexpectedCommand {
                expected: channel,
                actual: self.command,
            });
        }
        Ok(self)
    }
}

/// Client authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    /// Client identity.
    pub client_id: Uuid,
    /// Exported-keying-material token.
    pub token: [u8; TOKEN_SIZE],
}

/// Request to relay the stream it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Destination.
    pub address: Address,
}

impl Connect {
    /// Read a `Connect` from the front of a bidirectional stream.
    ///
    /// Consumes the header and address only; relayed bytes that follow stay
    /// in the stream.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, CodecError> {
        CommandHeader::read_from(reader)
            .await?
            .expect(CommandType::Connect, "bidirectional stream")?;
        let address = Address::read_from(reader).await?;
        Ok(Self { address })
    }
}

/// One UDP packet, or one fragment of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Association the packet belongs to.
    pub assoc_id: u16,
    /// Packet id shared by all fragments.
    pub packet_id: u16,
    /// Number of fragments.
    pub fragment_total: u8,
    /// Index of this fragment.
    pub fragment_id: u8,
    /// Destination (client to server) or source (server to client).
    pub address: Address,
    /// Payload. Its length is the wire `size` field.
    pub data: Bytes,
}

impl Packet {
    /// An unfragmented packet.
    pub fn new(assoc_id: u16, packet_id: u16, address: Address, data: Bytes) -> Self {
        Self {
            assoc_id,
            packet_id,
            fragment_total: 1,
            fragment_id: 0,
            address,
            data,
        }
    }

    /// Whether this is one piece of a larger packet.
    pub fn is_fragment(&self) -> bool {
        self.fragment_total > 1
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + PACKET_FIXED_SIZE + self.address.encoded_len() + self.data.len()
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<(), CodecError> {
        if self.data.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: self.data.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if self.fragment_id >= self.fragment_total {
            return Err(CodecError::InvalidFragment {
                id: self.fragment_id,
                total: self.fragment_total,
            });
        }
        buf.put_u16(self.assoc_id);
        buf.put_u16(self.packet_id);
        buf.put_u8(self.fragment_total);
        buf.put_u8(self.fragment_id);
        buf.put_u16(self.data.len() as u16);
        self.address.encode(buf)?;
        buf.put_slice(&self.data);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        if buf.remaining() < PACKET_FIXED_SIZE {
            return Err(CodecError::incomplete(PACKET_FIXED_SIZE, buf.remaining()));
        }
        let assoc_id = buf.get_u16();
        let packet_id = buf.get_u16();
        let fragment_total = buf.get_u8();
        let fragment_id = buf.get_u8();
        let size = buf.get_u16() as usize;
        let address = Address::decode(buf)?;
        if buf.remaining() < size {
            return Err(CodecError::incomplete(size, buf.remaining()));
        }
        let data = buf.copy_to_bytes(size);
        Ok(Self {
            assoc_id,
            packet_id,
            fragment_total,
            fragment_id,
            address,
            data,
        })
    }
}

/// Release of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dissociate {
    /// Association to release.
    pub assoc_id: u16,
}

/// Any command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Client authentication.
    Authenticate(Authenticate),
    /// Stream relay request.
    Connect(Connect),
    /// UDP packet.
    Packet(Packet),
    /// Association release.
    Dissociate(Dissociate),
    /// Keep-alive.
    Heartbeat,
}

impl Command {
    /// The command's type byte.
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Authenticate(_) => CommandType::Authenticate,
            Command::Connect(_) => CommandType::Connect,
            Command::Packet(_) => CommandType::Packet,
            Command::Dissociate(_) => CommandType::Dissociate,
            Command::Heartbeat => CommandType::Heartbeat,
        }
    }

    /// Append the full frame to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), CodecError> {
        CommandHeader::new(self.command_type()).encode(buf);
        match self {
            Command::Authenticate(auth) => {
                buf.put_slice(auth.client_id.as_bytes());
                buf.put_slice(&auth.token);
            }
            Command::Connect(connect) => connect.address.encode(buf)?,
            Command::Packet(packet) => packet.encode_body(buf)?,
            Command::Dissociate(dissociate) => buf.put_u16(dissociate.assoc_id),
            Command::Heartbeat => {}
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Command::Authenticate(_) => HEADER_SIZE + CLIENT_ID_SIZE + TOKEN_SIZE,
            Command::Connect(connect) => HEADER_SIZE + connect.address.encoded_len(),
            Command::Packet(packet) => packet.encoded_len(),
            Command::Dissociate(_) => HEADER_SIZE + 2,
            Command::Heartbeat => HEADER_SIZE,
        }
    }

    /// Decode one command from the front of `buf`.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let header = CommandHeader::decode(buf)?;
        match header.command {
            CommandType::Authenticate => {
                let needed = CLIENT_ID_SIZE + TOKEN_SIZE;
                if buf.remaining() < needed {
                    return Err(CodecError::incomplete(needed, buf.remaining()));
                }
                let mut id = [0u8; CLIENT_ID_SIZE];
                buf.copy_to_slice(&mut id);
                let mut token = [0u8; TOKEN_SIZE];
                buf.copy_to_slice(&mut token);
                Ok(Command::Authenticate(Authenticate {
                    client_id: Uuid::from_bytes(id),
                    token,
                }))
            }
            CommandType::Connect => Ok(Command::Connect(Connect {
                address: Address::decode(buf)?,
            })),
            CommandType::Packet => Ok(Command::Packet(Packet::decode_body(buf)?)),
            CommandType::Dissociate => {
                if buf.remaining() < 2 {
                    return Err(CodecError::incomplete(2, buf.remaining()));
                }
                Ok(Command::Dissociate(Dissociate {
                    assoc_id: buf.get_u16(),
                }))
            }
            CommandType::Heartbeat => Ok(Command::Heartbeat),
        }
    }

    /// Decode a buffer holding exactly one command, as a datagram does.
    pub fn decode_frame(mut frame: Bytes) -> Result<Self, CodecError> {
        let command = Self::decode(&mut frame)?;
        if frame.has_remaining() {
            return Err(CodecError::TrailingBytes(frame.remaining()));
        }
        Ok(command)
    }

    /// Read a one-shot unidirectional stream to its end and decode it.
    pub async fn read_stream<R: AsyncRead + Unpin>(
        reader: &mut R,
        limit: usize,
    ) -> Result<Self, CodecError> {
        let mut raw = Vec::new();
        reader
            .take(limit as u64 + 1)
            .read_to_end(&mut raw)
            .await?;
        if raw.len() > limit {
            return Err(CodecError::FrameTooLarge(limit));
        }
        Self::decode_frame(Bytes::from(raw))
    }
}
