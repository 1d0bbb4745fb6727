//! Target addresses carried by `Connect` and `Packet`.
//!
//! ```text
//! Address = type:u8, payload, port:u16
//!   Domain (0x00) payload = len:u8, [len]u8
//!   IPv4   (0x01) payload = [4]u8
//!   IPv6   (0x02) payload = [16]u8
//!   None   (0xff) no payload, no port
//! ```

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use bytes::{Buf, BufMut};
use tokio::io::AsyncRead;

use super::error::CodecError;
use super::read_exact_counted;
use crate::core::constants::{
    ADDR_TYPE_DOMAIN, ADDR_TYPE_IPV4, ADDR_TYPE_IPV6, ADDR_TYPE_NONE, MAX_DOMAIN_LEN,
};

/// A relay destination or source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// No address. Used on every fragment after the first.
    None,
    /// An IP address and port.
    SocketAddress(SocketAddr),
    /// A domain name and port, resolved by the server.
    DomainAddress(String, u16),
}

impl Address {
    /// Wire type byte.
    pub fn type_code(&self) -> u8 {
        match self {
            Address::None => ADDR_TYPE_NONE,
            Address::SocketAddress(SocketAddr::V4(_)) => ADDR_TYPE_IPV4,
            Address::SocketAddress(SocketAddr::V6(_)) => ADDR_TYPE_IPV6,
            Address::DomainAddress(..) => ADDR_TYPE_DOMAIN,
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::None => 1,
            Address::SocketAddress(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::DomainAddress(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Whether this is the `None` placeholder.
    pub fn is_none(&self) -> bool {
        matches!(self, Address::None)
    }

    /// Port, if the address has one.
    pub fn port(&self) -> Option<u16> {
        match self {
            Address::None => None,
            Address::SocketAddress(addr) => Some(addr.port()),
            Address::DomainAddress(_, port) => Some(*port),
        }
    }

    /// The socket address, if this is an IP address.
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::SocketAddress(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Append the wire encoding to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), CodecError> {
        match self {
            Address::None => buf.put_u8(ADDR_TYPE_NONE),
            Address::SocketAddress(SocketAddr::V4(addr)) => {
                buf.put_u8(ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::SocketAddress(SocketAddr::V6(addr)) => {
                buf.put_u8(ADDR_TYPE_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::DomainAddress(domain, port) => {
                validate_domain(domain.as_bytes())?;
                buf.put_u8(ADDR_TYPE_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Decode an address from the front of `buf`.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        need(buf, 1)?;
        match buf.get_u8() {
            ADDR_TYPE_NONE => Ok(Address::None),
            ADDR_TYPE_IPV4 => {
                need(buf, 4 + 2)?;
                let mut ip = [0u8; 4];
                buf.copy_to_slice(&mut ip);
                let port = buf.get_u16();
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(ip),
                    port,
                ))))
            }
            ADDR_TYPE_IPV6 => {
                need(buf, 16 + 2)?;
                let mut ip = [0u8; 16];
                buf.copy_to_slice(&mut ip);
                let port = buf.get_u16();
                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(ip),
                    port,
                    0,
                    0,
                ))))
            }
            ADDR_TYPE_DOMAIN => {
                need(buf, 1)?;
                let len = buf.get_u8() as usize;
                need(buf, len + 2)?;
                let mut name = vec![0u8; len];
                buf.copy_to_slice(&mut name);
                let port = buf.get_u16();
                domain_address(name, port)
            }
            other => Err(CodecError::UnknownAddressType(other)),
        }
    }

    /// Read an address from a stream without consuming anything past it.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, CodecError> {
        let mut kind = [0u8; 1];
        read_exact_counted(reader, &mut kind).await?;
        match kind[0] {
            ADDR_TYPE_NONE => Ok(Address::None),
            ADDR_TYPE_IPV4 => {
                let mut raw = [0u8; 4 + 2];
                read_exact_counted(reader, &mut raw).await?;
                Address::decode(&mut [&kind[..], &raw[..]].concat().as_slice())
            }
            ADDR_TYPE_IPV6 => {
                let mut raw = [0u8; 16 + 2];
                read_exact_counted(reader, &mut raw).await?;
                Address::decode(&mut [&kind[..], &raw[..]].concat().as_slice())
            }
            ADDR_TYPE_DOMAIN => {
                let mut len = [0u8; 1];
                read_exact_counted(reader, &mut len).await?;
                let mut raw = vec![0u8; len[0] as usize + 2];
                read_exact_counted(reader, &mut raw).await?;
                let port = u16::from_be_bytes([raw[raw.len() - 2], raw[raw.len() - 1]]);
                raw.truncate(raw.len() - 2);
                domain_address(raw, port)
            }
            other => Err(CodecError::UnknownAddressType(other)),
        }
    }
}

fn need<B: Buf>(buf: &B, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::incomplete(n, buf.remaining()));
    }
    Ok(())
}

fn validate_domain(name: &[u8]) -> Result<(), CodecError> {
    if name.is_empty() {
        return Err(CodecError::InvalidDomain);
    }
    if name.len() > MAX_DOMAIN_LEN {
        return Err(CodecError::DomainTooLong(name.len()));
    }
    Ok(())
}

fn domain_address(name: Vec<u8>, port: u16) -> Result<Address, CodecError> {
    validate_domain(&name)?;
    let name = String::from_utf8(name).map_err(|_| CodecError::InvalidDomain)?;
    Ok(Address::DomainAddress(name, port))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::None => f.write_str("none"),
            Address::SocketAddress(addr) => write!(f, "{addr}"),
            Address::DomainAddress(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::SocketAddress(addr)
    }
}

impl FromStr for Address {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::SocketAddress(addr));
        }
        let (host, port) = s.rsplit_once(':').ok_or(CodecError::InvalidDomain)?;
        let port = port.parse::<u16>().map_err(|_| CodecError::InvalidDomain)?;
        validate_domain(host.as_bytes())?;
        Ok(Address::DomainAddress(host.to_owned(), port))
    }
}
