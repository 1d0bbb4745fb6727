//! Protocol constants for TUIC v5.
//!
//! Wire values are fixed by the protocol and MUST NOT be changed. Defaults
//! in the last sections are only starting points for the option structs.

use std::time::Duration;

// =============================================================================
// COMMAND HEADER
// =============================================================================

/// Protocol version spoken by this crate.
pub const VERSION: u8 = 0x05;

/// Size of the command header (version + type).
pub const HEADER_SIZE: usize = 2;

/// `Authenticate` command type.
pub const CMD_AUTHENTICATE: u8 = 0x00;

/// `Connect` command type.
pub const CMD_CONNECT: u8 = 0x01;

/// `Packet` command type.
pub const CMD_PACKET: u8 = 0x02;

/// `Dissociate` command type.
pub const CMD_DISSOCIATE: u8 = 0x03;

/// `Heartbeat` command type.
pub const CMD_HEARTBEAT: u8 = 0x04;

// =============================================================================
// ADDRESS TYPES
// =============================================================================

/// Domain name: length byte, name bytes, port.
pub const ADDR_TYPE_DOMAIN: u8 = 0x00;

/// IPv4 address: 4 bytes, port.
pub const ADDR_TYPE_IPV4: u8 = 0x01;

/// IPv6 address: 16 bytes, port.
pub const ADDR_TYPE_IPV6: u8 = 0x02;

/// No address. Carries neither payload nor port.
pub const ADDR_TYPE_NONE: u8 = 0xff;

/// Longest encodable domain name.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Largest address encoding (domain type + length + 255 bytes + port).
pub const MAX_ADDRESS_SIZE: usize = 1 + 1 + MAX_DOMAIN_LEN + 2;

/// Largest IP address encoding (IPv6 type + 16 bytes + port).
pub const MAX_IP_ADDRESS_SIZE: usize = 1 + 16 + 2;

// =============================================================================
// FRAME SIZES
// =============================================================================

/// Client identifier size (UUID).
pub const CLIENT_ID_SIZE: usize = 16;

/// Authentication token size.
pub const TOKEN_SIZE: usize = 32;

/// Authenticate frame size.
pub const AUTHENTICATE_SIZE: usize = HEADER_SIZE + CLIENT_ID_SIZE + TOKEN_SIZE;

/// Fixed packet fields: assoc_id, packet_id, fragment_total, fragment_id, size.
pub const PACKET_FIXED_SIZE: usize = 2 + 2 + 1 + 1 + 2;

/// Framing overhead of a packet carrying an IP address.
pub const PACKET_OVERHEAD: usize = HEADER_SIZE + PACKET_FIXED_SIZE + MAX_IP_ADDRESS_SIZE;

/// Largest UDP payload a single packet frame can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Largest command frame that may arrive on a one-shot unidirectional stream.
pub const MAX_FRAME_SIZE: usize =
    HEADER_SIZE + PACKET_FIXED_SIZE + MAX_ADDRESS_SIZE + MAX_PAYLOAD_SIZE;

/// Most fragments a single packet can be split into.
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Smallest datagram every QUIC path supports.
pub const INITIAL_MAX_DATAGRAM_SIZE: usize = 1200;

/// Fragment size that always fits the initial datagram size
/// (3 bytes of DATAGRAM frame header).
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = INITIAL_MAX_DATAGRAM_SIZE - PACKET_OVERHEAD - 3;

// =============================================================================
// CLOSE CODES
// =============================================================================

/// Unexpected I/O failure on the connection.
pub const CLOSE_PROTOCOL_ERROR: u32 = 0xffff_fff0;

/// The presented token did not verify.
pub const CLOSE_AUTHENTICATION_FAILED: u32 = 0xffff_fff1;

/// No authentication arrived in time.
pub const CLOSE_AUTHENTICATION_TIMEOUT: u32 = 0xffff_fff2;

/// Unknown or misordered command.
pub const CLOSE_BAD_COMMAND: u32 = 0xffff_fff3;

// =============================================================================
// DEFAULTS
// =============================================================================

/// Logical streams allowed on one connection before the pool opens another.
pub const DEFAULT_MAX_OPEN_STREAMS: usize = 100;

/// Default maximum UDP relay packet size.
pub const DEFAULT_MAX_UDP_RELAY_PACKET_SIZE: usize = 1500;

/// The server never advertises datagrams larger than this.
pub const SERVER_MAX_DATAGRAM_FRAME_SIZE: usize = 1400;

/// Interval between heartbeats while streams are open.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Bound on dialing plus authenticating a new connection.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Server wait for the authenticate frame.
pub const DEFAULT_AUTHENTICATION_TIMEOUT: Duration = Duration::from_millis(1000);

/// Delay between a stream closing and its slot being released.
pub const DEFAULT_STREAM_LINGER: Duration = Duration::from_secs(5);

/// Idle time after which the pool evicts an unused client.
pub const DEFAULT_POOL_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// Per-connection bound on concurrently running handler tasks.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 512;

/// Queue depth of an association's receive channel.
pub const ASSOCIATION_QUEUE_DEPTH: usize = 64;

/// Partially reassembled packets older than this are dropped by the server.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);
