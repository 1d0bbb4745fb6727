//! Collaborator interface for relayed traffic.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::core::{QuicConnection, RelayError, Result};
use crate::protocol::Address;
use crate::relay::{PacketSender, StreamConn};

/// Receives authenticated traffic from server sessions.
///
/// Implementations dial the real destinations. Both methods run in their own
/// task; returning an error only ends that task.
#[async_trait]
pub trait ServerHandler<C: QuicConnection>: Send + Sync + 'static {
    /// A client asked for a TCP connection to `target`.
    async fn handle_tcp(&self, stream: StreamConn<C>, target: Address, user: Uuid) -> Result<()>;

    /// A whole UDP datagram arrived from a client.
    async fn handle_udp(&self, packet: UdpPacket<C>) -> Result<()>;
}

/// One reassembled UDP datagram from a client association.
pub struct UdpPacket<C: QuicConnection> {
    pub(crate) assoc_id: u16,
    pub(crate) target: Address,
    pub(crate) data: Bytes,
    pub(crate) user: Uuid,
    pub(crate) remote: SocketAddr,
    pub(crate) sender: PacketSender<C>,
    pub(crate) write_closed: Arc<AtomicBool>,
}

impl<C: QuicConnection> fmt::Debug for UdpPacket<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpPacket")
            .field("assoc_id", &self.assoc_id)
            .field("target", &self.target)
            .field("len", &self.data.len())
            .field("user", &self.user)
            .finish()
    }
}

impl<C: QuicConnection> UdpPacket<C> {
    /// Association the datagram belongs to.
    pub fn assoc_id(&self) -> u16 {
        self.assoc_id
    }

    /// Where the client wants the datagram delivered.
    pub fn target(&self) -> &Address {
        &self.target
    }

    /// Datagram payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Authenticated client id.
    pub fn user(&self) -> Uuid {
        self.user
    }

    /// Address of the client's physical connection.
    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// Whether the client has dissociated.
    pub fn is_write_closed(&self) -> bool {
        self.write_closed.load(Ordering::Acquire)
    }

    /// Send a reply to the client's association, reporting `source` as the
    /// sender. Fails with [`RelayError::Closed`] once the client dissociated.
    pub async fn write_back(&self, data: impl Into<Bytes>, source: Address) -> Result<usize> {
        if self.is_write_closed() {
            return Err(RelayError::Closed);
        }
        let data = data.into();
        let len = data.len();
        self.sender.send(self.assoc_id, source, data).await?;
        Ok(len)
    }
}
