//! Transport seams.
//!
//! The relay runs over any multiplexed encrypted connection offering
//! bidirectional streams, unidirectional streams, unreliable datagrams and
//! a keying-material exporter. QUIC is the intended transport; the
//! in-memory transport in [`crate::transport`] implements the same traits.

use std::fmt::Debug;
use std::hash::Hash;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors from sending an unreliable datagram.
#[derive(Debug, Error)]
pub enum DatagramError {
    /// Datagram exceeds what the path currently allows.
    #[error("datagram too large (max = {max})")]
    TooLarge {
        /// Largest datagram payload the connection accepts.
        max: usize,
    },

    /// Peer does not accept datagrams.
    #[error("datagrams not supported by peer")]
    Unsupported,

    /// Connection is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(#[from] io::Error),
}

/// Receive half of a stream.
pub trait RecvStream: AsyncRead + Unpin + Send + 'static {
    /// Tell the peer to stop sending; pending reads fail.
    fn stop(&mut self, code: u32);
}

/// Send half of a stream. `poll_shutdown` finishes the stream (FIN).
pub trait SendStream: AsyncWrite + Unpin + Send + 'static {
    /// Abandon the stream immediately, discarding unsent data.
    fn reset(&mut self, code: u32);
}

/// One physical connection.
#[async_trait]
pub trait QuicConnection: Send + Sync + 'static {
    /// Send half type.
    type SendStream: SendStream;
    /// Receive half type.
    type RecvStream: RecvStream;

    /// Open a bidirectional stream.
    async fn open_bi(&self) -> io::Result<(Self::SendStream, Self::RecvStream)>;

    /// Open a unidirectional stream.
    async fn open_uni(&self) -> io::Result<Self::SendStream>;

    /// Accept the next bidirectional stream opened by the peer.
    async fn accept_bi(&self) -> io::Result<(Self::SendStream, Self::RecvStream)>;

    /// Accept the next unidirectional stream opened by the peer.
    async fn accept_uni(&self) -> io::Result<Self::RecvStream>;

    /// Send an unreliable datagram.
    fn send_datagram(&self, data: Bytes) -> Result<(), DatagramError>;

    /// Receive the next datagram.
    async fn read_datagram(&self) -> io::Result<Bytes>;

    /// Current largest datagram payload, if datagrams are available.
    fn max_datagram_size(&self) -> Option<usize>;

    /// Export keying material bound to this connection's TLS session.
    fn export_keying_material(
        &self,
        output: &mut [u8],
        label: &[u8],
        context: &[u8],
    ) -> io::Result<()>;

    /// Close the connection with an application code.
    fn close(&self, code: u32, reason: &[u8]);

    /// Resolves once the connection is closed, by either side.
    async fn closed(&self) -> io::Error;

    /// Peer address.
    fn remote_address(&self) -> SocketAddr;
}

/// Something that can open physical connections to a server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connection type produced.
    type Connection: QuicConnection;

    /// Connect to `remote`, presenting `server_name` for TLS.
    async fn connect(&self, remote: SocketAddr, server_name: &str) -> io::Result<Self::Connection>;

    /// Release the underlying socket. Called on pool teardown.
    fn close(&self) {}
}

/// Source of incoming physical connections on the server.
#[async_trait]
pub trait Listener: Send + 'static {
    /// Connection type accepted.
    type Connection: QuicConnection;

    /// Next incoming connection, or `None` once the listener is shut down.
    async fn accept(&mut self) -> Option<io::Result<Self::Connection>>;

    /// Local address connections arrive on.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// A network path. Pools key their clients and cached transports by dialer.
#[async_trait]
pub trait Dialer: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Transport type this dialer yields.
    type Transport: Transport;

    /// Resolve the path to a transport and the server address.
    async fn dial(&self) -> io::Result<(Self::Transport, SocketAddr)>;
}

/// Connection type reached through a dialer.
pub type DialerConnection<D> = <<D as Dialer>::Transport as Transport>::Connection;
