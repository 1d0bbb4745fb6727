//! quinn adapter.
//!
//! Wraps `quinn::Endpoint` and `quinn::Connection` in the transport traits.
//! TLS configuration stays with the caller; this module only fills in the
//! transport parameters the relay cares about.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use quinn::VarInt;

use crate::core::constants::PACKET_OVERHEAD;
use crate::core::{
    ClientOptions, CongestionControl, DatagramError, Listener, QuicConnection, RecvStream,
    SendStream, ServerOptions, Transport,
};

/// Transport parameters for a client connection.
pub fn client_transport_config(options: &ClientOptions) -> quinn::TransportConfig {
    let mut config = transport_config(options.congestion_control);
    config.datagram_receive_buffer_size(Some(
        (options.max_udp_relay_packet_size + PACKET_OVERHEAD) * 64,
    ));
    config
}

/// Transport parameters for a server connection.
pub fn server_transport_config(options: &ServerOptions) -> quinn::TransportConfig {
    let mut config = transport_config(options.congestion_control);
    config.datagram_receive_buffer_size(Some(options.max_datagram_frame_size() * 64));
    config
}

fn transport_config(cc: CongestionControl) -> quinn::TransportConfig {
    let mut config = quinn::TransportConfig::default();
    match cc {
        CongestionControl::Cubic => {
            config.congestion_controller_factory(Arc::new(quinn::congestion::CubicConfig::default()))
        }
        CongestionControl::NewReno => config
            .congestion_controller_factory(Arc::new(quinn::congestion::NewRenoConfig::default())),
        CongestionControl::Bbr => {
            config.congestion_controller_factory(Arc::new(quinn::congestion::BbrConfig::default()))
        }
    };
    config
}

fn varint(code: u32) -> VarInt {
    VarInt::from_u32(code)
}

impl SendStream for quinn::SendStream {
    fn reset(&mut self, code: u32) {
        let _ = quinn::SendStream::reset(self, varint(code));
    }
}

impl RecvStream for quinn::RecvStream {
    fn stop(&mut self, code: u32) {
        let _ = quinn::RecvStream::stop(self, varint(code));
    }
}

/// A quinn connection.
#[derive(Debug, Clone)]
pub struct QuinnConnection(pub quinn::Connection);

#[async_trait]
impl QuicConnection for QuinnConnection {
    type SendStream = quinn::SendStream;
    type RecvStream = quinn::RecvStream;

    async fn open_bi(&self) -> io::Result<(quinn::SendStream, quinn::RecvStream)> {
        Ok(self.0.open_bi().await?)
    }

    async fn open_uni(&self) -> io::Result<quinn::SendStream> {
        Ok(self.0.open_uni().await?)
    }

    async fn accept_bi(&self) -> io::Result<(quinn::SendStream, quinn::RecvStream)> {
        Ok(self.0.accept_bi().await?)
    }

    async fn accept_uni(&self) -> io::Result<quinn::RecvStream> {
        Ok(self.0.accept_uni().await?)
    }

    fn send_datagram(&self, data: Bytes) -> Result<(), DatagramError> {
        use quinn::SendDatagramError as E;
        self.0.send_datagram(data).map_err(|e| match e {
            E::TooLarge => DatagramError::TooLarge {
                max: self.0.max_datagram_size().unwrap_or(0),
            },
            E::UnsupportedByPeer | E::Disabled => DatagramError::Unsupported,
            E::ConnectionLost(e) => DatagramError::ConnectionLost(e.into()),
        })
    }

    async fn read_datagram(&self) -> io::Result<Bytes> {
        Ok(self.0.read_datagram().await?)
    }

    fn max_datagram_size(&self) -> Option<usize> {
        self.0.max_datagram_size()
    }

    fn export_keying_material(
        &self,
        output: &mut [u8],
        label: &[u8],
        context: &[u8],
    ) -> io::Result<()> {
        self.0
            .export_keying_material(output, label, context)
            .map_err(|_| io::Error::other("keying material export failed"))
    }

    fn close(&self, code: u32, reason: &[u8]) {
        self.0.close(varint(code), reason);
    }

    async fn closed(&self) -> io::Error {
        self.0.closed().await.into()
    }

    fn remote_address(&self) -> SocketAddr {
        self.0.remote_address()
    }
}

/// Client transport over a quinn endpoint.
#[derive(Debug, Clone)]
pub struct QuinnTransport {
    endpoint: quinn::Endpoint,
    reduce_rtt: bool,
}

impl QuinnTransport {
    /// Wrap an endpoint that already carries a default client config.
    pub fn new(endpoint: quinn::Endpoint, reduce_rtt: bool) -> Self {
        Self {
            endpoint,
            reduce_rtt,
        }
    }
}

#[async_trait]
impl Transport for QuinnTransport {
    type Connection = QuinnConnection;

    async fn connect(&self, remote: SocketAddr, server_name: &str) -> io::Result<QuinnConnection> {
        let connecting = self
            .endpoint
            .connect(remote, server_name)
            .map_err(io::Error::other)?;
        let conn = if self.reduce_rtt {
            match connecting.into_0rtt() {
                Ok((conn, _accepted)) => conn,
                Err(connecting) => connecting.await?,
            }
        } else {
            connecting.await?
        };
        tracing::debug!(%remote, server_name, "quic connection established");
        Ok(QuinnConnection(conn))
    }

    fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"");
    }
}

/// Server listener over a quinn endpoint.
#[derive(Debug)]
pub struct QuinnListener {
    endpoint: quinn::Endpoint,
}

impl QuinnListener {
    /// Wrap an endpoint that already carries a server config.
    pub fn new(endpoint: quinn::Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Listener for QuinnListener {
    type Connection = QuinnConnection;

    async fn accept(&mut self) -> Option<io::Result<QuinnConnection>> {
        let incoming = self.endpoint.accept().await?;
        Some(incoming.await.map(QuinnConnection).map_err(io::Error::from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }
}
