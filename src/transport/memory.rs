//! In-process transport.
//!
//! Implements the transport traits over tokio duplex pipes and channels so
//! clients, servers and pools can run end to end without sockets or TLS.
//! Keying material comes from HKDF-SHA256 over a secret shared by the two
//! halves of a connection pair.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use bytes::Bytes;
use hkdf::Hkdf;
use parking_lot::Mutex;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::scope::CloseSignal;
use crate::core::constants::INITIAL_MAX_DATAGRAM_SIZE;
use crate::core::{
    DatagramError, Dialer, Listener, QuicConnection, RecvStream, SendStream, Transport,
};

/// Tunables for in-memory connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Largest datagram accepted. `None` disables datagrams.
    pub max_datagram_size: Option<usize>,
    /// Datagrams queued per direction before new ones are dropped.
    pub datagram_queue: usize,
    /// Bytes buffered per stream direction.
    pub stream_buffer: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: Some(INITIAL_MAX_DATAGRAM_SIZE),
            datagram_queue: 1024,
            stream_buffer: 64 * 1024,
        }
    }
}

fn aborted(shared: &Shared) -> io::Error {
    let reason = match *shared.reason.lock() {
        Some((code, ref reason)) => format!(
            "connection closed: {} ({code:#x})",
            String::from_utf8_lossy(reason)
        ),
        None => "connection closed".to_owned(),
    };
    io::Error::new(io::ErrorKind::ConnectionAborted, reason)
}

#[derive(Debug, Default)]
struct Direction {
    reset: AtomicBool,
    stopped: AtomicBool,
}

struct CloseWatch {
    shared: Arc<Shared>,
    signal: CloseSignal,
}

impl CloseWatch {
    fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: shared.clone(),
            signal: CloseSignal::new(&shared.closed),
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        self.signal
            .poll_cancelled(cx)
            .then(|| aborted(&self.shared))
    }
}

/// Send half of an in-memory stream.
pub struct MemorySendStream {
    pipe: Option<DuplexStream>,
    direction: Arc<Direction>,
    closed: CloseWatch,
}

/// Receive half of an in-memory stream.
pub struct MemoryRecvStream {
    pipe: Option<DuplexStream>,
    direction: Arc<Direction>,
    closed: CloseWatch,
}

fn stream(shared: &Arc<Shared>, buffer: usize) -> (MemorySendStream, MemoryRecvStream) {
    let (tx, rx) = tokio::io::duplex(buffer);
    let direction = Arc::new(Direction::default());
    (
        MemorySendStream {
            pipe: Some(tx),
            direction: direction.clone(),
            closed: CloseWatch::new(shared),
        },
        MemoryRecvStream {
            pipe: Some(rx),
            direction,
            closed: CloseWatch::new(shared),
        },
    )
}

impl AsyncWrite for MemorySendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Some(e) = this.closed.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        if this.direction.stopped.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream stopped by peer",
            )));
        }
        match this.pipe.as_mut() {
            Some(pipe) => Pin::new(pipe).poll_write(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream reset",
            ))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.pipe.as_mut() {
            Some(pipe) => Pin::new(pipe).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Some(e) = this.closed.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        match this.pipe.as_mut() {
            Some(pipe) => Pin::new(pipe).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl SendStream for MemorySendStream {
    fn reset(&mut self, _code: u32) {
        self.direction.reset.store(true, Ordering::Release);
        self.pipe = None;
    }
}

impl AsyncRead for MemoryRecvStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Some(e) = this.closed.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        let Some(pipe) = this.pipe.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream stopped",
            )));
        };
        let before = buf.filled().len();
        ready!(Pin::new(pipe).poll_read(cx, buf))?;
        if buf.filled().len() == before && this.direction.reset.load(Ordering::Acquire) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset by peer",
            )));
        }
        Poll::Ready(Ok(()))
    }
}

impl RecvStream for MemoryRecvStream {
    fn stop(&mut self, _code: u32) {
        self.direction.stopped.store(true, Ordering::Release);
        self.pipe = None;
    }
}

struct Shared {
    closed: CancellationToken,
    reason: Mutex<Option<(u32, Bytes)>>,
    secret: [u8; 32],
    config: MemoryConfig,
}

struct Endpoint {
    open_bi: mpsc::UnboundedSender<(MemorySendStream, MemoryRecvStream)>,
    incoming_bi: AsyncMutex<mpsc::UnboundedReceiver<(MemorySendStream, MemoryRecvStream)>>,
    open_uni: mpsc::UnboundedSender<MemoryRecvStream>,
    incoming_uni: AsyncMutex<mpsc::UnboundedReceiver<MemoryRecvStream>>,
    datagram_tx: mpsc::Sender<Bytes>,
    datagram_rx: AsyncMutex<mpsc::Receiver<Bytes>>,
}

/// One side of an in-memory connection.
pub struct MemoryConnection {
    shared: Arc<Shared>,
    endpoint: Endpoint,
    local: SocketAddr,
    remote: SocketAddr,
    close_calls: AtomicUsize,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

impl MemoryConnection {
    /// Create a connected `(client, server)` pair with default settings.
    pub fn pair() -> (Self, Self) {
        Self::pair_with(MemoryConfig::default())
    }

    /// Create a connected `(client, server)` pair.
    pub fn pair_with(config: MemoryConfig) -> (Self, Self) {
        let client_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);
        let server_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 443);
        Self::pair_between(config, client_addr, server_addr)
    }

    fn pair_between(config: MemoryConfig, client: SocketAddr, server: SocketAddr) -> (Self, Self) {
        let shared = Arc::new(Shared {
            closed: CancellationToken::new(),
            reason: Mutex::new(None),
            secret: rand::random(),
            config,
        });

        let (c2s_bi_tx, c2s_bi_rx) = mpsc::unbounded_channel();
        let (s2c_bi_tx, s2c_bi_rx) = mpsc::unbounded_channel();
        let (c2s_uni_tx, c2s_uni_rx) = mpsc::unbounded_channel();
        let (s2c_uni_tx, s2c_uni_rx) = mpsc::unbounded_channel();
        let queue = config.datagram_queue.max(1);
        let (c2s_dgram_tx, c2s_dgram_rx) = mpsc::channel(queue);
        let (s2c_dgram_tx, s2c_dgram_rx) = mpsc::channel(queue);

        let client_side = Self {
            shared: shared.clone(),
            endpoint: Endpoint {
                open_bi: c2s_bi_tx,
                incoming_bi: AsyncMutex::new(s2c_bi_rx),
                open_uni: c2s_uni_tx,
                incoming_uni: AsyncMutex::new(s2c_uni_rx),
                datagram_tx: c2s_dgram_tx,
                datagram_rx: AsyncMutex::new(s2c_dgram_rx),
            },
            local: client,
            remote: server,
            close_calls: AtomicUsize::new(0),
        };
        let server_side = Self {
            shared,
            endpoint: Endpoint {
                open_bi: s2c_bi_tx,
                incoming_bi: AsyncMutex::new(c2s_bi_rx),
                open_uni: s2c_uni_tx,
                incoming_uni: AsyncMutex::new(c2s_uni_rx),
                datagram_tx: s2c_dgram_tx,
                datagram_rx: AsyncMutex::new(c2s_dgram_rx),
            },
            local: server,
            remote: client,
            close_calls: AtomicUsize::new(0),
        };
        (client_side, server_side)
    }

    /// Times `close` was called on this side.
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Code of the first close by either side.
    pub fn close_code(&self) -> Option<u32> {
        self.shared.reason.lock().as_ref().map(|(code, _)| *code)
    }

    /// Whether either side closed the connection.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    fn check_open(&self) -> io::Result<()> {
        if self.shared.closed.is_cancelled() {
            return Err(aborted(&self.shared));
        }
        Ok(())
    }

    fn buffer(&self) -> usize {
        self.shared.config.stream_buffer.max(1)
    }
}

#[async_trait]
impl QuicConnection for MemoryConnection {
    type SendStream = MemorySendStream;
    type RecvStream = MemoryRecvStream;

    async fn open_bi(&self) -> io::Result<(MemorySendStream, MemoryRecvStream)> {
        self.check_open()?;
        let (local_send, peer_recv) = stream(&self.shared, self.buffer());
        let (peer_send, local_recv) = stream(&self.shared, self.buffer());
        self.endpoint
            .open_bi
            .send((peer_send, peer_recv))
            .map_err(|_| aborted(&self.shared))?;
        Ok((local_send, local_recv))
    }

    async fn open_uni(&self) -> io::Result<MemorySendStream> {
        self.check_open()?;
        let (local_send, peer_recv) = stream(&self.shared, self.buffer());
        self.endpoint
            .open_uni
            .send(peer_recv)
            .map_err(|_| aborted(&self.shared))?;
        Ok(local_send)
    }

    async fn accept_bi(&self) -> io::Result<(MemorySendStream, MemoryRecvStream)> {
        self.check_open()?;
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(aborted(&self.shared)),
            next = async { self.endpoint.incoming_bi.lock().await.recv().await } => {
                next.ok_or_else(|| aborted(&self.shared))
            }
        }
    }

    async fn accept_uni(&self) -> io::Result<MemoryRecvStream> {
        self.check_open()?;
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(aborted(&self.shared)),
            next = async { self.endpoint.incoming_uni.lock().await.recv().await } => {
                next.ok_or_else(|| aborted(&self.shared))
            }
        }
    }

    fn send_datagram(&self, data: Bytes) -> Result<(), DatagramError> {
        self.check_open()?;
        let max = self
            .shared
            .config
            .max_datagram_size
            .ok_or(DatagramError::Unsupported)?;
        if data.len() > max {
            return Err(DatagramError::TooLarge { max });
        }
        match self.endpoint.datagram_tx.try_send(data) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(DatagramError::ConnectionLost(aborted(&self.shared)))
            }
        }
    }

    async fn read_datagram(&self) -> io::Result<Bytes> {
        self.check_open()?;
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(aborted(&self.shared)),
            next = async { self.endpoint.datagram_rx.lock().await.recv().await } => {
                next.ok_or_else(|| aborted(&self.shared))
            }
        }
    }

    fn max_datagram_size(&self) -> Option<usize> {
        self.shared.config.max_datagram_size
    }

    fn export_keying_material(
        &self,
        output: &mut [u8],
        label: &[u8],
        context: &[u8],
    ) -> io::Result<()> {
        let hk = Hkdf::<Sha256>::new(None, &self.shared.secret);
        let label_len = (label.len() as u32).to_be_bytes();
        hk.expand_multi_info(&[&label_len[..], label, context], output)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
    }

    fn close(&self, code: u32, reason: &[u8]) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut slot = self.shared.reason.lock();
            if slot.is_none() {
                *slot = Some((code, Bytes::copy_from_slice(reason)));
            }
        }
        self.shared.closed.cancel();
    }

    async fn closed(&self) -> io::Error {
        self.shared.closed.cancelled().await;
        aborted(&self.shared)
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut slot = self.shared.reason.lock();
        if slot.is_none() {
            *slot = Some((0, Bytes::from_static(b"connection dropped")));
        }
        drop(slot);
        self.shared.closed.cancel();
    }
}

struct TransportInner {
    incoming: mpsc::UnboundedSender<MemoryConnection>,
    config: MemoryConfig,
    connects: AtomicUsize,
    closed: AtomicBool,
    next_port: AtomicUsize,
}

/// Client end of an in-memory server. Each `connect` creates a connection
/// whose server half is delivered to the paired [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<TransportInner>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("connects", &self.connect_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Server end of an in-memory server.
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
    local: SocketAddr,
}

/// Create a connected transport and listener.
pub fn memory_endpoint(config: MemoryConfig) -> (MemoryTransport, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            inner: Arc::new(TransportInner {
                incoming: tx,
                config,
                connects: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                next_port: AtomicUsize::new(40000),
            }),
        },
        MemoryListener {
            incoming: rx,
            local: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 443),
        },
    )
}

impl MemoryTransport {
    /// Connections opened so far.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn connect(&self, remote: SocketAddr, _server_name: &str) -> io::Result<MemoryConnection> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport closed",
            ));
        }
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed) as u16;
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let (client, server) = MemoryConnection::pair_between(self.inner.config, local, remote);
        self.inner.incoming.send(server).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone")
        })?;
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(client)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Listener for MemoryListener {
    type Connection = MemoryConnection;

    async fn accept(&mut self) -> Option<io::Result<MemoryConnection>> {
        self.incoming.recv().await.map(Ok)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// A named path to an in-memory server. Dialers compare by name.
#[derive(Clone)]
pub struct MemoryDialer {
    name: Arc<str>,
    transport: MemoryTransport,
    remote: SocketAddr,
    dials: Arc<AtomicUsize>,
}

impl MemoryDialer {
    /// Create a dialer named `name` reaching `transport`.
    pub fn new(name: impl Into<Arc<str>>, transport: MemoryTransport) -> Self {
        Self {
            name: name.into(),
            transport,
            remote: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 443),
            dials: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Times `dial` was called on this dialer or its clones.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MemoryDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MemoryDialer").field(&self.name).finish()
    }
}

impl PartialEq for MemoryDialer {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for MemoryDialer {}

impl Hash for MemoryDialer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    type Transport = MemoryTransport;

    async fn dial(&self) -> io::Result<(MemoryTransport, SocketAddr)> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok((self.transport.clone(), self.remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bi_stream() {
        let (client, server) = MemoryConnection::pair();
        let (mut send, mut recv) = client.open_bi().await.unwrap();
        let (mut peer_send, mut peer_recv) = server.accept_bi().await.unwrap();

        send.write_all(b"ping").await.unwrap();
        send.shutdown().await.unwrap();
        let mut buf = Vec::new();
        peer_recv.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");

        peer_send.write_all(b"pong").await.unwrap();
        peer_send.shutdown().await.unwrap();
        buf.clear();
        recv.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");
    }

    #[tokio::test]
    async fn test_reset_is_error_for_reader() {
        let (client, server) = MemoryConnection::pair();
        let mut send = client.open_uni().await.unwrap();
        let mut recv = server.accept_uni().await.unwrap();
        send.reset(0);
        let mut buf = Vec::new();
        let err = recv.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_close_wakes_readers() {
        let (client, server) = MemoryConnection::pair();
        let (_send, mut recv) = client.open_bi().await.unwrap();
        let _peer = server.accept_bi().await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            recv.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        server.close(0xffff_fff1, b"authentication failed");

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(client.close_code(), Some(0xffff_fff1));
        assert!(client.accept_uni().await.is_err());
        assert_eq!(server.close_count(), 1);
        assert_eq!(client.close_count(), 0);
    }

    #[tokio::test]
    async fn test_datagram_limits() {
        let (client, server) = MemoryConnection::pair_with(MemoryConfig {
            max_datagram_size: Some(100),
            ..MemoryConfig::default()
        });
        assert!(matches!(
            client.send_datagram(Bytes::from(vec![0u8; 101])),
            Err(DatagramError::TooLarge { max: 100 })
        ));
        client.send_datagram(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(server.read_datagram().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_exporter_agrees_across_sides() {
        let (client, server) = MemoryConnection::pair();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        client.export_keying_material(&mut a, b"label", b"ctx").unwrap();
        server.export_keying_material(&mut b, b"label", b"ctx").unwrap();
        assert_eq!(a, b);

        server.export_keying_material(&mut b, b"label", b"other").unwrap();
        assert_ne!(a, b);

        let (other, _) = MemoryConnection::pair();
        other.export_keying_material(&mut b, b"label", b"ctx").unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_transport_delivers_server_half() {
        let (transport, mut listener) = memory_endpoint(MemoryConfig::default());
        let remote = listener.local_addr().unwrap();
        let client = transport.connect(remote, "memory").await.unwrap();
        let server = listener.accept().await.unwrap().unwrap();
        assert_eq!(client.remote_address(), remote);
        assert_eq!(server.remote_address(), client.local);
        assert_eq!(transport.connect_count(), 1);

        transport.close();
        assert!(transport.connect(remote, "memory").await.is_err());
    }
}
