//! Relayed TCP streams.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::core::{QuicConnection, RecvStream, RelayError, SendStream};
use crate::transport::CloseSignal;

/// Opaque value held for the stream's lifetime and dropped on close.
pub type Lease = Box<dyn Send + Sync>;

/// A bidirectional stream carrying one proxied TCP session.
///
/// After the `Connect` header the stream is plain bytes. Shutting down the
/// write side sends FIN. When the owning connection is torn down, pending
/// and later I/O fails with `ConnectionAborted`.
pub struct StreamConn<C: QuicConnection> {
    send: C::SendStream,
    recv: C::RecvStream,
    signal: Option<CloseSignal>,
    lease: Option<Lease>,
    closed: bool,
}

impl<C: QuicConnection> fmt::Debug for StreamConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConn")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<C: QuicConnection> StreamConn<C> {
    /// Wrap the two halves of a bidirectional stream.
    pub fn new(send: C::SendStream, recv: C::RecvStream) -> Self {
        Self {
            send,
            recv,
            signal: None,
            lease: None,
            closed: false,
        }
    }

    /// Fail I/O once `signal` fires.
    pub fn with_close_signal(mut self, signal: CloseSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Hold `lease` until the stream is closed or dropped.
    pub fn with_lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Close both directions. Idempotent.
    ///
    /// Finishes the send side if that completes immediately, resets it
    /// otherwise, then stops the receive side.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match tokio::time::timeout(Duration::ZERO, self.send.shutdown()).await {
            Ok(Ok(())) => {}
            _ => self.send.reset(0),
        }
        self.recv.stop(0);
        self.lease = None;
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        let signal = self.signal.as_mut()?;
        signal
            .poll_cancelled(cx)
            .then(|| io::Error::new(io::ErrorKind::ConnectionAborted, RelayError::ClientClosed))
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
        }
        Ok(())
    }
}

impl<C: QuicConnection> AsyncRead for StreamConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_open()?;
        if let Some(e) = this.poll_aborted(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.recv).poll_read(cx, buf)
    }
}

impl<C: QuicConnection> AsyncWrite for StreamConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_open()?;
        if let Some(e) = this.poll_aborted(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.send).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_aborted(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.send).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_aborted(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.send).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryConnection, TaskScope};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncReadExt;

    struct Flag(Arc<AtomicBool>);

    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_plain_bytes_after_setup() {
        let (client, server) = MemoryConnection::pair();
        let (send, recv) = client.open_bi().await.unwrap();
        let mut conn = StreamConn::<MemoryConnection>::new(send, recv);
        let (peer_send, peer_recv) = server.accept_bi().await.unwrap();
        let mut peer = StreamConn::<MemoryConnection>::new(peer_send, peer_recv);

        conn.write_all(b"hello").await.unwrap();
        conn.shutdown().await.unwrap();
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drops_lease() {
        let (client, server) = MemoryConnection::pair();
        let (send, recv) = client.open_bi().await.unwrap();
        let _peer = server.accept_bi().await.unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let mut conn = StreamConn::<MemoryConnection>::new(send, recv)
            .with_lease(Box::new(Flag(released.clone())));
        conn.close().await;
        assert!(released.load(Ordering::SeqCst));
        conn.close().await;
        assert!(conn.is_closed());
        assert!(conn.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_scope_cancel_aborts_pending_read() {
        let (client, server) = MemoryConnection::pair();
        let (send, recv) = client.open_bi().await.unwrap();
        let _peer = server.accept_bi().await.unwrap();

        let scope = TaskScope::new(1);
        let mut conn =
            StreamConn::<MemoryConnection>::new(send, recv).with_close_signal(scope.close_signal());
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            conn.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        scope.cancel();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_scope_cancel_fails_flush_and_shutdown() {
        let (client, server) = MemoryConnection::pair();
        let (send, recv) = client.open_bi().await.unwrap();
        let _peer = server.accept_bi().await.unwrap();

        let scope = TaskScope::new(1);
        let mut conn =
            StreamConn::<MemoryConnection>::new(send, recv).with_close_signal(scope.close_signal());
        scope.cancel();

        let err = conn.flush().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        let err = conn.shutdown().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
