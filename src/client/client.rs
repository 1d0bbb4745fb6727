//! Client-side connection lifecycle.
//!
//! A [`Client`] owns at most one physical connection to the relay server and
//! multiplexes logical requests over it:
//!
//! - TCP requests become bidirectional streams ([`Client::connect_tcp`])
//! - UDP sessions become associations ([`Client::associate`])
//!
//! The connection is dialed lazily by the first request. Dialing spawns the
//! authenticator, the datagram receiver, the unidirectional stream acceptor
//! (QUIC relay mode), a heartbeat sender and a close watcher, all inside one
//! [`TaskScope`] that is cancelled when the connection goes away.
//!
//! Once the physical connection is force-closed, by [`Client::force_close`],
//! a transport failure or the peer, the client stays [`ClientPhase::Closed`]
//! and every request fails with [`RelayError::ClientClosed`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::dial::DialCache;
use crate::core::constants::MAX_FRAME_SIZE;
use crate::core::{
    ClientOptions, CloseCode, DatagramError, Dialer, DialerConnection, QuicConnection, RecvStream,
    RelayError, RelayMode, Result, Transport,
};
use crate::crypto::{AuthGate, AuthState, AuthToken};
use crate::protocol::{Address, Authenticate, Command, Connect};
use crate::relay::{AssociationTable, PacketSender, StreamConn, UdpAssociation, send_uni};
use crate::transport::TaskScope;

/// Lifecycle phase of a client's physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientPhase {
    /// No physical connection yet.
    Unestablished,
    /// Connected, authentication not yet sent.
    Authenticating,
    /// Authenticated; requests flow.
    Open,
    /// Logically closed; waiting for open streams to finish.
    Closing,
    /// Physical connection torn down. Terminal.
    Closed,
}

/// One physical connection and the tasks serving it.
struct Established<C: QuicConnection> {
    conn: Arc<C>,
    gate: AuthGate,
    scope: TaskScope,
    sender: PacketSender<C>,
    closed: AtomicBool,
}

impl<C: QuicConnection> Established<C> {
    fn shutdown(&self, code: CloseCode, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conn.close(code.as_u32(), reason.as_bytes());
        self.scope.cancel();
        self.gate.resolve(AuthState::Closed);
    }
}

struct Inner<D: Dialer> {
    dialer: D,
    dials: Arc<DialCache<D>>,
    options: ClientOptions,
    dial_lock: AsyncMutex<()>,
    current: Mutex<Option<Arc<Established<DialerConnection<D>>>>>,
    table: Arc<AssociationTable>,
    open_streams: AtomicUsize,
    closing: AtomicBool,
    terminated: AtomicBool,
    last_visited: Mutex<Instant>,
}

/// A relay client bound to one network path.
///
/// Cheap to clone; clones share the physical connection.
pub struct Client<D: Dialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Dialer> fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("dialer", &self.inner.dialer)
            .field("phase", &self.phase())
            .field("open_streams", &self.open_streams())
            .finish()
    }
}

impl<D: Dialer> Client<D> {
    /// Create a client for `dialer` with its own transport cache.
    pub fn new(dialer: D, options: ClientOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::with_cache(dialer, options, Arc::new(DialCache::new())))
    }

    pub(crate) fn with_cache(dialer: D, options: ClientOptions, dials: Arc<DialCache<D>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialer,
                dials,
                options,
                dial_lock: AsyncMutex::new(()),
                current: Mutex::new(None),
                table: Arc::new(AssociationTable::new()),
                open_streams: AtomicUsize::new(0),
                closing: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                last_visited: Mutex::new(Instant::now()),
            }),
        }
    }

    /// The network path this client dials.
    pub fn dialer(&self) -> &D {
        &self.inner.dialer
    }

    /// Client options.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Open a relayed TCP stream to `address`.
    pub async fn connect_tcp(&self, address: Address) -> Result<StreamConn<DialerConnection<D>>> {
        self.touch();
        let est = self.inner.establish().await?;
        let guard = self.inner.acquire_stream()?;
        match open_connect(est.conn.as_ref(), address).await {
            Ok((send, recv)) => {
                tracing::trace!(open_streams = self.open_streams(), "stream opened");
                Ok(StreamConn::new(send, recv)
                    .with_close_signal(est.scope.close_signal())
                    .with_lease(Box::new(guard)))
            }
            Err(e) => {
                guard.release_now();
                if e.is_transport_error() {
                    tracing::debug!(error = %e, "stream open failed");
                    self.inner.force_close(CloseCode::ProtocolError, "stream open failed");
                    return Err(RelayError::ClientClosed);
                }
                Err(e)
            }
        }
    }

    /// Open a UDP association.
    pub async fn associate(&self) -> Result<UdpAssociation<DialerConnection<D>>> {
        self.touch();
        let est = self.inner.establish().await?;
        let guard = self.inner.acquire_stream()?;
        UdpAssociation::open(
            est.sender.clone(),
            self.inner.table.clone(),
            Some(Box::new(guard)),
        )
    }

    /// Close logically. The physical connection is torn down now if no
    /// stream is open, otherwise when the last one is released.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::Release);
        if self.inner.open_streams.load(Ordering::Acquire) == 0 {
            self.inner.force_close(CloseCode::ProtocolError, "client closed");
        } else {
            tracing::debug!(open_streams = self.open_streams(), "close deferred");
        }
    }

    /// Tear down the physical connection immediately. Idempotent.
    pub fn force_close(&self) {
        self.inner.force_close(CloseCode::ProtocolError, "client closed");
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ClientPhase {
        if self.inner.terminated.load(Ordering::Acquire) {
            return ClientPhase::Closed;
        }
        if self.inner.closing.load(Ordering::Acquire) {
            return ClientPhase::Closing;
        }
        match self.inner.current.lock().as_ref() {
            None => ClientPhase::Unestablished,
            Some(est) if est.gate.state() == AuthState::Pending => ClientPhase::Authenticating,
            Some(_) => ClientPhase::Open,
        }
    }

    /// Whether the client takes no new requests.
    pub fn is_closed(&self) -> bool {
        matches!(self.phase(), ClientPhase::Closing | ClientPhase::Closed)
    }

    /// Logical streams currently holding a slot.
    pub fn open_streams(&self) -> usize {
        self.inner.open_streams.load(Ordering::Acquire)
    }

    /// When a request last went through this client.
    pub fn last_visited(&self) -> Instant {
        *self.inner.last_visited.lock()
    }

    pub(crate) fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn touch(&self) {
        *self.inner.last_visited.lock() = Instant::now();
    }

    #[cfg(test)]
    fn connection(&self) -> Option<Arc<DialerConnection<D>>> {
        self.inner.current.lock().as_ref().map(|est| est.conn.clone())
    }
}

impl<D: Dialer> Inner<D> {
    async fn establish(self: &Arc<Self>) -> Result<Arc<Established<DialerConnection<D>>>> {
        let timeout = self.options.request_timeout;
        let est = tokio::time::timeout(timeout, async {
            let est = self.connection().await?;
            est.gate.wait().await?;
            Ok::<_, RelayError>(est)
        })
        .await
        .map_err(|_| RelayError::Timeout)??;
        Ok(est)
    }

    async fn connection(self: &Arc<Self>) -> Result<Arc<Established<DialerConnection<D>>>> {
        if let Some(est) = self.live()? {
            return Ok(est);
        }
        let _dialing = self.dial_lock.lock().await;
        if let Some(est) = self.live()? {
            return Ok(est);
        }

        let (transport, remote) = self.dials.get(&self.dialer).await?;
        tracing::debug!(dialer = ?self.dialer, %remote, "connecting");
        let conn = Arc::new(transport.connect(remote, &self.options.server_name).await?);
        let est = Arc::new(Established {
            sender: PacketSender::new(
                conn.clone(),
                self.options.relay_mode,
                self.options.max_udp_relay_packet_size,
            ),
            conn,
            gate: AuthGate::new(),
            scope: TaskScope::new(self.options.max_concurrent_tasks),
            closed: AtomicBool::new(false),
        });

        {
            let mut current = self.current.lock();
            if self.terminated.load(Ordering::Acquire) {
                drop(current);
                est.shutdown(CloseCode::ProtocolError, "client closed");
                return Err(RelayError::ClientClosed);
            }
            *current = Some(est.clone());
        }
        self.spawn_tasks(&est);
        Ok(est)
    }

    fn live(&self) -> Result<Option<Arc<Established<DialerConnection<D>>>>> {
        if self.terminated.load(Ordering::Acquire) || self.closing.load(Ordering::Acquire) {
            return Err(RelayError::ClientClosed);
        }
        Ok(self.current.lock().clone())
    }

    fn acquire_stream(self: &Arc<Self>) -> Result<StreamGuard<D>> {
        let max = self.options.max_open_streams;
        let open = self.open_streams.fetch_add(1, Ordering::AcqRel) + 1;
        if open > max {
            self.open_streams.fetch_sub(1, Ordering::AcqRel);
            return Err(RelayError::TooManyOpenStreams { max });
        }
        if self.closing.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire) {
            self.release_stream();
            return Err(RelayError::ClientClosed);
        }
        Ok(StreamGuard {
            client: self.clone(),
            linger: self.options.stream_linger,
        })
    }

    fn release_stream(&self) {
        let left = self.open_streams.fetch_sub(1, Ordering::AcqRel) - 1;
        if left == 0 && self.closing.load(Ordering::Acquire) {
            self.force_close(CloseCode::ProtocolError, "client closed");
        }
    }

    fn force_close(&self, code: CloseCode, reason: &str) {
        let est = {
            let mut current = self.current.lock();
            self.terminated.store(true, Ordering::Release);
            current.take()
        };
        if let Some(est) = est {
            tracing::debug!(dialer = ?self.dialer, reason, "force closing connection");
            est.shutdown(code, reason);
        }
        self.table.clear();
    }

    fn spawn_tasks(self: &Arc<Self>, est: &Arc<Established<DialerConnection<D>>>) {
        let weak = Arc::downgrade(self);

        est.scope.spawn(authenticate(
            weak.clone(),
            est.conn.clone(),
            est.gate.clone(),
            self.options.client_id,
            self.options.password.clone(),
        ));
        est.scope.spawn(receive_datagrams(
            weak.clone(),
            est.conn.clone(),
            self.table.clone(),
        ));
        if self.options.relay_mode == RelayMode::Quic {
            est.scope.spawn(accept_uni_streams(
                weak.clone(),
                est.conn.clone(),
                self.table.clone(),
                est.scope.clone(),
            ));
        }
        if !self.options.heartbeat_interval.is_zero() {
            est.scope.spawn(heartbeat(
                weak.clone(),
                est.conn.clone(),
                self.options.heartbeat_interval,
            ));
        }
        est.scope.spawn(watch_closed(weak, est.conn.clone()));
    }
}

impl<D: Dialer> Drop for Inner<D> {
    fn drop(&mut self) {
        if let Some(est) = self.current.get_mut().take() {
            est.shutdown(CloseCode::ProtocolError, "client dropped");
        }
    }
}

fn force_close_weak<D: Dialer>(client: &Weak<Inner<D>>, reason: &str) {
    if let Some(inner) = client.upgrade() {
        inner.force_close(CloseCode::ProtocolError, reason);
    }
}

async fn open_connect<C: QuicConnection>(
    conn: &C,
    address: Address,
) -> Result<(C::SendStream, C::RecvStream)> {
    let bytes = Command::Connect(Connect { address }).to_bytes()?;
    let (mut send, recv) = conn.open_bi().await?;
    send.write_all(&bytes).await?;
    Ok((send, recv))
}

async fn authenticate<D: Dialer>(
    client: Weak<Inner<D>>,
    conn: Arc<DialerConnection<D>>,
    gate: AuthGate,
    client_id: Uuid,
    password: Zeroizing<String>,
) {
    let sent = async {
        let token = AuthToken::derive(conn.as_ref(), &client_id, password.as_bytes())?;
        let auth = Command::Authenticate(Authenticate {
            client_id,
            token: *token.as_bytes(),
        });
        send_uni(conn.as_ref(), &auth).await
    };
    match sent.await {
        Ok(()) => {
            tracing::debug!(%client_id, "authentication sent");
            gate.resolve(AuthState::Accepted(client_id));
        }
        Err(e) => {
            tracing::warn!(%client_id, error = %e, "failed to send authentication");
            gate.resolve(AuthState::Closed);
            force_close_weak(&client, "authentication failed");
        }
    }
}

async fn receive_datagrams<D: Dialer>(
    client: Weak<Inner<D>>,
    conn: Arc<DialerConnection<D>>,
    table: Arc<AssociationTable>,
) {
    loop {
        let frame = match conn.read_datagram().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "datagram receive ended");
                force_close_weak(&client, "datagram receive failed");
                return;
            }
        };
        match Command::decode_frame(frame) {
            Ok(Command::Packet(packet)) => {
                table.dispatch(packet);
            }
            Ok(Command::Heartbeat) => tracing::trace!("heartbeat received"),
            Ok(other) => tracing::trace!(command = %other.command_type(), "unexpected datagram"),
            Err(e) => tracing::trace!(error = %e, "dropping malformed datagram"),
        }
    }
}

async fn accept_uni_streams<D: Dialer>(
    client: Weak<Inner<D>>,
    conn: Arc<DialerConnection<D>>,
    table: Arc<AssociationTable>,
    scope: TaskScope,
) {
    loop {
        let mut recv = match conn.accept_uni().await {
            Ok(recv) => recv,
            Err(e) => {
                tracing::debug!(error = %e, "uni stream accept ended");
                force_close_weak(&client, "stream accept failed");
                return;
            }
        };
        let table = table.clone();
        let spawned = scope
            .spawn_bounded(async move {
                match Command::read_stream(&mut recv, MAX_FRAME_SIZE).await {
                    Ok(Command::Packet(packet)) => {
                        table.dispatch(packet);
                    }
                    Ok(other) => {
                        tracing::trace!(command = %other.command_type(), "unexpected uni stream")
                    }
                    Err(e) => tracing::trace!(error = %e, "dropping malformed uni stream"),
                }
                recv.stop(0);
            })
            .await;
        if spawned.is_none() {
            return;
        }
    }
}

async fn heartbeat<D: Dialer>(
    client: Weak<Inner<D>>,
    conn: Arc<DialerConnection<D>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(inner) = client.upgrade() else {
            return;
        };
        let open = inner.open_streams.load(Ordering::Acquire);
        drop(inner);
        if open == 0 {
            continue;
        }
        let Ok(frame) = Command::Heartbeat.to_bytes() else {
            continue;
        };
        let sent = match conn.send_datagram(frame) {
            Err(DatagramError::Unsupported) => send_uni(conn.as_ref(), &Command::Heartbeat).await,
            other => other.map_err(|e| match e {
                DatagramError::ConnectionLost(e) => RelayError::Io(e),
                e => RelayError::Io(std::io::Error::other(e)),
            }),
        };
        match sent {
            Ok(()) => tracing::trace!(open_streams = open, "heartbeat sent"),
            Err(e) => tracing::debug!(error = %e, "heartbeat failed"),
        }
    }
}

async fn watch_closed<D: Dialer>(client: Weak<Inner<D>>, conn: Arc<DialerConnection<D>>) {
    let reason = conn.closed().await;
    tracing::debug!(error = %reason, "connection closed");
    force_close_weak(&client, "connection closed");
}

/// Holds one open-stream slot. Dropping it releases the slot after the
/// configured linger.
struct StreamGuard<D: Dialer> {
    client: Arc<Inner<D>>,
    linger: Duration,
}

impl<D: Dialer> StreamGuard<D> {
    fn release_now(mut self) {
        self.linger = Duration::ZERO;
    }
}

impl<D: Dialer> Drop for StreamGuard<D> {
    fn drop(&mut self) {
        if self.linger.is_zero() {
            self.client.release_stream();
            return;
        }
        let client = self.client.clone();
        let linger = self.linger;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(linger).await;
                    client.release_stream();
                });
            }
            Err(_) => client.release_stream(),
        }
    }
}
