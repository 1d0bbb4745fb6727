//! Server side of one physical connection.
//!
//! A session runs three receive loops (bidirectional streams,
//! unidirectional streams, datagrams) in its own [`TaskScope`]. Every frame
//! other than `Authenticate` waits on the session's [`AuthGate`] before it is
//! acted on. The gate fails, and the connection closes, on a bad token or
//! when no `Authenticate` arrives within the configured timeout.
//!
//! Unknown or misplaced commands close the connection with `BadCommand`;
//! other malformed frames only drop the stream or datagram they came in.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use super::handler::{ServerHandler, UdpPacket};
use crate::core::constants::{MAX_FRAME_SIZE, REASSEMBLY_TIMEOUT};
use crate::core::{CloseCode, QuicConnection, RecvStream, RelayMode, SendStream, ServerOptions};
use crate::crypto::{AuthGate, AuthState, AuthToken};
use crate::protocol::{
    Address, Authenticate, CodecError, Command, CommandHeader, CommandType, Packet, Reassembler,
};
use crate::relay::{PacketSender, StreamConn};
use crate::transport::TaskScope;

struct ServerAssociation {
    write_closed: Arc<AtomicBool>,
    reassembler: Reassembler,
}

impl ServerAssociation {
    fn new() -> Self {
        Self {
            write_closed: Arc::new(AtomicBool::new(false)),
            reassembler: Reassembler::new(),
        }
    }
}

pub(crate) struct Session<C: QuicConnection, H> {
    conn: Arc<C>,
    options: Arc<ServerOptions>,
    handler: Arc<H>,
    gate: AuthGate,
    scope: TaskScope,
    native: PacketSender<C>,
    quic: PacketSender<C>,
    associations: Mutex<HashMap<u16, ServerAssociation>>,
    closed: AtomicBool,
}

impl<C, H> Session<C, H>
where
    C: QuicConnection,
    H: ServerHandler<C>,
{
    pub(crate) fn new(
        conn: C,
        options: Arc<ServerOptions>,
        handler: Arc<H>,
        scope: TaskScope,
    ) -> Arc<Self> {
        let conn = Arc::new(conn);
        let max = options.effective_max_udp_relay_packet_size();
        Arc::new(Self {
            native: PacketSender::new(conn.clone(), RelayMode::Native, max),
            quic: PacketSender::new(conn.clone(), RelayMode::Quic, max),
            conn,
            options,
            handler,
            gate: AuthGate::new(),
            scope,
            associations: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Serve the connection until it closes.
    pub(crate) async fn run(self: Arc<Self>) {
        let remote = self.conn.remote_address();
        tracing::debug!(%remote, "session started");

        self.scope.spawn(self.clone().accept_bi());
        self.scope.spawn(self.clone().accept_uni());
        self.scope.spawn(self.clone().receive_datagrams());
        self.scope.spawn(self.clone().expire_fragments());

        let timeout = self.options.authentication_timeout;
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if self.gate.resolve(AuthState::TimedOut) {
                    tracing::warn!(%remote, ?timeout, "authentication timed out");
                    self.close(CloseCode::AuthenticationTimeout);
                }
            }
            _ = self.gate.wait() => {}
            _ = self.scope.cancelled() => {}
        }

        tokio::select! {
            reason = self.conn.closed() => {
                tracing::debug!(%remote, error = %reason, "session closed");
            }
            _ = self.scope.cancelled() => {
                self.close(CloseCode::ProtocolError);
            }
        }
        self.scope.cancel();
        self.gate.resolve(AuthState::Closed);
        self.associations.lock().clear();
    }

    fn close(&self, code: CloseCode) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conn.close(code.as_u32(), code.reason().as_bytes());
        self.scope.cancel();
        self.gate.resolve(AuthState::Closed);
    }

    /// Route a decode failure: bad commands end the connection, anything
    /// else only the frame.
    fn frame_error(&self, error: &CodecError, channel: &'static str) {
        if error.is_bad_command() {
            tracing::warn!(channel, %error, "bad command");
            self.close(CloseCode::BadCommand);
        } else {
            tracing::trace!(channel, %error, "dropping malformed frame");
        }
    }

    fn misplaced(&self, command: CommandType, channel: &'static str) {
        self.frame_error(
            &CodecError::UnexpectedCommand {
                expected: channel,
                actual: command,
            },
            channel,
        );
    }

    async fn accept_bi(self: Arc<Self>) {
        loop {
            let (send, recv) = match self.conn.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    tracing::trace!(error = %e, "bidirectional accept ended");
                    return;
                }
            };
            let session = self.clone();
            if self
                .scope
                .spawn_bounded(session.handle_bi(send, recv))
                .await
                .is_none()
            {
                return;
            }
        }
    }

    async fn handle_bi(self: Arc<Self>, mut send: C::SendStream, mut recv: C::RecvStream) {
        let header = match CommandHeader::read_from(&mut recv).await {
            Ok(header) => header,
            Err(CodecError::VersionMismatch { actual, .. }) => {
                tracing::debug!(version = actual, "resetting stream of foreign version");
                send.reset(0);
                recv.stop(0);
                return;
            }
            Err(e) => return self.frame_error(&e, "bidirectional stream"),
        };
        if let Err(e) = header.expect(CommandType::Connect, "bidirectional stream") {
            return self.frame_error(&e, "bidirectional stream");
        }
        let target = match Address::read_from(&mut recv).await {
            Ok(target) => target,
            Err(e) => {
                self.frame_error(&e, "bidirectional stream");
                recv.stop(0);
                let _ = send.shutdown().await;
                return;
            }
        };

        let Ok(user) = self.gate.wait().await else {
            recv.stop(0);
            send.reset(0);
            return;
        };
        tracing::debug!(%user, %target, "tcp relay requested");
        let stream = StreamConn::<C>::new(send, recv).with_close_signal(self.scope.close_signal());
        if let Err(e) = self.handler.handle_tcp(stream, target, user).await {
            tracing::debug!(%user, error = %e, "tcp relay ended with error");
        }
    }

    async fn accept_uni(self: Arc<Self>) {
        loop {
            let recv = match self.conn.accept_uni().await {
                Ok(recv) => recv,
                Err(e) => {
                    tracing::trace!(error = %e, "unidirectional accept ended");
                    return;
                }
            };
            let session = self.clone();
            if self
                .scope
                .spawn_bounded(session.handle_uni(recv))
                .await
                .is_none()
            {
                return;
            }
        }
    }

    async fn handle_uni(self: Arc<Self>, mut recv: C::RecvStream) {
        let command = Command::read_stream(&mut recv, MAX_FRAME_SIZE).await;
        recv.stop(0);
        let command = match command {
            Ok(command) => command,
            Err(e) => return self.frame_error(&e, "unidirectional stream"),
        };
        match command {
            Command::Authenticate(auth) => self.authenticate(auth),
            Command::Packet(packet) => self.on_packet(packet, RelayMode::Quic).await,
            Command::Dissociate(d) => {
                if self.gate.wait().await.is_ok() {
                    self.dissociate(d.assoc_id);
                }
            }
            Command::Heartbeat => tracing::trace!("heartbeat"),
            Command::Connect(_) => self.misplaced(CommandType::Connect, "unidirectional stream"),
        }
    }

    async fn receive_datagrams(self: Arc<Self>) {
        loop {
            let frame = match self.conn.read_datagram().await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::trace!(error = %e, "datagram receive ended");
                    return;
                }
            };
            let command = match Command::decode_frame(frame) {
                Ok(command) => command,
                Err(e) => {
                    self.frame_error(&e, "datagram");
                    continue;
                }
            };
            match command {
                Command::Packet(packet) => {
                    let session = self.clone();
                    let task = session.on_packet(packet, RelayMode::Native);
                    if self.scope.spawn_bounded(task).await.is_none() {
                        return;
                    }
                }
                Command::Heartbeat => tracing::trace!("heartbeat"),
                other => self.misplaced(other.command_type(), "datagram"),
            }
        }
    }

    fn authenticate(&self, auth: Authenticate) {
        let client_id = auth.client_id;
        let valid = match self.options.password_for(&client_id) {
            Some(password) => {
                match AuthToken::derive(self.conn.as_ref(), &client_id, password.as_bytes()) {
                    Ok(expected) => expected.verify(&auth.token),
                    Err(e) => {
                        tracing::warn!(%client_id, error = %e, "token derivation failed");
                        false
                    }
                }
            }
            None => false,
        };

        if valid {
            if self.gate.resolve(AuthState::Accepted(client_id)) {
                tracing::debug!(%client_id, "client authenticated");
            } else {
                tracing::trace!(%client_id, "ignoring repeated authentication");
            }
        } else if self.gate.resolve(AuthState::Failed) {
            tracing::warn!(%client_id, remote = %self.conn.remote_address(), "authentication failed");
            self.close(CloseCode::AuthenticationFailed);
        }
    }

    async fn on_packet(self: Arc<Self>, packet: Packet, mode: RelayMode) {
        let Ok(user) = self.gate.wait().await else {
            return;
        };
        let assoc_id = packet.assoc_id;
        let (whole, write_closed) = {
            let mut associations = self.associations.lock();
            let assoc = associations
                .entry(assoc_id)
                .or_insert_with(ServerAssociation::new);
            let Some(whole) = assoc.reassembler.feed(packet) else {
                return;
            };
            (whole, assoc.write_closed.clone())
        };

        let sender = match mode {
            RelayMode::Native => self.native.clone(),
            RelayMode::Quic => self.quic.clone(),
        };
        tracing::trace!(assoc_id, %user, len = whole.data.len(), "udp packet");
        let packet = UdpPacket {
            assoc_id,
            target: whole.address,
            data: whole.data,
            user,
            remote: self.conn.remote_address(),
            sender,
            write_closed,
        };
        if let Err(e) = self.handler.handle_udp(packet).await {
            tracing::debug!(assoc_id, error = %e, "udp relay failed");
        }
    }

    async fn expire_fragments(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(REASSEMBLY_TIMEOUT / 2);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut expired = 0;
            for assoc in self.associations.lock().values_mut() {
                if assoc.reassembler.expire(REASSEMBLY_TIMEOUT) {
                    expired += 1;
                }
            }
            if expired > 0 {
                tracing::trace!(expired, "dropped stale partial packets");
            }
        }
    }

    fn dissociate(&self, assoc_id: u16) {
        if let Some(assoc) = self.associations.lock().remove(&assoc_id) {
            assoc.write_closed.store(true, Ordering::Release);
            tracing::debug!(assoc_id, "association dissociated");
        }
    }
}
