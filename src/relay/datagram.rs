//! UDP relay: packet sending in both relay modes and client associations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::send_uni;
use super::stream::Lease;
use crate::core::constants::{
    ASSOCIATION_QUEUE_DEPTH, HEADER_SIZE, MAX_PAYLOAD_SIZE, PACKET_FIXED_SIZE,
};
use crate::core::{DatagramError, QuicConnection, RelayError, RelayMode, Result};
use crate::protocol::{Address, Command, Dissociate, Packet, Reassembler, fragment};

/// Sends UDP packets for any association on one connection.
pub struct PacketSender<C: QuicConnection> {
    conn: Arc<C>,
    mode: RelayMode,
    max_packet_size: usize,
}

impl<C: QuicConnection> Clone for PacketSender<C> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            mode: self.mode,
            max_packet_size: self.max_packet_size,
        }
    }
}

impl<C: QuicConnection> fmt::Debug for PacketSender<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketSender")
            .field("mode", &self.mode)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

impl<C: QuicConnection> PacketSender<C> {
    /// Create a sender. Payloads above `max_packet_size` are fragmented.
    pub fn new(conn: Arc<C>, mode: RelayMode, max_packet_size: usize) -> Self {
        Self {
            conn,
            mode,
            max_packet_size: max_packet_size.max(1),
        }
    }

    /// Relay mode in use.
    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    /// Send `data` for association `assoc_id`.
    pub async fn send(&self, assoc_id: u16, address: Address, data: Bytes) -> Result<()> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(RelayError::PacketTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let packet = Packet::new(assoc_id, rand::random(), address, data);
        match self.mode {
            RelayMode::Quic => {
                for piece in fragment(packet, self.max_packet_size)? {
                    send_uni(self.conn.as_ref(), &Command::Packet(piece)).await?;
                }
                Ok(())
            }
            RelayMode::Native => {
                let size = packet.data.len();
                let first = if size > self.max_packet_size {
                    self.try_fragments(packet.clone(), self.max_packet_size)
                } else {
                    self.try_datagram(Command::Packet(packet.clone()))
                };
                let max = match first {
                    Ok(()) => return Ok(()),
                    Err(Attempt::Failed(e)) => return Err(e),
                    Err(Attempt::TooLarge(max)) => max,
                };
                // Fragment 0 carries the full address and is the largest.
                let header = HEADER_SIZE + PACKET_FIXED_SIZE + packet.address.encoded_len();
                let chunk = max.saturating_sub(header);
                tracing::trace!(assoc_id, max, chunk, "datagram too large, fragmenting");
                match self.try_fragments(packet, chunk) {
                    Ok(()) => Ok(()),
                    Err(Attempt::Failed(e)) => Err(e),
                    Err(Attempt::TooLarge(max)) => Err(RelayError::PacketTooLarge {
                        size,
                        max: max.saturating_sub(header),
                    }),
                }
            }
        }
    }

    fn try_fragments(&self, packet: Packet, chunk: usize) -> std::result::Result<(), Attempt> {
        if chunk == 0 {
            return Err(Attempt::TooLarge(0));
        }
        let pieces = fragment(packet, chunk).map_err(|e| Attempt::Failed(e.into()))?;
        for piece in pieces {
            self.try_datagram(Command::Packet(piece))?;
        }
        Ok(())
    }

    fn try_datagram(&self, command: Command) -> std::result::Result<(), Attempt> {
        let bytes = command.to_bytes().map_err(|e| Attempt::Failed(e.into()))?;
        self.conn.send_datagram(bytes).map_err(|e| match e {
            DatagramError::TooLarge { max } => Attempt::TooLarge(max),
            DatagramError::Unsupported => {
                Attempt::Failed(RelayError::Config("peer does not accept datagrams".into()))
            }
            DatagramError::ConnectionLost(e) => Attempt::Failed(RelayError::Io(e)),
        })
    }
}

enum Attempt {
    TooLarge(usize),
    Failed(RelayError),
}

/// Client-side association id to inbound queue mapping.
#[derive(Debug, Default)]
pub struct AssociationTable {
    map: RwLock<HashMap<u16, mpsc::Sender<Packet>>>,
}

impl AssociationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a random unused id. `None` when all ids are taken.
    pub fn register(&self) -> Option<(u16, mpsc::Receiver<Packet>)> {
        let mut map = self.map.write();
        if map.len() > u16::MAX as usize {
            return None;
        }
        let id = loop {
            let candidate: u16 = rand::random();
            if !map.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = mpsc::channel(ASSOCIATION_QUEUE_DEPTH);
        map.insert(id, tx);
        Some((id, rx))
    }

    /// Queue an inbound packet for its association. Unknown ids and full
    /// queues drop the packet.
    pub fn dispatch(&self, packet: Packet) -> bool {
        let map = self.map.read();
        let Some(tx) = map.get(&packet.assoc_id) else {
            tracing::trace!(assoc_id = packet.assoc_id, "packet for unknown association");
            return false;
        };
        tx.try_send(packet).is_ok()
    }

    /// Forget an association.
    pub fn remove(&self, id: u16) -> bool {
        self.map.write().remove(&id).is_some()
    }

    /// Forget every association; their readers observe closure.
    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Live associations.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether no association is live.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

struct Inbound {
    rx: mpsc::Receiver<Packet>,
    reassembler: Reassembler,
}

/// A virtual UDP socket multiplexed over the connection.
///
/// Closing it sends `Dissociate` and leaves the connection untouched.
pub struct UdpAssociation<C: QuicConnection> {
    assoc_id: u16,
    sender: PacketSender<C>,
    table: Arc<AssociationTable>,
    inbound: AsyncMutex<Inbound>,
    closed: AtomicBool,
    lease: Mutex<Option<Lease>>,
}

impl<C: QuicConnection> fmt::Debug for UdpAssociation<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpAssociation")
            .field("assoc_id", &self.assoc_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C: QuicConnection> UdpAssociation<C> {
    /// Register a new association in `table`.
    pub fn open(
        sender: PacketSender<C>,
        table: Arc<AssociationTable>,
        lease: Option<Lease>,
    ) -> Result<Self> {
        let (assoc_id, rx) = table
            .register()
            .ok_or(RelayError::TooManyOpenStreams { max: u16::MAX as usize })?;
        tracing::debug!(assoc_id, "udp association opened");
        Ok(Self {
            assoc_id,
            sender,
            table,
            inbound: AsyncMutex::new(Inbound {
                rx,
                reassembler: Reassembler::new(),
            }),
            closed: AtomicBool::new(false),
            lease: Mutex::new(lease),
        })
    }

    /// Association id on the wire.
    pub fn assoc_id(&self) -> u16 {
        self.assoc_id
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one datagram to `target`.
    pub async fn send_to(&self, data: impl Into<Bytes>, target: Address) -> Result<usize> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let data = data.into();
        let len = data.len();
        self.sender.send(self.assoc_id, target, data).await?;
        Ok(len)
    }

    /// Wait for the next whole datagram and its source.
    pub async fn recv_from(&self) -> Result<(Bytes, Address)> {
        let mut inbound = self.inbound.lock().await;
        loop {
            if self.is_closed() {
                return Err(RelayError::Closed);
            }
            let packet = inbound.rx.recv().await.ok_or(RelayError::Closed)?;
            if let Some(whole) = inbound.reassembler.feed(packet) {
                return Ok((whole.data, whole.address));
            }
        }
    }

    /// Release the association and tell the server. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.table.remove(self.assoc_id);
        self.lease.lock().take();
        tracing::debug!(assoc_id = self.assoc_id, "udp association closed");
        let dissociate = Command::Dissociate(Dissociate {
            assoc_id: self.assoc_id,
        });
        send_uni(self.sender.conn.as_ref(), &dissociate).await
    }
}

impl<C: QuicConnection> Drop for UdpAssociation<C> {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.table.remove(self.assoc_id);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let conn = self.sender.conn.clone();
        let dissociate = Command::Dissociate(Dissociate {
            assoc_id: self.assoc_id,
        });
        handle.spawn(async move {
            if let Err(e) = send_uni(conn.as_ref(), &dissociate).await {
                tracing::trace!(error = %e, "dissociate on drop failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::CMD_PACKET;
    use crate::protocol::CommandType;
    use crate::transport::{MemoryConfig, MemoryConnection};

    fn target() -> Address {
        Address::SocketAddress("203.0.113.5:53".parse().unwrap())
    }

    #[tokio::test]
    async fn test_native_small_packet_is_one_datagram() {
        let (client, server) = MemoryConnection::pair();
        let sender = PacketSender::new(Arc::new(client), RelayMode::Native, 1500);
        sender.send(9, target(), Bytes::from_static(b"query")).await.unwrap();

        let raw = server.read_datagram().await.unwrap();
        assert_eq!(raw[1], CMD_PACKET);
        let Command::Packet(p) = Command::decode_frame(raw).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(p.assoc_id, 9);
        assert_eq!(p.fragment_total, 1);
        assert_eq!(&p.data[..], b"query");
    }

    #[tokio::test]
    async fn test_native_fragments_above_threshold() {
        let (client, server) = MemoryConnection::pair();
        let sender = PacketSender::new(Arc::new(client), RelayMode::Native, 100);
        sender.send(1, target(), Bytes::from(vec![3u8; 250])).await.unwrap();

        let mut reassembler = Reassembler::new();
        let mut whole = None;
        for _ in 0..3 {
            let Command::Packet(p) = Command::decode_frame(server.read_datagram().await.unwrap())
                .unwrap()
            else {
                panic!("expected packet");
            };
            assert_eq!(p.fragment_total, 3);
            whole = reassembler.feed(p).or(whole);
        }
        assert_eq!(whole.unwrap().data.len(), 250);
    }

    #[tokio::test]
    async fn test_native_retries_when_datagram_too_large() {
        let (client, server) = MemoryConnection::pair_with(MemoryConfig {
            max_datagram_size: Some(229),
            ..MemoryConfig::default()
        });
        let sender = PacketSender::new(Arc::new(client), RelayMode::Native, 1500);
        sender.send(1, target(), Bytes::from(vec![1u8; 1000])).await.unwrap();

        let mut reassembler = Reassembler::new();
        let mut count = 0;
        let whole = loop {
            let raw = server.read_datagram().await.unwrap();
            assert!(raw.len() <= 229);
            count += 1;
            let Command::Packet(p) = Command::decode_frame(raw).unwrap() else {
                panic!("expected packet");
            };
            if let Some(whole) = reassembler.feed(p) {
                break whole;
            }
        };
        assert_eq!(count, 5);
        assert_eq!(whole.data.len(), 1000);
        assert_eq!(whole.address, target());
    }

    #[tokio::test]
    async fn test_retry_leaves_room_for_domain_address() {
        let (client, server) = MemoryConnection::pair();
        let sender = PacketSender::new(Arc::new(client), RelayMode::Native, 1500);
        let target: Address = "stun.long-relay-name.example.org:3478".parse().unwrap();
        sender.send(2, target.clone(), Bytes::from(vec![5u8; 5000])).await.unwrap();

        let mut reassembler = Reassembler::new();
        let whole = loop {
            let raw = server.read_datagram().await.unwrap();
            assert!(raw.len() <= 1200, "datagram of {} bytes", raw.len());
            let Command::Packet(p) = Command::decode_frame(raw).unwrap() else {
                panic!("expected packet");
            };
            if let Some(whole) = reassembler.feed(p) {
                break whole;
            }
        };
        assert_eq!(whole.data.len(), 5000);
        assert_eq!(whole.address, target);
    }

    #[tokio::test]
    async fn test_quic_mode_uses_uni_streams() {
        let (client, server) = MemoryConnection::pair();
        let sender = PacketSender::new(Arc::new(client), RelayMode::Quic, 1500);
        sender.send(4, target(), Bytes::from_static(b"abc")).await.unwrap();

        let mut recv = server.accept_uni().await.unwrap();
        let cmd = Command::read_stream(&mut recv, 4096).await.unwrap();
        assert_eq!(cmd.command_type(), CommandType::Packet);
    }

    #[tokio::test]
    async fn test_rejects_oversized_payload() {
        let (client, _server) = MemoryConnection::pair();
        let sender = PacketSender::new(Arc::new(client), RelayMode::Native, 1500);
        let err = sender
            .send(1, target(), Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::PacketTooLarge { .. }));
    }

    #[test]
    fn test_table_register_and_dispatch() {
        let table = AssociationTable::new();
        let (a, mut rx_a) = table.register().unwrap();
        let (b, _rx_b) = table.register().unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        assert!(table.dispatch(Packet::new(a, 1, Address::None, Bytes::new())));
        assert_eq!(rx_a.try_recv().unwrap().assoc_id, a);
        let unknown = (0..=u16::MAX).find(|id| *id != a && *id != b).unwrap();
        assert!(!table.dispatch(Packet::new(unknown, 1, Address::None, Bytes::new())));

        assert!(table.remove(a));
        assert!(!table.remove(a));
        table.clear();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_association_close_sends_dissociate() {
        let (client, server) = MemoryConnection::pair();
        let sender = PacketSender::new(Arc::new(client), RelayMode::Native, 1500);
        let table = Arc::new(AssociationTable::new());
        let assoc = UdpAssociation::open(sender, table.clone(), None).unwrap();
        let id = assoc.assoc_id();

        assoc.close().await.unwrap();
        assoc.close().await.unwrap();
        assert!(table.is_empty());
        assert!(matches!(assoc.recv_from().await, Err(RelayError::Closed)));
        assert!(matches!(
            assoc.send_to(Bytes::from_static(b"x"), target()).await,
            Err(RelayError::Closed)
        ));

        let mut recv = server.accept_uni().await.unwrap();
        let cmd = Command::read_stream(&mut recv, 64).await.unwrap();
        assert_eq!(cmd, Command::Dissociate(Dissociate { assoc_id: id }));
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_association_receives_reassembled() {
        let (client, _server) = MemoryConnection::pair();
        let sender = PacketSender::new(Arc::new(client), RelayMode::Native, 1500);
        let table = Arc::new(AssociationTable::new());
        let assoc = UdpAssociation::open(sender, table.clone(), None).unwrap();

        let data = Bytes::from(vec![9u8; 300]);
        let pieces = fragment(Packet::new(assoc.assoc_id(), 5, target(), data.clone()), 128).unwrap();
        for piece in pieces.into_iter().rev() {
            assert!(table.dispatch(piece));
        }
        let (got, from) = assoc.recv_from().await.unwrap();
        assert_eq!(got, data);
        assert_eq!(from, target());
    }

    #[tokio::test]
    async fn test_clear_ends_readers() {
        let (client, _server) = MemoryConnection::pair();
        let sender = PacketSender::new(Arc::new(client), RelayMode::Native, 1500);
        let table = Arc::new(AssociationTable::new());
        let assoc = UdpAssociation::open(sender, table.clone(), None).unwrap();
        table.clear();
        assert!(matches!(assoc.recv_from().await, Err(RelayError::Closed)));
    }
}
