//! UDP packet fragmentation and reassembly.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use super::address::Address;
use super::command::Packet;
use super::error::CodecError;
use crate::core::constants::MAX_FRAGMENTS;

/// Split `packet` into fragments carrying at most `max_size` payload bytes.
///
/// Fragments share the packet id and are numbered from zero. Only the first
/// carries the address. A payload that already fits is returned unchanged.
pub fn fragment(packet: Packet, max_size: usize) -> Result<Vec<Packet>, CodecError> {
    let chunk = max_size.max(1);
    if packet.data.len() <= chunk {
        return Ok(vec![Packet {
            fragment_total: 1,
            fragment_id: 0,
            ..packet
        }]);
    }

    let count = packet.data.len().div_ceil(chunk);
    if count > MAX_FRAGMENTS {
        return Err(CodecError::TooManyFragments(count));
    }

    let mut fragments = Vec::with_capacity(count);
    let mut address = packet.address;
    for (id, start) in (0..packet.data.len()).step_by(chunk).enumerate() {
        let end = (start + chunk).min(packet.data.len());
        fragments.push(Packet {
            assoc_id: packet.assoc_id,
            packet_id: packet.packet_id,
            fragment_total: count as u8,
            fragment_id: id as u8,
            address: std::mem::replace(&mut address, Address::None),
            data: packet.data.slice(start..end),
        });
    }
    Ok(fragments)
}

#[derive(Debug)]
struct Slot {
    assoc_id: u16,
    packet_id: u16,
    address: Address,
    fragments: Vec<Option<Bytes>>,
    received: usize,
    started: Instant,
}

impl Slot {
    fn new(assoc_id: u16, packet_id: u16, total: u8) -> Self {
        Self {
            assoc_id,
            packet_id,
            address: Address::None,
            fragments: vec![None; total as usize],
            received: 0,
            started: Instant::now(),
        }
    }
}

/// Rebuilds fragmented packets for one association.
///
/// Holds a single in-progress packet. A fragment for a different packet id
/// discards it. Duplicate and out-of-range fragments are dropped, and each
/// packet is emitted at most once.
#[derive(Debug, Default)]
pub struct Reassembler {
    slot: Option<Slot>,
    last_completed: Option<u16>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet. Returns a whole packet once one is complete.
    pub fn feed(&mut self, packet: Packet) -> Option<Packet> {
        if packet.fragment_total <= 1 {
            return (packet.fragment_id == 0).then_some(packet);
        }
        if packet.fragment_id >= packet.fragment_total {
            tracing::trace!(
                packet_id = packet.packet_id,
                fragment_id = packet.fragment_id,
                fragment_total = packet.fragment_total,
                "dropping out-of-range fragment"
            );
            return None;
        }
        if self.slot.is_none() && self.last_completed == Some(packet.packet_id) {
            return None;
        }

        let restart = match &self.slot {
            Some(slot) => {
                slot.packet_id != packet.packet_id
                    || slot.fragments.len() != packet.fragment_total as usize
            }
            None => true,
        };
        if restart {
            if let Some(old) = &self.slot {
                tracing::trace!(
                    packet_id = old.packet_id,
                    received = old.received,
                    "discarding incomplete packet"
                );
            }
            self.slot = Some(Slot::new(
                packet.assoc_id,
                packet.packet_id,
                packet.fragment_total,
            ));
            self.last_completed = None;
        }

        let slot = self.slot.as_mut()?;
        let index = packet.fragment_id as usize;
        if slot.fragments[index].is_some() {
            return None;
        }
        if index == 0 {
            slot.address = packet.address;
        }
        slot.fragments[index] = Some(packet.data);
        slot.received += 1;
        if slot.received < slot.fragments.len() {
            return None;
        }

        let slot = self.slot.take()?;
        let len = slot.fragments.iter().flatten().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(len);
        for piece in slot.fragments.iter().flatten() {
            data.extend_from_slice(piece);
        }
        self.last_completed = Some(slot.packet_id);
        Some(Packet {
            assoc_id: slot.assoc_id,
            packet_id: slot.packet_id,
            fragment_total: 1,
            fragment_id: 0,
            address: slot.address,
            data: data.freeze(),
        })
    }

    /// Whether a packet is partially reassembled.
    pub fn is_pending(&self) -> bool {
        self.slot.is_some()
    }

    /// Drop the partial packet if its first fragment arrived more than
    /// `max_age` ago. Returns whether anything was dropped.
    pub fn expire(&mut self, max_age: Duration) -> bool {
        let stale = self
            .slot
            .as_ref()
            .is_some_and(|slot| slot.started.elapsed() > max_age);
        if stale {
            self.slot = None;
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    fn source() -> Address {
        Address::SocketAddress("198.51.100.7:5353".parse().unwrap())
    }

    fn reassemble(fragments: Vec<Packet>) -> Option<Packet> {
        let mut reassembler = Reassembler::new();
        let mut out = None;
        for f in fragments {
            if let Some(p) = reassembler.feed(f) {
                assert!(out.is_none(), "completed twice");
                out = Some(p);
            }
        }
        out
    }

    #[test]
    fn test_fits_single_packet() {
        let packet = Packet::new(1, 2, source(), payload(100));
        let fragments = fragment(packet.clone(), 100).unwrap();
        assert_eq!(fragments, vec![packet]);
    }

    #[test]
    fn test_fragment_round_trip() {
        for len in [1usize, 99, 100, 101, 1000, 4096, 20_000] {
            for size in [1usize, 7, 100, 512, 1168] {
                if len.div_ceil(size) > MAX_FRAGMENTS {
                    continue;
                }
                let data = payload(len);
                let fragments =
                    fragment(Packet::new(3, 9, source(), data.clone()), size).unwrap();
                for f in &fragments {
                    assert!(f.data.len() <= size);
                    assert!(f.fragment_id < f.fragment_total || f.fragment_total == 1);
                }
                let whole = reassemble(fragments).unwrap();
                assert_eq!(whole.data, data, "len {len} size {size}");
                assert_eq!(whole.address, source());
            }
        }
    }

    #[test]
    fn test_address_only_on_first_fragment() {
        let fragments = fragment(Packet::new(1, 1, source(), payload(30)), 10).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].address, source());
        assert!(fragments[1].address.is_none());
        assert!(fragments[2].address.is_none());
    }

    #[test]
    fn test_too_many_fragments() {
        let err = fragment(Packet::new(1, 1, source(), payload(256)), 1).unwrap_err();
        assert!(matches!(err, CodecError::TooManyFragments(256)));
    }

    #[test]
    fn test_hundred_kilobytes_reverse_order() {
        let data = payload(100_000);
        let fragments = fragment(Packet::new(5, 77, source(), data.clone()), 1400).unwrap();
        assert_eq!(fragments.len(), 72);
        assert!(fragments.iter().all(|f| f.fragment_total == 72));

        let whole = reassemble(fragments.into_iter().rev().collect()).unwrap();
        assert_eq!(whole.data.len(), 100_000);
        assert_eq!(whole.data, data);
        assert_eq!(whole.address, source());
    }

    #[test]
    fn test_any_permutation_completes_once() {
        let data = payload(5000);
        let fragments = fragment(Packet::new(1, 4, source(), data.clone()), 300).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut shuffled = fragments.clone();
            shuffled.shuffle(&mut rng);
            let whole = reassemble(shuffled).unwrap();
            assert_eq!(whole.data, data);
        }
    }

    #[test]
    fn test_duplicates_ignored() {
        let fragments = fragment(Packet::new(1, 4, source(), payload(30)), 10).unwrap();
        let mut reassembler = Reassembler::new();
        assert!(reassembler.feed(fragments[0].clone()).is_none());
        assert!(reassembler.feed(fragments[0].clone()).is_none());
        assert!(reassembler.feed(fragments[1].clone()).is_none());
        assert!(reassembler.feed(fragments[2].clone()).is_some());

        for f in fragments {
            assert!(reassembler.feed(f).is_none());
        }
        assert!(!reassembler.is_pending());
    }

    #[test]
    fn test_out_of_range_dropped() {
        let mut reassembler = Reassembler::new();
        let bogus = Packet {
            fragment_total: 2,
            fragment_id: 2,
            ..Packet::new(1, 1, Address::None, payload(4))
        };
        assert!(reassembler.feed(bogus).is_none());
        assert!(!reassembler.is_pending());
    }

    #[test]
    fn test_new_packet_discards_partial() {
        let first = fragment(Packet::new(1, 10, source(), payload(30)), 10).unwrap();
        let second = fragment(Packet::new(1, 11, source(), payload(20)), 10).unwrap();

        let mut reassembler = Reassembler::new();
        assert!(reassembler.feed(first[0].clone()).is_none());
        assert!(reassembler.feed(second[0].clone()).is_none());
        assert!(reassembler.feed(first[1].clone()).is_none());
        assert!(reassembler.feed(first[2].clone()).is_none());
        assert!(reassembler.feed(second[0].clone()).is_none());

        let mut reassembler = Reassembler::new();
        assert!(reassembler.feed(second[0].clone()).is_none());
        let whole = reassembler.feed(second[1].clone()).unwrap();
        assert_eq!(whole.packet_id, 11);
        assert_eq!(whole.data.len(), 20);
    }

    #[test]
    fn test_unfragmented_passes_through() {
        let mut reassembler = Reassembler::new();
        let packet = Packet::new(1, 1, source(), payload(10));
        assert_eq!(reassembler.feed(packet.clone()), Some(packet));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_drops_stale_partial() {
        let pieces = fragment(Packet::new(1, 7, source(), payload(30)), 10).unwrap();
        let mut reassembler = Reassembler::new();
        assert!(reassembler.feed(pieces[0].clone()).is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!reassembler.expire(Duration::from_secs(10)));
        assert!(reassembler.is_pending());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(reassembler.expire(Duration::from_secs(10)));
        assert!(!reassembler.is_pending());
        assert!(!reassembler.expire(Duration::from_secs(10)));
    }
}
