//! Fragmentation and Reassembly
//!
//! A packet whose encoding exceeds the bearer MTU is split into `Fragment`
//! packets. Each fragment keeps the original sender, recipient and TTL so it
//! can be relayed on its own; only the final recipient reassembles.
//!
//! Fragment payload: `message_id (8) | index (2) | count (2) | checksum (4) | chunk`

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use super::packet::{Packet, PacketType, MIN_PACKET_LEN};
use crate::error::{CapacityError, CodecError, MeshError, MeshResult};
use crate::identity::{PeerId, PEER_ID_LEN};

pub const FRAGMENT_HEADER_LEN: usize = 16;
pub const MESSAGE_ID_LEN: usize = 8;

/// Bookkeeping charged against the byte budget for every buffered chunk
const CHUNK_OVERHEAD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: [u8; MESSAGE_ID_LEN],
    pub index: u16,
    pub count: u16,
    pub checksum: [u8; 4],
    pub chunk: Vec<u8>,
}

impl Fragment {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.chunk.len());
        out.extend_from_slice(&self.message_id);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.count.to_be_bytes());
        out.extend_from_slice(&self.checksum);
        out.extend_from_slice(&self.chunk);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < FRAGMENT_HEADER_LEN {
            return Err(CodecError::malformed("truncated fragment header"));
        }
        let mut message_id = [0u8; MESSAGE_ID_LEN];
        message_id.copy_from_slice(&data[..8]);
        let index = u16::from_be_bytes([data[8], data[9]]);
        let count = u16::from_be_bytes([data[10], data[11]]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&data[12..16]);

        if count == 0 || index >= count {
            return Err(CodecError::malformed(format!("fragment index {} of {}", index, count)));
        }

        Ok(Self {
            message_id,
            index,
            count,
            checksum,
            chunk: data[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

fn checksum(data: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

/// Split `packet` so that every produced packet encodes to at most `mtu`
/// bytes. A packet that already fits is returned unchanged.
pub fn fragment_packet(packet: &Packet, mtu: usize) -> Result<Vec<Packet>, CodecError> {
    let encoded = packet.encode()?;
    if encoded.len() <= mtu {
        return Ok(vec![packet.clone()]);
    }

    let overhead = MIN_PACKET_LEN + packet.recipient.map_or(0, |_| PEER_ID_LEN) + FRAGMENT_HEADER_LEN;
    if mtu <= overhead {
        return Err(CodecError::Oversized { size: overhead, max: mtu });
    }
    let chunk_size = mtu - overhead;
    let count = encoded.len().div_ceil(chunk_size);
    if count > u16::MAX as usize {
        return Err(CodecError::Oversized {
            size: encoded.len(),
            max: chunk_size * u16::MAX as usize,
        });
    }

    let mut message_id = [0u8; MESSAGE_ID_LEN];
    rand::thread_rng().fill_bytes(&mut message_id);
    let checksum = checksum(&encoded);

    let fragments = encoded
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let fragment = Fragment {
                message_id,
                index: index as u16,
                count: count as u16,
                checksum,
                chunk: chunk.to_vec(),
            };
            let mut out = Packet::new(PacketType::Fragment, packet.sender, packet.ttl, fragment.encode());
            out.timestamp = packet.timestamp;
            if let Some(recipient) = packet.recipient {
                out = out.with_recipient(recipient);
            }
            out
        })
        .collect();

    Ok(fragments)
}

struct PartialSet {
    count: u16,
    checksum: [u8; 4],
    chunks: BTreeMap<u16, Vec<u8>>,
    bytes: usize,
    started: Instant,
}

/// Buffers fragments per `(sender, message_id)` until a set completes.
/// Memory is bounded by a set count, a byte budget and a timeout.
pub struct Reassembler {
    sets: HashMap<(PeerId, [u8; MESSAGE_ID_LEN]), PartialSet>,
    buffered_bytes: usize,
    max_sets: usize,
    max_bytes: usize,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(max_sets: usize, max_bytes: usize, timeout: Duration) -> Self {
        Self {
            sets: HashMap::new(),
            buffered_bytes: 0,
            max_sets,
            max_bytes,
            timeout,
        }
    }

    /// Add a fragment. Returns the original packet once every fragment of
    /// its set has arrived.
    pub fn accept(&mut self, sender: PeerId, fragment: Fragment, now: Instant) -> MeshResult<Option<Packet>> {
        let key = (sender, fragment.message_id);
        let cost = fragment.chunk.len() + CHUNK_OVERHEAD;

        match self.sets.get(&key) {
            Some(set) => {
                if set.count != fragment.count || set.checksum != fragment.checksum {
                    self.discard(&key);
                    return Err(CodecError::malformed("fragment disagrees with its set").into());
                }
                if set.chunks.contains_key(&fragment.index) {
                    return Ok(None);
                }
                if self.buffered_bytes + cost > self.max_bytes {
                    return Err(CapacityError::ReassemblyFull.into());
                }
            }
            None => {
                // Every chunk costs at least its overhead, so larger sets
                // could never complete within the budget.
                if fragment.count as usize * CHUNK_OVERHEAD > self.max_bytes {
                    return Err(CapacityError::ReassemblyFull.into());
                }
                if self.sets.len() >= self.max_sets || self.buffered_bytes + cost > self.max_bytes {
                    self.sweep(now);
                }
                if self.sets.len() >= self.max_sets || self.buffered_bytes + cost > self.max_bytes {
                    return Err(CapacityError::ReassemblyFull.into());
                }
                self.sets.insert(
                    key,
                    PartialSet {
                        count: fragment.count,
                        checksum: fragment.checksum,
                        chunks: BTreeMap::new(),
                        bytes: 0,
                        started: now,
                    },
                );
            }
        }

        let Some(set) = self.sets.get_mut(&key) else {
            return Ok(None);
        };
        self.buffered_bytes += cost;
        set.bytes += cost;
        set.chunks.insert(fragment.index, fragment.chunk);
        if set.chunks.len() < set.count as usize {
            return Ok(None);
        }

        let Some(set) = self.sets.remove(&key) else {
            return Ok(None);
        };
        self.buffered_bytes -= set.bytes;

        let encoded: Vec<u8> = set.chunks.into_values().flatten().collect();
        if checksum(&encoded) != set.checksum {
            return Err(MeshError::Codec(CodecError::malformed("fragment checksum mismatch")));
        }
        Packet::decode(&encoded).map(Some).map_err(MeshError::from)
    }

    fn discard(&mut self, key: &(PeerId, [u8; MESSAGE_ID_LEN])) {
        if let Some(set) = self.sets.remove(key) {
            self.buffered_bytes -= set.bytes;
        }
    }

    /// Discard sets older than the timeout; returns how many were dropped
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut reclaimed = 0usize;
        let before = self.sets.len();
        self.sets.retain(|_, set| {
            let keep = now.duration_since(set.started) < timeout;
            if !keep {
                reclaimed += set.bytes;
            }
            keep
        });
        self.buffered_bytes -= reclaimed;
        let dropped = before - self.sets.len();
        if dropped > 0 {
            log::debug!("Dropped {} incomplete fragment sets ({} bytes)", dropped, reclaimed);
        }
        dropped
    }

    pub fn pending_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reassembler() -> Reassembler {
        Reassembler::new(8, 64 * 1024, Duration::from_secs(30))
    }

    fn big_packet(len: usize) -> Packet {
        let payload = (0..len).map(|i| (i % 251) as u8).collect();
        Packet::new(PacketType::Message, PeerId::new([1; 8]), 5, payload).with_recipient(PeerId::new([2; 8]))
    }

    #[test]
    fn test_small_packet_not_fragmented() {
        let packet = big_packet(10);
        let out = fragment_packet(&packet, 512).unwrap();
        assert_eq!(out, vec![packet]);
    }

    #[test]
    fn test_fragments_fit_mtu_and_keep_routing_fields() {
        let packet = big_packet(2000);
        let fragments = fragment_packet(&packet, 128).unwrap();
        assert!(fragments.len() > 1);
        for fragment in &fragments {
            assert!(fragment.encode().unwrap().len() <= 128);
            assert_eq!(fragment.packet_type, PacketType::Fragment);
            assert_eq!(fragment.recipient, packet.recipient);
            assert_eq!(fragment.ttl, packet.ttl);
        }
        let fingerprints: std::collections::HashSet<_> = fragments.iter().map(|f| f.fingerprint()).collect();
        assert_eq!(fingerprints.len(), fragments.len());
    }

    #[test]
    fn test_reassembles_out_of_order_with_duplicates() {
        let packet = big_packet(1500);
        let mut fragments = fragment_packet(&packet, 100).unwrap();
        fragments.reverse();
        let duplicate = fragments[0].clone();
        fragments.insert(1, duplicate);

        let mut reassembler = reassembler();
        let now = Instant::now();
        let mut result = None;
        for f in fragments {
            let fragment = Fragment::decode(&f.payload).unwrap();
            if let Some(p) = reassembler.accept(f.sender, fragment, now).unwrap() {
                assert!(result.is_none());
                result = Some(p);
            }
        }
        assert_eq!(result, Some(packet));
        assert_eq!(reassembler.pending_sets(), 0);
        assert_eq!(reassembler.buffered_bytes(), 0);
    }

    #[test]
    fn test_incomplete_set_times_out() {
        let packet = big_packet(1000);
        let fragments = fragment_packet(&packet, 100).unwrap();
        let mut reassembler = reassembler();
        let start = Instant::now();

        for f in &fragments[..fragments.len() - 1] {
            let fragment = Fragment::decode(&f.payload).unwrap();
            assert!(reassembler.accept(f.sender, fragment, start).unwrap().is_none());
        }
        assert_eq!(reassembler.pending_sets(), 1);
        assert!(reassembler.buffered_bytes() > 0);

        assert_eq!(reassembler.sweep(start + Duration::from_secs(29)), 0);
        assert_eq!(reassembler.sweep(start + Duration::from_secs(30)), 1);
        assert_eq!(reassembler.pending_sets(), 0);
        assert_eq!(reassembler.buffered_bytes(), 0);

        // The late last fragment starts a new set and never completes.
        let last = fragments.last().unwrap();
        let fragment = Fragment::decode(&last.payload).unwrap();
        let late = reassembler.accept(last.sender, fragment, start + Duration::from_secs(31)).unwrap();
        assert!(late.is_none());
    }

    #[test]
    fn test_checksum_mismatch_is_malformed() {
        let packet = big_packet(300);
        let fragments = fragment_packet(&packet, 100).unwrap();
        let mut reassembler = reassembler();
        let now = Instant::now();

        let mut outcome = Ok(None);
        for (i, f) in fragments.iter().enumerate() {
            let mut fragment = Fragment::decode(&f.payload).unwrap();
            if i == 0 {
                fragment.chunk[0] ^= 0xff;
            }
            outcome = reassembler.accept(f.sender, fragment, now);
        }
        assert!(matches!(outcome, Err(MeshError::Codec(CodecError::Malformed(_)))));
        assert_eq!(reassembler.buffered_bytes(), 0);
    }

    #[test]
    fn test_set_limit_enforced() {
        let mut reassembler = Reassembler::new(1, 64 * 1024, Duration::from_secs(30));
        let now = Instant::now();
        let first = fragment_packet(&big_packet(500), 100).unwrap();
        let second = fragment_packet(&big_packet(500), 100).unwrap();

        let f = Fragment::decode(&first[0].payload).unwrap();
        assert!(reassembler.accept(first[0].sender, f, now).unwrap().is_none());
        let f = Fragment::decode(&second[0].payload).unwrap();
        assert!(matches!(
            reassembler.accept(second[0].sender, f, now),
            Err(MeshError::Capacity(CapacityError::ReassemblyFull))
        ));
    }

    #[test]
    fn test_bad_fragment_header() {
        assert!(Fragment::decode(&[0u8; 4]).is_err());
        let mut header = [0u8; FRAGMENT_HEADER_LEN];
        header[9] = 3; // index 3
        header[11] = 2; // count 2
        assert!(Fragment::decode(&header).is_err());
    }

    #[test]
    fn test_huge_fragment_count_rejected() {
        let mut reassembler = Reassembler::new(64, 1024 * 1024, Duration::from_secs(30));
        let fragment = Fragment {
            message_id: [9; MESSAGE_ID_LEN],
            index: 0,
            count: u16::MAX,
            checksum: [0; 4],
            chunk: vec![1],
        };
        assert!(matches!(
            reassembler.accept(PeerId::new([3; 8]), fragment, Instant::now()),
            Err(MeshError::Capacity(CapacityError::ReassemblyFull))
        ));
        assert_eq!(reassembler.pending_sets(), 0);
        assert_eq!(reassembler.buffered_bytes(), 0);
    }

    #[test]
    fn test_refused_first_chunk_leaves_no_set() {
        let mut reassembler = Reassembler::new(8, 200, Duration::from_secs(30));
        let now = Instant::now();
        let fragment = Fragment {
            message_id: [4; MESSAGE_ID_LEN],
            index: 0,
            count: 2,
            checksum: [0; 4],
            chunk: vec![0; 300],
        };
        assert!(matches!(
            reassembler.accept(PeerId::new([3; 8]), fragment, now),
            Err(MeshError::Capacity(CapacityError::ReassemblyFull))
        ));
        assert_eq!(reassembler.pending_sets(), 0);
        assert_eq!(reassembler.buffered_bytes(), 0);
    }

    proptest! {
        #[test]
        fn prop_fragment_reassemble_round_trip(
            payload in proptest::collection::vec(any::<u8>(), 0..4000),
            mtu in 64usize..600,
        ) {
            let packet = Packet::new(PacketType::Message, PeerId::new([7; 8]), 3, payload);
            let fragments = fragment_packet(&packet, mtu).unwrap();
            let mut reassembler = reassembler();
            let now = Instant::now();

            if fragments.len() == 1 {
                prop_assert_eq!(&fragments[0], &packet);
            } else {
                let mut rebuilt = None;
                for f in fragments {
                    prop_assert!(f.encode().unwrap().len() <= mtu);
                    let fragment = Fragment::decode(&f.payload).unwrap();
                    if let Some(p) = reassembler.accept(f.sender, fragment, now).unwrap() {
                        rebuilt = Some(p);
                    }
                }
                prop_assert_eq!(rebuilt, Some(packet));
            }
        }
    }
}
