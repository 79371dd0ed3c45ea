//! Packet Codec
//!
//! Binary framing for Bluetooth LE bearers. Layout (big-endian):
//!
//! ```text
//! version | type | ttl | timestamp_ms (8) | flags | payload_len (2)
//! sender (8) | recipient (8, optional) | payload | signature (64, optional)
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{timestamp_ms, Fingerprint, PROTOCOL_VERSION};
use crate::error::CodecError;
use crate::identity::{verify_signature, LocalIdentity, PeerId, PEER_ID_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN};

/// Fixed header before the sender id
pub const HEADER_LEN: usize = 14;

/// Header plus sender id
pub const MIN_PACKET_LEN: usize = HEADER_LEN + PEER_ID_LEN;

/// Largest payload the length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Announce = 0x01,               // Link-local presence and keys
    Leave = 0x03,                  // Link-local departure
    Message = 0x04,                // Application envelope
    Fragment = 0x05,               // Piece of a larger packet
    NoiseHandshakeInit = 0x10,     // Noise XX message 1
    NoiseHandshakeResponse = 0x11, // Noise XX message 2
    NoiseHandshakeFinal = 0x12,    // Noise XX message 3
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Announce),
            0x03 => Ok(PacketType::Leave),
            0x04 => Ok(PacketType::Message),
            0x05 => Ok(PacketType::Fragment),
            0x10 => Ok(PacketType::NoiseHandshakeInit),
            0x11 => Ok(PacketType::NoiseHandshakeResponse),
            0x12 => Ok(PacketType::NoiseHandshakeFinal),
            other => Err(CodecError::malformed(format!("unknown packet type 0x{:02x}", other))),
        }
    }
}

impl PacketType {
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            PacketType::NoiseHandshakeInit | PacketType::NoiseHandshakeResponse | PacketType::NoiseHandshakeFinal
        )
    }
}

/// Packet flags for optional fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFlags {
    pub has_recipient: bool,
    pub has_signature: bool,
    pub is_compressed: bool,
    pub is_encrypted: bool,
}

impl PacketFlags {
    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.has_recipient { flags |= 0x01; }
        if self.has_signature { flags |= 0x02; }
        if self.is_compressed { flags |= 0x04; }
        if self.is_encrypted { flags |= 0x08; }
        flags
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            has_recipient: (byte & 0x01) != 0,
            has_signature: (byte & 0x02) != 0,
            is_compressed: (byte & 0x04) != 0,
            is_encrypted: (byte & 0x08) != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub ttl: u8,
    pub timestamp: u64,
    pub flags: PacketFlags,
    pub sender: PeerId,
    pub recipient: Option<PeerId>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_LEN]>,
}

impl Packet {
    pub fn new(packet_type: PacketType, sender: PeerId, ttl: u8, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            ttl,
            timestamp: timestamp_ms(),
            flags: PacketFlags::default(),
            sender,
            recipient: None,
            payload,
            signature: None,
        }
    }

    /// Set recipient for point-to-point packets
    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient = Some(recipient);
        self.flags.has_recipient = true;
        self
    }

    pub fn with_compression(mut self, compressed: bool) -> Self {
        self.flags.is_compressed = compressed;
        self
    }

    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.flags.is_encrypted = encrypted;
        self
    }

    pub fn with_signature(mut self, signature: [u8; SIGNATURE_LEN]) -> Self {
        self.signature = Some(signature);
        self.flags.has_signature = true;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    pub fn is_addressed_to(&self, peer: &PeerId) -> bool {
        self.recipient.as_ref() == Some(peer)
    }

    /// Copy for the next hop, or `None` once the hop budget is spent
    pub fn next_hop(&self) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }
        let mut relayed = self.clone();
        relayed.ttl -= 1;
        Some(relayed)
    }

    /// Dedup key over version, type, timestamp, sender, recipient and
    /// payload. TTL and signature change per hop or are optional, so they
    /// are left out.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update([self.version, self.packet_type as u8]);
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.sender.as_bytes());
        match &self.recipient {
            Some(recipient) => {
                hasher.update([1u8]);
                hasher.update(recipient.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update(&self.payload);
        Fingerprint::from_digest(&hasher.finalize())
    }

    pub fn encoded_len(&self) -> usize {
        MIN_PACKET_LEN
            + self.recipient.map_or(0, |_| PEER_ID_LEN)
            + self.payload.len()
            + self.signature.map_or(0, |_| SIGNATURE_LEN)
    }

    /// Encode to the binary wire format
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.encode_with(self.ttl, self.signature.as_ref())
    }

    /// The bytes covered by the signature: the encoding with ttl zeroed and
    /// no signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        self.encode_with(0, None)
    }

    fn encode_with(&self, ttl: u8, signature: Option<&[u8; SIGNATURE_LEN]>) -> Result<Vec<u8>, CodecError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::Oversized {
                size: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut flags = self.flags;
        flags.has_recipient = self.recipient.is_some();
        flags.has_signature = signature.is_some();

        let mut buffer = Vec::with_capacity(self.encoded_len());

        // Header (14 bytes)
        buffer.push(self.version);
        buffer.push(self.packet_type as u8);
        buffer.push(ttl);
        buffer.extend_from_slice(&self.timestamp.to_be_bytes());
        buffer.push(flags.to_byte());
        buffer.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());

        buffer.extend_from_slice(self.sender.as_bytes());
        if let Some(recipient) = &self.recipient {
            buffer.extend_from_slice(recipient.as_bytes());
        }
        buffer.extend_from_slice(&self.payload);
        if let Some(signature) = signature {
            buffer.extend_from_slice(signature);
        }

        Ok(buffer)
    }

    /// Decode one packet; the frame must contain exactly one packet
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < MIN_PACKET_LEN {
            return Err(CodecError::malformed(format!("packet too short: {} bytes", data.len())));
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(CodecError::malformed(format!("unsupported protocol version {}", version)));
        }
        let packet_type = PacketType::try_from(data[1])?;
        let ttl = data[2];

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&data[3..11]);
        let timestamp = u64::from_be_bytes(timestamp);

        let flags = PacketFlags::from_byte(data[11]);
        let payload_len = u16::from_be_bytes([data[12], data[13]]) as usize;
        let mut offset = HEADER_LEN;

        let sender = read_peer_id(data, &mut offset)?;
        let recipient = if flags.has_recipient {
            Some(read_peer_id(data, &mut offset)?)
        } else {
            None
        };

        let payload = data
            .get(offset..offset + payload_len)
            .ok_or_else(|| CodecError::malformed("payload length mismatch"))?
            .to_vec();
        offset += payload_len;

        let signature = if flags.has_signature {
            let bytes = data
                .get(offset..offset + SIGNATURE_LEN)
                .ok_or_else(|| CodecError::malformed("missing signature"))?;
            let mut signature = [0u8; SIGNATURE_LEN];
            signature.copy_from_slice(bytes);
            offset += SIGNATURE_LEN;
            Some(signature)
        } else {
            None
        };

        if offset != data.len() {
            return Err(CodecError::malformed(format!("{} trailing bytes", data.len() - offset)));
        }

        Ok(Packet {
            version,
            packet_type,
            ttl,
            timestamp,
            flags,
            sender,
            recipient,
            payload,
            signature,
        })
    }

    /// Sign with the local identity key
    pub fn sign(mut self, identity: &LocalIdentity) -> Result<Self, CodecError> {
        let signature = identity.sign(&self.signing_bytes()?);
        self = self.with_signature(signature);
        Ok(self)
    }

    /// Check the signature against the sender's signing key. Unsigned
    /// packets never verify.
    pub fn verify(&self, signing_public_key: &[u8; PUBLIC_KEY_LEN]) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        match self.signing_bytes() {
            Ok(bytes) => verify_signature(signing_public_key, &bytes, signature),
            Err(_) => false,
        }
    }
}

fn read_peer_id(data: &[u8], offset: &mut usize) -> Result<PeerId, CodecError> {
    let bytes = data
        .get(*offset..*offset + PEER_ID_LEN)
        .ok_or_else(|| CodecError::malformed("truncated peer id"))?;
    let mut id = [0u8; PEER_ID_LEN];
    id.copy_from_slice(bytes);
    *offset += PEER_ID_LEN;
    Ok(PeerId::new(id))
}

/// LZ4-compress `data` when it is at least `threshold` bytes and the result
/// is smaller
pub fn compress(data: &[u8], threshold: usize) -> Option<Vec<u8>> {
    if data.len() < threshold {
        return None;
    }
    let compressed = lz4_flex::compress_prepend_size(data);
    (compressed.len() < data.len()).then_some(compressed)
}

/// Inverse of `compress`, refusing to inflate beyond `max_len`
pub fn decompress(data: &[u8], max_len: usize) -> Result<Vec<u8>, CodecError> {
    let prefix: [u8; 4] = data
        .get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| CodecError::malformed("truncated compressed payload"))?;
    let declared = u32::from_le_bytes(prefix) as usize;
    if declared > max_len {
        return Err(CodecError::Oversized { size: declared, max: max_len });
    }
    lz4_flex::decompress_size_prepended(data).map_err(|e| CodecError::malformed(format!("lz4: {}", e)))
}

/// Body of a link-local `Announce`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncePayload {
    pub nickname: String,
    pub noise_public_key: String,
    pub signing_public_key: String,
}

impl AnnouncePayload {
    pub fn for_identity(identity: &LocalIdentity, nickname: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            noise_public_key: hex::encode(identity.noise_public_key()),
            signing_public_key: hex::encode(identity.signing_public_key()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::malformed(format!("announce: {}", e)))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::malformed(format!("announce: {}", e)))
    }

    pub fn noise_key(&self) -> Result<[u8; PUBLIC_KEY_LEN], CodecError> {
        decode_key(&self.noise_public_key)
    }

    pub fn signing_key(&self) -> Result<[u8; PUBLIC_KEY_LEN], CodecError> {
        decode_key(&self.signing_public_key)
    }
}

fn decode_key(value: &str) -> Result<[u8; PUBLIC_KEY_LEN], CodecError> {
    hex::decode(value)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| CodecError::malformed("announce key must be 32 hex-encoded bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(n: u8) -> PeerId {
        PeerId::new([n; 8])
    }

    #[test]
    fn test_encode_decode_with_all_fields() {
        let identity = LocalIdentity::generate().unwrap();
        let packet = Packet::new(PacketType::Message, identity.peer_id(), 7, b"hello".to_vec())
            .with_recipient(peer(2))
            .with_encryption(true)
            .sign(&identity)
            .unwrap();

        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), packet.encoded_len());
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.verify(identity.signing_public_key()));
    }

    #[test]
    fn test_signature_survives_ttl_change() {
        let identity = LocalIdentity::generate().unwrap();
        let packet = Packet::new(PacketType::Message, identity.peer_id(), 5, b"x".to_vec())
            .sign(&identity)
            .unwrap();
        let relayed = packet.next_hop().unwrap();
        assert_eq!(relayed.ttl, 4);
        assert!(relayed.verify(identity.signing_public_key()));

        let mut tampered = relayed.clone();
        tampered.payload = b"y".to_vec();
        assert!(!tampered.verify(identity.signing_public_key()));
    }

    #[test]
    fn test_fingerprint_ignores_ttl_and_signature() {
        let packet = Packet::new(PacketType::Message, peer(1), 3, b"abc".to_vec());
        let relayed = packet.next_hop().unwrap();
        let signed = packet.clone().with_signature([9u8; 64]);
        assert_eq!(packet.fingerprint(), relayed.fingerprint());
        assert_eq!(packet.fingerprint(), signed.fingerprint());

        let other = packet.clone().with_recipient(peer(2));
        assert_ne!(packet.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_ttl_zero_has_no_next_hop() {
        let packet = Packet::new(PacketType::Message, peer(1), 0, vec![]);
        assert!(packet.next_hop().is_none());
    }

    #[test]
    fn test_rejects_malformed_input() {
        let packet = Packet::new(PacketType::Message, peer(1), 3, b"abc".to_vec());
        let bytes = packet.encode().unwrap();

        assert!(matches!(Packet::decode(&bytes[..10]), Err(CodecError::Malformed(_))));
        assert!(matches!(Packet::decode(&bytes[..bytes.len() - 1]), Err(CodecError::Malformed(_))));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(matches!(Packet::decode(&trailing), Err(CodecError::Malformed(_))));

        let mut bad_type = bytes.clone();
        bad_type[1] = 0x7f;
        assert!(matches!(Packet::decode(&bad_type), Err(CodecError::Malformed(_))));

        let mut bad_version = bytes;
        bad_version[0] = 9;
        assert!(matches!(Packet::decode(&bad_version), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let packet = Packet::new(PacketType::Message, peer(1), 3, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(packet.encode(), Err(CodecError::Oversized { .. })));
    }

    #[test]
    fn test_compression_only_when_smaller() {
        let repetitive = vec![b'a'; 1024];
        let compressed = compress(&repetitive, 256).unwrap();
        assert!(compressed.len() < repetitive.len());
        assert_eq!(decompress(&compressed, 4096).unwrap(), repetitive);
        assert!(matches!(decompress(&compressed, 512), Err(CodecError::Oversized { .. })));

        assert!(compress(b"short", 256).is_none());
        let random: Vec<u8> = (0..512).map(|_| rand::random::<u8>()).collect();
        assert!(compress(&random, 256).is_none());
    }

    #[test]
    fn test_announce_payload_keys() {
        let identity = LocalIdentity::generate().unwrap();
        let announce = AnnouncePayload::for_identity(&identity, "alice");
        let parsed = AnnouncePayload::from_bytes(&announce.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.nickname, "alice");
        assert_eq!(&parsed.noise_key().unwrap(), identity.noise_public_key());
        assert_eq!(&parsed.signing_key().unwrap(), identity.signing_public_key());
        assert!(AnnouncePayload::from_bytes(b"not json").is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Packet::decode(&data);
        }

        #[test]
        fn prop_encode_decode(
            ttl in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..600),
            recipient in proptest::option::of(any::<[u8; 8]>()),
        ) {
            let mut packet = Packet::new(PacketType::Message, peer(3), ttl, payload);
            if let Some(r) = recipient {
                packet = packet.with_recipient(PeerId::new(r));
            }
            let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, packet);
        }
    }
}
