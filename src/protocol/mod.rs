//! BitChat Binary Protocol
//!
//! Packet framing, fragmentation for small-MTU bearers and the application
//! envelope shared with non-mesh transports.

pub mod envelope;
pub mod fragmentation;
pub mod packet;

pub use envelope::{ContentType, Envelope};
pub use fragmentation::{fragment_packet, Fragment, Reassembler};
pub use packet::{AnnouncePayload, Packet, PacketFlags, PacketType};

use std::fmt;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Service UUID for BitChat Bluetooth LE service
pub const SERVICE_UUID: &str = "F47B5E2D-4A9E-4C5A-9B3F-8E1D2C3A4B5C";

/// Characteristic UUID for BitChat message exchange
pub const CHARACTERISTIC_UUID: &str = "A1B2C3D4-E5F6-4A5B-8C9D-0E1F2A3B4C5D";

pub const FINGERPRINT_LEN: usize = 16;

/// Dedup key: truncated SHA-256 over the immutable fields of a packet or
/// envelope
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(self.0))
    }
}

/// Milliseconds since the Unix epoch
pub fn timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
