//! Application Envelope
//!
//! The unit every transport (mesh, overlay, relay) carries. Its fingerprint
//! is what makes delivery exactly-once across transports.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{timestamp_ms, Fingerprint};
use crate::error::CodecError;
use crate::identity::{PeerId, PEER_ID_LEN};

const FLAG_HAS_RECIPIENT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContentType {
    Text = 0x01,
    Binary = 0x02,
    DeliveryAck = 0x03,
}

impl TryFrom<u8> for ContentType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ContentType::Text),
            0x02 => Ok(ContentType::Binary),
            0x03 => Ok(ContentType::DeliveryAck),
            other => Err(CodecError::malformed(format!("unknown content type 0x{:02x}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: PeerId,
    pub recipient: Option<PeerId>,
    pub content_type: ContentType,
    pub timestamp: u64,
    pub nonce: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(sender: PeerId, recipient: Option<PeerId>, content_type: ContentType, payload: Vec<u8>) -> Self {
        Self {
            sender,
            recipient,
            content_type,
            timestamp: timestamp_ms(),
            nonce: rand::random(),
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    pub fn text(&self) -> Option<&str> {
        match self.content_type {
            ContentType::Text => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_digest(&Sha256::digest(self.encode()))
    }

    pub fn encoded_len(&self) -> usize {
        PEER_ID_LEN + 1 + self.recipient.map_or(0, |_| PEER_ID_LEN) + 1 + 8 + 8 + 4 + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(self.sender.as_bytes());
        match &self.recipient {
            Some(recipient) => {
                out.push(FLAG_HAS_RECIPIENT);
                out.extend_from_slice(recipient.as_bytes());
            }
            None => out.push(0),
        }
        out.push(self.content_type as u8);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader { data, offset: 0 };

        let sender = PeerId::new(reader.array()?);
        let flags = reader.byte()?;
        let recipient = if flags & FLAG_HAS_RECIPIENT != 0 {
            Some(PeerId::new(reader.array()?))
        } else {
            None
        };
        let content_type = ContentType::try_from(reader.byte()?)?;
        let timestamp = u64::from_be_bytes(reader.array()?);
        let nonce = u64::from_be_bytes(reader.array()?);
        let payload_len = u32::from_be_bytes(reader.array()?) as usize;
        let payload = reader.take(payload_len)?.to_vec();

        if reader.offset != data.len() {
            return Err(CodecError::malformed("trailing bytes after envelope"));
        }

        Ok(Self {
            sender,
            recipient,
            content_type,
            timestamp,
            nonce,
            payload,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| CodecError::malformed("envelope length overflow"))?;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or_else(|| CodecError::malformed("truncated envelope"))?;
        self.offset = end;
        Ok(bytes)
    }

    fn byte(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
