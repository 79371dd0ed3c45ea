//! Peer Identity
//!
//! A node owns two long-term keys: an X25519 static key used by the Noise
//! handshake and an Ed25519 key used to sign announces, broadcasts and the
//! out-of-band identity proof. The `PeerId` is derived from the Noise key,
//! so an identifier can never be reused with a different key.

use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{MeshError, MeshResult};

pub const PEER_ID_LEN: usize = 8;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// Domain separation for identity proofs
const IDENTITY_PROOF_CONTEXT: &[u8] = b"bitchat-identity-v1";

/// Stable identifier of a mesh participant
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; PEER_ID_LEN]);

impl PeerId {
    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// First eight bytes of SHA-256 over the Noise static public key
    pub fn from_noise_key(noise_public_key: &[u8; PUBLIC_KEY_LEN]) -> Self {
        let digest = Sha256::digest(noise_public_key);
        let mut id = [0u8; PEER_ID_LEN];
        id.copy_from_slice(&digest[..PEER_ID_LEN]);
        Self(id)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let bytes = hex::decode(value).ok()?;
        let id: [u8; PEER_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PeerId::from_hex(&raw).ok_or_else(|| serde::de::Error::custom("peer id must be 16 hex characters"))
    }
}

/// Outcome of checking an identity proof against what the mesh negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    /// Proof is valid and matches the peer's negotiated session key
    Verified,
    /// Proof is valid but there is no negotiated key to compare against yet
    Unverified,
    /// Proof is invalid or names a different key
    Mismatch,
}

/// Out-of-band signed identity proof (what a scanned code carries)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityProof {
    pub noise_public_key: [u8; PUBLIC_KEY_LEN],
    pub signing_public_key: [u8; PUBLIC_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

impl IdentityProof {
    pub const ENCODED_LEN: usize = PUBLIC_KEY_LEN * 2 + SIGNATURE_LEN;

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_noise_key(&self.noise_public_key)
    }

    /// Check that the signing key vouches for the Noise key
    pub fn is_valid(&self) -> bool {
        verify_signature(
            &self.signing_public_key,
            &proof_message(&self.noise_public_key),
            &self.signature,
        )
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..32].copy_from_slice(&self.noise_public_key);
        out[32..64].copy_from_slice(&self.signing_public_key);
        out[64..].copy_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut proof = IdentityProof {
            noise_public_key: [0u8; PUBLIC_KEY_LEN],
            signing_public_key: [0u8; PUBLIC_KEY_LEN],
            signature: [0u8; SIGNATURE_LEN],
        };
        proof.noise_public_key.copy_from_slice(&data[..32]);
        proof.signing_public_key.copy_from_slice(&data[32..64]);
        proof.signature.copy_from_slice(&data[64..]);
        Some(proof)
    }

    /// Compare against the static key negotiated by a Noise session
    pub fn check_against(&self, negotiated: Option<&[u8; PUBLIC_KEY_LEN]>) -> VerificationStatus {
        if !self.is_valid() {
            return VerificationStatus::Mismatch;
        }
        match negotiated {
            Some(key) if key == &self.noise_public_key => VerificationStatus::Verified,
            Some(_) => VerificationStatus::Mismatch,
            None => VerificationStatus::Unverified,
        }
    }
}

fn proof_message(noise_public_key: &[u8; PUBLIC_KEY_LEN]) -> Vec<u8> {
    let mut message = Vec::with_capacity(IDENTITY_PROOF_CONTEXT.len() + PUBLIC_KEY_LEN);
    message.extend_from_slice(IDENTITY_PROOF_CONTEXT);
    message.extend_from_slice(noise_public_key);
    message
}

/// Verify an Ed25519 signature
pub fn verify_signature(public_key: &[u8; PUBLIC_KEY_LEN], message: &[u8], signature: &[u8]) -> bool {
    UnparsedPublicKey::new(&signature::ED25519, public_key)
        .verify(message, signature)
        .is_ok()
}

/// Long-term keys of the local node
pub struct LocalIdentity {
    peer_id: PeerId,
    noise_secret: StaticSecret,
    noise_public: [u8; PUBLIC_KEY_LEN],
    signing_key: Ed25519KeyPair,
    signing_public: [u8; PUBLIC_KEY_LEN],
}

impl LocalIdentity {
    /// Generate fresh keys
    pub fn generate() -> MeshResult<Self> {
        let noise_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| MeshError::KeyGeneration)?;
        let signing_key = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| MeshError::KeyGeneration)?;
        Ok(Self::from_parts(noise_secret, signing_key))
    }

    /// Rebuild an identity from persisted secrets
    pub fn from_secrets(noise_secret: [u8; 32], signing_seed: [u8; 32]) -> MeshResult<Self> {
        let signing_key =
            Ed25519KeyPair::from_seed_unchecked(&signing_seed).map_err(|_| MeshError::KeyGeneration)?;
        Ok(Self::from_parts(StaticSecret::from(noise_secret), signing_key))
    }

    fn from_parts(noise_secret: StaticSecret, signing_key: Ed25519KeyPair) -> Self {
        let noise_public = PublicKey::from(&noise_secret).to_bytes();
        let mut signing_public = [0u8; PUBLIC_KEY_LEN];
        signing_public.copy_from_slice(signing_key.public_key().as_ref());

        Self {
            peer_id: PeerId::from_noise_key(&noise_public),
            noise_secret,
            noise_public,
            signing_key,
            signing_public,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn noise_secret(&self) -> &StaticSecret {
        &self.noise_secret
    }

    pub fn noise_public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.noise_public
    }

    pub fn signing_public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.signing_public
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(self.signing_key.sign(message).as_ref());
        out
    }

    /// Proof to hand out of band (e.g. rendered as a QR code)
    pub fn identity_proof(&self) -> IdentityProof {
        IdentityProof {
            noise_public_key: self.noise_public,
            signing_public_key: self.signing_public,
            signature: self.sign(&proof_message(&self.noise_public)),
        }
    }

    /// Short human-comparable fingerprint of the Noise key
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.noise_public))
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity").field("peer_id", &self.peer_id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_derived_from_noise_key() {
        let identity = LocalIdentity::generate().unwrap();
        assert_eq!(identity.peer_id(), PeerId::from_noise_key(identity.noise_public_key()));
    }

    #[test]
    fn test_peer_id_hex_round_trip() {
        let id = PeerId::new([0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3]);
        assert_eq!(id.to_hex(), "deadbeef00010203");
        assert_eq!(PeerId::from_hex("deadbeef00010203"), Some(id));
        assert_eq!(PeerId::from_hex("dead"), None);

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"deadbeef00010203\"");
        assert_eq!(serde_json::from_str::<PeerId>(&json).unwrap(), id);
    }

    #[test]
    fn test_identity_proof_verifies() {
        let identity = LocalIdentity::generate().unwrap();
        let proof = identity.identity_proof();

        assert!(proof.is_valid());
        assert_eq!(proof.peer_id(), identity.peer_id());
        assert_eq!(IdentityProof::from_bytes(&proof.to_bytes()), Some(proof.clone()));

        assert_eq!(proof.check_against(Some(identity.noise_public_key())), VerificationStatus::Verified);
        assert_eq!(proof.check_against(None), VerificationStatus::Unverified);
        assert_eq!(proof.check_against(Some(&[7u8; 32])), VerificationStatus::Mismatch);
    }

    #[test]
    fn test_tampered_proof_is_rejected() {
        let identity = LocalIdentity::generate().unwrap();
        let mut proof = identity.identity_proof();
        proof.noise_public_key[0] ^= 0xff;

        assert!(!proof.is_valid());
        assert_eq!(proof.check_against(Some(&proof.noise_public_key.clone())), VerificationStatus::Mismatch);
    }

    #[test]
    fn test_from_secrets_is_deterministic() {
        let a = LocalIdentity::from_secrets([1u8; 32], [2u8; 32]).unwrap();
        let b = LocalIdentity::from_secrets([1u8; 32], [2u8; 32]).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
        assert_eq!(a.signing_public_key(), b.signing_public_key());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
