//! Noise Protocol Implementation
//!
//! Noise_XX_25519_ChaChaPoly_SHA256: mutual authentication with both static
//! keys transmitted encrypted. After the handshake the two directions get
//! their own ChaCha20-Poly1305 key; transport messages carry an explicit
//! nonce so relayed packets may arrive out of order.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{AuthError, HandshakeError};

/// Noise Protocol constants
pub const NOISE_PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_ChaChaPoly_SHA256";
pub const NOISE_PROLOGUE: &[u8] = b"bitchat-mesh-v1";
const DH_LEN: usize = 32;
const HASH_LEN: usize = 32;
const TAG_LEN: usize = 16;
const NONCE_PREFIX_LEN: usize = 8;
const REPLAY_WINDOW_BITS: u64 = 64;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// HKDF with two outputs as defined by the Noise framework
fn hkdf2(chaining_key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = hmac_sha256(chaining_key, &[input]);
    let first = hmac_sha256(&temp, &[&[0x01]]);
    let second = hmac_sha256(&temp, &[&first, &[0x02]]);
    (first, second)
}

fn aead_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn dh(secret: &StaticSecret, remote: &[u8; DH_LEN]) -> Result<[u8; DH_LEN], HandshakeError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*remote));
    if !shared.was_contributory() {
        return Err(HandshakeError::Unauthenticated);
    }
    Ok(shared.to_bytes())
}

/// Handshake-phase cipher with an implicit counter nonce
struct CipherState {
    cipher: Option<ChaCha20Poly1305>,
    nonce: u64,
}

impl CipherState {
    fn empty() -> Self {
        Self { cipher: None, nonce: 0 }
    }

    fn with_key(key: &[u8; 32]) -> Self {
        Self {
            cipher: Some(ChaCha20Poly1305::new(Key::from_slice(key))),
            nonce: 0,
        }
    }

    fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };
        let nonce = aead_nonce(self.nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: ad })
            .map_err(|_| HandshakeError::Malformed("encryption failed"))?;
        self.nonce += 1;
        Ok(ciphertext)
    }

    fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let Some(cipher) = &self.cipher else {
            return Ok(ciphertext.to_vec());
        };
        let nonce = aead_nonce(self.nonce);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| HandshakeError::Unauthenticated)?;
        self.nonce += 1;
        Ok(plaintext)
    }
}

struct SymmetricState {
    chaining_key: [u8; HASH_LEN],
    hash: [u8; HASH_LEN],
    cipher: CipherState,
}

impl SymmetricState {
    fn new() -> Self {
        // The protocol name is exactly HASH_LEN bytes, so it is used verbatim.
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(NOISE_PROTOCOL_NAME);
        Self {
            chaining_key: hash,
            hash,
            cipher: CipherState::empty(),
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash.copy_from_slice(&hasher.finalize());
    }

    fn mix_key(&mut self, input: &[u8]) {
        let (chaining_key, key) = hkdf2(&self.chaining_key, input);
        self.chaining_key = chaining_key;
        self.cipher = CipherState::with_key(&key);
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let hash = self.hash;
        let ciphertext = self.cipher.encrypt_with_ad(&hash, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let hash = self.hash;
        let plaintext = self.cipher.decrypt_with_ad(&hash, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    fn split(&self) -> ([u8; 32], [u8; 32]) {
        hkdf2(&self.chaining_key, &[])
    }
}

/// Which side of the handshake this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// XX handshake state machine
///
/// ```text
/// -> e
/// <- e, ee, s, es
/// -> s, se
/// ```
pub struct HandshakeState {
    role: Role,
    symmetric: SymmetricState,
    local_static: StaticSecret,
    local_static_public: [u8; DH_LEN],
    local_ephemeral: Option<StaticSecret>,
    remote_ephemeral: Option<[u8; DH_LEN]>,
    remote_static: Option<[u8; DH_LEN]>,
    message_index: u8,
}

impl HandshakeState {
    pub fn new(role: Role, local_static: &StaticSecret, prologue: &[u8]) -> Self {
        let mut symmetric = SymmetricState::new();
        symmetric.mix_hash(prologue);
        Self {
            role,
            symmetric,
            local_static: local_static.clone(),
            local_static_public: PublicKey::from(local_static).to_bytes(),
            local_ephemeral: None,
            remote_ephemeral: None,
            remote_static: None,
            message_index: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_finished(&self) -> bool {
        self.message_index == 3
    }

    pub fn remote_static(&self) -> Option<&[u8; DH_LEN]> {
        self.remote_static.as_ref()
    }

    /// Produce the next handshake message carrying `payload`
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let mut out = Vec::with_capacity(DH_LEN * 2 + TAG_LEN * 2 + payload.len());

        match (self.role, self.message_index) {
            (Role::Initiator, 0) => {
                let ephemeral_public = self.generate_ephemeral();
                out.extend_from_slice(&ephemeral_public);
                self.symmetric.mix_hash(&ephemeral_public);
            }
            (Role::Responder, 1) => {
                let ephemeral_public = self.generate_ephemeral();
                out.extend_from_slice(&ephemeral_public);
                self.symmetric.mix_hash(&ephemeral_public);

                let remote_ephemeral = self.remote_ephemeral()?;
                let ee = dh(self.ephemeral()?, &remote_ephemeral)?;
                self.symmetric.mix_key(&ee);

                let static_public = self.local_static_public;
                out.extend(self.symmetric.encrypt_and_hash(&static_public)?);

                let es = dh(&self.local_static, &remote_ephemeral)?;
                self.symmetric.mix_key(&es);
            }
            (Role::Initiator, 2) => {
                let static_public = self.local_static_public;
                out.extend(self.symmetric.encrypt_and_hash(&static_public)?);

                let remote_ephemeral = self.remote_ephemeral()?;
                let se = dh(&self.local_static, &remote_ephemeral)?;
                self.symmetric.mix_key(&se);
            }
            _ => return Err(HandshakeError::Malformed("handshake message out of order")),
        }

        out.extend(self.symmetric.encrypt_and_hash(payload)?);
        self.message_index += 1;
        Ok(out)
    }

    /// Consume the peer's next handshake message and return its payload
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let payload = match (self.role, self.message_index) {
            (Role::Responder, 0) => {
                let remote_ephemeral = read_key(message, 0)?;
                self.symmetric.mix_hash(&remote_ephemeral);
                self.remote_ephemeral = Some(remote_ephemeral);
                self.symmetric.decrypt_and_hash(&message[DH_LEN..])?
            }
            (Role::Initiator, 1) => {
                let remote_ephemeral = read_key(message, 0)?;
                self.symmetric.mix_hash(&remote_ephemeral);
                self.remote_ephemeral = Some(remote_ephemeral);

                let ee = dh(self.ephemeral()?, &remote_ephemeral)?;
                self.symmetric.mix_key(&ee);

                let static_end = DH_LEN + DH_LEN + TAG_LEN;
                if message.len() < static_end {
                    return Err(HandshakeError::Malformed("truncated static key"));
                }
                let remote_static = self.read_static(&message[DH_LEN..static_end])?;

                let es = dh(self.ephemeral()?, &remote_static)?;
                self.symmetric.mix_key(&es);

                self.symmetric.decrypt_and_hash(&message[static_end..])?
            }
            (Role::Responder, 2) => {
                let static_end = DH_LEN + TAG_LEN;
                if message.len() < static_end {
                    return Err(HandshakeError::Malformed("truncated static key"));
                }
                let remote_static = self.read_static(&message[..static_end])?;

                let se = dh(self.ephemeral()?, &remote_static)?;
                self.symmetric.mix_key(&se);

                self.symmetric.decrypt_and_hash(&message[static_end..])?
            }
            _ => return Err(HandshakeError::Malformed("handshake message out of order")),
        };

        self.message_index += 1;
        Ok(payload)
    }

    /// Derive transport ciphers once all three messages are processed
    pub fn into_transport(self) -> Result<TransportCipher, HandshakeError> {
        if !self.is_finished() {
            return Err(HandshakeError::Malformed("handshake not finished"));
        }
        let remote_static = self
            .remote_static
            .ok_or(HandshakeError::Malformed("missing remote static key"))?;
        let (initiator_key, responder_key) = self.symmetric.split();
        let (send_key, recv_key) = match self.role {
            Role::Initiator => (initiator_key, responder_key),
            Role::Responder => (responder_key, initiator_key),
        };

        Ok(TransportCipher {
            send: ChaCha20Poly1305::new(Key::from_slice(&send_key)),
            recv: ChaCha20Poly1305::new(Key::from_slice(&recv_key)),
            send_nonce: 0,
            replay: ReplayWindow::default(),
            handshake_hash: self.symmetric.hash,
            remote_static,
        })
    }

    fn generate_ephemeral(&mut self) -> [u8; DH_LEN] {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        self.local_ephemeral = Some(secret);
        public
    }

    fn ephemeral(&self) -> Result<&StaticSecret, HandshakeError> {
        self.local_ephemeral
            .as_ref()
            .ok_or(HandshakeError::Malformed("missing local ephemeral key"))
    }

    fn remote_ephemeral(&self) -> Result<[u8; DH_LEN], HandshakeError> {
        self.remote_ephemeral
            .ok_or(HandshakeError::Malformed("missing remote ephemeral key"))
    }

    fn read_static(&mut self, encrypted: &[u8]) -> Result<[u8; DH_LEN], HandshakeError> {
        let decrypted = self.symmetric.decrypt_and_hash(encrypted)?;
        let remote_static: [u8; DH_LEN] = decrypted
            .try_into()
            .map_err(|_| HandshakeError::Malformed("bad static key length"))?;
        self.remote_static = Some(remote_static);
        Ok(remote_static)
    }
}

fn read_key(message: &[u8], offset: usize) -> Result<[u8; DH_LEN], HandshakeError> {
    message
        .get(offset..offset + DH_LEN)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(HandshakeError::Malformed("truncated ephemeral key"))
}

/// Sliding window of accepted nonces
#[derive(Debug, Default, Clone)]
struct ReplayWindow {
    highest: Option<u64>,
    bitmap: u64,
}

impl ReplayWindow {
    fn is_acceptable(&self, nonce: u64) -> bool {
        match self.highest {
            None => true,
            Some(highest) if nonce > highest => true,
            Some(highest) => {
                let offset = highest - nonce;
                offset < REPLAY_WINDOW_BITS && self.bitmap & (1u64 << offset) == 0
            }
        }
    }

    fn mark(&mut self, nonce: u64) {
        match self.highest {
            None => {
                self.highest = Some(nonce);
                self.bitmap = 1;
            }
            Some(highest) if nonce > highest => {
                let shift = nonce - highest;
                self.bitmap = if shift >= REPLAY_WINDOW_BITS { 0 } else { self.bitmap << shift };
                self.bitmap |= 1;
                self.highest = Some(nonce);
            }
            Some(highest) => {
                self.bitmap |= 1u64 << (highest - nonce);
            }
        }
    }
}

/// Established-session ciphers
pub struct TransportCipher {
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_nonce: u64,
    replay: ReplayWindow,
    handshake_hash: [u8; HASH_LEN],
    remote_static: [u8; DH_LEN],
}

impl TransportCipher {
    /// `nonce (8, big-endian) || ciphertext || tag`
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        if self.send_nonce == u64::MAX {
            return Err(AuthError::NonceExhausted);
        }
        let counter = self.send_nonce;
        let ciphertext = self
            .send
            .encrypt(Nonce::from_slice(&aead_nonce(counter)), plaintext)
            .map_err(|_| AuthError::DecryptFailed)?;
        self.send_nonce += 1;

        let mut out = Vec::with_capacity(NONCE_PREFIX_LEN + ciphertext.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend(ciphertext);
        Ok(out)
    }

    pub fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>, AuthError> {
        if message.len() < NONCE_PREFIX_LEN + TAG_LEN {
            return Err(AuthError::DecryptFailed);
        }
        let mut counter_bytes = [0u8; NONCE_PREFIX_LEN];
        counter_bytes.copy_from_slice(&message[..NONCE_PREFIX_LEN]);
        let counter = u64::from_be_bytes(counter_bytes);

        if !self.replay.is_acceptable(counter) {
            return Err(AuthError::Replay(counter));
        }
        let plaintext = self
            .recv
            .decrypt(Nonce::from_slice(&aead_nonce(counter)), &message[NONCE_PREFIX_LEN..])
            .map_err(|_| AuthError::DecryptFailed)?;
        self.replay.mark(counter);
        Ok(plaintext)
    }

    pub fn handshake_hash(&self) -> &[u8; HASH_LEN] {
        &self.handshake_hash
    }

    pub fn remote_static(&self) -> &[u8; DH_LEN] {
        &self.remote_static
    }
}
