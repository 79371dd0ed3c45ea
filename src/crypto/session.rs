//! Noise Sessions
//!
//! One `Session` per remote peer. It drives the XX handshake, owns the
//! transport ciphers once established and enforces the retry policy.
//!
//! ```text
//! Uninitialized --initiate/respond--> Handshaking --complete--> Established
//! Handshaking --error/timeout--> Failed --retry (after cool-down)--> Uninitialized
//! Established --decrypt failure--> Failed
//! any --teardown--> Uninitialized
//! ```
//!
//! An inbound handshake against an Established session runs in a side slot.
//! The old keys stay in use until that handshake authenticates the same
//! static key; an unauthenticated message 1 cannot tear a session down.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::noise::{HandshakeState, Role, TransportCipher, NOISE_PROLOGUE};
use crate::config::SessionConfig;
use crate::error::{AuthError, HandshakeError};
use crate::identity::{IdentityProof, LocalIdentity, PeerId, PUBLIC_KEY_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Established,
    Failed,
}

/// Retry and timeout knobs, resolved from `SessionConfig`
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub handshake_timeout: Duration,
    pub retry_cooldown: Duration,
    pub max_attempts: usize,
    pub attempt_window: Duration,
}

impl From<&SessionConfig> for SessionPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            retry_cooldown: Duration::from_secs(config.retry_cooldown_secs),
            max_attempts: config.max_attempts_per_window as usize,
            attempt_window: Duration::from_secs(config.attempt_window_secs),
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// Read-only view of a session for callers of the facade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub peer_id: PeerId,
    pub session_id: Uuid,
    pub state: SessionState,
    pub role: Option<Role>,
    pub handshake_hash: Option<String>,
    pub remote_static_key: Option<String>,
}

pub struct Session {
    peer_id: PeerId,
    id: Uuid,
    state: SessionState,
    role: Option<Role>,
    handshake: Option<HandshakeState>,
    transport: Option<TransportCipher>,
    handshake_started: Option<Instant>,
    failed_at: Option<Instant>,
    last_error: Option<HandshakeError>,
    remote_proof: Option<IdentityProof>,
    /// Responder handshake started while Established, and its start time
    rekey: Option<(HandshakeState, Instant)>,
    attempts: VecDeque<Instant>,
}

impl Session {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            id: Uuid::new_v4(),
            state: SessionState::Uninitialized,
            role: None,
            handshake: None,
            transport: None,
            handshake_started: None,
            failed_at: None,
            last_error: None,
            remote_proof: None,
            rekey: None,
            attempts: VecDeque::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// A renegotiation is pending behind the Established session
    pub fn is_rekeying(&self) -> bool {
        self.rekey.is_some()
    }

    pub fn last_error(&self) -> Option<&HandshakeError> {
        self.last_error.as_ref()
    }

    pub fn remote_proof(&self) -> Option<&IdentityProof> {
        self.remote_proof.as_ref()
    }

    pub fn remote_static_key(&self) -> Option<&[u8; PUBLIC_KEY_LEN]> {
        self.transport.as_ref().map(|t| t.remote_static())
    }

    pub fn handshake_hash(&self) -> Option<&[u8; 32]> {
        self.transport.as_ref().map(|t| t.handshake_hash())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            peer_id: self.peer_id,
            session_id: self.id,
            state: self.state,
            role: self.role,
            handshake_hash: self.handshake_hash().map(hex::encode),
            remote_static_key: self.remote_static_key().map(hex::encode),
        }
    }

    /// Start a handshake as initiator and return message 1
    pub fn initiate(
        &mut self,
        local: &LocalIdentity,
        policy: &SessionPolicy,
        now: Instant,
    ) -> Result<Vec<u8>, HandshakeError> {
        if self.state != SessionState::Uninitialized {
            return Err(HandshakeError::InvalidState(self.state));
        }
        self.record_attempt(policy, now)?;

        let mut handshake = HandshakeState::new(Role::Initiator, local.noise_secret(), NOISE_PROLOGUE);
        let message = handshake.write_message(&[])?;
        self.begin(Role::Initiator, handshake, now);
        Ok(message)
    }

    /// Answer an inbound message 1 and return message 2.
    ///
    /// An Established session keeps its keys and the new handshake waits in
    /// a side slot. Otherwise any previous state is replaced; the caller
    /// resolves simultaneous initiation before calling.
    pub fn respond(
        &mut self,
        local: &LocalIdentity,
        message: &[u8],
        policy: &SessionPolicy,
        now: Instant,
    ) -> Result<Vec<u8>, HandshakeError> {
        self.record_attempt(policy, now)?;

        let mut handshake = HandshakeState::new(Role::Responder, local.noise_secret(), NOISE_PROLOGUE);
        let result = handshake
            .read_message(message)
            .and_then(|_| handshake.write_message(&local.identity_proof().to_bytes()));

        if self.state == SessionState::Established {
            let reply = result?;
            log::debug!("Renegotiation requested on session {} with {}", self.id, self.peer_id);
            self.rekey = Some((handshake, now));
            return Ok(reply);
        }

        self.reset();
        match result {
            Ok(reply) => {
                self.begin(Role::Responder, handshake, now);
                Ok(reply)
            }
            Err(err) => Err(self.fail(err, now)),
        }
    }

    /// Process message 2 as initiator; returns message 3 and establishes
    pub fn on_response(
        &mut self,
        local: &LocalIdentity,
        message: &[u8],
        now: Instant,
    ) -> Result<Vec<u8>, HandshakeError> {
        if self.state != SessionState::Handshaking || self.role != Some(Role::Initiator) {
            return Err(HandshakeError::InvalidState(self.state));
        }
        let Some(mut handshake) = self.handshake.take() else {
            return Err(HandshakeError::InvalidState(self.state));
        };

        let result = handshake
            .read_message(message)
            .and_then(|payload| self.check_remote(&handshake, &payload))
            .and_then(|proof| {
                let reply = handshake.write_message(&local.identity_proof().to_bytes())?;
                Ok((proof, reply))
            })
            .and_then(|(proof, reply)| Ok((proof, reply, handshake.into_transport()?)));

        match result {
            Ok((proof, reply, transport)) => {
                self.establish(proof, transport);
                Ok(reply)
            }
            Err(err) => Err(self.fail(err, now)),
        }
    }

    /// Process message 3 as responder and establish
    pub fn on_final(&mut self, message: &[u8], now: Instant) -> Result<(), HandshakeError> {
        if self.state == SessionState::Established {
            return self.finish_rekey(message);
        }
        if self.state != SessionState::Handshaking || self.role != Some(Role::Responder) {
            return Err(HandshakeError::InvalidState(self.state));
        }
        let Some(mut handshake) = self.handshake.take() else {
            return Err(HandshakeError::InvalidState(self.state));
        };

        let result = handshake
            .read_message(message)
            .and_then(|payload| self.check_remote(&handshake, &payload))
            .and_then(|proof| Ok((proof, handshake.into_transport()?)));

        match result {
            Ok((proof, transport)) => {
                self.establish(proof, transport);
                Ok(())
            }
            Err(err) => Err(self.fail(err, now)),
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
        match (&self.state, self.transport.as_mut()) {
            (SessionState::Established, Some(transport)) => transport.encrypt(plaintext),
            _ => Err(AuthError::NoSession(self.peer_id)),
        }
    }

    /// Decrypt a transport message. Authentication failure invalidates the
    /// session; a replayed nonce only drops the message.
    pub fn decrypt(&mut self, ciphertext: &[u8], now: Instant) -> Result<Vec<u8>, AuthError> {
        let result = match (&self.state, self.transport.as_mut()) {
            (SessionState::Established, Some(transport)) => transport.decrypt(ciphertext),
            _ => return Err(AuthError::NoSession(self.peer_id)),
        };
        if let Err(AuthError::DecryptFailed) = result {
            self.fail(HandshakeError::Unauthenticated, now);
        }
        result
    }

    /// Fail a handshake that has been pending too long. A stale
    /// renegotiation is dropped without touching the Established keys.
    pub fn check_timeout(&mut self, policy: &SessionPolicy, now: Instant) -> bool {
        if self
            .rekey
            .as_ref()
            .is_some_and(|(_, started)| now.duration_since(*started) >= policy.handshake_timeout)
        {
            log::debug!("Renegotiation with {} timed out", self.peer_id);
            self.rekey = None;
        }
        let expired = self.state == SessionState::Handshaking
            && self
                .handshake_started
                .is_some_and(|started| now.duration_since(started) >= policy.handshake_timeout);
        if expired {
            self.fail(HandshakeError::Timeout, now);
        }
        expired
    }

    pub fn can_retry(&self, policy: &SessionPolicy, now: Instant) -> bool {
        self.state == SessionState::Failed
            && self
                .failed_at
                .map_or(true, |failed| now.duration_since(failed) >= policy.retry_cooldown)
            && self.attempts_in_window(policy, now) < policy.max_attempts
    }

    /// Move a failed session back to `Uninitialized` once the cool-down allows
    pub fn retry(&mut self, policy: &SessionPolicy, now: Instant) -> Result<(), HandshakeError> {
        if self.state != SessionState::Failed {
            return Err(HandshakeError::InvalidState(self.state));
        }
        if !self.can_retry(policy, now) {
            return Err(HandshakeError::RetryLimited);
        }
        self.reset();
        Ok(())
    }

    /// Drop all key material. The next handshake gets a fresh session id.
    pub fn teardown(&mut self) {
        if self.state != SessionState::Uninitialized {
            log::debug!("Tearing down session {} with {}", self.id, self.peer_id);
        }
        self.reset();
    }

    /// Swap in the side-slot handshake once message 3 proves the same
    /// static key as the running session
    fn finish_rekey(&mut self, message: &[u8]) -> Result<(), HandshakeError> {
        let Some((mut handshake, _)) = self.rekey.take() else {
            return Err(HandshakeError::InvalidState(self.state));
        };
        let payload = handshake.read_message(message)?;
        let proof = self.check_remote(&handshake, &payload)?;
        let transport = handshake.into_transport()?;
        if Some(transport.remote_static()) != self.remote_static_key() {
            return Err(HandshakeError::IdentityMismatch(self.peer_id));
        }
        self.id = Uuid::new_v4();
        self.establish(proof, transport);
        Ok(())
    }

    fn reset(&mut self) {
        self.id = Uuid::new_v4();
        self.state = SessionState::Uninitialized;
        self.role = None;
        self.handshake = None;
        self.transport = None;
        self.handshake_started = None;
        self.failed_at = None;
        self.remote_proof = None;
        self.rekey = None;
    }

    fn begin(&mut self, role: Role, handshake: HandshakeState, now: Instant) {
        self.state = SessionState::Handshaking;
        self.role = Some(role);
        self.handshake = Some(handshake);
        self.handshake_started = Some(now);
        self.last_error = None;
    }

    fn establish(&mut self, proof: IdentityProof, transport: TransportCipher) {
        self.state = SessionState::Established;
        self.transport = Some(transport);
        self.remote_proof = Some(proof);
        self.handshake_started = None;
        self.rekey = None;
        log::info!("Noise session {} established with {}", self.id, self.peer_id);
    }

    fn fail(&mut self, err: HandshakeError, now: Instant) -> HandshakeError {
        log::warn!("Session {} with {} failed: {}", self.id, self.peer_id, err);
        self.state = SessionState::Failed;
        self.handshake = None;
        self.transport = None;
        self.handshake_started = None;
        self.rekey = None;
        self.failed_at = Some(now);
        self.last_error = Some(err.clone());
        err
    }

    /// The handshake payload is the peer's identity proof; it must vouch
    /// for the static key Noise negotiated and that key must hash to the
    /// expected peer id.
    fn check_remote(&self, handshake: &HandshakeState, payload: &[u8]) -> Result<IdentityProof, HandshakeError> {
        let remote_static = handshake
            .remote_static()
            .ok_or(HandshakeError::Malformed("missing remote static key"))?;
        if PeerId::from_noise_key(remote_static) != self.peer_id {
            return Err(HandshakeError::IdentityMismatch(self.peer_id));
        }
        let proof = IdentityProof::from_bytes(payload).ok_or(HandshakeError::Malformed("bad identity proof"))?;
        if !proof.is_valid() || &proof.noise_public_key != remote_static {
            return Err(HandshakeError::Unauthenticated);
        }
        Ok(proof)
    }

    fn attempts_in_window(&self, policy: &SessionPolicy, now: Instant) -> usize {
        self.attempts
            .iter()
            .filter(|at| now.duration_since(**at) < policy.attempt_window)
            .count()
    }

    fn record_attempt(&mut self, policy: &SessionPolicy, now: Instant) -> Result<(), HandshakeError> {
        while let Some(oldest) = self.attempts.front() {
            if now.duration_since(*oldest) >= policy.attempt_window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        if self.attempts.len() >= policy.max_attempts {
            return Err(HandshakeError::RetryLimited);
        }
        self.attempts.push_back(now);
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id)
            .field("id", &self.id)
            .field("state", &self.state)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
