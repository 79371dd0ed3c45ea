//! Error Types
//!
//! One error enum per failure domain of the mesh engine. Link, codec and
//! auth failures are handled inside the engine and only show up in logs,
//! statistics and peer/session state; `SendError` is the only one a caller
//! of the facade is expected to act on.

use thiserror::Error;

use crate::crypto::session::SessionState;
use crate::identity::PeerId;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Radio and bearer failures. All of them are recoverable: the peer is
/// treated as unreachable, never as a crash.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link operation unsupported: {0}")]
    Unsupported(String),

    #[error("radio permission denied: {0}")]
    PermissionDenied(String),

    #[error("link operation timed out: {0}")]
    Timeout(String),

    #[error("bearer lost: {0}")]
    BearerLost(String),
}

/// Noise handshake failures. The session goes to `Failed` and is retried
/// after the configured cool-down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed handshake message: {0}")]
    Malformed(&'static str),

    #[error("handshake message failed authentication")]
    Unauthenticated,

    #[error("handshake timed out")]
    Timeout,

    #[error("remote static key does not match peer {0}")]
    IdentityMismatch(PeerId),

    #[error("handshake message not valid in state {0:?}")]
    InvalidState(SessionState),

    #[error("handshake retry limit reached, cooling down")]
    RetryLimited,
}

/// Framing failures. The packet is dropped and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("encoded size {size} exceeds limit {max}")]
    Oversized { size: usize, max: usize },
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CodecError::Malformed(reason.into())
    }
}

/// Decrypt and signature failures. The session is invalidated; repeated
/// failures from one peer lead to a temporary block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("ciphertext failed authentication")]
    DecryptFailed,

    #[error("nonce {0} replayed or outside the replay window")]
    Replay(u64),

    #[error("no established session with {0}")]
    NoSession(PeerId),

    #[error("invalid packet signature")]
    BadSignature,

    #[error("nonce space exhausted, session must be renegotiated")]
    NonceExhausted,
}

/// Rate-limit and buffer-full conditions. Whatever triggered it is dropped,
/// never queued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error("relay rate limit exceeded for {0}")]
    RateLimited(PeerId),

    #[error("outbound queue full")]
    QueueFull,

    #[error("reassembly buffer full")]
    ReassemblyFull,

    #[error("message stream backlog full")]
    DeliveryBacklog,
}

/// Caller-visible failures of `MeshService::send_message`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("no route to recipient")]
    NoRoute,

    #[error("no established session with recipient")]
    SessionNotEstablished,

    #[error("payload of {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Configuration problems found while loading or validating `MeshConfig`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Umbrella error for the engine
#[derive(Error, Debug)]
pub enum MeshError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("identity key generation failed")]
    KeyGeneration,

    #[error("envelope from {0} cannot be originated by this node")]
    ForeignEnvelope(PeerId),

    #[error("message stream already taken")]
    StreamTaken,

    #[error("mesh service is not running")]
    NotRunning,
}
