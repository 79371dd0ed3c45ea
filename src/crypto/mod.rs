//! Cryptography Module
//!
//! End-to-end encryption between peers using the Noise Protocol Framework
//! (XX pattern) and per-peer sessions built on top of it.

pub mod noise;
pub mod session;

pub use noise::{HandshakeState, Role, TransportCipher};
pub use session::{Session, SessionInfo, SessionPolicy, SessionState};
