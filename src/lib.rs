//! BitChat Mesh - Decentralized Bluetooth LE Mesh Messaging
//!
//! Peer-to-peer messaging engine for short-range radio meshes: nodes
//! discover each other, authenticate with Noise XX, and flood or route
//! packets hop by hop with a bounded TTL and Bloom filter dedup.
//!
//! `MeshService` is the entry point. It runs on any `Link`; `MemoryNetwork`
//! is an in-process radio for tests and demos, and with the `ble` feature
//! `link::ble::BleLink` drives a real Bluetooth adapter.

pub mod config;
pub mod crypto;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod link;
pub mod mesh_service;
pub mod peer_table;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use config::MeshConfig;
pub use error::{AuthError, CapacityError, CodecError, ConfigError, HandshakeError, LinkError, MeshError, MeshResult, SendError};
pub use identity::{IdentityProof, LocalIdentity, PeerId, VerificationStatus};
pub use link::{Link, MemoryLink, MemoryNetwork};
pub use mesh_service::{MeshService, MeshStatistics, PeerEvent, ReceivedMessage, Recipient};
pub use peer_table::{ConnectionState, PeerInfo};
pub use protocol::{ContentType, Envelope};
pub use transport::{ChannelTransport, Transport, TransportKind};
