//! Link Layer
//!
//! Discovery, advertising and bearer connections on the short-range radio.
//! A bearer is a duplex frame channel to one physical neighbour; frames are
//! at most `mtu` bytes. Every failure here is recoverable: the engine treats
//! a lost bearer as a departed neighbour.

#[cfg(feature = "ble")]
pub mod ble;
pub mod memory;

pub use memory::{MemoryLink, MemoryNetwork};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::identity::PeerId;

/// A reachable device seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDiscovered {
    /// Identity hint from the advertisement, if the radio exposes one
    pub peer_id: Option<PeerId>,
    pub address: String,
    pub rssi: Option<i16>,
}

/// A live duplex channel to one neighbour
#[derive(Debug)]
pub struct BearerConnection {
    /// Link address of the remote side
    pub address: String,
    pub mtu: usize,
    pub rssi: Option<i16>,
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

pub type DiscoveryStream = BoxStream<'static, PeerDiscovered>;
pub type IncomingStream = BoxStream<'static, BearerConnection>;

#[async_trait]
pub trait Link: Send + Sync {
    /// Start scanning; the stream ends when the link stops
    async fn start_discovery(&self) -> Result<DiscoveryStream, LinkError>;

    /// Bearers opened by remote devices
    async fn incoming(&self) -> Result<IncomingStream, LinkError>;

    /// Open a bearer to a discovered device
    async fn connect(&self, address: &str) -> Result<BearerConnection, LinkError>;

    /// Make this node discoverable, carrying `identity_hint` where the radio
    /// allows it
    async fn advertise(&self, identity_hint: PeerId) -> Result<(), LinkError>;

    /// Stop scanning and advertising and drop every bearer
    async fn stop(&self) -> Result<(), LinkError>;
}
