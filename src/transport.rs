//! Transports
//!
//! The mesh is one of several ways an envelope can travel. Overlay and
//! relay-server transports are modelled as in-process broadcast channels;
//! whatever arrives on them is fed back into `MeshService::ingest_envelope`
//! so each envelope reaches the application once, whichever path it took.

use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::MeshResult;
use crate::mesh_service::MeshService;
use crate::protocol::Envelope;

pub type EnvelopeStream = BoxStream<'static, Envelope>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// The Bluetooth mesh
    Mesh,
    /// A peer-to-peer internet overlay
    Overlay,
    /// A store-and-forward relay server
    Relay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Mesh => write!(f, "mesh"),
            TransportKind::Overlay => write!(f, "overlay"),
            TransportKind::Relay => write!(f, "relay"),
        }
    }
}

/// Envelope bus shared by every participant of a non-mesh transport
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    name: String,
    bus: broadcast::Sender<Envelope>,
}

impl ChannelTransport {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self { name: name.into(), bus }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of subscribers that saw the envelope
    pub fn publish(&self, envelope: &Envelope) -> usize {
        self.bus.send(envelope.clone()).unwrap_or(0)
    }

    pub fn subscribe(&self) -> EnvelopeStream {
        let name = self.name.clone();
        stream::unfold((self.bus.subscribe(), name), |(mut receiver, name)| async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => return Some((envelope, (receiver, name))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber on {} lagged, {} envelopes skipped", name, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    pub fn peer_count(&self) -> usize {
        self.bus.receiver_count()
    }
}

/// A configured way of moving envelopes
#[derive(Clone)]
pub enum Transport {
    Mesh(MeshService),
    Overlay(ChannelTransport),
    Relay(ChannelTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Mesh(_) => TransportKind::Mesh,
            Transport::Overlay(_) => TransportKind::Overlay,
            Transport::Relay(_) => TransportKind::Relay,
        }
    }

    pub fn publish(&self, envelope: &Envelope) -> MeshResult<()> {
        match self {
            Transport::Mesh(service) => service.publish(envelope),
            Transport::Overlay(channel) | Transport::Relay(channel) => {
                let delivered = channel.publish(envelope);
                debug!("Envelope published on {} to {} subscribers", channel.name(), delivered);
                Ok(())
            }
        }
    }

    /// Envelopes arriving on this transport. For the mesh this takes the
    /// service's message stream.
    pub fn subscribe(&self) -> MeshResult<EnvelopeStream> {
        match self {
            Transport::Mesh(service) => Ok(service.messages()?.map(|message| message.envelope).boxed()),
            Transport::Overlay(channel) | Transport::Relay(channel) => Ok(channel.subscribe()),
        }
    }

    pub fn peer_count(&self) -> usize {
        match self {
            Transport::Mesh(service) => service.statistics().neighbours,
            Transport::Overlay(channel) | Transport::Relay(channel) => channel.peer_count(),
        }
    }
}

impl MeshService {
    /// Feed every envelope seen on `channel` into this node's delivery path
    pub fn bridge(&self, kind: TransportKind, channel: &ChannelTransport) -> JoinHandle<()> {
        let service = self.clone();
        let mut envelopes = channel.subscribe();
        let name = channel.name().to_string();
        tokio::spawn(async move {
            while let Some(envelope) = envelopes.next().await {
                service.ingest_envelope(envelope, kind);
            }
            debug!("Bridge from {} closed", name);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::protocol::ContentType;

    #[tokio::test]
    async fn test_channel_transport_fan_out() {
        let overlay = ChannelTransport::new("overlay", 8);
        let mut first = overlay.subscribe();
        let mut second = overlay.subscribe();
        assert_eq!(overlay.peer_count(), 2);

        let envelope = Envelope::new(PeerId::new([1; 8]), None, ContentType::Text, b"hi".to_vec());
        let transport = Transport::Overlay(overlay.clone());
        transport.publish(&envelope).unwrap();

        assert_eq!(first.next().await.unwrap(), envelope);
        assert_eq!(second.next().await.unwrap(), envelope);
        assert_eq!(transport.kind(), TransportKind::Overlay);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let relay = ChannelTransport::new("relay", 4);
        let envelope = Envelope::new(PeerId::new([2; 8]), None, ContentType::Binary, vec![1, 2, 3]);
        assert_eq!(relay.publish(&envelope), 0);
        assert!(Transport::Relay(relay).publish(&envelope).is_ok());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::Mesh.to_string(), "mesh");
        assert_eq!(TransportKind::Relay.to_string(), "relay");
    }
}
