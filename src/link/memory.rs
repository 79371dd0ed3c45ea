//! In-process radio medium
//!
//! `MemoryNetwork` models which nodes are in range of each other. Nodes
//! obtain a `MemoryLink`, advertise, discover in-range advertisers and open
//! bearers to them. A bearer is a pair of pump tasks; severing it aborts the
//! pumps so both ends observe the loss just like a radio disconnect.

use async_trait::async_trait;
use futures::channel::mpsc as stream_channel;
use futures::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BearerConnection, DiscoveryStream, IncomingStream, Link, PeerDiscovered};
use crate::error::LinkError;
use crate::identity::PeerId;

const BEARER_BUFFER: usize = 64;
const DEFAULT_MTU: usize = 512;
const DEFAULT_RSSI: i16 = -60;

#[derive(Default)]
struct Node {
    advertised: Option<PeerId>,
    discovery: Vec<stream_channel::UnboundedSender<PeerDiscovered>>,
    incoming: Vec<stream_channel::UnboundedSender<BearerConnection>>,
}

struct Bearer {
    ends: (String, String),
    pumps: [JoinHandle<()>; 2],
}

struct NetworkState {
    mtu: usize,
    next_bearer: u64,
    nodes: HashMap<String, Node>,
    adjacency: HashSet<(String, String)>,
    bearers: HashMap<u64, Bearer>,
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl NetworkState {
    fn adjacent(&self, address: &str) -> Vec<String> {
        self.adjacency
            .iter()
            .filter_map(|(a, b)| {
                if a == address {
                    Some(b.clone())
                } else if b == address {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Tell `listener`'s scanners about `advertiser`
    fn announce(&mut self, advertiser: &str, listener: &str) {
        let Some(hint) = self.nodes.get(advertiser).and_then(|n| n.advertised) else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(listener) {
            let discovered = PeerDiscovered {
                peer_id: Some(hint),
                address: advertiser.to_string(),
                rssi: Some(DEFAULT_RSSI),
            };
            node.discovery.retain(|tx| tx.unbounded_send(discovered.clone()).is_ok());
        }
    }

    fn sever_where(&mut self, matches: impl Fn(&(String, String)) -> bool) -> usize {
        let ids: Vec<u64> = self
            .bearers
            .iter()
            .filter(|(_, bearer)| matches(&bearer.ends))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(bearer) = self.bearers.remove(id) {
                debug!("Severing bearer {} between {} and {}", id, bearer.ends.0, bearer.ends.1);
                for pump in bearer.pumps {
                    pump.abort();
                }
            }
        }
        ids.len()
    }
}

/// Shared radio medium for any number of in-process nodes
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_mtu(DEFAULT_MTU)
    }

    pub fn with_mtu(mtu: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                mtu,
                next_bearer: 0,
                nodes: HashMap::new(),
                adjacency: HashSet::new(),
                bearers: HashMap::new(),
            })),
        }
    }

    /// Radio endpoint for the node at `address`
    pub fn link(&self, address: impl Into<String>) -> MemoryLink {
        let address = address.into();
        self.state.lock().nodes.entry(address.clone()).or_default();
        MemoryLink {
            network: self.clone(),
            address,
        }
    }

    /// Put two nodes in radio range of each other
    pub fn connect_nodes(&self, a: &str, b: &str) {
        let mut state = self.state.lock();
        state.nodes.entry(a.to_string()).or_default();
        state.nodes.entry(b.to_string()).or_default();
        if state.adjacency.insert(pair(a, b)) {
            state.announce(a, b);
            state.announce(b, a);
        }
    }

    /// Take two nodes out of range, dropping any bearer between them
    pub fn disconnect_nodes(&self, a: &str, b: &str) {
        let mut state = self.state.lock();
        state.adjacency.remove(&pair(a, b));
        let ends = pair(a, b);
        state.sever_where(|e| *e == ends);
    }

    /// Drop every bearer between `a` and `b` while leaving them in range
    pub fn sever(&self, a: &str, b: &str) -> usize {
        let ends = pair(a, b);
        self.state.lock().sever_where(|e| *e == ends)
    }

    pub fn bearer_count(&self) -> usize {
        self.state.lock().bearers.len()
    }

    pub fn bearers_between(&self, a: &str, b: &str) -> usize {
        let ends = pair(a, b);
        self.state.lock().bearers.values().filter(|bearer| bearer.ends == ends).count()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn pump(mut from: mpsc::Receiver<Vec<u8>>, to: mpsc::Sender<Vec<u8>>, mtu: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = from.recv().await {
            if frame.len() > mtu {
                warn!("Dropping {} byte frame larger than MTU {}", frame.len(), mtu);
                continue;
            }
            if to.send(frame).await.is_err() {
                break;
            }
        }
    })
}

/// One node's view of a `MemoryNetwork`
#[derive(Clone)]
pub struct MemoryLink {
    network: MemoryNetwork,
    address: String,
}

impl MemoryLink {
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn start_discovery(&self) -> Result<DiscoveryStream, LinkError> {
        let (tx, rx) = stream_channel::unbounded();
        let mut state = self.network.state.lock();
        state.nodes.entry(self.address.clone()).or_default().discovery.push(tx);
        for neighbour in state.adjacent(&self.address) {
            state.announce(&neighbour, &self.address);
        }
        Ok(rx.boxed())
    }

    async fn incoming(&self) -> Result<IncomingStream, LinkError> {
        let (tx, rx) = stream_channel::unbounded();
        self.network
            .state
            .lock()
            .nodes
            .entry(self.address.clone())
            .or_default()
            .incoming
            .push(tx);
        Ok(rx.boxed())
    }

    async fn connect(&self, address: &str) -> Result<BearerConnection, LinkError> {
        let mut state = self.network.state.lock();
        if !state.adjacency.contains(&pair(&self.address, address)) {
            return Err(LinkError::Timeout(format!("{} is out of range of {}", address, self.address)));
        }

        let mtu = state.mtu;
        let (local_tx, local_out) = mpsc::channel(BEARER_BUFFER);
        let (remote_in_tx, remote_in) = mpsc::channel(BEARER_BUFFER);
        let (remote_tx, remote_out) = mpsc::channel(BEARER_BUFFER);
        let (local_in_tx, local_in) = mpsc::channel(BEARER_BUFFER);

        let mut remote = Some(BearerConnection {
            address: self.address.clone(),
            mtu,
            rssi: Some(DEFAULT_RSSI),
            outbound: remote_tx,
            inbound: remote_in,
        });

        let Some(target) = state.nodes.get_mut(address) else {
            return Err(LinkError::Timeout(format!("{} is not on the network", address)));
        };
        target.incoming.retain(|tx| match remote.take() {
            Some(connection) => match tx.unbounded_send(connection) {
                Ok(()) => true,
                Err(err) => {
                    remote = Some(err.into_inner());
                    false
                }
            },
            None => !tx.is_closed(),
        });
        if remote.is_some() {
            return Err(LinkError::Timeout(format!("{} is not accepting bearers", address)));
        }

        let id = state.next_bearer;
        state.next_bearer += 1;
        state.bearers.insert(
            id,
            Bearer {
                ends: pair(&self.address, address),
                pumps: [pump(local_out, remote_in_tx, mtu), pump(remote_out, local_in_tx, mtu)],
            },
        );
        debug!("Bearer {} opened from {} to {}", id, self.address, address);

        Ok(BearerConnection {
            address: address.to_string(),
            mtu,
            rssi: Some(DEFAULT_RSSI),
            outbound: local_tx,
            inbound: local_in,
        })
    }

    async fn advertise(&self, identity_hint: PeerId) -> Result<(), LinkError> {
        let mut state = self.network.state.lock();
        state.nodes.entry(self.address.clone()).or_default().advertised = Some(identity_hint);
        for neighbour in state.adjacent(&self.address) {
            state.announce(&self.address, &neighbour);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), LinkError> {
        let mut state = self.network.state.lock();
        if let Some(node) = state.nodes.get_mut(&self.address) {
            node.advertised = None;
            node.discovery.clear();
            node.incoming.clear();
        }
        let address = self.address.clone();
        state.sever_where(|(a, b)| *a == address || *b == address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discovery_sees_in_range_advertisers() {
        let network = MemoryNetwork::new();
        let a = network.link("a");
        let b = network.link("b");
        let c = network.link("c");
        network.connect_nodes("a", "b");

        b.advertise(PeerId::new([2; 8])).await.unwrap();
        c.advertise(PeerId::new([3; 8])).await.unwrap();

        let mut discovery = a.start_discovery().await.unwrap();
        let found = discovery.next().await.unwrap();
        assert_eq!(found.address, "b");
        assert_eq!(found.peer_id, Some(PeerId::new([2; 8])));

        network.connect_nodes("a", "c");
        let found = discovery.next().await.unwrap();
        assert_eq!(found.address, "c");
    }

    #[tokio::test]
    async fn test_bearer_carries_frames_both_ways() {
        let network = MemoryNetwork::new();
        let a = network.link("a");
        let b = network.link("b");
        network.connect_nodes("a", "b");

        let mut incoming = b.incoming().await.unwrap();
        let mut to_b = a.connect("b").await.unwrap();
        let mut to_a = incoming.next().await.unwrap();
        assert_eq!(to_b.address, "b");
        assert_eq!(to_a.address, "a");

        to_b.outbound.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(to_a.inbound.recv().await.unwrap(), b"ping");
        to_a.outbound.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(to_b.inbound.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_sever_closes_both_ends() {
        let network = MemoryNetwork::new();
        let a = network.link("a");
        let b = network.link("b");
        network.connect_nodes("a", "b");

        let mut incoming = b.incoming().await.unwrap();
        let mut to_b = a.connect("b").await.unwrap();
        let mut to_a = incoming.next().await.unwrap();
        assert_eq!(network.bearers_between("a", "b"), 1);

        assert_eq!(network.sever("a", "b"), 1);
        assert!(to_b.inbound.recv().await.is_none());
        assert!(to_a.inbound.recv().await.is_none());
        assert_eq!(network.bearer_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_out_of_range_fails() {
        let network = MemoryNetwork::new();
        let a = network.link("a");
        let _b = network.link("b");
        assert!(matches!(a.connect("b").await, Err(LinkError::Timeout(_))));

        network.connect_nodes("a", "b");
        // In range but nobody accepting.
        assert!(matches!(a.connect("b").await, Err(LinkError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_oversized_frames_dropped() {
        let network = MemoryNetwork::with_mtu(64);
        let a = network.link("a");
        let b = network.link("b");
        network.connect_nodes("a", "b");

        let mut incoming = b.incoming().await.unwrap();
        let to_b = a.connect("b").await.unwrap();
        let mut to_a = incoming.next().await.unwrap();

        to_b.outbound.send(vec![0u8; 65]).await.unwrap();
        to_b.outbound.send(vec![1u8; 64]).await.unwrap();
        assert_eq!(to_a.inbound.recv().await.unwrap(), vec![1u8; 64]);
    }
}
