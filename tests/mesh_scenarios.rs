use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitchat_mesh::crypto::SessionState;
use bitchat_mesh::mesh_service::MessageStream;
use bitchat_mesh::{
    ChannelTransport, ContentType, Envelope, LocalIdentity, MemoryNetwork, MeshConfig, MeshService, ReceivedMessage,
    Recipient, Transport, TransportKind,
};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn node(network: &MemoryNetwork, address: &str, config: &MeshConfig) -> MeshService {
    let mut config = config.clone();
    config.nickname = address.to_string();
    let link = Arc::new(network.link(address));
    MeshService::new(config, LocalIdentity::generate().unwrap(), link).unwrap()
}

fn established(a: &MeshService, b: &MeshService) -> bool {
    let state = |node: &MeshService, peer| node.session_info(&peer).map(|info| info.state);
    state(a, b.peer_id()) == Some(SessionState::Established) && state(b, a.peer_id()) == Some(SessionState::Established)
}

async fn next_message(messages: &mut MessageStream) -> ReceivedMessage {
    tokio::time::timeout(WAIT, messages.next())
        .await
        .expect("message within timeout")
        .expect("message stream open")
}

async fn assert_quiet(messages: &mut MessageStream) {
    let extra = tokio::time::timeout(Duration::from_millis(300), messages.next()).await;
    assert!(extra.is_err(), "unexpected extra message: {:?}", extra);
}

#[tokio::test]
async fn broadcast_crosses_a_line_of_four_exactly_once() {
    let network = MemoryNetwork::new();
    let config = MeshConfig {
        max_ttl: 3,
        ..MeshConfig::default()
    };
    let nodes: Vec<MeshService> = ["a", "b", "c", "d"].iter().map(|address| node(&network, address, &config)).collect();
    let mut d_messages = nodes[3].messages().unwrap();

    for service in &nodes {
        service.start().await.unwrap();
    }
    network.connect_nodes("a", "b");
    network.connect_nodes("b", "c");
    network.connect_nodes("c", "d");

    wait_until("line topology", || {
        let counts: Vec<usize> = nodes.iter().map(|service| service.statistics().neighbours).collect();
        counts == [1, 2, 2, 1]
    })
    .await;

    let relayed_before: Vec<u64> = nodes.iter().map(|service| service.statistics().packets_relayed).collect();
    nodes[0].send_text(Recipient::Broadcast, "across the line").unwrap();

    let received = next_message(&mut d_messages).await;
    assert_eq!(received.envelope.text(), Some("across the line"));
    assert_eq!(received.envelope.sender, nodes[0].peer_id());
    assert_eq!(received.via, TransportKind::Mesh);
    assert_quiet(&mut d_messages).await;

    let relayed: Vec<u64> = nodes
        .iter()
        .zip(&relayed_before)
        .map(|(service, before)| service.statistics().packets_relayed - before)
        .collect();
    assert_eq!(relayed, [0, 1, 1, 0]);

    for service in &nodes {
        service.stop().await.unwrap();
    }
}

#[tokio::test]
async fn session_renegotiated_after_reconnect() {
    let network = MemoryNetwork::new();
    let config = MeshConfig {
        delivery_acks: false,
        ..MeshConfig::default()
    };
    let a = node(&network, "a", &config);
    let b = node(&network, "b", &config);
    let mut a_messages = a.messages().unwrap();
    let mut b_messages = b.messages().unwrap();

    a.start().await.unwrap();
    b.start().await.unwrap();
    network.connect_nodes("a", "b");
    wait_until("first handshake", || established(&a, &b)).await;
    let first = a.session_info(&b.peer_id()).unwrap();

    for i in 0..10 {
        a.send_text(Recipient::Peer(b.peer_id()), &format!("a{}", i)).unwrap();
        b.send_text(Recipient::Peer(a.peer_id()), &format!("b{}", i)).unwrap();
    }
    for i in 0..10 {
        let at_b = next_message(&mut b_messages).await;
        assert_eq!(at_b.envelope.text(), Some(format!("a{}", i).as_str()));
        assert!(at_b.authenticated);
        let at_a = next_message(&mut a_messages).await;
        assert_eq!(at_a.envelope.text(), Some(format!("b{}", i).as_str()));
    }

    network.disconnect_nodes("a", "b");
    wait_until("peers to leave", || a.peer(&b.peer_id()).is_none() && b.peer(&a.peer_id()).is_none()).await;

    network.connect_nodes("a", "b");
    wait_until("second handshake", || established(&a, &b)).await;
    let second = a.session_info(&b.peer_id()).unwrap();
    assert_ne!(first.session_id, second.session_id);
    assert_ne!(first.handshake_hash, second.handshake_hash);

    b.send_text(Recipient::Peer(a.peer_id()), "after reconnect").unwrap();
    assert_eq!(next_message(&mut a_messages).await.envelope.text(), Some("after reconnect"));
    assert_quiet(&mut b_messages).await;

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn envelope_on_two_transports_is_delivered_once() {
    let network = MemoryNetwork::new();
    let config = MeshConfig::default();
    let a = node(&network, "a", &config);
    let b = node(&network, "b", &config);
    let mut b_messages = b.messages().unwrap();

    let overlay = ChannelTransport::new("overlay", 16);
    let bridge = b.bridge(TransportKind::Overlay, &overlay);

    a.start().await.unwrap();
    b.start().await.unwrap();
    network.connect_nodes("a", "b");
    wait_until("neighbours", || a.statistics().neighbours == 1 && b.statistics().neighbours == 1).await;

    let envelope = Envelope::new(a.peer_id(), None, ContentType::Text, b"twice sent".to_vec());
    let transports = [Transport::Mesh(a.clone()), Transport::Overlay(overlay.clone())];
    for transport in &transports {
        transport.publish(&envelope).unwrap();
    }

    let received = next_message(&mut b_messages).await;
    assert_eq!(received.envelope, envelope);
    assert_quiet(&mut b_messages).await;
    assert!(b.statistics().duplicates_dropped >= 1);

    bridge.abort();
    a.stop().await.unwrap();
    b.stop().await.unwrap();
}
