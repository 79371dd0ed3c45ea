//! BitChat Mesh node
//!
//! Runs one mesh node and prints what it receives. With the `ble` feature
//! the node uses the first Bluetooth adapter; without it a small in-process
//! mesh is simulated so the engine can be watched end to end.
//!
//! `BITCHAT_MESH_CONFIG` may point at a JSON config file.

use anyhow::{Context, Result};
use futures::StreamExt;
use log::info;
use std::sync::Arc;

use bitchat_mesh::{LocalIdentity, MeshConfig, MeshService, PeerEvent};

const CONFIG_ENV: &str = "BITCHAT_MESH_CONFIG";

async fn load_config() -> Result<MeshConfig> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) => MeshConfig::load(&path)
            .await
            .with_context(|| format!("loading config from {}", path)),
        Err(_) => Ok(MeshConfig::default()),
    }
}

fn spawn_printers(service: &MeshService) -> Result<()> {
    let mut messages = service.messages()?;
    let label = service.nickname().to_string();
    tokio::spawn(async move {
        while let Some(message) = messages.next().await {
            let body = message
                .envelope
                .text()
                .map(str::to_string)
                .unwrap_or_else(|| format!("<{} bytes>", message.envelope.payload.len()));
            println!(
                "[{}] {} via {}{}: {}",
                label,
                message.envelope.sender,
                message.via,
                if message.authenticated { "" } else { " (unverified)" },
                body
            );
        }
    });

    let mut events = service.peer_events();
    let label = service.nickname().to_string();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                PeerEvent::Joined { peer_id, nickname } => {
                    println!("[{}] + {} {}", label, peer_id, nickname.unwrap_or_default())
                }
                PeerEvent::Left { peer_id } => println!("[{}] - {}", label, peer_id),
                PeerEvent::Updated {
                    peer_id,
                    connection_state,
                } => println!("[{}] ~ {} {:?}", label, peer_id, connection_state),
            }
        }
    });
    Ok(())
}

#[cfg(feature = "ble")]
async fn run(config: MeshConfig) -> Result<()> {
    use bitchat_mesh::link::ble::BleLink;

    let link = BleLink::new(config.connect_timeout(), config.mtu).await?;
    let service = MeshService::new(config, LocalIdentity::generate()?, Arc::new(link))?;
    info!("Node {} fingerprint {}", service.peer_id(), service.fingerprint());
    spawn_printers(&service)?;
    service.start().await?;

    tokio::signal::ctrl_c().await?;
    service.stop().await?;
    Ok(())
}

#[cfg(not(feature = "ble"))]
async fn run(config: MeshConfig) -> Result<()> {
    use bitchat_mesh::{MemoryNetwork, Recipient};
    use std::time::Duration;

    let network = MemoryNetwork::new();
    let mut nodes = Vec::new();
    for (address, nickname) in [("radio-a", "alice"), ("radio-b", "bob"), ("radio-c", "carol")] {
        let mut node_config = config.clone();
        node_config.nickname = nickname.to_string();
        let service = MeshService::new(node_config, LocalIdentity::generate()?, Arc::new(network.link(address)))?;
        spawn_printers(&service)?;
        service.start().await?;
        nodes.push(service);
    }

    // alice and carol are out of range of each other; bob relays
    network.connect_nodes("radio-a", "radio-b");
    network.connect_nodes("radio-b", "radio-c");
    tokio::time::sleep(Duration::from_millis(300)).await;

    nodes[0].send_text(Recipient::Broadcast, "hello mesh")?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    match nodes[0].send_text(Recipient::Peer(nodes[1].peer_id()), "hi bob") {
        Ok(()) => {}
        Err(e) => info!("Direct message not sent: {}", e),
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    for node in &nodes {
        println!("{}", serde_json::to_string_pretty(&node.statistics())?);
        node.stop().await?;
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    info!("=== BitChat Mesh ===");

    let config = load_config().await?;
    run(config).await
}
