//! Bluetooth LE Link
//!
//! Central-role radio built on btleplug: scans for devices exposing the
//! bitchat service, connects with a timeout, subscribes to the message
//! characteristic and writes frames without response. btleplug cannot act
//! as a peripheral, so this side never advertises and never accepts
//! inbound bearers.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{BearerConnection, DiscoveryStream, IncomingStream, Link, PeerDiscovered};
use crate::error::LinkError;
use crate::identity::PeerId;
use crate::protocol::{CHARACTERISTIC_UUID, SERVICE_UUID};

const BEARER_BUFFER: usize = 64;

fn link_error(err: btleplug::Error) -> LinkError {
    match err {
        btleplug::Error::PermissionDenied => LinkError::PermissionDenied("Bluetooth access denied".to_string()),
        btleplug::Error::NotSupported(reason) => LinkError::Unsupported(reason),
        btleplug::Error::TimedOut(after) => LinkError::Timeout(format!("radio timed out after {:?}", after)),
        other => LinkError::BearerLost(other.to_string()),
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, LinkError> {
    Uuid::parse_str(value).map_err(|e| LinkError::Unsupported(format!("bad service uuid {}: {}", value, e)))
}

/// Bluetooth LE central for the bitchat service
pub struct BleLink {
    adapter: Adapter,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    connect_timeout: Duration,
    mtu: usize,
    known: Arc<Mutex<HashMap<String, PeripheralId>>>,
    connected: Mutex<HashMap<String, Peripheral>>,
}

impl BleLink {
    /// Open the first Bluetooth adapter on this machine
    pub async fn new(connect_timeout: Duration, mtu: usize) -> Result<Self, LinkError> {
        let manager = Manager::new().await.map_err(link_error)?;
        let adapters = manager.adapters().await.map_err(link_error)?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Unsupported("no Bluetooth adapters found".to_string()))?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => warn!("Bluetooth adapter info unavailable: {}", e),
        }

        Ok(Self {
            adapter,
            service_uuid: parse_uuid(SERVICE_UUID)?,
            characteristic_uuid: parse_uuid(CHARACTERISTIC_UUID)?,
            connect_timeout,
            mtu,
            known: Arc::new(Mutex::new(HashMap::new())),
            connected: Mutex::new(HashMap::new()),
        })
    }

    async fn open(&self, peripheral: Peripheral, address: &str) -> Result<BearerConnection, LinkError> {
        peripheral.discover_services().await.map_err(link_error)?;
        let characteristic = peripheral
            .services()
            .iter()
            .filter(|service| service.uuid == self.service_uuid)
            .flat_map(|service| service.characteristics.iter())
            .find(|c| c.uuid == self.characteristic_uuid)
            .cloned()
            .ok_or_else(|| LinkError::Unsupported(format!("{} lacks the bitchat characteristic", address)))?;

        peripheral.subscribe(&characteristic).await.map_err(link_error)?;
        let mut notifications = peripheral.notifications().await.map_err(link_error)?;
        let rssi = match peripheral.properties().await {
            Ok(Some(properties)) => properties.rssi,
            _ => None,
        };

        let (outbound, mut frames) = mpsc::channel::<Vec<u8>>(BEARER_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel(BEARER_BUFFER);

        let writer = peripheral.clone();
        let write_target = characteristic.clone();
        let label = address.to_string();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if let Err(e) = writer.write(&write_target, &frame, WriteType::WithoutResponse).await {
                    warn!("Write to {} failed: {}", label, e);
                    break;
                }
            }
            if let Err(e) = writer.disconnect().await {
                debug!("Disconnect from {} failed: {}", label, e);
            }
        });

        let notify_uuid = characteristic.uuid;
        let label = address.to_string();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                if inbound_tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            info!("Notification stream ended for device: {}", label);
        });

        self.connected.lock().insert(address.to_string(), peripheral);
        Ok(BearerConnection {
            address: address.to_string(),
            mtu: self.mtu,
            rssi,
            outbound,
            inbound,
        })
    }
}

#[async_trait]
impl Link for BleLink {
    async fn start_discovery(&self) -> Result<DiscoveryStream, LinkError> {
        info!("Starting BLE scan for bitchat devices");
        let events = self.adapter.events().await.map_err(link_error)?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![self.service_uuid],
            })
            .await
            .map_err(link_error)?;

        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let discovered = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let known = known.clone();
            async move {
                let CentralEvent::DeviceDiscovered(id) = event else {
                    return None;
                };
                let address = format!("{:?}", id);
                let rssi = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral.properties().await.ok().flatten().and_then(|p| p.rssi),
                    Err(_) => None,
                };
                debug!("Discovered device: {}", address);
                known.lock().insert(address.clone(), id);
                Some(PeerDiscovered {
                    peer_id: None,
                    address,
                    rssi,
                })
            }
        });
        Ok(discovered.boxed())
    }

    async fn incoming(&self) -> Result<IncomingStream, LinkError> {
        Ok(stream::empty().boxed())
    }

    async fn connect(&self, address: &str) -> Result<BearerConnection, LinkError> {
        let id = self
            .known
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| LinkError::Timeout(format!("{} has not been discovered", address)))?;
        let peripheral = self.adapter.peripheral(&id).await.map_err(link_error)?;

        debug!("Attempting connection to: {}", address);
        match tokio::time::timeout(self.connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => info!("Connected to device: {}", address),
            Ok(Err(e)) => return Err(link_error(e)),
            Err(_) => return Err(LinkError::Timeout(format!("connecting to {}", address))),
        }

        match self.open(peripheral.clone(), address).await {
            Ok(bearer) => Ok(bearer),
            Err(e) => {
                let _ = peripheral.disconnect().await;
                Err(e)
            }
        }
    }

    async fn advertise(&self, _identity_hint: PeerId) -> Result<(), LinkError> {
        Err(LinkError::Unsupported("btleplug cannot advertise as a peripheral".to_string()))
    }

    async fn stop(&self) -> Result<(), LinkError> {
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        let peripherals: Vec<(String, Peripheral)> = self.connected.lock().drain().collect();
        for (address, peripheral) in peripherals {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect from {}: {}", address, e);
            }
        }
        Ok(())
    }
}
