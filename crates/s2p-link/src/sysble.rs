//! btleplug-backed [`BleAdapter`] — the real radio.
//!
//! btleplug exposes no MTU exchange, so the granted MTU is whatever the
//! constructor was told to assume (the conservative ATT default unless the
//! deployment knows better). Writes use `WithResponse`, which doubles as the
//! platform write-completion signal.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;

use s2p_core::{BridgeError, BridgeResult};

use crate::ble::{
    BleAdapter, BleLink, LinkEvent, PeerInfo, PeerStatus, COMMAND_RX_UUID, DEFAULT_ATT_MTU,
    RESPONSE_TX_UUID, SERVICE_UUID, STATUS_UUID,
};

fn ble_err(e: btleplug::Error) -> BridgeError {
    BridgeError::link(e.to_string())
}

pub struct SystemAdapter {
    adapter: Adapter,
    assumed_mtu: u16,
}

impl SystemAdapter {
    /// Open the first BLE adapter on the host.
    pub async fn new() -> BridgeResult<Self> {
        Self::with_mtu(DEFAULT_ATT_MTU).await
    }

    /// Open the first adapter, assuming `assumed_mtu` was granted by the
    /// platform's own MTU exchange.
    pub async fn with_mtu(assumed_mtu: u16) -> BridgeResult<Self> {
        let manager = Manager::new().await.map_err(ble_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_err)?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::link("no BLE adapter present"))?;
        Ok(Self { adapter, assumed_mtu: assumed_mtu.max(DEFAULT_ATT_MTU) })
    }

    async fn find_peripheral(&self, address: &str) -> BridgeResult<Peripheral> {
        for p in self.adapter.peripherals().await.map_err(ble_err)? {
            if p.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(p);
            }
        }
        Err(BridgeError::link(format!("peer {address} not in scan results")))
    }
}

#[async_trait]
impl BleAdapter for SystemAdapter {
    async fn start_scan(&self) -> BridgeResult<mpsc::Receiver<PeerInfo>> {
        let filter = ScanFilter { services: vec![SERVICE_UUID] };
        self.adapter.start_scan(filter).await.map_err(ble_err)?;

        let mut events = self.adapter.events().await.map_err(ble_err)?;
        let adapter = self.adapter.clone();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else { continue };
                let Ok(Some(props)) = peripheral.properties().await else { continue };

                let info = PeerInfo {
                    address: peripheral.address().to_string(),
                    name: props.local_name,
                    rssi: props.rssi,
                };
                if tx.send(info).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn stop_scan(&self) -> BridgeResult<()> {
        self.adapter.stop_scan().await.map_err(ble_err)
    }

    async fn connect(
        &self,
        address: &str,
        mtu_target: u16,
        timeout: Duration,
    ) -> BridgeResult<(Box<dyn BleLink>, mpsc::Receiver<LinkEvent>)> {
        let peripheral = self.find_peripheral(address).await?;

        tokio::time::timeout(timeout, async {
            peripheral.connect().await.map_err(ble_err)?;
            peripheral.discover_services().await.map_err(ble_err)
        })
        .await
        .map_err(|_| BridgeError::ConnectTimeout)??;

        let chars = peripheral.characteristics();
        let locate = |uuid: uuid::Uuid| -> BridgeResult<Characteristic> {
            chars
                .iter()
                .find(|c| c.uuid == uuid && c.service_uuid == SERVICE_UUID)
                .cloned()
                .ok_or_else(|| BridgeError::ServiceMissing { uuid: uuid.to_string() })
        };
        let command_rx = locate(COMMAND_RX_UUID)?;
        let response_tx = locate(RESPONSE_TX_UUID)?;
        let status = locate(STATUS_UUID)?;

        peripheral.subscribe(&response_tx).await.map_err(ble_err)?;
        peripheral.subscribe(&status).await.map_err(ble_err)?;

        let mut notifications = peripheral.notifications().await.map_err(ble_err)?;
        let (event_tx, event_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                let event = if n.uuid == STATUS_UUID {
                    match n.value.first().and_then(|b| PeerStatus::from_byte(*b)) {
                        Some(s) => LinkEvent::Status(s),
                        None => continue,
                    }
                } else if n.uuid == RESPONSE_TX_UUID {
                    LinkEvent::Notification(n.value)
                } else {
                    continue;
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
            // Notification stream ends when the link is gone.
            let _ = event_tx.send(LinkEvent::Disconnected).await;
        });

        let mtu = self.assumed_mtu.min(mtu_target).max(DEFAULT_ATT_MTU);
        tracing::debug!(peer = %address, mtu, "GATT connected, characteristics subscribed");

        let link = SystemLink { peripheral, command_rx, mtu };
        Ok((Box::new(link), event_rx))
    }
}

struct SystemLink {
    peripheral: Peripheral,
    command_rx: Characteristic,
    mtu: u16,
}

#[async_trait]
impl BleLink for SystemLink {
    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn has_write_completion(&self) -> bool {
        // WithResponse resolves on the peer's write acknowledgement.
        true
    }

    async fn write_packet(&self, packet: &[u8]) -> BridgeResult<()> {
        self.peripheral
            .write(&self.command_rx, packet, WriteType::WithResponse)
            .await
            .map_err(ble_err)
    }

    async fn disconnect(&self) -> BridgeResult<()> {
        self.peripheral.disconnect().await.map_err(ble_err)
    }
}
