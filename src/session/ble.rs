//! Bluetooth LE connectivity based on `btleplug`.
//!
//! The device exposes a single GATT service with two characteristics: the host writes fragments
//!  to the TX characteristic without response, and the device notifies fragments on the RX
//!  characteristic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::{uuid, Uuid};

use crate::session::{Connector, DeviceTarget};
use crate::transport::{Connection, LinkSignal, Transport};

pub const SERVICE_UUID: Uuid = uuid!("7a230001-5475-a6a4-654c-8431f6ad49c4");
/// host to device
pub const TX_CHARACTERISTIC_UUID: Uuid = uuid!("7a230002-5475-a6a4-654c-8431f6ad49c4");
/// device to host
pub const RX_CHARACTERISTIC_UUID: Uuid = uuid!("7a230003-5475-a6a4-654c-8431f6ad49c4");

pub struct BleConnector {
    adapter: Adapter,
    scan_timeout: Duration,
    /// negotiated ATT MTU minus the 3 byte attribute protocol overhead; btleplug does not expose
    ///  the negotiated MTU, so this must match what the device negotiates
    max_write_len: usize,
}

impl BleConnector {
    pub const DEFAULT_MAX_WRITE_LEN: usize = 244;

    pub async fn new(adapter_index: usize) -> anyhow::Result<BleConnector> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?
            .into_iter()
            .nth(adapter_index)
            .ok_or_else(|| anyhow!("no bluetooth adapter #{}", adapter_index))?;
        info!("using bluetooth adapter #{}", adapter_index);

        Ok(BleConnector {
            adapter,
            scan_timeout: Duration::from_secs(10),
            max_write_len: Self::DEFAULT_MAX_WRITE_LEN,
        })
    }

    pub fn with_scan_timeout(mut self, scan_timeout: Duration) -> BleConnector {
        self.scan_timeout = scan_timeout;
        self
    }

    pub fn with_max_write_len(mut self, max_write_len: usize) -> BleConnector {
        self.max_write_len = max_write_len;
        self
    }

    async fn find(&self, target: &DeviceTarget) -> anyhow::Result<Peripheral> {
        self.adapter.start_scan(ScanFilter { services: vec![SERVICE_UUID] }).await?;
        let result = self.scan(target).await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("error stopping scan: {}", e);
        }
        result
    }

    async fn scan(&self, target: &DeviceTarget) -> anyhow::Result<Peripheral> {
        let deadline = tokio::time::Instant::now() + self.scan_timeout;
        while tokio::time::Instant::now() < deadline {
            let mut best: Option<(i16, Peripheral)> = None;

            for peripheral in self.adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                if !properties.services.contains(&SERVICE_UUID) {
                    continue;
                }

                match target {
                    DeviceTarget::Address(address) if properties.address.to_string().eq_ignore_ascii_case(address) => return Ok(peripheral),
                    DeviceTarget::Named(name) if properties.local_name.as_deref() == Some(name.as_str()) => return Ok(peripheral),
                    DeviceTarget::Nearest => {
                        let rssi = properties.rssi.unwrap_or(i16::MIN);
                        if best.as_ref().map_or(true, |(best_rssi, _)| rssi > *best_rssi) {
                            best = Some((rssi, peripheral));
                        }
                    }
                    _ => {}
                }
            }

            if let Some((rssi, peripheral)) = best {
                debug!("nearest device is {} at {} dBm", peripheral.address(), rssi);
                return Ok(peripheral);
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        bail!("no device found for {:?} within {:?}", target, self.scan_timeout)
    }
}

#[async_trait]
impl Connector for BleConnector {
    async fn connect(&self, target: &DeviceTarget) -> anyhow::Result<Connection> {
        let peripheral = self.find(target).await?;
        let peer = peripheral.address().to_string();

        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let characteristic = |uuid: Uuid| peripheral.characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| anyhow!("device {} has no characteristic {}", peer, uuid));
        let tx = characteristic(TX_CHARACTERISTIC_UUID)?;
        let rx = characteristic(RX_CHARACTERISTIC_UUID)?;

        peripheral.subscribe(&rx).await?;
        let inbound = forward_notifications(&self.adapter, &peripheral).await?;
        info!("connected to {}", peer);

        Ok(Connection {
            transport: Arc::new(BleTransport {
                peripheral,
                tx,
                max_write_len: self.max_write_len,
            }),
            inbound,
            peer,
        })
    }
}

/// Forwards RX notifications to the link, followed by [LinkSignal::Disconnected] when the adapter
///  reports the device as disconnected or the notification stream ends.
async fn forward_notifications(adapter: &Adapter, peripheral: &Peripheral) -> anyhow::Result<mpsc::UnboundedReceiver<LinkSignal>> {
    let mut notifications = peripheral.notifications().await?;
    let mut adapter_events = adapter.events().await?;
    let peripheral_id = peripheral.id();
    let (sender, receiver) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                notification = notifications.next() => match notification {
                    Some(notification) if notification.uuid == RX_CHARACTERISTIC_UUID => {
                        if sender.send(LinkSignal::Notification(notification.value.into())).is_err() {
                            return;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                event = adapter_events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => break,
                    Some(_) => {}
                    None => break,
                },
            }
        }
        debug!("device {:?} disconnected", peripheral_id);
        let _ = sender.send(LinkSignal::Disconnected);
    });
    Ok(receiver)
}

struct BleTransport {
    peripheral: Peripheral,
    tx: Characteristic,
    max_write_len: usize,
}

#[async_trait]
impl Transport for BleTransport {
    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        if data.len() > self.max_write_len {
            bail!("write of {} bytes exceeds the maximum of {}", data.len(), self.max_write_len);
        }
        self.peripheral.write(&self.tx, data, WriteType::WithoutResponse).await?;
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("error disconnecting: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}
