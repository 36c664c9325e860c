//! BLE central backed by `btleplug` (BlueZ, CoreBluetooth, WinRT).
//!
//! Enabled with the `ble-central` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::gatt::{GSP_NOTIFY_UUID, GSP_SERVICE_UUID, GSP_WRITE_UUID};
use super::transport::{BleAddress, BleAdvertisement, SensorCentral, SensorLink};
use super::BleError;

fn gatt_error(e: btleplug::Error) -> BleError {
    BleError::GattError(e.to_string())
}

/// Central role on the first Bluetooth adapter of the host.
pub struct BtleCentral {
    adapter: Adapter,
    adv_tx: broadcast::Sender<BleAdvertisement>,
    peripherals: Arc<Mutex<HashMap<BleAddress, Peripheral>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleCentral {
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(gatt_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(gatt_error)?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::ScanError("No Bluetooth adapter found".to_string()))?;
        let (adv_tx, _) = broadcast::channel(256);

        Ok(Self {
            adapter,
            adv_tx,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            event_task: Mutex::new(None),
        })
    }

    /// Forward discovery events from the adapter as advertisements.
    async fn pump_events(
        adapter: Adapter,
        adv_tx: broadcast::Sender<BleAdvertisement>,
        peripherals: Arc<Mutex<HashMap<BleAddress, Peripheral>>>,
    ) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                log::warn!("Could not subscribe to adapter events: {}", e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let peripheral = match adapter.peripheral(&id).await {
                Ok(p) => p,
                Err(_) => continue,
            };
            let props = match peripheral.properties().await {
                Ok(Some(props)) => props,
                _ => continue,
            };

            let address = BleAddress::Real(props.address.into_inner());
            peripherals.lock().await.insert(address.clone(), peripheral);
            let _ = adv_tx.send(BleAdvertisement {
                name: props.local_name,
                rssi: props.rssi,
                source_address: address,
            });
        }
    }
}

#[async_trait]
impl SensorCentral for BtleCentral {
    async fn start_scan(&self) -> Result<(), BleError> {
        {
            let mut task = self.event_task.lock().await;
            if task.as_ref().map(|t| t.is_finished()).unwrap_or(true) {
                *task = Some(tokio::spawn(Self::pump_events(
                    self.adapter.clone(),
                    self.adv_tx.clone(),
                    Arc::clone(&self.peripherals),
                )));
            }
        }
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))
    }

    fn advertisements(&self) -> broadcast::Receiver<BleAdvertisement> {
        self.adv_tx.subscribe()
    }

    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn SensorLink>, BleError> {
        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| BleError::ConnectionError(format!("{} has not been seen", address)))?;

        peripheral
            .connect()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))?;

        let connected = Arc::new(AtomicBool::new(true));
        let watcher = tokio::spawn(watch_disconnect(
            self.adapter.clone(),
            peripheral.id(),
            Arc::clone(&connected),
        ));

        Ok(Box::new(BtleLink {
            peripheral,
            address: address.clone(),
            write_char: None,
            notifications: Mutex::new(None),
            connected,
            watcher,
        }))
    }
}

/// Clears `connected` when the adapter reports the peripheral gone. This
/// usually fires before the notification stream closes.
async fn watch_disconnect(adapter: Adapter, id: PeripheralId, connected: Arc<AtomicBool>) {
    match adapter.events().await {
        Ok(mut events) => {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        log::info!("Peripheral {:?} disconnected", gone);
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
        Err(e) => log::warn!("Disconnect watcher: could not subscribe to adapter events: {}", e),
    }
}

pub struct BtleLink {
    peripheral: Peripheral,
    address: BleAddress,
    write_char: Option<Characteristic>,
    /// Only touched through `&mut self`; the mutex makes the link `Sync`.
    notifications: Mutex<Option<BoxStream<'static, ValueNotification>>>,
    connected: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[async_trait]
impl SensorLink for BtleLink {
    async fn discover(&mut self) -> Result<(), BleError> {
        self.peripheral.discover_services().await.map_err(gatt_error)?;

        let chars = self.peripheral.characteristics();
        let find = |uuid: Uuid| {
            chars
                .iter()
                .find(|c| c.service_uuid == GSP_SERVICE_UUID && c.uuid == uuid)
                .cloned()
                .ok_or(BleError::CharacteristicNotFound(uuid))
        };
        let write_char = find(GSP_WRITE_UUID)?;
        let notify_char = find(GSP_NOTIFY_UUID)?;

        self.peripheral
            .subscribe(&notify_char)
            .await
            .map_err(gatt_error)?;
        let stream = self.peripheral.notifications().await.map_err(gatt_error)?;

        self.write_char = Some(write_char);
        *self.notifications.get_mut() = Some(stream);
        Ok(())
    }

    async fn write_command(&self, frame: &[u8]) -> Result<(), BleError> {
        let write_char = self
            .write_char
            .as_ref()
            .ok_or(BleError::CharacteristicNotFound(GSP_WRITE_UUID))?;
        self.peripheral
            .write(write_char, frame, WriteType::WithResponse)
            .await
            .map_err(gatt_error)
    }

    async fn next_notification(&mut self) -> Result<Vec<u8>, BleError> {
        let stream = self
            .notifications
            .get_mut()
            .as_mut()
            .ok_or_else(|| BleError::GattError("notifications not enabled".to_string()))?;

        while let Some(notification) = stream.next().await {
            if notification.uuid == GSP_NOTIFY_UUID {
                return Ok(notification.value);
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        Err(BleError::Disconnected)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.connected.store(false, Ordering::SeqCst);
        self.watcher.abort();
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))
    }

    fn peer_address(&self) -> &BleAddress {
        &self.address
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
