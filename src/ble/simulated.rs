//! In-process sensor simulator
//!
//! A simulated BLE "air" on which Movesense-like peripherals advertise and
//! accept a single central connection. Tests drive the peripheral side
//! directly: push notifications, inspect the command frames the session
//! wrote, or cut the link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use super::transport::{BleAddress, BleAdvertisement, SensorCentral, SensorLink};
use super::BleError;
use crate::codec;
use crate::sensor::SampleBatch;

/// The shared medium all simulated sensors and centrals live on.
pub struct SimSensorNetwork {
    adv_tx: broadcast::Sender<BleAdvertisement>,
    sensors: Mutex<HashMap<BleAddress, Arc<SensorState>>>,
}

impl SimSensorNetwork {
    pub fn new() -> Arc<Self> {
        let (adv_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            adv_tx,
            sensors: Mutex::new(HashMap::new()),
        })
    }

    /// Power on a sensor advertising `name`. It is seen by every later scan.
    pub async fn add_sensor(self: &Arc<Self>, name: impl Into<String>) -> SimSensor {
        let state = Arc::new(SensorState {
            address: BleAddress::Simulated(Uuid::new_v4()),
            name: name.into(),
            rssi: -60,
            connectable: AtomicBool::new(true),
            stall_connect: AtomicBool::new(false),
            stall_discovery: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            reject_reference: StdMutex::new(None),
            writes: StdMutex::new(Vec::new()),
            link: StdMutex::new(None),
        });
        self.sensors
            .lock()
            .await
            .insert(state.address.clone(), Arc::clone(&state));
        SimSensor { state }
    }

    /// Power off a sensor; it stops advertising and refuses connections.
    pub async fn remove_sensor(&self, sensor: &SimSensor) {
        self.sensors.lock().await.remove(&sensor.state.address);
        sensor.drop_link();
    }

    /// A central (gateway) attached to this network.
    pub fn central(self: &Arc<Self>) -> SimCentral {
        SimCentral {
            network: Arc::clone(self),
            scanning: AtomicBool::new(false),
        }
    }
}

struct ActiveLink {
    tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    notifying: Arc<AtomicBool>,
}

struct SensorState {
    address: BleAddress,
    name: String,
    rssi: i16,
    connectable: AtomicBool,
    stall_connect: AtomicBool,
    stall_discovery: AtomicBool,
    reject_writes: AtomicBool,
    reject_reference: StdMutex<Option<u8>>,
    writes: StdMutex<Vec<Vec<u8>>>,
    link: StdMutex<Option<ActiveLink>>,
}

impl SensorState {
    fn advertisement(&self) -> BleAdvertisement {
        BleAdvertisement {
            name: Some(self.name.clone()),
            rssi: Some(self.rssi),
            source_address: self.address.clone(),
        }
    }

    fn clear_link(&self) {
        if let Some(link) = lock(&self.link).take() {
            link.connected.store(false, Ordering::SeqCst);
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Test-side handle to a simulated peripheral.
#[derive(Clone)]
pub struct SimSensor {
    state: Arc<SensorState>,
}

impl SimSensor {
    pub fn address(&self) -> &BleAddress {
        &self.state.address
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Refuse (or accept again) incoming connections.
    pub fn set_connectable(&self, connectable: bool) {
        self.state.connectable.store(connectable, Ordering::SeqCst);
    }

    /// Make connection attempts hang until the central gives up.
    pub fn set_connect_stall(&self, stall: bool) {
        self.state.stall_connect.store(stall, Ordering::SeqCst);
    }

    /// Make GATT discovery hang until the central gives up.
    pub fn set_discovery_stall(&self, stall: bool) {
        self.state.stall_discovery.store(stall, Ordering::SeqCst);
    }

    /// Fail every write to the command characteristic.
    pub fn set_reject_writes(&self, reject: bool) {
        self.state.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Fail only writes addressed to `reference`.
    pub fn set_reject_reference(&self, reference: Option<u8>) {
        *lock(&self.state.reject_reference) = reference;
    }

    /// Command frames written by the central, oldest first.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state.writes).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state.link)
            .as_ref()
            .map(|link| link.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Whether the connected central has enabled notifications.
    pub fn is_notifying(&self) -> bool {
        lock(&self.state.link)
            .as_ref()
            .map(|link| link.notifying.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Send a raw notification on the notify characteristic.
    pub async fn notify(&self, payload: Vec<u8>) -> Result<(), BleError> {
        let tx = {
            let link = lock(&self.state.link);
            match link.as_ref() {
                Some(link) if link.notifying.load(Ordering::SeqCst) => link.tx.clone(),
                Some(_) => {
                    return Err(BleError::GattError("notifications not enabled".to_string()))
                }
                None => return Err(BleError::Disconnected),
            }
        };
        tx.send(payload).await.map_err(|_| BleError::Disconnected)
    }

    /// Encode `batch` as a `DATA` notification for `reference` and send it.
    pub async fn notify_batch(&self, reference: u8, batch: &SampleBatch) -> Result<(), BleError> {
        self.notify(codec::encode(reference, batch)).await
    }

    /// Drop the connection from the peripheral side (out of range, battery).
    pub fn drop_link(&self) {
        self.state.clear_link();
    }
}

/// Gateway-side central on a [`SimSensorNetwork`].
pub struct SimCentral {
    network: Arc<SimSensorNetwork>,
    scanning: AtomicBool,
}

impl SimCentral {
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorCentral for SimCentral {
    async fn start_scan(&self) -> Result<(), BleError> {
        self.scanning.store(true, Ordering::SeqCst);
        // Sensors advertise continuously; replay one advertisement each so
        // the new scan sees everything currently powered on.
        let sensors = self.network.sensors.lock().await;
        for sensor in sensors.values() {
            let _ = self.network.adv_tx.send(sensor.advertisement());
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<BleAdvertisement> {
        self.network.adv_tx.subscribe()
    }

    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn SensorLink>, BleError> {
        let state = {
            let sensors = self.network.sensors.lock().await;
            sensors.get(address).cloned().ok_or_else(|| {
                BleError::ConnectionError(format!("No peripheral at {}", address))
            })?
        };

        if state.stall_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !state.connectable.load(Ordering::SeqCst) {
            return Err(BleError::ConnectionError(format!(
                "{} refused the connection",
                address
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        let connected = Arc::new(AtomicBool::new(true));
        let notifying = Arc::new(AtomicBool::new(false));
        {
            let mut link = lock(&state.link);
            if let Some(previous) = link.take() {
                previous.connected.store(false, Ordering::SeqCst);
            }
            *link = Some(ActiveLink {
                tx,
                connected: Arc::clone(&connected),
                notifying: Arc::clone(&notifying),
            });
        }

        Ok(Box::new(SimLink {
            rx,
            connected,
            notifying,
            peer_address: address.clone(),
            sensor: state,
        }))
    }
}

/// Central side of a simulated GATT connection.
pub struct SimLink {
    rx: mpsc::Receiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
    notifying: Arc<AtomicBool>,
    peer_address: BleAddress,
    sensor: Arc<SensorState>,
}

#[async_trait]
impl SensorLink for SimLink {
    async fn discover(&mut self) -> Result<(), BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        if self.sensor.stall_discovery.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.notifying.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write_command(&self, frame: &[u8]) -> Result<(), BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        let rejected = *lock(&self.sensor.reject_reference);
        if self.sensor.reject_writes.load(Ordering::SeqCst)
            || (rejected.is_some() && frame.get(1).copied() == rejected)
        {
            return Err(BleError::GattError("write rejected".to_string()));
        }
        lock(&self.sensor.writes).push(frame.to_vec());
        Ok(())
    }

    async fn next_notification(&mut self) -> Result<Vec<u8>, BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        self.rx.recv().await.ok_or(BleError::Disconnected)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut link = lock(&self.sensor.link);
        if link
            .as_ref()
            .map(|l| Arc::ptr_eq(&l.connected, &self.connected))
            .unwrap_or(false)
        {
            *link = None;
        }
        Ok(())
    }

    fn peer_address(&self) -> &BleAddress {
        &self.peer_address
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
