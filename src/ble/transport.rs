//! BLE transport trait definitions and core types
//!
//! Defines the central-role interface the session state machine drives.
//! Both the simulated network and the btleplug backend conform to it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::BleError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl std::fmt::Display for BleAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BleAddress::Real(bytes) => {
                let parts: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
                write!(f, "{}", parts.join(":"))
            }
            BleAddress::Simulated(id) => write!(f, "sim-{}", id),
        }
    }
}

/// A received BLE advertisement.
#[derive(Debug, Clone)]
pub struct BleAdvertisement {
    /// Advertised local name, if the record carried one.
    pub name: Option<String>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
    /// Address of the advertising device.
    pub source_address: BleAddress,
}

impl BleAdvertisement {
    /// Exact comparison of the advertised name against `expected`.
    pub fn name_matches(&self, expected: &str) -> bool {
        self.name.as_deref() == Some(expected)
    }
}

/// An active GATT connection to a sensor peripheral.
///
/// The session task owns the link exclusively, so the receive side takes
/// `&mut self` and implementations need no interior locking for it.
#[async_trait]
pub trait SensorLink: Send + Sync {
    /// Locate the GSP service and its write/notify characteristics and
    /// enable notifications on the notify characteristic.
    async fn discover(&mut self) -> Result<(), BleError>;

    /// Write a command frame to the write characteristic, waiting for the
    /// peripheral's write acknowledgement.
    async fn write_command(&self, frame: &[u8]) -> Result<(), BleError>;

    /// Wait for the next notification payload.
    ///
    /// Must be cancel-safe: the session wraps it in a bounded timeout.
    async fn next_notification(&mut self) -> Result<Vec<u8>, BleError>;

    /// Disconnect from the peripheral.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Get the peer's BLE address.
    fn peer_address(&self) -> &BleAddress;

    /// Check whether the connection is still active.
    fn is_connected(&self) -> bool;
}

/// BLE central role: scanning for advertisements and connecting to peripherals.
#[async_trait]
pub trait SensorCentral: Send + Sync {
    /// Start scanning for BLE advertisements.
    async fn start_scan(&self) -> Result<(), BleError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Subscribe to discovered advertisements.
    ///
    /// Subscribe before calling [`start_scan`](Self::start_scan) so that no
    /// early advertisement is missed.
    fn advertisements(&self) -> broadcast::Receiver<BleAdvertisement>;

    /// Connect to a peripheral at the given address.
    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn SensorLink>, BleError>;
}
