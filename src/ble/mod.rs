//! BLE transport layer for Movesense sensors
//!
//! Provides the central-role abstraction traits consumed by the session
//! state machine, the GSP GATT constants, an in-process simulator for
//! testing, and (behind `ble-central`) a btleplug-backed implementation.

#[cfg(feature = "ble-central")]
pub mod btle;
pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
