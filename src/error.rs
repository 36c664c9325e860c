use std::path::PathBuf;

use thiserror::Error;

use crate::ble::BleError;
use crate::codec::MalformedPayload;
use crate::sensor::SensorKind;

/// Failures observed by the acquisition engine.
///
/// None of these are fatal: a session either drops the offending
/// notification and keeps streaming, or returns to idle.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("No matching peripheral advertised before the scan deadline")]
    ScanTimeout,

    #[error("GATT connect timed out")]
    ConnectTimeout,

    #[error("GATT service discovery timed out")]
    DiscoveryTimeout,

    #[error("Subscribing to {kind} failed: {source}")]
    SubscribeFailed {
        kind: SensorKind,
        #[source]
        source: BleError,
    },

    #[error(transparent)]
    MalformedPayload(#[from] MalformedPayload),

    #[error("No sensor subscribed with reference code {0}")]
    UnroutablePacket(u8),

    #[error("Notification of {0} bytes is shorter than the packet envelope")]
    TruncatedEnvelope(usize),

    #[error("Link to sensor lost")]
    LinkLost,

    #[error("Session shut down")]
    ShutDown,

    #[error("Transport error: {0}")]
    Ble(#[from] BleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Reference code {code} assigned to both {first} and {second}")]
    DuplicateReference {
        code: u8,
        first: SensorKind,
        second: SensorKind,
    },

    #[error("{0} is configured more than once")]
    DuplicateKind(SensorKind),

    #[error("{0} requires a sample rate")]
    MissingRate(SensorKind),

    #[error("{0} does not take a sample rate")]
    UnexpectedRate(SensorKind),

    #[error("{kind} does not support {rate} Hz")]
    UnsupportedRate { kind: SensorKind, rate: u32 },

    #[error("{0} is not part of this session's subscriptions")]
    NotConfigured(SensorKind),

    #[error("Sensor series must not be empty")]
    EmptySeries,

    #[error("Queue capacity for {0} must be non-zero")]
    ZeroCapacity(&'static str),

    #[error("{0} must be non-zero")]
    ZeroTimeout(&'static str),

    #[error("Interpolation rate must be a positive number of Hz")]
    InvalidInterpolationRate,

    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
