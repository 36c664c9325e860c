//! Session configuration
//!
//! Loaded from JSON; every field has a default so a config file only needs
//! to name what differs from the reference gateway setup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DecodeOptions;
use crate::error::ConfigError;
use crate::queue::QueueConfig;
use crate::sensor::SensorKind;

/// One data stream to subscribe to once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSubscription {
    pub kind: SensorKind,
    /// Sample rate in Hz; `None` for heart rate.
    #[serde(default)]
    pub rate: Option<u32>,
    /// Reference code echoed back in byte 1 of every notification.
    pub reference: u8,
}

impl SensorSubscription {
    pub fn new(kind: SensorKind, rate: Option<u32>, reference: u8) -> Self {
        Self {
            kind,
            rate,
            reference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial number printed on the sensor.
    pub series: String,
    /// Advertised name prefix; the full name is `"{name_prefix} {series}"`.
    pub name_prefix: String,
    /// Identifier of this gateway, carried in downstream records.
    pub gateway_id: String,
    pub sensors: Vec<SensorSubscription>,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Bounded wait for each notification; also the cancellation latency.
    pub notification_timeout_ms: u64,
    /// Pause between best-effort unsubscribe writes.
    pub unsubscribe_gap_ms: u64,
    /// How often the idle loop re-checks the control flags.
    pub idle_poll_ms: u64,
    /// Rate used to spread IMU timestamps across a batch.
    pub imu_interpolation_hz: f64,
    pub queues: QueueConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            series: "174630000192".to_string(),
            name_prefix: "Movesense".to_string(),
            gateway_id: String::new(),
            sensors: vec![
                SensorSubscription::new(SensorKind::Imu9, Some(26), 99),
                SensorSubscription::new(SensorKind::HeartRate, None, 98),
                SensorSubscription::new(SensorKind::Ecg, Some(125), 97),
            ],
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            discovery_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
            notification_timeout_ms: 300,
            unsubscribe_gap_ms: 100,
            idle_poll_ms: 100,
            imu_interpolation_hz: 104.0,
            queues: QueueConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Name the sensor advertises, matched exactly while scanning.
    pub fn device_name(&self) -> String {
        format!("{} {}", self.name_prefix, self.series)
    }

    pub fn subscription(&self, kind: SensorKind) -> Option<&SensorSubscription> {
        self.sensors.iter().find(|s| s.kind == kind)
    }

    pub fn decode_options(&self) -> DecodeOptions {
        let ecg_rate = self
            .subscription(SensorKind::Ecg)
            .and_then(|s| s.rate)
            .or(SensorKind::Ecg.nominal_rate())
            .unwrap_or(125);
        DecodeOptions {
            imu_interpolation_hz: self.imu_interpolation_hz,
            ecg_sample_rate_hz: ecg_rate as f64,
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    pub fn unsubscribe_gap(&self) -> Duration {
        Duration::from_millis(self.unsubscribe_gap_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Check the configuration for mistakes the wire format cannot detect,
    /// such as two streams sharing a reference code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.series.trim().is_empty() {
            return Err(ConfigError::EmptySeries);
        }

        let mut references: HashMap<u8, SensorKind> = HashMap::new();
        for (i, sub) in self.sensors.iter().enumerate() {
            if self.sensors[..i].iter().any(|s| s.kind == sub.kind) {
                return Err(ConfigError::DuplicateKind(sub.kind));
            }
            if let Some(&first) = references.get(&sub.reference) {
                return Err(ConfigError::DuplicateReference {
                    code: sub.reference,
                    first,
                    second: sub.kind,
                });
            }
            references.insert(sub.reference, sub.kind);

            match (sub.kind.is_rate_bearing(), sub.rate) {
                (true, None) => return Err(ConfigError::MissingRate(sub.kind)),
                (false, Some(_)) => return Err(ConfigError::UnexpectedRate(sub.kind)),
                (true, Some(rate)) if !sub.kind.supported_rates().contains(&rate) => {
                    return Err(ConfigError::UnsupportedRate {
                        kind: sub.kind,
                        rate,
                    })
                }
                _ => {}
            }
        }

        for (name, capacity) in [
            ("IMU", self.queues.imu),
            ("HR", self.queues.heart_rate),
            ("ECG", self.queues.ecg),
        ] {
            if capacity == 0 {
                return Err(ConfigError::ZeroCapacity(name));
            }
        }

        for (name, value) in [
            ("scan_timeout_ms", self.scan_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("notification_timeout_ms", self.notification_timeout_ms),
            ("idle_poll_ms", self.idle_poll_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }

        if !(self.imu_interpolation_hz.is_finite() && self.imu_interpolation_hz > 0.0) {
            return Err(ConfigError::InvalidInterpolationRate);
        }

        Ok(())
    }
}
