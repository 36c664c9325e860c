//! Sensor kinds and the samples decoded from their notifications.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Data streams a Movesense sensor can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorKind {
    /// Accelerometer + gyroscope.
    #[serde(rename = "IMU6")]
    Imu6,
    /// Accelerometer + gyroscope + magnetometer.
    #[serde(rename = "IMU9")]
    Imu9,
    #[serde(rename = "HR")]
    HeartRate,
    #[serde(rename = "ECG")]
    Ecg,
}

/// Sample rates the IMU resources accept.
pub const IMU_RATES_HZ: &[u32] = &[13, 26, 52, 104, 208, 416, 833, 1666];

/// Sample rates the ECG resource accepts.
pub const ECG_RATES_HZ: &[u32] = &[125, 128, 200, 250, 256, 500, 512];

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Imu6,
        SensorKind::Imu9,
        SensorKind::HeartRate,
        SensorKind::Ecg,
    ];

    /// Resource name used in the `Meas/...` subscription path.
    pub fn resource(self) -> &'static str {
        match self {
            SensorKind::Imu6 => "IMU6",
            SensorKind::Imu9 => "IMU9",
            SensorKind::HeartRate => "HR",
            SensorKind::Ecg => "ECG",
        }
    }

    /// Whether the subscription path carries a `/{rate}` suffix.
    pub fn is_rate_bearing(self) -> bool {
        !matches!(self, SensorKind::HeartRate)
    }

    /// Rates the device accepts for this kind; empty for heart rate.
    pub fn supported_rates(self) -> &'static [u32] {
        match self {
            SensorKind::Imu6 | SensorKind::Imu9 => IMU_RATES_HZ,
            SensorKind::Ecg => ECG_RATES_HZ,
            SensorKind::HeartRate => &[],
        }
    }

    /// Rate used when a configuration names the kind without a rate.
    pub fn nominal_rate(self) -> Option<u32> {
        match self {
            SensorKind::Imu6 | SensorKind::Imu9 => Some(26),
            SensorKind::Ecg => Some(125),
            SensorKind::HeartRate => None,
        }
    }

    /// Number of vector sensors packed into one IMU notification.
    pub fn imu_sensor_count(self) -> Option<usize> {
        match self {
            SensorKind::Imu6 => Some(2),
            SensorKind::Imu9 => Some(3),
            SensorKind::HeartRate | SensorKind::Ecg => None,
        }
    }

    /// The queue category samples of this kind are delivered to.
    pub fn category(self) -> SampleCategory {
        match self {
            SensorKind::Imu6 | SensorKind::Imu9 => SampleCategory::Imu,
            SensorKind::HeartRate => SampleCategory::HeartRate,
            SensorKind::Ecg => SampleCategory::Ecg,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource())
    }
}

/// One output queue per category; IMU6 and IMU9 share the IMU queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleCategory {
    Imu,
    HeartRate,
    Ecg,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// A single inertial sample.
///
/// `timestamp` is in device clock units (milliseconds). Only the first
/// sample of a batch carries the device's own timestamp; later samples are
/// interpolated across the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp: u32,
    pub acc: Vector3,
    pub gyro: Vector3,
    /// Present for IMU9 only.
    pub magn: Option<Vector3>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuBatch {
    pub kind: SensorKind,
    pub samples: Vec<ImuSample>,
}

impl ImuBatch {
    /// Device timestamp of the first sample.
    pub fn timestamp(&self) -> Option<u32> {
        self.samples.first().map(|s| s.timestamp)
    }
}

/// Heart-rate notifications carry no device clock, so the sample is
/// stamped with the host time at which it was received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub timestamp: DateTime<Utc>,
    pub average_bpm: f32,
    pub rr_interval_ms: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcgSample {
    pub timestamp: u32,
    pub amplitude: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcgBatch {
    pub samples: Vec<EcgSample>,
}

impl EcgBatch {
    pub fn timestamp(&self) -> Option<u32> {
        self.samples.first().map(|s| s.timestamp)
    }
}

/// Everything decoded from one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleBatch {
    Imu(ImuBatch),
    HeartRate(HeartRateSample),
    Ecg(EcgBatch),
}

impl SampleBatch {
    pub fn kind(&self) -> SensorKind {
        match self {
            SampleBatch::Imu(batch) => batch.kind,
            SampleBatch::HeartRate(_) => SensorKind::HeartRate,
            SampleBatch::Ecg(_) => SensorKind::Ecg,
        }
    }

    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        match self {
            SampleBatch::Imu(batch) => batch.samples.len(),
            SampleBatch::HeartRate(_) => 1,
            SampleBatch::Ecg(batch) => batch.samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde_names_match_resources() {
        for kind in SensorKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.resource()));
            let back: SensorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn test_imu_kinds_share_category() {
        assert_eq!(SensorKind::Imu6.category(), SampleCategory::Imu);
        assert_eq!(SensorKind::Imu9.category(), SampleCategory::Imu);
        assert_eq!(SensorKind::HeartRate.category(), SampleCategory::HeartRate);
        assert_eq!(SensorKind::Ecg.category(), SampleCategory::Ecg);
    }

    #[test]
    fn test_rates() {
        assert!(!SensorKind::HeartRate.is_rate_bearing());
        assert!(SensorKind::HeartRate.supported_rates().is_empty());
        assert_eq!(SensorKind::HeartRate.nominal_rate(), None);
        for kind in [SensorKind::Imu6, SensorKind::Imu9, SensorKind::Ecg] {
            let nominal = kind.nominal_rate().unwrap();
            assert!(kind.supported_rates().contains(&nominal));
        }
    }

    #[test]
    fn test_batch_len() {
        let hr = SampleBatch::HeartRate(HeartRateSample {
            timestamp: Utc::now(),
            average_bpm: 61.5,
            rr_interval_ms: 975,
        });
        assert_eq!(hr.len(), 1);
        assert_eq!(hr.kind(), SensorKind::HeartRate);

        let ecg = SampleBatch::Ecg(EcgBatch { samples: vec![] });
        assert!(ecg.is_empty());
    }
}
