//! Downstream record envelope
//!
//! Consumers that republish queued samples to a message broker wrap each
//! batch in a [`SampleRecord`] and publish it on the topic for its category.
//! The field names are the ones existing dashboards subscribe to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::sensor::{EcgBatch, HeartRateSample, ImuBatch, SampleBatch, SampleCategory, Vector3};

pub const IMU_TOPIC: &str = "sensors/imu";
pub const HR_TOPIC: &str = "sensors/hr";
pub const ECG_TOPIC: &str = "sensors/ecg";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    #[serde(rename = "Movesense_series")]
    pub series: String,
    #[serde(rename = "Pico_ID")]
    pub gateway_id: String,
    /// Host wall clock in seconds since the Unix epoch.
    #[serde(rename = "Timestamp_UTC")]
    pub timestamp_utc: f64,
    #[serde(flatten)]
    pub body: RecordBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordBody {
    Imu {
        #[serde(rename = "Timestamp_ms")]
        timestamp_ms: u32,
        #[serde(rename = "ArrayAcc")]
        acc: Vec<Vector3>,
        #[serde(rename = "ArrayGyro")]
        gyro: Vec<Vector3>,
        /// Empty for IMU6.
        #[serde(rename = "ArrayMagn")]
        magn: Vec<Vector3>,
    },
    HeartRate {
        average: f32,
        #[serde(rename = "rrData")]
        rr_data: Vec<u16>,
    },
    Ecg {
        #[serde(rename = "Timestamp_ms")]
        timestamp_ms: u32,
        #[serde(rename = "Samples")]
        samples: Vec<i32>,
    },
}

impl RecordBody {
    fn imu(batch: &ImuBatch) -> Self {
        RecordBody::Imu {
            timestamp_ms: batch.timestamp().unwrap_or(0),
            acc: batch.samples.iter().map(|s| s.acc).collect(),
            gyro: batch.samples.iter().map(|s| s.gyro).collect(),
            magn: batch.samples.iter().filter_map(|s| s.magn).collect(),
        }
    }

    fn heart_rate(sample: &HeartRateSample) -> Self {
        RecordBody::HeartRate {
            average: sample.average_bpm,
            rr_data: vec![sample.rr_interval_ms],
        }
    }

    fn ecg(batch: &EcgBatch) -> Self {
        RecordBody::Ecg {
            timestamp_ms: batch.timestamp().unwrap_or(0),
            samples: batch.samples.iter().map(|s| s.amplitude).collect(),
        }
    }

    pub fn category(&self) -> SampleCategory {
        match self {
            RecordBody::Imu { .. } => SampleCategory::Imu,
            RecordBody::HeartRate { .. } => SampleCategory::HeartRate,
            RecordBody::Ecg { .. } => SampleCategory::Ecg,
        }
    }
}

impl SampleRecord {
    pub fn new(
        series: impl Into<String>,
        gateway_id: impl Into<String>,
        batch: &SampleBatch,
        published_at: DateTime<Utc>,
    ) -> Self {
        let body = match batch {
            SampleBatch::Imu(imu) => RecordBody::imu(imu),
            SampleBatch::HeartRate(hr) => RecordBody::heart_rate(hr),
            SampleBatch::Ecg(ecg) => RecordBody::ecg(ecg),
        };
        Self {
            series: series.into(),
            gateway_id: gateway_id.into(),
            timestamp_utc: published_at.timestamp_millis() as f64 / 1000.0,
            body,
        }
    }

    /// Record stamped with the series and gateway of `config`.
    pub fn for_session(config: &SessionConfig, batch: &SampleBatch, published_at: DateTime<Utc>) -> Self {
        Self::new(config.series.clone(), config.gateway_id.clone(), batch, published_at)
    }

    pub fn topic(&self) -> &'static str {
        topic_for(self.body.category())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub fn topic_for(category: SampleCategory) -> &'static str {
    match category {
        SampleCategory::Imu => IMU_TOPIC,
        SampleCategory::HeartRate => HR_TOPIC,
        SampleCategory::Ecg => ECG_TOPIC,
    }
}
