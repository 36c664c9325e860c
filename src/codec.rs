//! Binary frame codec for GSP data notifications
//!
//! Every data notification shares a two-byte envelope (packet type,
//! reference code) followed by a kind-specific little-endian body:
//!
//! ```text
//! IMU6/IMU9  | type | ref | timestamp u32 | acc[n] xyz f32 | gyro[n] xyz f32 | (magn[n] xyz f32)
//! HR         | type | ref | average f32   | rr u16
//! ECG        | type | ref | timestamp u32 | sample i32 ...
//! ```
//!
//! Decoding is pure: the only inputs are the payload, the interpolation
//! rates and (for heart rate, which has no device clock) the receive time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::gatt::{PacketType, ENVELOPE_LEN};
use crate::sensor::{
    EcgBatch, EcgSample, HeartRateSample, ImuBatch, ImuSample, SampleBatch, SensorKind, Vector3,
};

/// Width of every float / integer element in a data body.
pub const BYTES_PER_ELEMENT: usize = 4;

const TIMESTAMP_LEN: usize = 4;
const STAMPED_HEADER_LEN: usize = ENVELOPE_LEN + TIMESTAMP_LEN;
const HEART_RATE_LEN: usize = ENVELOPE_LEN + 4 + 2;
const AXES: usize = 3;

/// Why a payload could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// Shorter than the fixed header for the kind.
    Truncated { min: usize },
    /// Body length is not a multiple of the element width.
    Misaligned { stride: usize },
    /// Floats do not divide evenly into xyz triples per sensor.
    UnevenAxes { sensors: usize },
    /// Header only, no samples.
    Empty,
    /// Fixed-size payload with the wrong length.
    LengthMismatch { expected: usize },
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::Truncated { min } => write!(f, "shorter than {} byte header", min),
            MalformedReason::Misaligned { stride } => {
                write!(f, "body is not a multiple of {} bytes", stride)
            }
            MalformedReason::UnevenAxes { sensors } => {
                write!(f, "floats do not split into xyz triples for {} sensors", sensors)
            }
            MalformedReason::Empty => write!(f, "no samples"),
            MalformedReason::LengthMismatch { expected } => {
                write!(f, "expected exactly {} bytes", expected)
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed {kind} payload ({len} bytes): {reason}")]
pub struct MalformedPayload {
    pub kind: SensorKind,
    pub len: usize,
    pub reason: MalformedReason,
}

impl MalformedPayload {
    fn new(kind: SensorKind, payload: &[u8], reason: MalformedReason) -> Self {
        Self {
            kind,
            len: payload.len(),
            reason,
        }
    }
}

/// Rates used to interpolate timestamps inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// Physical notification rate the IMU batch is spread across. The
    /// sensor packs IMU batches at 104 Hz regardless of the subscribed rate.
    pub imu_interpolation_hz: f64,
    /// Subscribed ECG rate.
    pub ecg_sample_rate_hz: f64,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            imu_interpolation_hz: 104.0,
            ecg_sample_rate_hz: 125.0,
        }
    }
}

fn period_ms(rate_hz: f64) -> f64 {
    if rate_hz.is_finite() && rate_hz > 0.0 {
        1000.0 / rate_hz
    } else {
        0.0
    }
}

/// Timestamp of sample `index` in a batch whose first sample is at `base`.
pub fn interpolate_timestamp(base: u32, index: usize, period_ms: f64) -> u32 {
    if index == 0 {
        return base;
    }
    let offset = (index as f64 * period_ms).round();
    base.wrapping_add(offset as u32)
}

/// Round to three decimal places.
pub fn round3(value: f32) -> f32 {
    ((value as f64 * 1000.0).round() / 1000.0) as f32
}

fn le4(chunk: &[u8]) -> [u8; 4] {
    [chunk[0], chunk[1], chunk[2], chunk[3]]
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(le4(&payload[at..at + 4]))
}

/// Signature shared by every per-kind decoder.
pub type DecodeFn =
    fn(&[u8], &DecodeOptions, DateTime<Utc>) -> Result<SampleBatch, MalformedPayload>;

impl SensorKind {
    /// The decoder for notifications of this kind.
    pub fn decoder(self) -> DecodeFn {
        match self {
            SensorKind::Imu6 => decode_imu6,
            SensorKind::Imu9 => decode_imu9,
            SensorKind::HeartRate => decode_heart_rate,
            SensorKind::Ecg => decode_ecg,
        }
    }
}

/// Decode one complete notification payload belonging to `kind`.
///
/// The envelope's packet type and reference code are not inspected; routing
/// has already happened by the time a payload reaches the decoder.
pub fn decode(
    kind: SensorKind,
    payload: &[u8],
    options: &DecodeOptions,
    received_at: DateTime<Utc>,
) -> Result<SampleBatch, MalformedPayload> {
    (kind.decoder())(payload, options, received_at)
}

fn decode_imu6(
    payload: &[u8],
    options: &DecodeOptions,
    _received_at: DateTime<Utc>,
) -> Result<SampleBatch, MalformedPayload> {
    decode_imu(SensorKind::Imu6, payload, options).map(SampleBatch::Imu)
}

fn decode_imu9(
    payload: &[u8],
    options: &DecodeOptions,
    _received_at: DateTime<Utc>,
) -> Result<SampleBatch, MalformedPayload> {
    decode_imu(SensorKind::Imu9, payload, options).map(SampleBatch::Imu)
}

fn decode_imu(
    kind: SensorKind,
    payload: &[u8],
    options: &DecodeOptions,
) -> Result<ImuBatch, MalformedPayload> {
    let sensor_count = kind.imu_sensor_count().unwrap_or(2);

    if payload.len() < STAMPED_HEADER_LEN {
        return Err(MalformedPayload::new(
            kind,
            payload,
            MalformedReason::Truncated {
                min: STAMPED_HEADER_LEN,
            },
        ));
    }
    let body = &payload[STAMPED_HEADER_LEN..];
    if body.len() % BYTES_PER_ELEMENT != 0 {
        return Err(MalformedPayload::new(
            kind,
            payload,
            MalformedReason::Misaligned {
                stride: BYTES_PER_ELEMENT,
            },
        ));
    }
    if body.is_empty() {
        return Err(MalformedPayload::new(kind, payload, MalformedReason::Empty));
    }
    let float_count = body.len() / BYTES_PER_ELEMENT;
    if float_count % AXES != 0 || (float_count / AXES) % sensor_count != 0 {
        return Err(MalformedPayload::new(
            kind,
            payload,
            MalformedReason::UnevenAxes {
                sensors: sensor_count,
            },
        ));
    }

    let timestamp = read_u32(payload, ENVELOPE_LEN);
    let triples: Vec<Vector3> = body
        .chunks_exact(BYTES_PER_ELEMENT * AXES)
        .map(|triple| {
            let axis = |i: usize| round3(f32::from_le_bytes(le4(&triple[i * 4..i * 4 + 4])));
            Vector3::new(axis(0), axis(1), axis(2))
        })
        .collect();

    let per_sensor = triples.len() / sensor_count;
    let period = period_ms(options.imu_interpolation_hz);
    let samples = (0..per_sensor)
        .map(|i| ImuSample {
            timestamp: interpolate_timestamp(timestamp, i, period),
            acc: triples[i],
            gyro: triples[i + per_sensor],
            magn: (sensor_count == 3).then(|| triples[i + 2 * per_sensor]),
        })
        .collect();

    Ok(ImuBatch { kind, samples })
}

fn decode_heart_rate(
    payload: &[u8],
    _options: &DecodeOptions,
    received_at: DateTime<Utc>,
) -> Result<SampleBatch, MalformedPayload> {
    let kind = SensorKind::HeartRate;
    if payload.len() < HEART_RATE_LEN {
        return Err(MalformedPayload::new(
            kind,
            payload,
            MalformedReason::Truncated {
                min: HEART_RATE_LEN,
            },
        ));
    }
    if payload.len() > HEART_RATE_LEN {
        return Err(MalformedPayload::new(
            kind,
            payload,
            MalformedReason::LengthMismatch {
                expected: HEART_RATE_LEN,
            },
        ));
    }

    let average_bpm = f32::from_le_bytes(le4(&payload[2..6]));
    let rr_interval_ms = u16::from_le_bytes([payload[6], payload[7]]);
    Ok(SampleBatch::HeartRate(HeartRateSample {
        timestamp: received_at,
        average_bpm,
        rr_interval_ms,
    }))
}

fn decode_ecg(
    payload: &[u8],
    options: &DecodeOptions,
    _received_at: DateTime<Utc>,
) -> Result<SampleBatch, MalformedPayload> {
    let kind = SensorKind::Ecg;
    if payload.len() < STAMPED_HEADER_LEN {
        return Err(MalformedPayload::new(
            kind,
            payload,
            MalformedReason::Truncated {
                min: STAMPED_HEADER_LEN,
            },
        ));
    }
    let body = &payload[STAMPED_HEADER_LEN..];
    if body.len() % BYTES_PER_ELEMENT != 0 {
        return Err(MalformedPayload::new(
            kind,
            payload,
            MalformedReason::Misaligned {
                stride: BYTES_PER_ELEMENT,
            },
        ));
    }
    if body.is_empty() {
        return Err(MalformedPayload::new(kind, payload, MalformedReason::Empty));
    }

    let timestamp = read_u32(payload, ENVELOPE_LEN);
    let period = period_ms(options.ecg_sample_rate_hz);
    let samples = body
        .chunks_exact(BYTES_PER_ELEMENT)
        .enumerate()
        .map(|(i, chunk)| EcgSample {
            timestamp: interpolate_timestamp(timestamp, i, period),
            amplitude: i32::from_le_bytes(le4(chunk)),
        })
        .collect();

    Ok(SampleBatch::Ecg(EcgBatch { samples }))
}

/// Encode a batch into a single `DATA` notification for `reference`.
///
/// Inverse of [`decode`] up to float rounding and timestamp interpolation:
/// only the first sample's timestamp is written, as on the device.
pub fn encode(reference: u8, batch: &SampleBatch) -> Vec<u8> {
    let mut buf = vec![PacketType::DATA, reference];
    match batch {
        SampleBatch::Imu(imu) => {
            buf.extend_from_slice(&imu.timestamp().unwrap_or(0).to_le_bytes());
            let mut push = |v: &Vector3| {
                buf.extend_from_slice(&v.x.to_le_bytes());
                buf.extend_from_slice(&v.y.to_le_bytes());
                buf.extend_from_slice(&v.z.to_le_bytes());
            };
            for sample in &imu.samples {
                push(&sample.acc);
            }
            for sample in &imu.samples {
                push(&sample.gyro);
            }
            if imu.kind == SensorKind::Imu9 {
                for sample in &imu.samples {
                    push(&sample.magn.unwrap_or_default());
                }
            }
        }
        SampleBatch::HeartRate(hr) => {
            buf.extend_from_slice(&hr.average_bpm.to_le_bytes());
            buf.extend_from_slice(&hr.rr_interval_ms.to_le_bytes());
        }
        SampleBatch::Ecg(ecg) => {
            buf.extend_from_slice(&ecg.timestamp().unwrap_or(0).to_le_bytes());
            for sample in &ecg.samples {
                buf.extend_from_slice(&sample.amplitude.to_le_bytes());
            }
        }
    }
    buf
}

/// Split an encoded `DATA` frame the way the sensor does when it exceeds
/// the link MTU: the first `first_len` bytes go out as-is, the rest follow
/// in a `DATA_PART2` notification carrying the same reference code.
pub fn split_frame(frame: &[u8], first_len: usize) -> (Vec<u8>, Vec<u8>) {
    let first_len = first_len.max(ENVELOPE_LEN).min(frame.len());
    let reference = frame.get(1).copied().unwrap_or(0);
    let first = frame[..first_len].to_vec();
    let mut second = vec![PacketType::DATA_PART2, reference];
    second.extend_from_slice(&frame[first_len..]);
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imu9_batch(timestamp: u32, n: usize) -> ImuBatch {
        let period = period_ms(104.0);
        let samples = (0..n)
            .map(|i| {
                let f = i as f32;
                ImuSample {
                    timestamp: interpolate_timestamp(timestamp, i, period),
                    acc: Vector3::new(0.125 + f, -9.81, 0.5 * f),
                    gyro: Vector3::new(1.5, 2.25 - f, -0.75),
                    magn: Some(Vector3::new(30.0 + f, -12.5, 4.0)),
                }
            })
            .collect();
        ImuBatch {
            kind: SensorKind::Imu9,
            samples,
        }
    }

    fn decode_now(kind: SensorKind, payload: &[u8]) -> Result<SampleBatch, MalformedPayload> {
        decode(kind, payload, &DecodeOptions::default(), Utc::now())
    }

    #[test]
    fn test_imu9_timestamps_interpolated_across_batch() {
        let batch = imu9_batch(123_456, 8);
        let payload = encode(99, &SampleBatch::Imu(batch.clone()));

        let decoded = match decode_now(SensorKind::Imu9, &payload).unwrap() {
            SampleBatch::Imu(imu) => imu,
            other => panic!("expected IMU batch, got {:?}", other),
        };

        assert_eq!(decoded.samples.len(), 8);
        assert_eq!(decoded.samples[0].timestamp, 123_456);
        for pair in decoded.samples.windows(2) {
            let step = pair[1].timestamp - pair[0].timestamp;
            // 1000 / 104 Hz = 9.615 ms, rounded per sample from the base.
            assert!(step == 9 || step == 10, "step {}", step);
        }
        assert_eq!(decoded.samples[7].timestamp, 123_456 + 67);
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_imu_axis_blocks() {
        // 2 samples of IMU6: acc block then gyro block.
        let mut payload = vec![PacketType::DATA, 99];
        payload.extend_from_slice(&1000u32.to_le_bytes());
        for v in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }

        let batch = match decode_now(SensorKind::Imu6, &payload).unwrap() {
            SampleBatch::Imu(imu) => imu,
            other => panic!("expected IMU batch, got {:?}", other),
        };
        assert_eq!(batch.samples.len(), 2);
        assert_eq!(batch.samples[0].acc, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(batch.samples[1].acc, Vector3::new(4.0, 5.0, 6.0));
        assert_eq!(batch.samples[0].gyro, Vector3::new(7.0, 8.0, 9.0));
        assert_eq!(batch.samples[1].gyro, Vector3::new(10.0, 11.0, 12.0));
        assert!(batch.samples.iter().all(|s| s.magn.is_none()));
    }

    #[test]
    fn test_imu_values_rounded_to_three_decimals() {
        let mut payload = vec![PacketType::DATA, 99];
        payload.extend_from_slice(&0u32.to_le_bytes());
        for v in [1.23456f32, -0.00049, 9.8066, 0.1, 0.2, 0.3] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let batch = match decode_now(SensorKind::Imu6, &payload).unwrap() {
            SampleBatch::Imu(imu) => imu,
            other => panic!("expected IMU batch, got {:?}", other),
        };
        let acc = batch.samples[0].acc;
        assert_eq!(acc.x, 1.235);
        assert_eq!(acc.y, 0.0);
        assert_eq!(acc.z, 9.807);
    }

    #[test]
    fn test_heart_rate_round_trip() {
        let received_at = Utc::now();
        let sample = HeartRateSample {
            timestamp: received_at,
            average_bpm: 72.5,
            rr_interval_ms: 828,
        };
        let payload = encode(98, &SampleBatch::HeartRate(sample.clone()));
        assert_eq!(payload.len(), 8);

        let decoded = decode(
            SensorKind::HeartRate,
            &payload,
            &DecodeOptions::default(),
            received_at,
        )
        .unwrap();
        assert_eq!(decoded, SampleBatch::HeartRate(sample));
    }

    #[test]
    fn test_ecg_round_trip_with_rate_interpolation() {
        let options = DecodeOptions {
            ecg_sample_rate_hz: 250.0,
            ..DecodeOptions::default()
        };
        let amplitudes = [-120, 0, 35, 2_000_000, -7];
        let batch = EcgBatch {
            samples: amplitudes
                .iter()
                .enumerate()
                .map(|(i, &amplitude)| EcgSample {
                    timestamp: 5_000 + 4 * i as u32,
                    amplitude,
                })
                .collect(),
        };
        let payload = encode(97, &SampleBatch::Ecg(batch.clone()));
        let decoded = decode(SensorKind::Ecg, &payload, &options, Utc::now()).unwrap();
        assert_eq!(decoded, SampleBatch::Ecg(batch));
    }

    #[test]
    fn test_misaligned_bodies_rejected() {
        let mut payload = vec![PacketType::DATA, 97];
        payload.extend_from_slice(&10u32.to_le_bytes());
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7]);

        let err = decode_now(SensorKind::Ecg, &payload).unwrap_err();
        assert_eq!(err.reason, MalformedReason::Misaligned { stride: 4 });
        assert_eq!(err.len, 13);

        let err = decode_now(SensorKind::Imu9, &payload).unwrap_err();
        assert_eq!(err.reason, MalformedReason::Misaligned { stride: 4 });
    }

    #[test]
    fn test_uneven_axes_rejected() {
        // Four floats: not a whole number of triples.
        let mut payload = vec![PacketType::DATA, 99];
        payload.extend_from_slice(&10u32.to_le_bytes());
        payload.extend_from_slice(&[0u8; 16]);
        let err = decode_now(SensorKind::Imu6, &payload).unwrap_err();
        assert_eq!(err.reason, MalformedReason::UnevenAxes { sensors: 2 });

        // Two triples cannot be split across three IMU9 sensors.
        let mut payload = vec![PacketType::DATA, 99];
        payload.extend_from_slice(&10u32.to_le_bytes());
        payload.extend_from_slice(&[0u8; 24]);
        let err = decode_now(SensorKind::Imu9, &payload).unwrap_err();
        assert_eq!(err.reason, MalformedReason::UnevenAxes { sensors: 3 });
    }

    #[test]
    fn test_header_only_is_empty() {
        let mut payload = vec![PacketType::DATA, 97];
        payload.extend_from_slice(&10u32.to_le_bytes());
        let err = decode_now(SensorKind::Ecg, &payload).unwrap_err();
        assert_eq!(err.reason, MalformedReason::Empty);
    }

    #[test]
    fn test_heart_rate_length_must_be_exact() {
        let err = decode_now(SensorKind::HeartRate, &[2, 98, 0, 0, 0x90]).unwrap_err();
        assert_eq!(err.reason, MalformedReason::Truncated { min: 8 });

        let err = decode_now(SensorKind::HeartRate, &[2, 98, 0, 0, 0x90, 0x42, 1, 2, 3]).unwrap_err();
        assert_eq!(err.reason, MalformedReason::LengthMismatch { expected: 8 });
    }

    #[test]
    fn test_arbitrary_lengths_never_yield_partial_batches() {
        for kind in SensorKind::ALL {
            for len in 0..160 {
                let payload: Vec<u8> = (0..len).map(|i| (i * 37 % 251) as u8).collect();
                match decode_now(kind, &payload) {
                    Ok(batch) => {
                        assert!(!batch.is_empty());
                        assert_eq!(batch.kind(), kind);
                    }
                    Err(err) => {
                        assert_eq!(err.kind, kind);
                        assert_eq!(err.len, len);
                    }
                }
            }
        }
    }

    #[test]
    fn test_split_frame_carries_reference() {
        let frame = encode(99, &SampleBatch::Imu(imu9_batch(1, 4)));
        let (first, second) = split_frame(&frame, 100);
        assert_eq!(first.len(), 100);
        assert_eq!(second[0], PacketType::DATA_PART2);
        assert_eq!(second[1], 99);
        assert_eq!(first.len() + second.len() - ENVELOPE_LEN, frame.len());
    }

    #[test]
    fn test_interpolation_wraps_device_clock() {
        assert_eq!(interpolate_timestamp(u32::MAX, 1, 10.0), 9);
        assert_eq!(interpolate_timestamp(7, 0, 10.0), 7);
        assert_eq!(period_ms(0.0), 0.0);
    }
}
