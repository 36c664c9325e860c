//! Subscription command frames
//!
//! Builds the GSP commands written to the sensor's write characteristic:
//!
//! ```text
//! SUBSCRIBE    | 0x01 | ref | "Meas/IMU9/26" (UTF-8, no terminator)
//! UNSUBSCRIBE  | 0x02 | ref
//! HELLO        | 0x00 | ref
//! ```
//!
//! Reference codes are chosen by the subscriber. They must be distinct
//! within a session: the sensor echoes them verbatim, so a collision would
//! make two streams indistinguishable on the notify channel.

use std::collections::HashMap;

use crate::ble::gatt::{CMD_HELLO, CMD_SUBSCRIBE, CMD_UNSUBSCRIBE};
use crate::config::SensorSubscription;
use crate::error::ConfigError;
use crate::sensor::SensorKind;

#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    references: HashMap<SensorKind, u8>,
}

impl SubscriptionManager {
    /// Build from `(kind, reference)` pairs, rejecting reused codes or kinds.
    pub fn new(
        references: impl IntoIterator<Item = (SensorKind, u8)>,
    ) -> Result<Self, ConfigError> {
        let mut by_kind: HashMap<SensorKind, u8> = HashMap::new();
        for (kind, code) in references {
            if by_kind.contains_key(&kind) {
                return Err(ConfigError::DuplicateKind(kind));
            }
            if let Some((&first, _)) = by_kind.iter().find(|&(_, &c)| c == code) {
                return Err(ConfigError::DuplicateReference {
                    code,
                    first,
                    second: kind,
                });
            }
            by_kind.insert(kind, code);
        }
        Ok(Self {
            references: by_kind,
        })
    }

    pub fn from_subscriptions(subscriptions: &[SensorSubscription]) -> Result<Self, ConfigError> {
        Self::new(subscriptions.iter().map(|s| (s.kind, s.reference)))
    }

    pub fn reference(&self, kind: SensorKind) -> Option<u8> {
        self.references.get(&kind).copied()
    }

    /// Reverse map used by the demultiplexer: reference code -> kind.
    pub fn routes(&self) -> HashMap<u8, SensorKind> {
        self.references
            .iter()
            .map(|(&kind, &code)| (code, kind))
            .collect()
    }

    fn require(&self, kind: SensorKind) -> Result<u8, ConfigError> {
        self.reference(kind).ok_or(ConfigError::NotConfigured(kind))
    }

    /// Subscription path for `kind`; heart rate takes no rate suffix.
    pub fn path(kind: SensorKind, rate: Option<u32>) -> Result<String, ConfigError> {
        if !kind.is_rate_bearing() {
            return Ok(format!("Meas/{}", kind.resource()));
        }
        let rate = rate.ok_or(ConfigError::MissingRate(kind))?;
        Ok(format!("Meas/{}/{}", kind.resource(), rate))
    }

    pub fn build_subscribe(&self, kind: SensorKind, rate: Option<u32>) -> Result<Vec<u8>, ConfigError> {
        let code = self.require(kind)?;
        let path = Self::path(kind, rate)?;
        let mut frame = Vec::with_capacity(2 + path.len());
        frame.push(CMD_SUBSCRIBE);
        frame.push(code);
        frame.extend_from_slice(path.as_bytes());
        Ok(frame)
    }

    pub fn build_unsubscribe(&self, kind: SensorKind) -> Result<Vec<u8>, ConfigError> {
        Ok(vec![CMD_UNSUBSCRIBE, self.require(kind)?])
    }

    pub fn build_hello(reference: u8) -> Vec<u8> {
        vec![CMD_HELLO, reference]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new([
            (SensorKind::Imu9, 99),
            (SensorKind::HeartRate, 98),
            (SensorKind::Ecg, 97),
        ])
        .unwrap()
    }

    #[test]
    fn test_subscribe_frames() {
        let m = manager();
        let frame = m.build_subscribe(SensorKind::Imu9, Some(26)).unwrap();
        assert_eq!(frame[0], CMD_SUBSCRIBE);
        assert_eq!(frame[1], 99);
        assert_eq!(&frame[2..], b"Meas/IMU9/26");

        let frame = m.build_subscribe(SensorKind::HeartRate, None).unwrap();
        assert_eq!(frame, [&[CMD_SUBSCRIBE, 98][..], b"Meas/HR"].concat());

        // A stray rate on HR is ignored; the path never carries one.
        let frame = m.build_subscribe(SensorKind::HeartRate, Some(10)).unwrap();
        assert_eq!(&frame[2..], b"Meas/HR");

        let frame = m.build_subscribe(SensorKind::Ecg, Some(125)).unwrap();
        assert_eq!(hex::encode(&frame), "01614d6561732f4543472f313235");
    }

    #[test]
    fn test_unsubscribe_and_hello() {
        let m = manager();
        assert_eq!(m.build_unsubscribe(SensorKind::Ecg).unwrap(), vec![CMD_UNSUBSCRIBE, 97]);
        assert_eq!(SubscriptionManager::build_hello(7), vec![CMD_HELLO, 7]);
    }

    #[test]
    fn test_unconfigured_kind() {
        let m = manager();
        assert!(matches!(
            m.build_subscribe(SensorKind::Imu6, Some(26)),
            Err(ConfigError::NotConfigured(SensorKind::Imu6))
        ));
        assert!(matches!(
            m.build_unsubscribe(SensorKind::Imu6),
            Err(ConfigError::NotConfigured(SensorKind::Imu6))
        ));
    }

    #[test]
    fn test_missing_rate() {
        let m = manager();
        assert!(matches!(
            m.build_subscribe(SensorKind::Imu9, None),
            Err(ConfigError::MissingRate(SensorKind::Imu9))
        ));
    }

    #[test]
    fn test_reference_collision_rejected() {
        let err = SubscriptionManager::new([(SensorKind::Imu9, 1), (SensorKind::Ecg, 1)]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateReference { code: 1, .. }));
    }

    #[test]
    fn test_routes_invert_references() {
        let routes = manager().routes();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[&99], SensorKind::Imu9);
        assert_eq!(routes[&98], SensorKind::HeartRate);
        assert_eq!(routes[&97], SensorKind::Ecg);
    }
}
