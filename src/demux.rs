//! Notification demultiplexing
//!
//! All subscribed streams share one notify characteristic. Byte 1 of every
//! notification is the reference code chosen at subscription time, which
//! identifies the stream and therefore the decoder to apply.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::ble::gatt::{PacketType, ENVELOPE_LEN};
use crate::codec::{self, DecodeOptions};
use crate::error::AcquisitionError;
use crate::queue::SampleQueues;
use crate::sensor::{SampleBatch, SensorKind};
use crate::stats::AcquisitionStats;
use crate::subscription::SubscriptionManager;

/// Maps reference codes to sensor kinds. Pure: no state changes on lookup.
#[derive(Debug, Clone)]
pub struct Demultiplexer {
    routes: HashMap<u8, SensorKind>,
}

impl Demultiplexer {
    pub fn new(routes: HashMap<u8, SensorKind>) -> Self {
        Self { routes }
    }

    pub fn from_subscriptions(manager: &SubscriptionManager) -> Self {
        Self::new(manager.routes())
    }

    /// The kind whose stream `payload` belongs to.
    pub fn route(&self, payload: &[u8]) -> Result<SensorKind, AcquisitionError> {
        let code = *payload
            .get(1)
            .ok_or(AcquisitionError::TruncatedEnvelope(payload.len()))?;
        self.routes
            .get(&code)
            .copied()
            .ok_or(AcquisitionError::UnroutablePacket(code))
    }

    /// Route `payload` and decode it with its kind's decoder.
    pub fn dispatch(
        &self,
        payload: &[u8],
        options: &DecodeOptions,
    ) -> Result<SampleBatch, AcquisitionError> {
        let kind = self.route(payload)?;
        Ok(codec::decode(kind, payload, options, Utc::now())?)
    }
}

/// What happened to one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Decoded and appended to its queue.
    Queued {
        kind: SensorKind,
        samples: usize,
        /// An older entry was evicted to make room.
        overflowed: bool,
    },
    /// Held until the next notification shows whether a `DATA_PART2`
    /// continuation follows.
    AwaitingContinuation { reference: u8 },
    /// Status reply to a command; counted, never queued.
    CommandResult { reference: u8, status: Option<u16> },
    /// Discarded (malformed or unroutable).
    Dropped,
}

struct PendingFrame {
    kind: SensorKind,
    reference: u8,
    bytes: Vec<u8>,
}

/// Demultiplex -> decode -> enqueue, for every notification of a session.
///
/// A frame may be cut anywhere by the sensor, including on a sample
/// boundary where the first part still decodes on its own. Every non-HR
/// `DATA` frame is therefore held until the next notification (or an
/// explicit [`flush`](Self::flush)) and only decoded alone when no
/// continuation follows it.
///
/// Never fails: problems are logged, counted in [`AcquisitionStats`] and the
/// notification is dropped.
pub struct NotificationPipeline {
    label: String,
    demux: Demultiplexer,
    options: DecodeOptions,
    queues: SampleQueues,
    stats: Arc<AcquisitionStats>,
    pending: Option<PendingFrame>,
}

impl NotificationPipeline {
    pub fn new(
        label: impl Into<String>,
        demux: Demultiplexer,
        options: DecodeOptions,
        queues: SampleQueues,
        stats: Arc<AcquisitionStats>,
    ) -> Self {
        Self {
            label: label.into(),
            demux,
            options,
            queues,
            stats,
            pending: None,
        }
    }

    pub fn handle(&mut self, payload: &[u8]) -> Delivery {
        self.stats.record_notification();

        if payload.len() < ENVELOPE_LEN {
            self.flush();
            self.stats.record_malformed();
            log::warn!(
                "{}: {}",
                self.label,
                AcquisitionError::TruncatedEnvelope(payload.len())
            );
            return Delivery::Dropped;
        }

        match PacketType::from_byte(payload[0]) {
            Some(PacketType::CommandResult) => {
                self.flush();
                self.command_result(payload)
            }
            Some(PacketType::DataPart2) => self.continuation(payload),
            // Routing only depends on the reference code, so unknown packet
            // types are treated like plain data.
            Some(PacketType::Data) | None => {
                self.flush();
                self.data(payload)
            }
        }
    }

    /// Decode and queue a held frame on its own. Called when no more
    /// notifications are expected for a while.
    pub fn flush(&mut self) -> Option<Delivery> {
        let held = self.pending.take()?;
        Some(self.deliver(held.kind, &held.bytes))
    }

    /// Flush any held frame, e.g. when the session ends.
    pub fn reset(&mut self) {
        self.flush();
    }

    fn command_result(&self, payload: &[u8]) -> Delivery {
        self.stats.record_command_result();
        let reference = payload[1];
        let status = payload
            .get(2..4)
            .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]));
        log::debug!(
            "{}: command result for reference {}: status {:?}",
            self.label,
            reference,
            status
        );
        Delivery::CommandResult { reference, status }
    }

    fn data(&mut self, payload: &[u8]) -> Delivery {
        let kind = match self.demux.route(payload) {
            Ok(kind) => kind,
            Err(err) => {
                self.stats.record_unroutable();
                log::warn!("{}: {}, dropped", self.label, err);
                return Delivery::Dropped;
            }
        };

        // Heart rate always fits one notification.
        if kind == SensorKind::HeartRate {
            return self.deliver(kind, payload);
        }

        let reference = payload[1];
        self.pending = Some(PendingFrame {
            kind,
            reference,
            bytes: payload.to_vec(),
        });
        Delivery::AwaitingContinuation { reference }
    }

    fn continuation(&mut self, payload: &[u8]) -> Delivery {
        let reference = payload[1];
        match self.pending.take() {
            Some(first) if first.reference == reference => {
                let mut combined = first.bytes;
                combined.extend_from_slice(&payload[ENVELOPE_LEN..]);
                self.deliver(first.kind, &combined)
            }
            other => {
                // A different stream's frame was held; it stands alone.
                if let Some(held) = other {
                    self.deliver(held.kind, &held.bytes);
                }
                self.stats.record_malformed();
                log::warn!(
                    "{}: continuation for reference {} without a first part, dropped",
                    self.label,
                    reference
                );
                Delivery::Dropped
            }
        }
    }

    fn deliver(&mut self, kind: SensorKind, payload: &[u8]) -> Delivery {
        match codec::decode(kind, payload, &self.options, Utc::now()) {
            Ok(batch) => {
                let samples = batch.len();
                let overflowed = self.queues.push(batch);
                self.stats.record_batch(samples);
                if overflowed {
                    self.stats.record_overflow();
                }
                log::debug!("{}: queued {} batch of {} samples", self.label, kind, samples);
                Delivery::Queued {
                    kind,
                    samples,
                    overflowed,
                }
            }
            Err(err) => {
                self.stats.record_malformed();
                log::warn!("{}: {}, dropped", self.label, err);
                Delivery::Dropped
            }
        }
    }

    pub fn queues(&self) -> &SampleQueues {
        &self.queues
    }

    pub fn stats(&self) -> &Arc<AcquisitionStats> {
        &self.stats
    }
}
