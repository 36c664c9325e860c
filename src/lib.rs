// Movesense Bridge - BLE acquisition engine for Movesense wearable sensors

pub mod ble;
pub mod codec;
pub mod config;
pub mod control;
pub mod demux;
pub mod error;
pub mod queue;
pub mod record;
pub mod sensor;
pub mod session;
pub mod stats;
pub mod subscription;

pub use config::{SensorSubscription, SessionConfig};
pub use control::SessionControl;
pub use error::{AcquisitionError, ConfigError};
pub use queue::{BoundedQueue, QueueConfig, SampleQueues};
pub use sensor::{SampleBatch, SensorKind};
pub use session::{CycleOutcome, DeviceSession, SessionState, StreamEnd};
pub use stats::{AcquisitionStats, StatsSnapshot};

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::ble::transport::SensorCentral;

/// Handles shared between a running acquisition task and its consumers.
#[derive(Clone)]
pub struct Acquisition {
    pub control: Arc<SessionControl>,
    pub queues: SampleQueues,
    pub stats: Arc<AcquisitionStats>,
}

/// Build a [`DeviceSession`] for `config` on `central` and run it on a
/// background task until [`SessionControl::shutdown`] is called.
///
/// Acquisition starts paused; call `control.start()` to begin streaming.
pub fn spawn_acquisition(
    central: Arc<dyn SensorCentral>,
    config: SessionConfig,
) -> Result<(Acquisition, JoinHandle<()>), ConfigError> {
    let acquisition = Acquisition {
        control: Arc::new(SessionControl::new()),
        queues: SampleQueues::new(&config.queues),
        stats: Arc::new(AcquisitionStats::new()),
    };
    let mut session = DeviceSession::new(
        central,
        config,
        acquisition.queues.clone(),
        Arc::clone(&acquisition.control),
        Arc::clone(&acquisition.stats),
    )?;
    let handle = tokio::spawn(async move { session.run().await });
    Ok((acquisition, handle))
}
