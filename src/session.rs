//! Device session state machine
//!
//! One task owns a [`DeviceSession`] and walks it through
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Discovering -> Subscribing -> Streaming
//!      -> Unsubscribing -> Disconnecting -> Idle
//! ```
//!
//! with `Failed` reachable from any setup state on timeout or I/O error.
//! Every wait is bounded, so the machine observes the shared
//! [`SessionControl`] flags at least once per notification timeout.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::ble::transport::{BleAddress, SensorCentral, SensorLink};
use crate::ble::BleError;
use crate::config::SessionConfig;
use crate::control::SessionControl;
use crate::demux::{Demultiplexer, NotificationPipeline};
use crate::error::{AcquisitionError, ConfigError};
use crate::queue::SampleQueues;
use crate::sensor::SensorKind;
use crate::stats::AcquisitionStats;
use crate::subscription::SubscriptionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Subscribing,
    Streaming,
    Unsubscribing,
    Disconnecting,
    /// The current attempt failed; always followed by `Idle`.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Scanning => "Scanning",
            SessionState::Connecting => "Connecting",
            SessionState::Discovering => "Discovering",
            SessionState::Subscribing => "Subscribing",
            SessionState::Streaming => "Streaming",
            SessionState::Unsubscribing => "Unsubscribing",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// State of one BLE connection, from connect until disconnect.
pub struct Session {
    link: Box<dyn SensorLink>,
    /// Subscriptions the sensor acknowledged, by kind.
    references: HashMap<SensorKind, u8>,
    connected: bool,
    streaming: bool,
}

impl Session {
    fn new(link: Box<dyn SensorLink>) -> Self {
        Self {
            link,
            references: HashMap::new(),
            connected: true,
            streaming: false,
        }
    }

    pub fn peer_address(&self) -> &BleAddress {
        self.link.peer_address()
    }

    pub fn references(&self) -> &HashMap<SensorKind, u8> {
        &self.references
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.link.is_connected()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }
}

/// Why a streaming phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The running flag was cleared.
    Stopped,
    /// A rescan was requested; the next cycle scans again.
    Rescan,
    LinkLost,
}

/// Result of one pass through the state machine.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing was requested; the machine stayed idle.
    Idle,
    /// A rescan located the sensor while acquisition was not running.
    Located(BleAddress),
    /// The session streamed and was torn down.
    Streamed(StreamEnd),
    /// The attempt failed and the machine went back to idle.
    Failed(AcquisitionError),
}

pub struct DeviceSession {
    label: String,
    config: SessionConfig,
    central: Arc<dyn SensorCentral>,
    control: Arc<SessionControl>,
    subscriptions: SubscriptionManager,
    pipeline: NotificationPipeline,
    state: SessionState,
    transitions: broadcast::Sender<SessionState>,
    /// Set after a connection failure: wait for the running flag to be
    /// re-activated instead of retrying straight away.
    awaiting_restart: bool,
    /// Scan again on the next cycle regardless of the running flag.
    restart_scan: bool,
}

impl DeviceSession {
    pub fn new(
        central: Arc<dyn SensorCentral>,
        config: SessionConfig,
        queues: SampleQueues,
        control: Arc<SessionControl>,
        stats: Arc<AcquisitionStats>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let subscriptions = SubscriptionManager::from_subscriptions(&config.sensors)?;
        let label = config.device_name();
        let pipeline = NotificationPipeline::new(
            label.clone(),
            Demultiplexer::from_subscriptions(&subscriptions),
            config.decode_options(),
            queues,
            stats,
        );
        let (transitions, _) = broadcast::channel(64);

        Ok(Self {
            label,
            config,
            central,
            control,
            subscriptions,
            pipeline,
            state: SessionState::Idle,
            transitions,
            awaiting_restart: false,
            restart_scan: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn control(&self) -> &Arc<SessionControl> {
        &self.control
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Follow every state change from now on.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }

    fn transition(&mut self, next: SessionState) {
        log::info!("{}: {} -> {}", self.label, self.state, next);
        self.state = next;
        let _ = self.transitions.send(next);
    }

    /// Drive the machine until [`SessionControl::shutdown`] is called.
    pub async fn run(&mut self) {
        let mut shutdown = self.control.shutdown_signal();
        log::info!("{}: session loop started", self.label);

        while !self.control.is_shut_down() {
            match self.run_cycle().await {
                CycleOutcome::Idle | CycleOutcome::Failed(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_poll()) => {}
                        _ = shutdown.recv() => break,
                    }
                }
                CycleOutcome::Located(_) | CycleOutcome::Streamed(_) => {}
            }
        }

        log::info!("{}: session loop stopped", self.label);
    }

    /// Run one cycle starting from `Idle`: scan, connect, stream until told
    /// to stop, tear down. Returns without leaving `Idle` when nothing is
    /// requested.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let requested = self.control.take_rescan();
        let rescan = std::mem::take(&mut self.restart_scan) || requested;
        let running = self.control.is_running();

        if !running || rescan {
            self.awaiting_restart = false;
        }
        if !rescan && (!running || self.awaiting_restart) {
            return CycleOutcome::Idle;
        }

        match self.acquire().await {
            Ok(outcome) => outcome,
            Err(AcquisitionError::ShutDown) => {
                log::info!("{}: {} interrupted by shutdown", self.label, self.state);
                self.transition(SessionState::Idle);
                CycleOutcome::Idle
            }
            Err(err) => {
                let failed_in = self.state;
                self.transition(SessionState::Failed);
                log::warn!("{}: {} failed: {}", self.label, failed_in, err);
                if failed_in != SessionState::Scanning {
                    self.awaiting_restart = true;
                    log::info!(
                        "{}: waiting for acquisition to be restarted",
                        self.label
                    );
                }
                self.discard_stale_rescan();
                self.transition(SessionState::Idle);
                CycleOutcome::Failed(err)
            }
        }
    }

    async fn acquire(&mut self) -> Result<CycleOutcome, AcquisitionError> {
        let control = Arc::clone(&self.control);

        self.transition(SessionState::Scanning);
        let address = until_shutdown(&control, self.scan()).await?;

        if !self.control.is_running() {
            log::info!(
                "{}: located at {}, acquisition not running",
                self.label,
                address
            );
            self.transition(SessionState::Idle);
            return Ok(CycleOutcome::Located(address));
        }

        self.transition(SessionState::Connecting);
        let connecting = async {
            match timeout(self.config.connect_timeout(), self.central.connect(&address)).await {
                Ok(link) => link.map_err(AcquisitionError::from),
                Err(_) => Err(AcquisitionError::ConnectTimeout),
            }
        };
        let link = until_shutdown(&control, connecting).await?;
        let mut session = Session::new(link);

        if let Err(err) = self.prepare(&mut session).await {
            self.abandon(&mut session).await;
            return Err(err);
        }

        session.streaming = true;
        self.discard_stale_rescan();
        self.transition(SessionState::Streaming);
        let end = self.stream(&mut session).await;
        self.teardown(session).await;

        if end == StreamEnd::Rescan {
            self.restart_scan = true;
        }
        Ok(CycleOutcome::Streamed(end))
    }

    async fn scan(&self) -> Result<BleAddress, AcquisitionError> {
        let name = self.config.device_name();
        let mut adverts = self.central.advertisements();
        self.central.start_scan().await?;

        let found = timeout(self.config.scan_timeout(), async {
            loop {
                match adverts.recv().await {
                    Ok(adv) if adv.name_matches(&name) => return Ok(adv),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Advertisement stream lagged by {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BleError::ScanError(
                            "advertisement stream closed".to_string(),
                        ))
                    }
                }
            }
        })
        .await;

        if let Err(e) = self.central.stop_scan().await {
            log::warn!("{}: failed to stop scan: {}", self.label, e);
        }

        let adv = match found {
            Ok(adv) => adv?,
            Err(_) => return Err(AcquisitionError::ScanTimeout),
        };
        log::info!(
            "{}: found at {} (rssi {:?})",
            self.label,
            adv.source_address,
            adv.rssi
        );
        Ok(adv.source_address)
    }

    /// Discovering + Subscribing.
    async fn prepare(&mut self, session: &mut Session) -> Result<(), AcquisitionError> {
        self.transition(SessionState::Discovering);
        let control = Arc::clone(&self.control);
        let wait = self.config.discovery_timeout();
        let discovering = async {
            match timeout(wait, session.link.discover()).await {
                Ok(result) => result.map_err(AcquisitionError::from),
                Err(_) => Err(AcquisitionError::DiscoveryTimeout),
            }
        };
        until_shutdown(&control, discovering).await?;

        self.transition(SessionState::Subscribing);
        for sub in &self.config.sensors {
            let frame = self.subscriptions.build_subscribe(sub.kind, sub.rate)?;
            log::debug!(
                "{}: subscribe {} <- {}",
                self.label,
                sub.kind,
                hex::encode(&frame)
            );
            match timeout(self.config.write_timeout(), session.link.write_command(&frame)).await {
                Ok(Ok(())) => {
                    session.references.insert(sub.kind, sub.reference);
                    log::info!(
                        "{}: subscribed to {} (reference {})",
                        self.label,
                        SubscriptionManager::path(sub.kind, sub.rate)?,
                        sub.reference
                    );
                }
                Ok(Err(source)) => {
                    return Err(AcquisitionError::SubscribeFailed {
                        kind: sub.kind,
                        source,
                    })
                }
                Err(_) => {
                    return Err(AcquisitionError::SubscribeFailed {
                        kind: sub.kind,
                        source: BleError::Timeout,
                    })
                }
            }
        }
        Ok(())
    }

    async fn stream(&mut self, session: &mut Session) -> StreamEnd {
        let wait = self.config.notification_timeout();
        loop {
            if !self.control.is_running() {
                return StreamEnd::Stopped;
            }
            if self.control.take_rescan() {
                log::info!("{}: rescan requested while streaming", self.label);
                return StreamEnd::Rescan;
            }
            if !session.is_connected() {
                return self.link_lost(session);
            }

            match timeout(wait, session.link.next_notification()).await {
                // Nothing arrived this poll: a held frame has no continuation
                // coming. Re-check the flags.
                Err(_) => {
                    self.pipeline.flush();
                }
                Ok(Ok(payload)) => {
                    self.pipeline.handle(&payload);
                }
                Ok(Err(BleError::Disconnected)) => return self.link_lost(session),
                Ok(Err(e)) => {
                    log::warn!("{}: notification error: {}", self.label, e);
                }
            }
        }
    }

    fn link_lost(&self, session: &mut Session) -> StreamEnd {
        session.connected = false;
        log::warn!("{}: {}", self.label, AcquisitionError::LinkLost);
        StreamEnd::LinkLost
    }

    /// Unsubscribing -> Disconnecting -> Idle. Best effort throughout.
    async fn teardown(&mut self, mut session: Session) {
        session.streaming = false;
        self.pipeline.reset();

        self.transition(SessionState::Unsubscribing);
        if session.is_connected() {
            self.unsubscribe_acknowledged(&mut session).await;
        } else {
            log::debug!("{}: link already down, skipping unsubscribe", self.label);
            session.references.clear();
        }

        self.transition(SessionState::Disconnecting);
        self.disconnect(&session).await;
        session.connected = false;

        self.transition(SessionState::Idle);
    }

    /// Drop a half-established connection, releasing whatever the sensor
    /// already acknowledged.
    async fn abandon(&self, session: &mut Session) {
        if session.link.is_connected() {
            self.unsubscribe_acknowledged(session).await;
            self.disconnect(session).await;
        }
    }

    /// UNSUBSCRIBE every acknowledged kind, in configuration order with a
    /// gap between commands.
    async fn unsubscribe_acknowledged(&self, session: &mut Session) {
        let mut first = true;
        for sub in &self.config.sensors {
            if !session.references.contains_key(&sub.kind) {
                continue;
            }
            if !first {
                tokio::time::sleep(self.config.unsubscribe_gap()).await;
            }
            first = false;

            let frame = match self.subscriptions.build_unsubscribe(sub.kind) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("{}: {}", self.label, e);
                    continue;
                }
            };
            log::debug!(
                "{}: unsubscribe {} <- {}",
                self.label,
                sub.kind,
                hex::encode(&frame)
            );
            match timeout(self.config.write_timeout(), session.link.write_command(&frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("{}: unsubscribe {} failed: {}", self.label, sub.kind, e)
                }
                Err(_) => log::warn!("{}: unsubscribe {} timed out", self.label, sub.kind),
            }
        }
        session.references.clear();
    }

    async fn disconnect(&self, session: &Session) {
        match timeout(self.config.write_timeout(), session.link.disconnect()).await {
            Ok(Ok(())) => log::info!("{}: disconnected from {}", self.label, session.peer_address()),
            Ok(Err(e)) => log::warn!("{}: disconnect failed: {}", self.label, e),
            Err(_) => log::warn!("{}: disconnect timed out", self.label),
        }
    }

    /// Rescan requests are only honored from Idle or Streaming; drop any
    /// that arrived while a connection attempt was in progress.
    fn discard_stale_rescan(&self) {
        if self.control.take_rescan() {
            log::debug!(
                "{}: ignoring rescan requested during connection setup",
                self.label
            );
        }
    }
}

/// Run `work` unless [`SessionControl::shutdown`] is called first.
async fn until_shutdown<T>(
    control: &SessionControl,
    work: impl Future<Output = Result<T, AcquisitionError>>,
) -> Result<T, AcquisitionError> {
    let mut shutdown = control.shutdown_signal();
    if control.is_shut_down() {
        return Err(AcquisitionError::ShutDown);
    }
    tokio::select! {
        result = work => result,
        _ = shutdown.recv() => Err(AcquisitionError::ShutDown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::{CMD_SUBSCRIBE, CMD_UNSUBSCRIBE};
    use crate::ble::simulated::SimSensorNetwork;
    use crate::config::SensorSubscription;
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig {
            sensors: vec![
                SensorSubscription::new(SensorKind::Imu9, Some(26), 99),
                SensorSubscription::new(SensorKind::HeartRate, None, 98),
            ],
            ..SessionConfig::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SessionState>) -> Vec<SessionState> {
        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state);
        }
        seen
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Unsubscribing.to_string(), "Unsubscribing");
        assert_eq!(SessionState::Failed.to_string(), "Failed");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = SimSensorNetwork::new();
        let config = SessionConfig {
            sensors: vec![
                SensorSubscription::new(SensorKind::Imu9, Some(26), 1),
                SensorSubscription::new(SensorKind::HeartRate, None, 1),
            ],
            ..SessionConfig::default()
        };
        let result = DeviceSession::new(
            Arc::new(network.central()),
            config,
            SampleQueues::default(),
            Arc::new(SessionControl::new()),
            Arc::new(AcquisitionStats::new()),
        );
        assert!(matches!(result, Err(ConfigError::DuplicateReference { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_until_started() {
        let network = SimSensorNetwork::new();
        network.add_sensor("Movesense 174630000192").await;
        let mut session = DeviceSession::new(
            Arc::new(network.central()),
            config(),
            SampleQueues::default(),
            Arc::new(SessionControl::new()),
            Arc::new(AcquisitionStats::new()),
        )
        .unwrap();
        let mut rx = session.subscribe_transitions();

        assert!(matches!(session.run_cycle().await, CycleOutcome::Idle));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_while_stopped_only_locates() {
        let network = SimSensorNetwork::new();
        let sensor = network.add_sensor("Movesense 174630000192").await;
        let control = Arc::new(SessionControl::new());
        let mut session = DeviceSession::new(
            Arc::new(network.central()),
            config(),
            SampleQueues::default(),
            Arc::clone(&control),
            Arc::new(AcquisitionStats::new()),
        )
        .unwrap();
        let mut rx = session.subscribe_transitions();

        control.request_rescan();
        match session.run_cycle().await {
            CycleOutcome::Located(address) => assert_eq!(&address, sensor.address()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(drain(&mut rx), vec![SessionState::Scanning, SessionState::Idle]);
        assert!(!sensor.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout_waits_for_restart() {
        let network = SimSensorNetwork::new();
        let sensor = network.add_sensor("Movesense 174630000192").await;
        sensor.set_discovery_stall(true);
        let control = Arc::new(SessionControl::new());
        let mut session = DeviceSession::new(
            Arc::new(network.central()),
            config(),
            SampleQueues::default(),
            Arc::clone(&control),
            Arc::new(AcquisitionStats::new()),
        )
        .unwrap();
        let mut rx = session.subscribe_transitions();

        control.start();
        assert!(matches!(
            session.run_cycle().await,
            CycleOutcome::Failed(AcquisitionError::DiscoveryTimeout)
        ));
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionState::Scanning,
                SessionState::Connecting,
                SessionState::Discovering,
                SessionState::Failed,
                SessionState::Idle,
            ]
        );
        assert!(!sensor.is_connected());

        // Still running, but a connection failure is not retried...
        assert!(matches!(session.run_cycle().await, CycleOutcome::Idle));

        // ...until the running flag is re-activated.
        sensor.set_discovery_stall(false);
        control.stop();
        assert!(matches!(session.run_cycle().await, CycleOutcome::Idle));
        control.start();

        let handle = tokio::spawn(async move {
            let outcome = session.run_cycle().await;
            (session, outcome)
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sensor.is_notifying());
        control.stop();
        let (_session, outcome) = handle.await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Streamed(StreamEnd::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure() {
        let network = SimSensorNetwork::new();
        let sensor = network.add_sensor("Movesense 174630000192").await;
        sensor.set_reject_writes(true);
        let control = Arc::new(SessionControl::new());
        let mut session = DeviceSession::new(
            Arc::new(network.central()),
            config(),
            SampleQueues::default(),
            Arc::clone(&control),
            Arc::new(AcquisitionStats::new()),
        )
        .unwrap();

        control.start();
        match session.run_cycle().await {
            CycleOutcome::Failed(AcquisitionError::SubscribeFailed { kind, .. }) => {
                assert_eq!(kind, SensorKind::Imu9)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!sensor.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_subscribe_failure_releases_acknowledged_kinds() {
        let network = SimSensorNetwork::new();
        let sensor = network.add_sensor("Movesense 174630000192").await;
        sensor.set_reject_reference(Some(98));
        let control = Arc::new(SessionControl::new());
        let mut session = DeviceSession::new(
            Arc::new(network.central()),
            config(),
            SampleQueues::default(),
            Arc::clone(&control),
            Arc::new(AcquisitionStats::new()),
        )
        .unwrap();

        control.start();
        match session.run_cycle().await {
            CycleOutcome::Failed(AcquisitionError::SubscribeFailed { kind, .. }) => {
                assert_eq!(kind, SensorKind::HeartRate)
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let writes = sensor.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(&writes[0][..2], &[CMD_SUBSCRIBE, 99]);
        assert_eq!(writes[1], vec![CMD_UNSUBSCRIBE, 99]);
        assert!(!sensor.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_scan() {
        let network = SimSensorNetwork::new();
        let control = Arc::new(SessionControl::new());
        let mut session = DeviceSession::new(
            Arc::new(network.central()),
            config(),
            SampleQueues::default(),
            Arc::clone(&control),
            Arc::new(AcquisitionStats::new()),
        )
        .unwrap();
        let mut rx = session.subscribe_transitions();

        control.start();
        let handle = tokio::spawn(async move { session.run().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        control.shutdown();

        // Well inside the 10 s scan timeout.
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("shutdown not observed while scanning")
            .unwrap();
        assert_eq!(drain(&mut rx), vec![SessionState::Scanning, SessionState::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_discovery() {
        let network = SimSensorNetwork::new();
        let sensor = network.add_sensor("Movesense 174630000192").await;
        sensor.set_discovery_stall(true);
        let control = Arc::new(SessionControl::new());
        let mut session = DeviceSession::new(
            Arc::new(network.central()),
            config(),
            SampleQueues::default(),
            Arc::clone(&control),
            Arc::new(AcquisitionStats::new()),
        )
        .unwrap();
        let mut rx = session.subscribe_transitions();

        control.start();
        let handle = tokio::spawn(async move { session.run().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        control.shutdown();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("shutdown not observed while discovering")
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionState::Scanning,
                SessionState::Connecting,
                SessionState::Discovering,
                SessionState::Idle,
            ]
        );
        assert!(!sensor.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribes_only_acknowledged_kinds() {
        let network = SimSensorNetwork::new();
        let sensor = network.add_sensor("Movesense 174630000192").await;
        let control = Arc::new(SessionControl::new());
        let mut session = DeviceSession::new(
            Arc::new(network.central()),
            config(),
            SampleQueues::default(),
            Arc::clone(&control),
            Arc::new(AcquisitionStats::new()),
        )
        .unwrap();

        control.start();
        let handle = tokio::spawn(async move { session.run_cycle().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        control.stop();
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Streamed(StreamEnd::Stopped)));

        let writes = sensor.writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(&writes[0][..2], &[CMD_SUBSCRIBE, 99]);
        assert_eq!(&writes[1][..2], &[CMD_SUBSCRIBE, 98]);
        assert_eq!(writes[2], vec![CMD_UNSUBSCRIBE, 99]);
        assert_eq!(writes[3], vec![CMD_UNSUBSCRIBE, 98]);
        assert!(!sensor.is_connected());
    }
}
