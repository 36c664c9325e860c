//! Externally driven session control.
//!
//! A UI, a button handler or a test flips these flags from any thread; the
//! session polls them between bounded waits and reacts within one
//! notification timeout.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

pub struct SessionControl {
    running: AtomicBool,
    rescan_requested: AtomicBool,
    shut_down: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionControl {
    /// New control handle; acquisition starts out paused.
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            running: AtomicBool::new(false),
            rescan_requested: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        log::info!("Acquisition requested");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        log::info!("Acquisition stop requested");
    }

    /// Flip the running flag, returning the new value.
    pub fn toggle(&self) -> bool {
        let now_running = !self.running.fetch_xor(true, Ordering::SeqCst);
        log::info!("Acquisition toggled, running = {}", now_running);
        now_running
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the session to tear down and look for the sensor again.
    pub fn request_rescan(&self) {
        self.rescan_requested.store(true, Ordering::SeqCst);
        log::info!("Rescan requested");
    }

    pub fn rescan_pending(&self) -> bool {
        self.rescan_requested.load(Ordering::SeqCst)
    }

    /// Consume a pending rescan request.
    pub fn take_rescan(&self) -> bool {
        self.rescan_requested.swap(false, Ordering::SeqCst)
    }

    /// Stop the session loop for good.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shut_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Receiver that fires once [`shutdown`](Self::shutdown) is called.
    /// Check [`is_shut_down`](Self::is_shut_down) after subscribing, since
    /// a signal sent earlier is not replayed.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}
