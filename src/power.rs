use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};

use crate::config::LoggerConfig;
use crate::sensors::BusLock;
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{Storage, StorageLock};

/// The shutdown/wake button, active when pressed.
pub trait WakeInput: Send {
    fn is_asserted(&mut self) -> bool;
}

/// Board-level power controls.
pub trait PowerPlatform: Send {
    /// Switch the switched sensor supply rail.
    fn set_sensor_rail(&mut self, on: bool);
    /// Configure the wake input to bring the device out of deep sleep.
    fn arm_wake_on_input(&mut self);
    /// Enter deep sleep. On hardware this never returns; waking resets the
    /// device.
    fn suspend(&mut self);
    /// Signal an unrecoverable startup fault (e.g. blink an LED).
    fn indicate_fault(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PowerState {
    /// Ignoring a button that was already held at startup.
    WaitReleased,
    Monitoring,
    ShuttingDown,
    Asleep,
}

/// Outcome of the shutdown sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// The writer closed its file within the lock timeout.
    pub writer_quiesced: bool,
    pub bus_locked: bool,
    pub storage_locked: bool,
    /// Session file closed and storage unmounted by the time of sleep.
    pub storage_closed: bool,
}

/// Polls the button, and on a long hold runs the ordered shutdown and puts
/// the device to sleep.
pub struct PowerController<S: Storage, W: WakeInput, P: PowerPlatform> {
    wake: W,
    platform: P,
    bus: BusLock,
    store: StorageLock<S>,
    coordinator: Arc<ShutdownCoordinator>,
    poll: Duration,
    hold_threshold: Duration,
    lock_timeout: Duration,
    wake_debounce: Duration,
    state: PowerState,
}

impl<S: Storage, W: WakeInput, P: PowerPlatform> PowerController<S, W, P> {
    pub fn new(
        config: &LoggerConfig,
        wake: W,
        platform: P,
        bus: BusLock,
        store: StorageLock<S>,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            wake,
            platform,
            bus,
            store,
            coordinator,
            poll: config.button_poll(),
            hold_threshold: config.hold_threshold(),
            lock_timeout: config.lock_timeout(),
            wake_debounce: config.wake_debounce(),
            state: PowerState::WaitReleased,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    /// Poll until a hold is detected, then shut down and suspend.
    pub async fn run(&mut self) -> ShutdownReport {
        self.wait_for_hold().await;
        self.shutdown().await
    }

    /// Returns once the button has read asserted on every poll for at least
    /// the hold threshold, measured from the first asserted poll.
    async fn wait_for_hold(&mut self) {
        let mut ticker = interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut held_since: Option<Instant> = None;

        loop {
            ticker.tick().await;
            let asserted = self.wake.is_asserted();
            match self.state {
                PowerState::WaitReleased => {
                    if !asserted {
                        self.state = PowerState::Monitoring;
                    }
                }
                PowerState::Monitoring => {
                    if !asserted {
                        held_since = None;
                        continue;
                    }
                    let since = *held_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.hold_threshold {
                        info!("[power] button held, shutting down");
                        return;
                    }
                }
                PowerState::ShuttingDown | PowerState::Asleep => return,
            }
        }
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        self.state = PowerState::ShuttingDown;
        self.coordinator.request();

        let mut report = ShutdownReport {
            writer_quiesced: self.coordinator.wait_writer_closed(self.lock_timeout).await,
            ..ShutdownReport::default()
        };
        if !report.writer_quiesced {
            warn!("[power] writer did not close within {:?}", self.lock_timeout);
        }

        let bus = timeout(self.lock_timeout, self.bus.lock()).await.ok();
        report.bus_locked = bus.is_some();
        if bus.is_none() {
            warn!("[power] bus lock not acquired, proceeding");
        }

        match timeout(self.lock_timeout, self.store.lock()).await {
            Ok(mut store) => {
                report.storage_locked = true;
                if let Err(e) = store.close_session() {
                    warn!("[power] close failed: {}", e);
                }
                if let Err(e) = store.unmount() {
                    warn!("[power] unmount failed: {}", e);
                }
                report.storage_closed = !store.is_open() && !store.is_mounted();
            }
            Err(_) => warn!("[power] storage lock not acquired, skipping close"),
        }

        self.platform.set_sensor_rail(false);
        drop(bus);

        while self.wake.is_asserted() {
            sleep(self.poll).await;
        }
        sleep(self.wake_debounce).await;

        self.platform.arm_wake_on_input();
        info!(
            "[power] sleeping (writer {}, storage {})",
            if report.writer_quiesced { "✓" } else { "⚠" },
            if report.storage_closed { "✓" } else { "⚠" }
        );
        self.state = PowerState::Asleep;
        self.platform.suspend();
        report
    }
}
