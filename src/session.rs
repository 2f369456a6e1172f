use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::LoggerConfig;
use crate::error::{LoggerError, LoggerResult};
use crate::power::{PowerController, PowerPlatform, ShutdownReport, WakeInput};
use crate::queue::{sample_queue, DropCounter};
use crate::sampler::{BootClock, Sampler, SamplerSummary};
use crate::sensors::{BusLock, Connectivity, SensorBus, SensorFacade, SensorSet};
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{SessionStore, Storage, StorageLock};
use crate::writer::{Writer, WriterSummary};

/// Everything the logger drives.
pub struct Hardware<S: Storage, W: WakeInput, P: PowerPlatform> {
    pub sensors: SensorSet,
    pub storage: S,
    pub wake: W,
    pub platform: P,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub connectivity: Connectivity,
    pub sampler: SamplerSummary,
    pub writer: WriterSummary,
    pub shutdown: ShutdownReport,
}

impl SessionReport {
    pub fn format_summary(&self) -> String {
        format!(
            "{}\n{} samples, {} dropped | {} written to {} ({} bytes) | {} write errors ({} records lost)",
            self.connectivity.format_status(),
            self.sampler.samples,
            self.sampler.drops,
            self.writer.records_written,
            self.writer.file_name,
            self.writer.file_bytes,
            self.writer.write_errors,
            self.writer.lost_records
        )
    }
}

/// A running logging session: sampler and writer tasks spawned, power
/// controller ready to watch the button.
pub struct Session<S: Storage, W: WakeInput, P: PowerPlatform> {
    connectivity: Connectivity,
    bus: BusLock,
    store: StorageLock<S>,
    controller: PowerController<S, W, P>,
    sampler_task: JoinHandle<SamplerSummary>,
    writer_task: JoinHandle<WriterSummary>,
    join_limit: Duration,
}

impl<S, W, P> Session<S, W, P>
where
    S: Storage,
    W: WakeInput,
    P: PowerPlatform,
{
    /// Power the sensors, open the session file, bring up the bus and start
    /// sampling. A storage failure here is fatal: the fault is indicated and
    /// no task is started.
    pub async fn start(config: &LoggerConfig, hw: Hardware<S, W, P>) -> LoggerResult<Self> {
        config.validate()?;
        let Hardware {
            sensors,
            storage,
            wake,
            mut platform,
        } = hw;

        let clock = BootClock::new();
        let (producer, consumer) = sample_queue(config.queue_capacity)?;
        let drops = DropCounter::new();
        let coordinator = Arc::new(ShutdownCoordinator::new());

        platform.set_sensor_rail(true);

        let store = SessionStore::new(storage).into_lock();
        let writer = match Writer::open(
            store.clone(),
            config,
            consumer,
            drops.clone(),
            coordinator.clone(),
            clock,
        )
        .await
        {
            Ok(writer) => writer,
            Err(e) => {
                error!("[session] no storage, cannot log: {}", e);
                if let Err(unmount) = store.lock().await.unmount() {
                    warn!("[session] unmount after failed open: {}", unmount);
                }
                platform.set_sensor_rail(false);
                platform.indicate_fault();
                return Err(e);
            }
        };

        let bus: BusLock = Arc::new(Mutex::new(SensorBus::new(sensors)));
        let facade = SensorFacade::new(bus.clone());
        let connectivity = facade.initialize().await;

        let sampler = Sampler::new(facade, producer, drops, clock, config.sample_period());
        let writer_task = tokio::spawn(writer.run(coordinator.listener()));
        let sampler_task = tokio::spawn(sampler.run(coordinator.listener()));

        let controller = PowerController::new(
            config,
            wake,
            platform,
            bus.clone(),
            store.clone(),
            coordinator,
        );

        info!(
            "[session] sampling at {} Hz, queue {}, block {} bytes",
            config.sample_rate_hz, config.queue_capacity, config.block_size
        );

        Ok(Self {
            connectivity,
            bus,
            store,
            controller,
            sampler_task,
            writer_task,
            join_limit: config.lock_timeout(),
        })
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn bus(&self) -> &BusLock {
        &self.bus
    }

    pub fn storage(&self) -> &StorageLock<S> {
        &self.store
    }

    /// Log until the button is held, then shut down and sleep.
    pub async fn run(mut self) -> LoggerResult<SessionReport> {
        let shutdown = self.controller.run().await;
        let sampler = join_task("sampler", self.sampler_task, self.join_limit).await?;
        let writer = join_task("writer", self.writer_task, self.join_limit).await?;

        Ok(SessionReport {
            connectivity: self.connectivity,
            sampler,
            writer,
            shutdown,
        })
    }
}

/// One complete power-on to sleep cycle.
pub async fn run_session<S, W, P>(
    config: &LoggerConfig,
    hw: Hardware<S, W, P>,
) -> LoggerResult<SessionReport>
where
    S: Storage,
    W: WakeInput,
    P: PowerPlatform,
{
    Session::start(config, hw).await?.run().await
}

async fn join_task<T>(name: &str, handle: JoinHandle<T>, limit: Duration) -> LoggerResult<T> {
    let abort = handle.abort_handle();
    match timeout(limit, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(LoggerError::Task(format!("{} task failed: {}", name, e))),
        Err(_) => {
            warn!("[session] {} did not stop within {:?}, aborting", name, limit);
            abort.abort();
            Err(LoggerError::Task(format!("{} did not stop", name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::{analyze_sequence, decode_records};
    use crate::sim::{self, MemStorage, ScriptedButton, SimPlatform};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn hardware(
        connected: [bool; 5],
        storage: MemStorage,
        button: ScriptedButton,
        platform: SimPlatform,
    ) -> Hardware<MemStorage, ScriptedButton, SimPlatform> {
        Hardware {
            sensors: sim::sensor_set(connected),
            storage,
            wake: button,
            platform,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_logs_until_long_press() {
        let storage = MemStorage::new();
        let platform = SimPlatform::new();
        let button = ScriptedButton::new().press(ms(5050), ms(600));

        let report = run_session(
            &LoggerConfig::default(),
            hardware([true; 5], storage.clone(), button, platform.clone()),
        )
        .await
        .unwrap();

        assert!(report.connectivity.all_connected());
        assert_eq!(report.sampler.drops, 0);
        assert!(report.sampler.samples >= 1100);
        assert!(report.sampler.samples - report.writer.records_written <= 1);
        assert_eq!(report.writer.write_errors, 0);
        assert!(report.shutdown.writer_quiesced);
        assert!(report.shutdown.storage_closed);

        let bytes = storage.file(&report.writer.file_name).unwrap();
        assert_eq!(bytes.len() as u64, report.writer.file_bytes);
        let records = decode_records(&bytes).unwrap();
        let sequence = analyze_sequence(&records);
        assert_eq!(sequence.first, Some(0));
        assert!(sequence.is_contiguous());
        for pair in records.windows(2) {
            assert_eq!(pair[1].timestamp_ms - pair[0].timestamp_ms, 5);
        }

        let log = platform.log();
        assert_eq!(log.suspends, 1);
        assert_eq!(log.rail_offs, 1);
        assert_eq!(log.faults, 0);
        assert!(!storage.is_mounted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_card_is_fatal() {
        let platform = SimPlatform::new();
        let result = Session::start(
            &LoggerConfig::default(),
            hardware(
                [true; 5],
                MemStorage::missing_card(),
                ScriptedButton::new(),
                platform.clone(),
            ),
        )
        .await;

        let err = result.err().unwrap();
        assert!(err.is_fatal_storage());
        let log = platform.log();
        assert_eq!(log.faults, 1);
        assert!(!log.rail_on);
        assert_eq!(log.suspends, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_unmounts_card() {
        let platform = SimPlatform::new();
        let storage = MemStorage::write_protected();
        let result = Session::start(
            &LoggerConfig::default(),
            hardware([true; 5], storage.clone(), ScriptedButton::new(), platform.clone()),
        )
        .await;

        let err = result.err().unwrap();
        assert!(matches!(err, LoggerError::Open { .. }));
        assert!(!storage.is_mounted());
        let log = platform.log();
        assert_eq!(log.faults, 1);
        assert!(!log.rail_on);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected_before_hardware() {
        let platform = SimPlatform::new();
        let config = LoggerConfig {
            sample_rate_hz: 0,
            ..LoggerConfig::default()
        };
        let result = run_session(
            &config,
            hardware([true; 5], MemStorage::new(), ScriptedButton::new(), platform.clone()),
        )
        .await;

        assert!(matches!(result, Err(LoggerError::InvalidConfig(_))));
        assert_eq!(platform.log(), Default::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_sensor_logs_zeros() {
        let storage = MemStorage::new();
        let button = ScriptedButton::new().press(ms(1050), ms(600));
        let session = Session::start(
            &LoggerConfig::default(),
            hardware(
                [true, false, true, true, true],
                storage.clone(),
                button,
                SimPlatform::new(),
            ),
        )
        .await
        .unwrap();

        assert!(!session.connectivity().accel_b);
        let report = session.run().await.unwrap();

        let records = decode_records(&storage.file(&report.writer.file_name).unwrap()).unwrap();
        assert!(!records.is_empty());
        for record in &records {
            assert_eq!(record.accel_b, [0; 3]);
            assert_ne!(record.accel_a, [0; 3]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_stall_drops_are_accounted_for() {
        let storage = MemStorage::new();
        let button = ScriptedButton::new().press(ms(6050), ms(600));
        let session = Session::start(
            &LoggerConfig::default(),
            hardware([true; 5], storage.clone(), button, SimPlatform::new()),
        )
        .await
        .unwrap();

        // Card stalls for 3 s, longer than the queue can absorb.
        let store = session.storage().clone();
        let stall = tokio::spawn(async move {
            tokio::time::sleep(ms(1000)).await;
            let _guard = store.lock().await;
            tokio::time::sleep(ms(3000)).await;
        });

        let report = session.run().await.unwrap();
        stall.await.unwrap();

        assert!(report.sampler.drops > 0);
        let records = decode_records(&storage.file(&report.writer.file_name).unwrap()).unwrap();
        let sequence = analyze_sequence(&records);
        assert_eq!(sequence.holes, report.sampler.drops);
        assert_eq!(sequence.duplicates, 0);
        assert_eq!(sequence.out_of_order, 0);
        assert_eq!(
            report.writer.records_written + report.sampler.drops,
            report.sampler.samples
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_uses_next_file() {
        let storage = MemStorage::new();
        for expected in ["log000.bin", "log001.bin"] {
            let report = run_session(
                &LoggerConfig::default(),
                hardware(
                    [true; 5],
                    storage.clone(),
                    ScriptedButton::new().press(ms(250), ms(600)),
                    SimPlatform::new(),
                ),
            )
            .await
            .unwrap();
            assert_eq!(report.writer.file_name, expected);
        }
        assert_eq!(storage.file_names(), vec!["log000.bin", "log001.bin"]);
    }
}
