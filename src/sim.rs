//! Simulated hardware for host runs and tests: synthetic sensors, an
//! in-memory storage card with fault injection, buttons and a platform that
//! records every power action.

use std::collections::BTreeMap;
use std::f32::consts::PI;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::power::{PowerPlatform, WakeInput};
use crate::sensors::{
    AccelReading, AngleReading, MagReading, SensorDevice, SensorSet, TemperatureReading,
};
use crate::storage::Storage;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Accelerometer producing a slow wobble around 1 g on Z.
pub struct SimAccelerometer {
    name: &'static str,
    present: bool,
    mg_per_count: f32,
    phase: f32,
    tick: u32,
}

impl SimAccelerometer {
    pub fn new(name: &'static str, present: bool, mg_per_count: f32, phase: f32) -> Self {
        Self {
            name,
            present,
            mg_per_count,
            phase,
            tick: 0,
        }
    }
}

impl SensorDevice for SimAccelerometer {
    type Reading = AccelReading;

    fn name(&self) -> &str {
        self.name
    }

    fn probe_and_configure(&mut self) -> bool {
        self.present
    }

    fn read(&mut self) -> AccelReading {
        let t = self.tick as f32 * 0.005 + self.phase;
        self.tick = self.tick.wrapping_add(1);
        let mg = [
            (t * 2.0 * PI).sin() * 500.0,
            (t * 2.0 * PI).cos() * 300.0,
            1000.0 + (t * PI).sin() * 100.0,
        ];
        AccelReading {
            counts: mg.map(|v| (v / self.mg_per_count) as i16),
            mg_per_count: self.mg_per_count,
        }
    }
}

/// Magnetometer pointing roughly north, slowly rotating.
pub struct SimMagnetometer {
    present: bool,
    tick: u32,
}

impl SensorDevice for SimMagnetometer {
    type Reading = MagReading;

    fn name(&self) -> &str {
        "mag"
    }

    fn probe_and_configure(&mut self) -> bool {
        self.present
    }

    fn read(&mut self) -> MagReading {
        let heading = self.tick as f32 * 0.001;
        self.tick = self.tick.wrapping_add(1);
        MagReading {
            microtesla: [heading.cos() * 22.0, heading.sin() * 22.0, -42.0],
        }
    }
}

/// Angle encoder sweeping through its 12-bit range.
pub struct SimAngleSensor {
    present: bool,
    raw: u16,
}

impl SensorDevice for SimAngleSensor {
    type Reading = AngleReading;

    fn name(&self) -> &str {
        "angle"
    }

    fn probe_and_configure(&mut self) -> bool {
        self.present
    }

    fn read(&mut self) -> AngleReading {
        self.raw = (self.raw + 3) % 4096;
        AngleReading { raw: self.raw }
    }
}

pub struct SimThermometer {
    present: bool,
    tick: u32,
}

impl SensorDevice for SimThermometer {
    type Reading = TemperatureReading;

    fn name(&self) -> &str {
        "temperature"
    }

    fn probe_and_configure(&mut self) -> bool {
        self.present
    }

    fn read(&mut self) -> TemperatureReading {
        let t = self.tick as f32 * 0.0001;
        self.tick = self.tick.wrapping_add(1);
        TemperatureReading {
            celsius: 21.5 + t.sin() * 0.5,
        }
    }
}

/// Full sensor set; `connected` gives, in order, whether accel_a, accel_b,
/// mag, angle and temperature answer their probe.
pub fn sensor_set(connected: [bool; 5]) -> SensorSet {
    let [accel_a, accel_b, mag, angle, temperature] = connected;
    SensorSet {
        accel_a: Box::new(SimAccelerometer::new("accel_a", accel_a, 0.976, 0.0)),
        accel_b: Box::new(SimAccelerometer::new("accel_b", accel_b, 3.9, 0.25)),
        mag: Box::new(SimMagnetometer {
            present: mag,
            tick: 0,
        }),
        angle: Box::new(SimAngleSensor {
            present: angle,
            raw: 0,
        }),
        temperature: Box::new(SimThermometer {
            present: temperature,
            tick: 0,
        }),
    }
}

#[derive(Default)]
struct MemMedium {
    files: BTreeMap<String, Vec<u8>>,
    mounted: bool,
    fail_mount: bool,
    fail_open: bool,
    fail_writes: bool,
    /// Bytes of each write that land before the fault.
    torn_writes: Option<usize>,
    failed_writes: usize,
    flushes: Vec<Instant>,
}

impl MemMedium {
    fn file_mut(&mut self, name: &str) -> io::Result<&mut Vec<u8>> {
        self.files
            .get_mut(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file vanished"))
    }
}

/// In-memory storage card. Clones share the same medium, so a test can keep
/// one handle for inspection while the logger owns another.
#[derive(Clone, Default)]
pub struct MemStorage {
    medium: Arc<Mutex<MemMedium>>,
}

pub struct MemHandle {
    name: String,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Card that refuses to mount.
    pub fn missing_card() -> Self {
        let storage = Self::new();
        lock(&storage.medium).fail_mount = true;
        storage
    }

    /// Card that mounts but refuses to create or open files.
    pub fn write_protected() -> Self {
        let storage = Self::new();
        lock(&storage.medium).fail_open = true;
        storage
    }

    /// Make subsequent writes fail (without touching the file) or succeed.
    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.medium).fail_writes = fail;
    }

    /// Make subsequent writes append only their first `keep` bytes and then
    /// fail, as a card pulled mid-write would. `None` restores normal writes.
    pub fn set_torn_writes(&self, keep: Option<usize>) {
        lock(&self.medium).torn_writes = keep;
    }

    pub fn insert_file(&self, name: &str, bytes: Vec<u8>) {
        lock(&self.medium).files.insert(name.to_string(), bytes);
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.medium).files.get(name).cloned()
    }

    pub fn file_names(&self) -> Vec<String> {
        lock(&self.medium).files.keys().cloned().collect()
    }

    pub fn flush_times(&self) -> Vec<Instant> {
        lock(&self.medium).flushes.clone()
    }

    pub fn failed_write_count(&self) -> usize {
        lock(&self.medium).failed_writes
    }

    pub fn is_mounted(&self) -> bool {
        lock(&self.medium).mounted
    }
}

impl Storage for MemStorage {
    type Handle = MemHandle;

    fn mount(&mut self) -> io::Result<()> {
        let mut medium = lock(&self.medium);
        if medium.fail_mount {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no card inserted"));
        }
        medium.mounted = true;
        Ok(())
    }

    fn exists(&mut self, name: &str) -> io::Result<bool> {
        Ok(lock(&self.medium).files.contains_key(name))
    }

    fn open_for_append(&mut self, name: &str) -> io::Result<MemHandle> {
        let mut medium = lock(&self.medium);
        if !medium.mounted {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "card not mounted"));
        }
        if medium.fail_open {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "card is write protected"));
        }
        medium.files.entry(name.to_string()).or_default();
        Ok(MemHandle {
            name: name.to_string(),
        })
    }

    fn len(&mut self, handle: &mut MemHandle) -> io::Result<u64> {
        let mut medium = lock(&self.medium);
        Ok(medium.file_mut(&handle.name)?.len() as u64)
    }

    fn write(&mut self, handle: &mut MemHandle, bytes: &[u8]) -> io::Result<()> {
        let mut medium = lock(&self.medium);
        if medium.fail_writes {
            medium.failed_writes += 1;
            return Err(io::Error::other("simulated card write fault"));
        }
        if let Some(keep) = medium.torn_writes {
            medium.failed_writes += 1;
            let landed = &bytes[..keep.min(bytes.len())];
            medium.file_mut(&handle.name)?.extend_from_slice(landed);
            return Err(io::Error::other("simulated card removed mid-write"));
        }
        medium.file_mut(&handle.name)?.extend_from_slice(bytes);
        Ok(())
    }

    fn truncate(&mut self, handle: &mut MemHandle, len: u64) -> io::Result<()> {
        let mut medium = lock(&self.medium);
        medium.file_mut(&handle.name)?.truncate(len as usize);
        Ok(())
    }

    fn flush(&mut self, _handle: &mut MemHandle) -> io::Result<()> {
        lock(&self.medium).flushes.push(Instant::now());
        Ok(())
    }

    fn close(&mut self, _handle: MemHandle) -> io::Result<()> {
        Ok(())
    }

    fn unmount(&mut self) -> io::Result<()> {
        lock(&self.medium).mounted = false;
        Ok(())
    }
}

/// Button whose state is set by hand, e.g. from a Ctrl-C handler.
#[derive(Clone, Default)]
pub struct SimButton {
    pressed: Arc<AtomicBool>,
}

impl SimButton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&self) {
        self.pressed.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.pressed.store(false, Ordering::SeqCst);
    }
}

impl WakeInput for SimButton {
    fn is_asserted(&mut self) -> bool {
        self.pressed.load(Ordering::SeqCst)
    }
}

/// Button pressed during fixed windows, measured from when it was created.
pub struct ScriptedButton {
    start: Instant,
    presses: Vec<(Duration, Duration)>,
}

impl ScriptedButton {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            presses: Vec::new(),
        }
    }

    /// Pressed from `at` for `held`.
    pub fn press(mut self, at: Duration, held: Duration) -> Self {
        self.presses.push((at, at + held));
        self
    }
}

impl Default for ScriptedButton {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeInput for ScriptedButton {
    fn is_asserted(&mut self) -> bool {
        let now = self.start.elapsed();
        self.presses
            .iter()
            .any(|(from, to)| *from <= now && now < *to)
    }
}

/// What the platform has been asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformLog {
    pub rail_on: bool,
    pub rail_offs: u32,
    pub wake_armed: bool,
    pub suspends: u32,
    pub faults: u32,
}

#[derive(Clone, Default)]
pub struct SimPlatform {
    log: Arc<Mutex<PlatformLog>>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> PlatformLog {
        lock(&self.log).clone()
    }
}

impl PowerPlatform for SimPlatform {
    fn set_sensor_rail(&mut self, on: bool) {
        let mut log = lock(&self.log);
        if log.rail_on && !on {
            log.rail_offs += 1;
        }
        log.rail_on = on;
    }

    fn arm_wake_on_input(&mut self) {
        lock(&self.log).wake_armed = true;
    }

    fn suspend(&mut self) {
        lock(&self.log).suspends += 1;
    }

    fn indicate_fault(&mut self) {
        lock(&self.log).faults += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{accel_to_milli_g, SensorBus};
    use crate::record::LogRecord;

    #[test]
    fn test_sim_sensors_read_plausible_values() {
        let mut bus = SensorBus::new(sensor_set([true; 5]));
        assert!(bus.initialize().all_connected());

        let mut record = LogRecord::stamped(0, 0);
        bus.read_into(&mut record);
        assert!((900..=1100).contains(&record.accel_a[2]));
        assert!(record.angle < 4096);
        assert!((200..=220).contains(&record.temperature_decidegc));
    }

    #[test]
    fn test_accel_counts_scale_back_to_milli_g() {
        let mut accel = SimAccelerometer::new("accel_b", true, 3.9, 0.0);
        let mg = accel_to_milli_g(&accel.read());
        assert!((mg[2] - 1000).abs() <= 4);
    }

    #[test]
    fn test_mem_storage_write_fault_leaves_file_untouched() {
        let mut storage = MemStorage::new();
        storage.mount().unwrap();
        let mut handle = storage.open_for_append("log000.bin").unwrap();
        storage.write(&mut handle, &[1; 32]).unwrap();

        storage.set_fail_writes(true);
        assert!(storage.write(&mut handle, &[2; 64]).is_err());
        assert_eq!(storage.file("log000.bin").unwrap().len(), 32);
        assert_eq!(storage.failed_write_count(), 1);
    }

    #[test]
    fn test_mem_storage_torn_write_keeps_prefix() {
        let mut storage = MemStorage::new();
        storage.mount().unwrap();
        let mut handle = storage.open_for_append("log000.bin").unwrap();

        storage.set_torn_writes(Some(40));
        assert!(storage.write(&mut handle, &[7; 64]).is_err());
        assert_eq!(storage.len(&mut handle).unwrap(), 40);

        storage.truncate(&mut handle, 0).unwrap();
        assert_eq!(storage.file("log000.bin").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_write_protected_card_mounts_but_refuses_files() {
        let mut storage = MemStorage::write_protected();
        storage.mount().unwrap();
        assert!(storage.open_for_append("log000.bin").is_err());
        assert!(storage.file_names().is_empty());
    }

    #[test]
    fn test_missing_card_fails_mount() {
        let mut storage = MemStorage::missing_card();
        assert!(storage.mount().is_err());
        assert!(!storage.is_mounted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_button_windows() {
        let mut button = ScriptedButton::new().press(
            Duration::from_millis(100),
            Duration::from_millis(200),
        );
        assert!(!button.is_asserted());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(button.is_asserted());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!button.is_asserted());
    }

    #[test]
    fn test_platform_counts_rail_offs() {
        let mut platform = SimPlatform::new();
        platform.set_sensor_rail(false);
        platform.set_sensor_rail(true);
        platform.set_sensor_rail(false);
        assert_eq!(platform.log().rail_offs, 1);
        assert!(!platform.log().rail_on);
    }
}
