use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::record::LogRecord;

/// One chip on the shared sensor bus. Reads are synchronous and only ever
/// issued while the bus lock is held.
pub trait SensorDevice: Send {
    type Reading;

    fn name(&self) -> &str;

    /// Probe the chip and apply its fixed operating parameters (rate, range,
    /// filtering). Returns whether the chip answered.
    fn probe_and_configure(&mut self) -> bool;

    /// One sample in the chip's native units. A failed transfer yields
    /// whatever the driver left behind; there is no error path.
    fn read(&mut self) -> Self::Reading;
}

/// Raw accelerometer counts plus the resolution the chip was configured for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelReading {
    pub counts: [i16; 3],
    pub mg_per_count: f32,
}

/// Magnetic field in microtesla.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagReading {
    pub microtesla: [f32; 3],
}

/// Raw angle code; 0..=4095 is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AngleReading {
    pub raw: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub celsius: f32,
}

pub type Accelerometer = Box<dyn SensorDevice<Reading = AccelReading>>;
pub type Magnetometer = Box<dyn SensorDevice<Reading = MagReading>>;
pub type AngleSensor = Box<dyn SensorDevice<Reading = AngleReading>>;
pub type Thermometer = Box<dyn SensorDevice<Reading = TemperatureReading>>;

/// 1 µT = 10 mG.
pub const MICROTESLA_TO_MILLIGAUSS: f32 = 10.0;

pub fn accel_to_milli_g(reading: &AccelReading) -> [i16; 3] {
    reading
        .counts
        .map(|c| (f32::from(c) * reading.mg_per_count).round() as i16)
}

pub fn mag_to_milli_gauss(reading: &MagReading) -> [i16; 3] {
    reading
        .microtesla
        .map(|ut| (ut * MICROTESLA_TO_MILLIGAUSS).round() as i16)
}

pub fn temperature_to_decidegc(reading: &TemperatureReading) -> i32 {
    (reading.celsius * 10.0).round() as i32
}

/// Every device the logger samples.
pub struct SensorSet {
    pub accel_a: Accelerometer,
    pub accel_b: Accelerometer,
    pub mag: Magnetometer,
    pub angle: AngleSensor,
    pub temperature: Thermometer,
}

struct Channel<R> {
    device: Box<dyn SensorDevice<Reading = R>>,
    connected: bool,
}

impl<R> Channel<R> {
    fn new(device: Box<dyn SensorDevice<Reading = R>>) -> Self {
        Self {
            device,
            connected: false,
        }
    }

    fn probe(&mut self) -> bool {
        self.connected = self.device.probe_and_configure();
        self.connected
    }

    fn read(&mut self) -> Option<R> {
        self.connected.then(|| self.device.read())
    }
}

/// Which sensors answered at initialization. Fixed for the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connectivity {
    pub accel_a: bool,
    pub accel_b: bool,
    pub mag: bool,
    pub angle: bool,
    pub temperature: bool,
}

impl Connectivity {
    pub fn entries(&self) -> [(&'static str, bool); 5] {
        [
            ("accel_a", self.accel_a),
            ("accel_b", self.accel_b),
            ("mag", self.mag),
            ("angle", self.angle),
            ("temperature", self.temperature),
        ]
    }

    pub fn all_connected(&self) -> bool {
        self.entries().iter().all(|(_, ok)| *ok)
    }

    /// Format connectivity for the startup notice
    pub fn format_status(&self) -> String {
        let parts: Vec<String> = self
            .entries()
            .iter()
            .map(|(name, ok)| format!("{} {}", name, if *ok { "✓" } else { "✗" }))
            .collect();
        format!("Sensors: {}", parts.join(" | "))
    }
}

/// The shared sensor bus and every device on it.
pub struct SensorBus {
    accel_a: Channel<AccelReading>,
    accel_b: Channel<AccelReading>,
    mag: Channel<MagReading>,
    angle: Channel<AngleReading>,
    temperature: Channel<TemperatureReading>,
}

impl SensorBus {
    pub fn new(set: SensorSet) -> Self {
        Self {
            accel_a: Channel::new(set.accel_a),
            accel_b: Channel::new(set.accel_b),
            mag: Channel::new(set.mag),
            angle: Channel::new(set.angle),
            temperature: Channel::new(set.temperature),
        }
    }

    /// Probe and configure each device. A device that fails stays disabled
    /// for the session; that is never fatal.
    pub fn initialize(&mut self) -> Connectivity {
        Connectivity {
            accel_a: self.accel_a.probe(),
            accel_b: self.accel_b.probe(),
            mag: self.mag.probe(),
            angle: self.angle.probe(),
            temperature: self.temperature.probe(),
        }
    }

    /// Names of the devices that did not answer their probe.
    pub fn missing_devices(&self) -> Vec<&str> {
        [
            (self.accel_a.connected, self.accel_a.device.name()),
            (self.accel_b.connected, self.accel_b.device.name()),
            (self.mag.connected, self.mag.device.name()),
            (self.angle.connected, self.angle.device.name()),
            (self.temperature.connected, self.temperature.device.name()),
        ]
        .into_iter()
        .filter_map(|(connected, name)| (!connected).then_some(name))
        .collect()
    }

    pub fn connectivity(&self) -> Connectivity {
        Connectivity {
            accel_a: self.accel_a.connected,
            accel_b: self.accel_b.connected,
            mag: self.mag.connected,
            angle: self.angle.connected,
            temperature: self.temperature.connected,
        }
    }

    /// Fill the sensor fields of `record`. Disconnected sensors leave their
    /// fields untouched (zero in a freshly stamped record).
    pub fn read_into(&mut self, record: &mut LogRecord) {
        if let Some(r) = self.accel_a.read() {
            record.accel_a = accel_to_milli_g(&r);
        }
        if let Some(r) = self.accel_b.read() {
            record.accel_b = accel_to_milli_g(&r);
        }
        if let Some(r) = self.mag.read() {
            record.mag = mag_to_milli_gauss(&r);
        }
        if let Some(r) = self.angle.read() {
            record.angle = r.raw;
        }
        if let Some(r) = self.temperature.read() {
            record.temperature_decidegc = temperature_to_decidegc(&r);
        }
    }
}

/// The bus lock. Held for one full multi-sensor pass, or by the shutdown
/// sequence while the sensor rail is switched off.
pub type BusLock = Arc<Mutex<SensorBus>>;

/// Exclusive-access front end over the bus.
#[derive(Clone)]
pub struct SensorFacade {
    bus: BusLock,
}

impl SensorFacade {
    pub fn new(bus: BusLock) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &BusLock {
        &self.bus
    }

    /// Run device initialization once and emit the startup notice.
    pub async fn initialize(&self) -> Connectivity {
        let mut bus = self.bus.lock().await;
        let connectivity = bus.initialize();
        info!("{}", connectivity.format_status());
        for name in bus.missing_devices() {
            warn!("{} did not respond; its fields will read zero this session", name);
        }
        connectivity
    }

    /// One multi-sensor pass under the bus lock.
    pub async fn fill(&self, record: &mut LogRecord) {
        let mut bus = self.bus.lock().await;
        bus.read_into(record);
    }
}
