//! Fixed 32-byte log record and its on-disk encoding.
//!
//! Layout (little-endian, packed, no header or delimiters between records):
//!
//! ```text
//! offset  size  field
//!      0     4  timestamp_ms          u32
//!      4     4  sequence              u32
//!      8     6  accel_a[3]            i16 x3, milli-g
//!     14     6  accel_b[3]            i16 x3, milli-g
//!     20     6  mag[3]                i16 x3, milli-gauss
//!     26     2  angle                 u16, raw sensor code
//!     28     4  temperature_decidegc  i32, tenths of a degree C
//! ```

use serde::{Deserialize, Serialize};
use zerocopy::byteorder::little_endian::{I16, I32, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Encoded size of one record.
pub const RECORD_SIZE: usize = 32;

/// One timestamped snapshot of every sensor channel.
///
/// `timestamp_ms` is milliseconds since boot and wraps after ~49.7 days;
/// the wrap is not corrected for. A sensor that is not connected leaves its
/// fields at zero, which cannot be told apart from a genuine zero reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp_ms: u32,
    pub sequence: u32,
    pub accel_a: [i16; 3],
    pub accel_b: [i16; 3],
    pub mag: [i16; 3],
    pub angle: u16,
    pub temperature_decidegc: i32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct WireRecord {
    timestamp_ms: U32,
    sequence: U32,
    accel_a: [I16; 3],
    accel_b: [I16; 3],
    mag: [I16; 3],
    angle: U16,
    temperature_decidegc: I32,
}

const _: () = assert!(core::mem::size_of::<WireRecord>() == RECORD_SIZE);

impl LogRecord {
    /// Empty record carrying only the timestamp and sequence number.
    pub fn stamped(timestamp_ms: u32, sequence: u32) -> Self {
        Self {
            timestamp_ms,
            sequence,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let wire = WireRecord {
            timestamp_ms: U32::new(self.timestamp_ms),
            sequence: U32::new(self.sequence),
            accel_a: self.accel_a.map(I16::new),
            accel_b: self.accel_b.map(I16::new),
            mag: self.mag.map(I16::new),
            angle: U16::new(self.angle),
            temperature_decidegc: I32::new(self.temperature_decidegc),
        };
        zerocopy::transmute!(wire)
    }

    /// Any 32 bytes decode; framing is the caller's job.
    pub fn decode(bytes: &[u8; RECORD_SIZE]) -> Self {
        let wire: WireRecord = zerocopy::transmute!(*bytes);
        Self {
            timestamp_ms: wire.timestamp_ms.get(),
            sequence: wire.sequence.get(),
            accel_a: wire.accel_a.map(|v| v.get()),
            accel_b: wire.accel_b.map(|v| v.get()),
            mag: wire.mag.map(|v| v.get()),
            angle: wire.angle.get(),
            temperature_decidegc: wire.temperature_decidegc.get(),
        }
    }

    /// Temperature in degrees Celsius.
    pub fn temperature_c(&self) -> f64 {
        self.temperature_decidegc as f64 / 10.0
    }
}
