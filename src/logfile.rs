//! Reading session files back: decoding, CSV export and sequence checks.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::{LoggerError, LoggerResult};
use crate::record::{LogRecord, RECORD_SIZE};

/// Decode a whole session file. Trailing bytes that do not form a full
/// record are an error rather than silently dropped.
pub fn decode_records(bytes: &[u8]) -> LoggerResult<Vec<LogRecord>> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(LoggerError::PartialRecord { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| {
            let mut raw = [0u8; RECORD_SIZE];
            raw.copy_from_slice(chunk);
            LogRecord::decode(&raw)
        })
        .collect())
}

pub fn read_log(path: &Path) -> LoggerResult<Vec<LogRecord>> {
    let bytes = fs::read(path)?;
    decode_records(&bytes)
}

/// Column names expected by the offline analysis tools: `lis1`/`lis2` are
/// accelerometers A and B, `mmc_mG` the magnetometer.
pub const CSV_HEADER: [&str; 15] = [
    "t_ms",
    "t_s",
    "seq",
    "lis1_x",
    "lis1_y",
    "lis1_z",
    "lis2_x",
    "lis2_y",
    "lis2_z",
    "mmc_mG_x",
    "mmc_mG_y",
    "mmc_mG_z",
    "angle_raw",
    "temp_deciC",
    "temp_C",
];

/// One row per record. `with_seconds` adds the `t_s` column.
pub fn write_csv<W: Write>(records: &[LogRecord], out: &mut W, with_seconds: bool) -> io::Result<()> {
    let header: Vec<&str> = CSV_HEADER
        .iter()
        .copied()
        .filter(|col| with_seconds || *col != "t_s")
        .collect();
    writeln!(out, "{}", header.join(","))?;

    for r in records {
        write!(out, "{}", r.timestamp_ms)?;
        if with_seconds {
            write!(out, ",{:.3}", f64::from(r.timestamp_ms) / 1000.0)?;
        }
        writeln!(
            out,
            ",{},{},{},{},{},{},{},{},{},{},{},{},{:.1}",
            r.sequence,
            r.accel_a[0],
            r.accel_a[1],
            r.accel_a[2],
            r.accel_b[0],
            r.accel_b[1],
            r.accel_b[2],
            r.mag[0],
            r.mag[1],
            r.mag[2],
            r.angle,
            r.temperature_decidegc,
            r.temperature_c()
        )?;
    }
    Ok(())
}

/// Continuity of the sequence numbers in a log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SequenceReport {
    pub records: usize,
    pub first: Option<u32>,
    pub last: Option<u32>,
    /// Sequence values skipped between consecutive records.
    pub holes: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
}

impl SequenceReport {
    pub fn is_contiguous(&self) -> bool {
        self.holes == 0 && self.duplicates == 0 && self.out_of_order == 0
    }

    pub fn format_summary(&self) -> String {
        let mark = if self.is_contiguous() { "✓" } else { "⚠" };
        match (self.first, self.last) {
            (Some(first), Some(last)) => format!(
                "{} {} records, seq {}..={} | {} missing | {} duplicate | {} out of order",
                mark, self.records, first, last, self.holes, self.duplicates, self.out_of_order
            ),
            _ => format!("{} empty log", mark),
        }
    }
}

/// Walk consecutive pairs. Steps are taken modulo 2^32 so a counter wrap
/// reads as a step of one.
pub fn analyze_sequence(records: &[LogRecord]) -> SequenceReport {
    let mut report = SequenceReport {
        records: records.len(),
        first: records.first().map(|r| r.sequence),
        last: records.last().map(|r| r.sequence),
        ..SequenceReport::default()
    };

    for pair in records.windows(2) {
        let step = pair[1].sequence.wrapping_sub(pair[0].sequence);
        if step == 0 {
            report.duplicates += 1;
        } else if step <= u32::MAX / 2 {
            report.holes += u64::from(step - 1);
        } else {
            report.out_of_order += 1;
        }
    }
    report
}
