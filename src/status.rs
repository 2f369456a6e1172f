use std::fs;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LoggerResult;

/// Where the writer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriterState {
    Opening,
    Draining,
    Closed,
}

/// Snapshot published by the writer after each periodic flush and on close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerStatus {
    pub timestamp: String,
    pub uptime_ms: u64,
    pub writer_state: WriterState,
    pub file_name: Option<String>,
    pub records_written: u64,
    pub file_bytes: u64,
    pub drops: u64,
    pub write_errors: u64,
    pub lost_records: u64,
}

impl LoggerStatus {
    pub fn new(writer_state: WriterState) -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_ms: 0,
            writer_state,
            file_name: None,
            records_written: 0,
            file_bytes: 0,
            drops: 0,
            write_errors: 0,
            lost_records: 0,
        }
    }

    pub fn save(&self, path: &Path) -> LoggerResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn summary_line(&self) -> String {
        let mark = if self.drops == 0 && self.write_errors == 0 {
            "✓"
        } else {
            "⚠"
        };
        format!(
            "{} {} | {} records ({} bytes) | drops {} | write errors {} ({} records lost) | up {:.1}s",
            mark,
            self.file_name.as_deref().unwrap_or("<no file>"),
            self.records_written,
            self.file_bytes,
            self.drops,
            self.write_errors,
            self.lost_records,
            self.uptime_ms as f64 / 1000.0
        )
    }
}

pub fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
