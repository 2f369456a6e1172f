use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoggerError, LoggerResult};
use crate::record::RECORD_SIZE;

/// Logger configuration. Every field has a default, so a config file only
/// needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub sample_rate_hz: u32,
    /// Sized for the writer's worst-case storage stall (2 s at 200 Hz).
    pub queue_capacity: usize,
    /// Storage write unit.
    pub block_size: usize,
    pub flush_interval_ms: u64,
    /// Upper bound on one writer wait, so flushes happen with no data.
    pub queue_wait_ms: u64,
    pub button_poll_ms: u64,
    pub hold_threshold_ms: u64,
    /// Bound on each lock acquisition during shutdown.
    pub lock_timeout_ms: u64,
    pub wake_debounce_ms: u64,
    pub log_dir: PathBuf,
    pub file_prefix: String,
    pub file_extension: String,
    pub max_file_index: u32,
    pub status_path: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 200,
            queue_capacity: 400,
            block_size: 512,
            flush_interval_ms: 1000,
            queue_wait_ms: 250,
            button_poll_ms: 100,
            hold_threshold_ms: 500,
            lock_timeout_ms: 1000,
            wake_debounce_ms: 200,
            log_dir: PathBuf::from("sdcard"),
            file_prefix: "log".to_string(),
            file_extension: "bin".to_string(),
            max_file_index: 999,
            status_path: None,
        }
    }
}

impl LoggerConfig {
    pub fn from_json_file(path: &Path) -> LoggerResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: LoggerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make the queue, scheduler or block
    /// impossible to construct.
    pub fn validate(&self) -> LoggerResult<()> {
        if self.sample_rate_hz == 0 || self.sample_rate_hz > 1000 {
            return Err(LoggerError::InvalidConfig(format!(
                "sample_rate_hz must be in 1..=1000, got {}",
                self.sample_rate_hz
            )));
        }
        if self.queue_capacity == 0 {
            return Err(LoggerError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.block_size < RECORD_SIZE {
            return Err(LoggerError::InvalidConfig(format!(
                "block_size must hold at least one {}-byte record, got {}",
                RECORD_SIZE, self.block_size
            )));
        }
        let intervals = [
            ("flush_interval_ms", self.flush_interval_ms),
            ("queue_wait_ms", self.queue_wait_ms),
            ("button_poll_ms", self.button_poll_ms),
            ("hold_threshold_ms", self.hold_threshold_ms),
            ("lock_timeout_ms", self.lock_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(LoggerError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.file_prefix.is_empty() {
            return Err(LoggerError::InvalidConfig(
                "file_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.sample_rate_hz.max(1)))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    pub fn button_poll(&self) -> Duration {
        Duration::from_millis(self.button_poll_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn wake_debounce(&self) -> Duration {
        Duration::from_millis(self.wake_debounce_ms)
    }

    /// Continuous assertion that counts as a deliberate hold.
    pub fn hold_threshold(&self) -> Duration {
        Duration::from_millis(self.hold_threshold_ms)
    }
}
