use std::io;

use thiserror::Error;

/// Logger error types
#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read configuration file: {0}")]
    ConfigFile(#[from] serde_json::Error),

    #[error("Storage mount failed: {0}")]
    Mount(#[source] io::Error),

    #[error("Failed to open session file {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),

    #[error("No session file is open")]
    SessionClosed,

    #[error("Log ends with a partial record: {len} bytes is not a whole number of records")]
    PartialRecord { len: usize },

    #[error("Task failed: {0}")]
    Task(String),
}

impl LoggerError {
    /// True for errors that leave the session without a data path.
    pub fn is_fatal_storage(&self) -> bool {
        matches!(self, LoggerError::Mount(_) | LoggerError::Open { .. })
    }
}

/// Result type for logger operations
pub type LoggerResult<T> = Result<T, LoggerError>;
