//! Battery-powered multi-sensor data logger.
//!
//! A sampler task reads every sensor at a fixed rate into 32-byte records,
//! a writer task batches them onto removable storage, and a power
//! controller watches the button to shut everything down in order before
//! deep sleep.

pub mod config;
pub mod error;
pub mod logfile;
pub mod power;
pub mod queue;
pub mod record;
pub mod sampler;
pub mod sensors;
pub mod session;
pub mod shutdown;
pub mod sim;
pub mod status;
pub mod storage;
pub mod writer;

pub use config::LoggerConfig;
pub use error::{LoggerError, LoggerResult};
pub use record::{LogRecord, RECORD_SIZE};
pub use session::{run_session, Hardware, Session, SessionReport};
