use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use motion_logger::sim::{self, SimButton, SimPlatform};
use motion_logger::storage::FsStorage;
use motion_logger::{run_session, Hardware, LoggerConfig};

#[derive(Parser, Debug)]
#[command(name = "motion_logger")]
#[command(about = "Multi-sensor data logger (host run with simulated sensors)", long_about = None)]
struct Args {
    /// JSON config file; unset fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory standing in for the storage card
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Seconds to log before the button is held (0 = until Ctrl-C)
    #[arg(long, value_name = "SECONDS", default_value = "10")]
    duration: u64,

    /// Write a JSON status snapshot here after every flush
    #[arg(long)]
    status_path: Option<PathBuf>,

    /// Sensors that answer their probe, in order accel_a,accel_b,mag,angle,temperature
    #[arg(long, value_delimiter = ',', default_values_t = [true; 5])]
    connected: Vec<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LoggerConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => LoggerConfig::default(),
    };
    if let Some(dir) = args.log_dir {
        config.log_dir = dir;
    }
    if let Some(rate) = args.sample_rate {
        config.sample_rate_hz = rate;
    }
    if args.status_path.is_some() {
        config.status_path = args.status_path;
    }
    config.validate()?;

    let mut connected = [true; 5];
    for (slot, value) in connected.iter_mut().zip(&args.connected) {
        *slot = *value;
    }

    let button = SimButton::new();
    let hold = config.hold_threshold() + config.button_poll() * 2;
    let presser = {
        let button = button.clone();
        let duration = args.duration;
        tokio::spawn(async move {
            if duration > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(duration)) => {
                        info!("Duration reached, holding button");
                    }
                    _ = tokio::signal::ctrl_c() => info!("Ctrl-C, holding button"),
                }
            } else {
                let _ = tokio::signal::ctrl_c().await;
                info!("Ctrl-C, holding button");
            }
            button.press();
            tokio::time::sleep(hold).await;
            button.release();
        })
    };

    info!("Logging to {}", config.log_dir.display());
    let hw = Hardware {
        sensors: sim::sensor_set(connected),
        storage: FsStorage::new(&config.log_dir),
        wake: button,
        platform: SimPlatform::new(),
    };
    let report = run_session(&config, hw).await.context("logging session failed")?;
    presser.abort();

    println!("{}", report.format_summary());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
