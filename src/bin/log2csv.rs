use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use motion_logger::logfile::{analyze_sequence, read_log, write_csv};

#[derive(Parser, Debug)]
#[command(about = "Convert a binary session log to CSV and check it for gaps")]
struct Args {
    /// Session file (e.g. log000.bin)
    input: PathBuf,

    /// CSV output path (defaults to the input with a .csv extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Omit the t_s column
    #[arg(long, default_value_t = false)]
    no_seconds: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let records = read_log(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let output = args
        .output
        .unwrap_or_else(|| args.input.with_extension("csv"));

    let mut out = BufWriter::new(
        File::create(&output).with_context(|| format!("creating {}", output.display()))?,
    );
    write_csv(&records, &mut out, !args.no_seconds)?;
    out.flush()?;

    let report = analyze_sequence(&records);
    println!("{} -> {}", args.input.display(), output.display());
    println!("{}", report.format_summary());
    if let (Some(first), Some(last)) = (records.first(), records.last()) {
        let span_ms = last.timestamp_ms.wrapping_sub(first.timestamp_ms);
        println!("  span {:.3}s", f64::from(span_ms) / 1000.0);
    }
    Ok(())
}
