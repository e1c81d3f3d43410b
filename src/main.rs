use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use drainwatch::{run, run_once, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "drainwatch", version, about = "Battery drain accounting daemon")]
struct Cli {
    /// Directory for accounting state, the window archive, and the status file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Battery supply name under /sys/class/power_supply (autodetected if omitted)
    #[arg(long)]
    battery: Option<String>,

    /// Sampling cadence in milliseconds
    #[arg(long, default_value_t = 5000)]
    interval_ms: u64,

    /// Status file path (defaults to <data-dir>/status.txt)
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Take one sample, print the status payload, and exit
    #[arg(long)]
    once: bool,
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".local/share/drainwatch"),
        _ => PathBuf::from("/var/lib/drainwatch"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let opts = RunOptions {
        data_dir: cli.data_dir.unwrap_or_else(default_data_dir),
        battery: cli.battery,
        interval_ms: cli.interval_ms,
        status_path: cli.status_file,
    };

    if cli.once {
        return run_once(opts);
    }

    log::info!("drainwatch starting up...");
    run(opts).await
}
