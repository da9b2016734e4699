use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use mixnet_sim::{setup::config::Config, tools::logging, Simulator};

/// Loopix-style mix-network simulator.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the experiment configuration.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    logging::enable_tracing();
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;
    let mut simulator = Simulator::new(config)?;
    let summary = simulator.run()?;

    info!(
        delivered = summary.delivered,
        total = summary.total_mails,
        mean_latency = summary.mean_latency,
        mean_entropy = summary.mean_entropy,
        epsilon = summary.epsilon,
        end_time = summary.end_time,
        "simulation finished"
    );
    Ok(())
}
