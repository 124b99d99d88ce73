use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use arena_core::worker::WorkerAgent;

use super::load_config;

/// Arguments for the worker subcommand
#[derive(Args)]
pub struct WorkerArgs {
    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the advertised slot count
    #[arg(long)]
    pub slots: Option<u32>,
}

pub async fn execute(args: WorkerArgs) -> Result<()> {
    let mut config = load_config(args.config)?;
    if let Some(slots) = args.slots {
        config.worker.available_slots = slots;
    }

    let agent = WorkerAgent::new(config)?;
    agent.serve().await
}
