use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

use arena_core::master::MasterNode;
use arena_core::storage::FsContestStore;

use super::load_config;

/// Arguments for the master subcommand
#[derive(Args)]
pub struct MasterArgs {
    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(args: MasterArgs) -> Result<()> {
    let config = load_config(args.config)?;

    let store = FsContestStore::open(&config.storage.root, &config.master.contest)
        .await
        .with_context(|| {
            format!(
                "Failed to open the contest store under {}",
                config.storage.root.display()
            )
        })?;

    let node = MasterNode::new(config, Arc::new(store));
    node.serve().await
}
