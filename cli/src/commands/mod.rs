pub mod master;
pub mod status;
pub mod submit;
pub mod worker;

use anyhow::Result;
use arena_core::config::{Config, ConfigLoader};
use arena_core::rpc::MasterClient;
use std::path::PathBuf;

/// Load the deployed configuration, honoring an explicit file path.
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = path {
        loader = loader.with_file(path);
    }
    loader.load()
}

/// Dial the master named in the configuration.
pub fn master_client(config: &Config) -> Result<MasterClient> {
    MasterClient::new(
        &config.master.host,
        config.master.port,
        &config.master.shared_secret,
    )
    .map_err(|err| anyhow::anyhow!("Failed to build the master client: {err}"))
}
