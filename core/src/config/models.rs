// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration models for master, worker, paths and timeouts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration shared by the master and the workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Master node settings (workers read this section to find the master)
    #[serde(default)]
    pub master: MasterConfig,
    /// Worker node settings
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Paths to the contest toolchain binaries
    #[serde(default)]
    pub paths: PathsConfig,
    /// Subprocess timeout budgets
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Persistent contest store settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Master node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    /// Hostname or address the master listens on and workers dial
    #[serde(default = "default_master_host")]
    pub host: String,
    /// Master RPC port
    #[serde(default = "default_master_port")]
    pub port: u16,
    /// Shared secret authenticating every RPC in both directions
    #[serde(default)]
    pub shared_secret: String,
    /// Interval between worker heartbeats, in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Seconds of heartbeat silence after which a worker is evicted
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    /// Contest identifier (names the store subtree and job directories)
    #[serde(default = "default_contest")]
    pub contest: String,
    /// Seconds a match may stay pending before the sweeper fails it
    #[serde(default = "default_match_timeout")]
    pub match_timeout_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: default_master_host(),
            port: default_master_port(),
            shared_secret: String::new(),
            heartbeat_secs: default_heartbeat_secs(),
            heartbeat_timeout: default_heartbeat_timeout(),
            contest: default_contest(),
            match_timeout_secs: default_match_timeout(),
        }
    }
}

/// Worker node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Worker RPC port
    #[serde(default = "default_worker_port")]
    pub port: u16,
    /// Slots advertised to the master (defaults to the CPU count)
    #[serde(default = "default_available_slots")]
    pub available_slots: u32,
    /// First port handed out to match referees (inclusive)
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// End of the referee port range (exclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port: default_worker_port(),
            available_slots: default_available_slots(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
        }
    }
}

/// Paths to the contest toolchain invoked by workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Champion compilation script
    #[serde(default = "default_compile_script")]
    pub compile_script: PathBuf,
    /// Directory of makefiles handed to the compilation script
    #[serde(default = "default_makefiles")]
    pub makefiles: PathBuf,
    /// Match referee binary
    #[serde(default = "default_stechec_server")]
    pub stechec_server: PathBuf,
    /// Match client binary
    #[serde(default = "default_stechec_client")]
    pub stechec_client: PathBuf,
    /// Rules library loaded by referee and clients
    #[serde(default = "default_rules")]
    pub rules: PathBuf,
    /// Spectator champion recording the replay (omit to skip dumps)
    #[serde(default)]
    pub dumper: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            compile_script: default_compile_script(),
            makefiles: default_makefiles(),
            stechec_server: default_stechec_server(),
            stechec_client: default_stechec_client(),
            rules: default_rules(),
            dumper: None,
        }
    }
}

/// Subprocess timeout budgets, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    /// Referee process budget
    #[serde(default = "default_server_timeout")]
    pub server: u64,
    /// Dumper process budget
    #[serde(default = "default_dumper_timeout")]
    pub dumper: u64,
    /// Player client process budget
    #[serde(default = "default_client_timeout")]
    pub client: u64,
    /// Champion compilation budget
    #[serde(default = "default_compile_timeout")]
    pub compile: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            server: default_server_timeout(),
            dumper: default_dumper_timeout(),
            client: default_client_timeout(),
            compile: default_compile_timeout(),
        }
    }
}

/// Persistent contest store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Root directory of the contest store
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/arena")
}

fn default_master_host() -> String {
    "localhost".to_string()
}

fn default_master_port() -> u16 {
    21000
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_contest() -> String {
    "prologin".to_string()
}

fn default_match_timeout() -> u64 {
    900
}

fn default_worker_port() -> u16 {
    21100
}

fn default_available_slots() -> u32 {
    num_cpus::get() as u32
}

fn default_port_range_start() -> u16 {
    20000
}

fn default_port_range_end() -> u16 {
    20100
}

fn default_compile_script() -> PathBuf {
    PathBuf::from("/usr/bin/compile-champion.sh")
}

fn default_makefiles() -> PathBuf {
    PathBuf::from("/usr/share/arena/makefiles")
}

fn default_stechec_server() -> PathBuf {
    PathBuf::from("/usr/bin/stechec_server")
}

fn default_stechec_client() -> PathBuf {
    PathBuf::from("/usr/bin/stechec_client")
}

fn default_rules() -> PathBuf {
    PathBuf::from("/usr/lib/arena/rules.so")
}

fn default_server_timeout() -> u64 {
    400
}

fn default_dumper_timeout() -> u64 {
    400
}

fn default_client_timeout() -> u64 {
    400
}

fn default_compile_timeout() -> u64 {
    300
}
