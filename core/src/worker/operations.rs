// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Subprocess operations run by the worker agent.
//!
//! Every job gets a scratch directory that is removed on every exit path,
//! a timeout budget that kills the subprocess on expiry, and (for player
//! clients) a bounded stdout capture with a visible truncation marker.

use base64::{engine::general_purpose, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{error, warn};

use crate::config::{PathsConfig, TimeoutsConfig};
use crate::rpc::protocol::PlayerScore;

/// Ceiling on a captured client stdout
pub const CLIENT_LOG_CEILING: usize = 256 * 1024;

/// Marker appended when a capture hit the ceiling
pub const CLIENT_LOG_TRUNCATED: &str = "\n\nLog truncated to stay below 256K.\n";

/// Log line substituted for a client that exceeded its budget
pub const CLIENT_TIMEOUT_LOG: &str = "worker: client timeout\n";

// Fixed stechec flag values, mirroring the contest deployment
const STECHEC_MEMORY: &str = "250000";
const STECHEC_SOCKET_TIMEOUT: &str = "45000";
const STECHEC_SERVER_TIME: &str = "3000";
const STECHEC_CLIENT_TIME: &str = "1500";

/// Errors from worker job operations
#[derive(Debug, Error)]
pub enum OperationError {
    /// Subprocess or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive could not be decoded or unpacked
    #[error("Archive error: {0}")]
    Archive(String),

    /// The configured dumper binary does not exist
    #[error("Dumper not found at {0}")]
    DumperMissing(PathBuf),
}

/// Outcome of one bounded subprocess run
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code (-1 when the process died without one)
    pub exit_code: i32,
    /// Captured stdout, possibly truncated
    pub stdout: Vec<u8>,
    /// The budget expired and the process was killed
    pub timed_out: bool,
}

/// Outcome of a champion compilation
#[derive(Debug)]
pub struct CompileOutcome {
    /// Compiled archive (None on failure)
    pub artifact: Option<Vec<u8>>,
    /// Compilation log (always present)
    pub log: Vec<u8>,
}

/// Decode a base64 payload, mapping failures onto [`OperationError`].
pub fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, OperationError> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|err| OperationError::Archive(format!("invalid base64 in {field}: {err}")))
}

/// Flatten option labels and values into command-line arguments.
pub fn flag_args(options: &BTreeMap<String, String>) -> Vec<String> {
    options
        .iter()
        .flat_map(|(label, value)| [label.clone(), value.clone()])
        .collect()
}

/// Write file-valued options into `dir` and return their flag arguments.
pub async fn materialize_file_options(
    file_options: &BTreeMap<String, String>,
    dir: &Path,
) -> Result<Vec<String>, OperationError> {
    let mut args = Vec::new();
    for (label, content_b64) in file_options {
        let bytes = decode_b64(label, content_b64)?;
        let path = dir.join(format!("opt-{}", label.trim_start_matches('-')));
        tokio::fs::write(&path, bytes).await?;
        args.push(label.clone());
        args.push(path.to_string_lossy().into_owned());
    }
    Ok(args)
}

/// Unpack a gzipped tar archive into `dest`.
pub async fn untar_gz(bytes: Vec<u8>, dest: PathBuf) -> Result<(), OperationError> {
    tokio::task::spawn_blocking(move || {
        let decoder = GzDecoder::new(std::io::Cursor::new(bytes));
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(&dest)
    })
    .await
    .map_err(|err| OperationError::Archive(err.to_string()))??;
    Ok(())
}

/// Gzip a byte buffer.
pub async fn gzip(bytes: Vec<u8>) -> Result<Vec<u8>, OperationError> {
    let compressed = tokio::task::spawn_blocking(move || {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&bytes)?;
        encoder.finish()
    })
    .await
    .map_err(|err| OperationError::Archive(err.to_string()))??;
    Ok(compressed)
}

/// Run a subprocess with a timeout budget and a bounded stdout capture.
///
/// On truncation the capture stops; a child that keeps writing past the
/// ceiling blocks on the full pipe until the budget kills it.
pub async fn communicate(
    mut command: Command,
    budget: Duration,
    max_len: Option<usize>,
    truncate_marker: &str,
) -> Result<CommandOutput, OperationError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    let mut child = command.spawn()?;

    match tokio::time::timeout(budget, drive(&mut child, max_len, truncate_marker)).await {
        Ok(output) => Ok(output?),
        Err(_) => {
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to kill timed-out subprocess");
            }
            Ok(CommandOutput {
                exit_code: -1,
                stdout: Vec::new(),
                timed_out: true,
            })
        }
    }
}

/// Collect stdout up to the ceiling, then wait for the exit status.
async fn drive(
    child: &mut Child,
    max_len: Option<usize>,
    truncate_marker: &str,
) -> std::io::Result<CommandOutput> {
    let mut collected = Vec::new();
    let mut truncated = false;

    if let Some(mut pipe) = child.stdout.take() {
        let mut buf = [0u8; 4096];
        loop {
            let want = match max_len {
                Some(ceiling) => {
                    let left = ceiling.saturating_sub(collected.len());
                    if left == 0 {
                        truncated = true;
                        break;
                    }
                    left.min(buf.len())
                }
                None => buf.len(),
            };
            let read = pipe.read(&mut buf[..want]).await?;
            if read == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..read]);
        }
    }
    if truncated {
        collected.extend_from_slice(truncate_marker.as_bytes());
    }

    let status = child.wait().await?;
    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: collected,
        timed_out: false,
    })
}

fn score_line() -> &'static Regex {
    static SCORE_LINE: OnceLock<Regex> = OnceLock::new();
    SCORE_LINE.get_or_init(|| Regex::new(r"^(\d+) (-?\d+) (-?\d+)$").expect("valid regex"))
}

/// Extract `(player, score)` pairs from the referee's stdout.
///
/// Lines have the shape `<player_id> <score> <stat>`; anything else is
/// silently ignored. The trailing stat is diagnostic only.
pub fn parse_scores(stdout: &str) -> Vec<PlayerScore> {
    stdout
        .lines()
        .filter_map(|line| {
            let caps = score_line().captures(line)?;
            Some(PlayerScore {
                match_player_id: caps[1].parse().ok()?,
                score: caps[2].parse().ok()?,
            })
        })
        .collect()
}

/// Compile a champion source archive; the artifact and log are read back
/// from the scratch directory the compile script populated.
pub async fn compile_champion(
    paths: &PathsConfig,
    timeouts: &TimeoutsConfig,
    sources: &[u8],
) -> Result<CompileOutcome, OperationError> {
    let scratch = tempfile::tempdir()?;
    untar_gz(sources.to_vec(), scratch.path().to_path_buf()).await?;

    let mut command = Command::new(&paths.compile_script);
    command.arg(&paths.makefiles).arg(scratch.path());
    let output = communicate(command, Duration::from_secs(timeouts.compile), None, "").await?;

    let artifact = if output.exit_code == 0 && !output.timed_out {
        tokio::fs::read(scratch.path().join("champion-compiled.tar.gz"))
            .await
            .ok()
    } else {
        None
    };

    let mut log = tokio::fs::read(scratch.path().join("compilation.log"))
        .await
        .unwrap_or_else(|_| b"compilation log not found\n".to_vec());
    if output.timed_out {
        error!("compilation timed out");
        log.extend_from_slice(b"\nworker: compilation timeout\n");
    }

    Ok(CompileOutcome { artifact, log })
}

/// Run the referee for a match; its stdout is the authoritative score
/// stream.
pub async fn run_referee(
    paths: &PathsConfig,
    timeouts: &TimeoutsConfig,
    req_port: u16,
    sub_port: u16,
    player_count: u32,
    options: &BTreeMap<String, String>,
    file_options: &BTreeMap<String, String>,
) -> Result<CommandOutput, OperationError> {
    let scratch = tempfile::tempdir()?;

    let mut command = Command::new(&paths.stechec_server);
    command
        .arg("--rules")
        .arg(&paths.rules)
        .arg("--rep_addr")
        .arg(format!("tcp://0.0.0.0:{req_port}"))
        .arg("--pub_addr")
        .arg(format!("tcp://0.0.0.0:{sub_port}"))
        .arg("--nb_clients")
        .arg((player_count + 1).to_string()) // players plus the spectator
        .arg("--time")
        .arg(STECHEC_SERVER_TIME)
        .arg("--socket_timeout")
        .arg(STECHEC_SOCKET_TIMEOUT)
        .arg("--verbose")
        .arg("1");
    command.args(flag_args(options));
    command.args(materialize_file_options(file_options, scratch.path()).await?);

    let output = communicate(command, Duration::from_secs(timeouts.server), None, "").await?;
    if output.timed_out {
        error!("referee timed out");
    } else if output.exit_code != 0 {
        error!(exit_code = output.exit_code, "referee exited abnormally");
    }
    Ok(output)
}

/// Run the spectator that records the replay; returns the gzipped dump.
///
/// Even after a timeout a partial dump may be available (at worst it is
/// empty).
pub async fn run_dumper(
    paths: &PathsConfig,
    timeouts: &TimeoutsConfig,
    req_port: u16,
    sub_port: u16,
    options: &BTreeMap<String, String>,
    file_options: &BTreeMap<String, String>,
) -> Result<Option<Vec<u8>>, OperationError> {
    let Some(dumper) = &paths.dumper else {
        return Ok(None);
    };
    if !dumper.exists() {
        return Err(OperationError::DumperMissing(dumper.clone()));
    }

    let scratch = tempfile::tempdir()?;
    let dump_path = scratch.path().join("dump");

    let mut command = Command::new(&paths.stechec_client);
    command
        .arg("--name")
        .arg("dumper")
        .arg("--rules")
        .arg(&paths.rules)
        .arg("--champion")
        .arg(dumper)
        .arg("--req_addr")
        .arg(format!("tcp://127.0.0.1:{req_port}"))
        .arg("--sub_addr")
        .arg(format!("tcp://127.0.0.1:{sub_port}"))
        .arg("--memory")
        .arg(STECHEC_MEMORY)
        .arg("--time")
        .arg(STECHEC_SERVER_TIME)
        .arg("--socket_timeout")
        .arg(STECHEC_SOCKET_TIMEOUT)
        .arg("--spectator")
        .arg("--verbose")
        .arg("1");
    command.env("DUMP_PATH", &dump_path);
    command.args(flag_args(options));
    command.args(materialize_file_options(file_options, scratch.path()).await?);

    let output = communicate(command, Duration::from_secs(timeouts.dumper), None, "").await?;
    if output.timed_out {
        error!("dumper timed out");
    }

    let dump = tokio::fs::read(&dump_path).await.unwrap_or_default();
    Ok(Some(gzip(dump).await?))
}

/// Run one player client against a referee; stdout is captured up to the
/// ceiling. A timeout normalizes to exit code 1 with a marker log.
pub async fn run_player(
    paths: &PathsConfig,
    timeouts: &TimeoutsConfig,
    champion_dir: &Path,
    match_player_id: u64,
    server_host: &str,
    req_port: u16,
    sub_port: u16,
    options: &BTreeMap<String, String>,
) -> Result<CommandOutput, OperationError> {
    let mut command = Command::new(&paths.stechec_client);
    command
        .arg("--name")
        .arg(match_player_id.to_string())
        .arg("--rules")
        .arg(&paths.rules)
        .arg("--champion")
        .arg(champion_dir.join("champion.so"))
        .arg("--req_addr")
        .arg(format!("tcp://{server_host}:{req_port}"))
        .arg("--sub_addr")
        .arg(format!("tcp://{server_host}:{sub_port}"))
        .arg("--memory")
        .arg(STECHEC_MEMORY)
        .arg("--socket_timeout")
        .arg(STECHEC_SOCKET_TIMEOUT)
        .arg("--time")
        .arg(STECHEC_CLIENT_TIME)
        .arg("--verbose")
        .arg("1");
    command.env("CHAMPION_PATH", format!("{}/", champion_dir.display()));
    command.args(flag_args(options));

    let output = communicate(
        command,
        Duration::from_secs(timeouts.client),
        Some(CLIENT_LOG_CEILING),
        CLIENT_LOG_TRUNCATED,
    )
    .await?;

    if output.timed_out {
        error!(match_player_id, "client timed out");
        return Ok(CommandOutput {
            exit_code: 1,
            stdout: CLIENT_TIMEOUT_LOG.as_bytes().to_vec(),
            timed_out: true,
        });
    }
    Ok(output)
}
