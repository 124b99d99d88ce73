// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Protocol definitions for master-worker communication.
//!
//! Request and response shapes for both RPC surfaces. Every request rejects
//! unknown fields; large binary inputs (source archives, artifacts, dumps,
//! logs) travel base64-encoded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// RPC method names, shared by clients and routers
pub mod methods {
    /// Worker -> master: liveness and capacity announcement
    pub const HEARTBEAT: &str = "heartbeat";
    /// Worker -> master: slot count change
    pub const UPDATE_WORKER: &str = "update_worker";
    /// Worker -> master: compilation artifact and log
    pub const COMPILATION_RESULT: &str = "compilation_result";
    /// Worker -> master: referee scores and replay dump
    pub const MATCH_DONE: &str = "match_done";
    /// Worker -> master: player exit code
    pub const CLIENT_DONE: &str = "client_done";
    /// Operator -> master: cluster snapshot
    pub const STATUS: &str = "status";
    /// Operator -> master: register a new champion
    pub const SUBMIT_CHAMPION: &str = "submit_champion";
    /// Operator -> master: request a match between champions
    pub const REQUEST_MATCH: &str = "request_match";

    /// Master -> worker: reserve a referee port
    pub const AVAILABLE_SERVER_PORT: &str = "available_server_port";
    /// Master -> worker: compile a champion
    pub const COMPILE_CHAMPION: &str = "compile_champion";
    /// Master -> worker: run a match referee
    pub const RUN_SERVER: &str = "run_server";
    /// Master -> worker: run a player client
    pub const RUN_CLIENT: &str = "run_client";
}

/// Worker identity and capacity as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerInfo {
    /// Hostname the master dials back
    pub hostname: String,
    /// Worker RPC port
    pub port: u16,
    /// Free slots right now
    pub current_slots: u32,
    /// Advertised capacity
    pub max_slots: u32,
}

/// Empty acknowledgement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ack {}

/// Heartbeat request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatRequest {
    /// Worker identity and capacity
    pub info: WorkerInfo,
    /// True only on the first delivered heartbeat after process start
    pub first_heartbeat: bool,
}

/// Slot count update published around each job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateWorkerRequest {
    /// Worker identity and capacity
    pub info: WorkerInfo,
}

/// Compilation outcome callback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilationResultRequest {
    /// Champion the compilation was for
    pub champion_id: u64,
    /// Compiled artifact, base64 (empty on failure)
    pub artifact_b64: String,
    /// Compilation log, base64 (always present)
    pub log_b64: String,
}

/// One referee-reported score line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayerScore {
    /// Player the referee scored
    pub match_player_id: u64,
    /// Final score (may be negative)
    pub score: i64,
}

/// Match completion callback from the referee's worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchDoneRequest {
    /// Match that finished
    pub match_id: u64,
    /// Referee score stream
    pub scores: Vec<PlayerScore>,
    /// Gzipped replay dump, base64 (may be empty)
    pub dump_b64: String,
}

/// Player completion callback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientDoneRequest {
    /// Match the player belonged to
    pub match_id: u64,
    /// Player that exited
    pub match_player_id: u64,
    /// Raw exit code (1 on timeout)
    pub exit_code: i32,
    /// Captured stdout, base64, truncated to the capture ceiling
    pub log_b64: String,
}

/// Status snapshot request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusRequest {}

/// One worker in the status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSnapshot {
    /// Worker hostname
    pub hostname: String,
    /// Worker RPC port
    pub port: u16,
    /// Cached free slots
    pub current_slots: u32,
    /// Advertised capacity
    pub max_slots: u32,
    /// Tasks the master believes are running there
    pub tasks_in_flight: usize,
    /// Last heartbeat seen
    pub last_heartbeat: DateTime<Utc>,
}

/// One in-flight match in the status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchSnapshot {
    /// Match identifier
    pub match_id: u64,
    /// Current lifecycle state
    pub status: String,
    /// Players already handed to the queue
    pub dispatched_players: usize,
    /// Players whose exit code arrived
    pub reported_players: usize,
    /// Whether referee scores arrived
    pub has_scores: bool,
}

/// Cluster snapshot for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusSnapshot {
    /// Registered workers
    pub workers: Vec<WorkerSnapshot>,
    /// Tasks waiting in the queue
    pub queued_tasks: usize,
    /// Matches not yet done
    pub matches: Vec<MatchSnapshot>,
}

/// Champion submission (front-end role)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitChampionRequest {
    /// Owner of the champion
    pub user: String,
    /// Display name
    pub name: String,
    /// Source archive (tar.gz), base64
    pub sources_b64: String,
}

/// Champion submission acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitChampionResponse {
    /// Identifier assigned to the champion
    pub champion_id: u64,
}

/// One requested match participant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchPlayerSpec {
    /// Champion to field
    pub champion_id: u64,
    /// Owner of the champion
    pub user: String,
}

/// Match request (front-end role)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestMatchRequest {
    /// Participants, in seat order
    pub players: Vec<MatchPlayerSpec>,
    /// Extra referee/client flags, label to value
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Flags whose value is a file, label to base64 contents
    #[serde(default)]
    pub file_options: BTreeMap<String, String>,
}

/// Match request acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestMatchResponse {
    /// Identifier assigned to the match
    pub match_id: u64,
}

/// Referee port reservation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRequest {}

/// Referee port reservation response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortResponse {
    /// Reserved port
    pub port: u16,
}

/// Slots consumed by an accepted job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotsResponse {
    /// Slot weight of the job
    pub slots: u32,
}

/// Champion compilation order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompileChampionRequest {
    /// Champion to compile
    pub champion_id: u64,
    /// Owner of the champion
    pub user: String,
    /// Source archive (tar.gz), base64
    pub sources_b64: String,
}

/// Referee start order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunServerRequest {
    /// Match to referee
    pub match_id: u64,
    /// Request port reserved on this worker
    pub req_port: u16,
    /// Subscribe port reserved on this worker
    pub sub_port: u16,
    /// Number of players that will connect
    pub player_count: u32,
    /// Extra flags, label to value
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Flags whose value is a file, label to base64 contents
    #[serde(default)]
    pub file_options: BTreeMap<String, String>,
}

/// Player client start order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunClientRequest {
    /// Match the player joins
    pub match_id: u64,
    /// Seat of the player in the match
    pub match_player_id: u64,
    /// Champion fielded in this seat
    pub champion_id: u64,
    /// Owner of the champion
    pub user: String,
    /// Hostname of the referee's worker
    pub server_host: String,
    /// Referee request port
    pub req_port: u16,
    /// Referee subscribe port
    pub sub_port: u16,
    /// Compiled champion archive (tar.gz), base64
    pub champion_b64: String,
    /// Extra flags, label to value
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}
