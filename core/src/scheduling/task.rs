// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Task descriptors and slot weights.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Slot weight of a compilation
pub const COMPILE_SLOTS: u32 = 1;

/// Slot weight of a match referee
pub const SERVER_SLOTS: u32 = 1;

/// Slot weight of a player client (the CPU-intensive leaf)
pub const PLAYER_SLOTS: u32 = 2;

/// Deterministic task identifier, correlating dispatches with callbacks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Identifier of the compilation task for a champion
    pub fn compile(champion_id: u64) -> Self {
        Self(format!("compile-{champion_id}"))
    }

    /// Identifier of the referee task for a match
    pub fn match_server(match_id: u64) -> Self {
        Self(format!("server-{match_id}"))
    }

    /// Identifier of a player task within a match
    pub fn player(match_id: u64, match_player_id: u64) -> Self {
        Self(format!("player-{match_id}-{match_player_id}"))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compile a submitted champion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileTask {
    /// Champion to compile
    pub champion_id: u64,
    /// Owner of the champion
    pub user: String,
}

/// Start the referee of a match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchServerTask {
    /// Match to referee
    pub match_id: u64,
    /// Number of players that will connect
    pub player_count: u32,
    /// Extra flags, label to value
    pub options: BTreeMap<String, String>,
    /// Flags whose value is a file, label to base64 contents
    pub file_options: BTreeMap<String, String>,
}

/// Run one player of a match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerTask {
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
    /// Extra flags, label to value
    pub options: BTreeMap<String, String>,
}

/// A unit of schedulable work, immutable once enqueued
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskSpec {
    /// Champion compilation
    Compile(CompileTask),
    /// Match referee
    MatchServer(MatchServerTask),
    /// Player client
    Player(PlayerTask),
}

impl TaskSpec {
    /// Deterministic identifier of the task
    pub fn id(&self) -> TaskId {
        match self {
            Self::Compile(t) => TaskId::compile(t.champion_id),
            Self::MatchServer(t) => TaskId::match_server(t.match_id),
            Self::Player(t) => TaskId::player(t.match_id, t.match_player_id),
        }
    }

    /// Slots the task consumes for its duration
    pub fn slots_taken(&self) -> u32 {
        match self {
            Self::Compile(_) => COMPILE_SLOTS,
            Self::MatchServer(_) => SERVER_SLOTS,
            Self::Player(_) => PLAYER_SLOTS,
        }
    }

    /// Match this task belongs to, if any
    pub fn match_id(&self) -> Option<u64> {
        match self {
            Self::Compile(_) => None,
            Self::MatchServer(t) => Some(t.match_id),
            Self::Player(t) => Some(t.match_id),
        }
    }
}

impl fmt::Display for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(t) => write!(f, "<Compilation: {}/{}>", t.user, t.champion_id),
            Self::MatchServer(t) => write!(f, "<Match: {} ({} players)>", t.match_id, t.player_count),
            Self::Player(t) => write!(f, "<Player: {} in match {}>", t.match_player_id, t.match_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_weights() {
        let compile = TaskSpec::Compile(CompileTask {
            champion_id: 7,
            user: "alice".into(),
        });
        assert_eq!(compile.slots_taken(), 1);
        assert_eq!(compile.id(), TaskId::compile(7));
        assert_eq!(compile.match_id(), None);

        let player = TaskSpec::Player(PlayerTask {
            match_id: 42,
            match_player_id: 1,
            champion_id: 7,
            user: "alice".into(),
            server_host: "w1".into(),
            req_port: 20000,
            sub_port: 20001,
            options: BTreeMap::new(),
        });
        assert_eq!(player.slots_taken(), 2);
        assert_eq!(player.match_id(), Some(42));
    }

    #[test]
    fn test_task_ids_are_deterministic() {
        assert_eq!(TaskId::player(42, 1), TaskId::player(42, 1));
        assert_ne!(TaskId::player(42, 1), TaskId::player(42, 2));
        assert_eq!(TaskId::match_server(42).to_string(), "server-42");
    }
}
