// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Contest store: champions, matches, artifacts and dumps.
//!
//! The orchestrator is the sole writer of statuses and results; submission
//! commands only create new rows. Result writes are idempotent so duplicate
//! callbacks leave rows unchanged.

pub mod fs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::rpc::protocol::PlayerScore;

pub use fs::FsContestStore;

/// Result type for store operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors produced by the contest store
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Row serialization failure
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Referenced row does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Row kind ("champion" or "match")
        kind: &'static str,
        /// Row identifier
        id: u64,
    },
}

/// Champion lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChampionStatus {
    /// Submitted, waiting for compilation
    New,
    /// Compilation dispatched
    Pending,
    /// Compiled and ready to play
    Ready,
    /// Compilation failed
    Error,
}

impl fmt::Display for ChampionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Match lifecycle as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Shell persisted, players being recorded
    Creating,
    /// Committed, referee task enqueued
    New,
    /// Referee dispatched, results being collected
    Pending,
    /// Scores and dump persisted (or failed and swept)
    Done,
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::New => write!(f, "new"),
            Self::Pending => write!(f, "pending"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// One seat in a match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSeat {
    /// Champion fielded in this seat
    pub champion_id: u64,
    /// Seat identifier, unique within the match
    pub match_player_id: u64,
    /// Owner of the champion
    pub user: String,
}

/// Persisted champion row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChampionRow {
    /// Champion identifier
    pub id: u64,
    /// Owner
    pub user: String,
    /// Display name
    pub name: String,
    /// Lifecycle state
    pub status: ChampionStatus,
    /// Submission time
    pub ts: DateTime<Utc>,
}

/// Persisted match row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRow {
    /// Match identifier
    pub id: u64,
    /// Lifecycle state
    pub status: MatchStatus,
    /// Set when the match was finalized without referee scores
    pub failed: bool,
    /// Seats, in order
    pub seats: Vec<MatchSeat>,
    /// Final scores (empty until done)
    pub scores: Vec<PlayerScore>,
    /// Request time
    pub ts: DateTime<Utc>,
}

/// Persistence boundary of the master.
#[async_trait]
pub trait ContestStore: Send + Sync {
    /// Create a champion row in `new` state and store its source archive.
    async fn create_champion(&self, user: &str, name: &str, sources: &[u8]) -> StorageResult<u64>;

    /// Fetch a champion row.
    async fn champion(&self, id: u64) -> StorageResult<ChampionRow>;

    /// Read the champion's source archive.
    async fn champion_sources(&self, id: u64) -> StorageResult<Vec<u8>>;

    /// Read the compiled artifact of a `ready` champion.
    async fn champion_artifact(&self, id: u64) -> StorageResult<Vec<u8>>;

    /// Move a champion to a new lifecycle state.
    async fn set_champion_status(&self, id: u64, status: ChampionStatus) -> StorageResult<()>;

    /// Persist a compilation outcome: artifact (None on failure) and log.
    ///
    /// Returns false when the champion already reached a final state, in
    /// which case nothing is written (duplicate callbacks are no-ops).
    async fn store_compilation_result(
        &self,
        id: u64,
        artifact: Option<&[u8]>,
        log: &[u8],
    ) -> StorageResult<bool>;

    /// Create a match row in `creating` state with its seats.
    async fn create_match(&self, seats: &[MatchSeat]) -> StorageResult<u64>;

    /// Fetch a match row.
    async fn match_row(&self, id: u64) -> StorageResult<MatchRow>;

    /// Move a match to a new lifecycle state.
    async fn set_match_status(&self, id: u64, status: MatchStatus) -> StorageResult<()>;

    /// Persist the final outcome of a match atomically.
    ///
    /// Returns false when the match is already done (duplicate callbacks
    /// are no-ops).
    async fn finalize_match(
        &self,
        id: u64,
        scores: &[PlayerScore],
        dump: Option<&[u8]>,
        failed: bool,
    ) -> StorageResult<bool>;

    /// Attach a player's captured output to a match.
    async fn store_player_log(&self, match_id: u64, match_player_id: u64, log: &[u8]) -> StorageResult<()>;
}
