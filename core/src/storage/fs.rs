// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Filesystem-backed contest store.
//!
//! Layout under `<root>/<contest>`:
//!
//! ```text
//! champions/<id>/champion.json
//! champions/<id>/champion.tgz
//! champions/<id>/champion-compiled.tar.gz
//! champions/<id>/compilation.log
//! matches/<id>/match.json
//! matches/<id>/dump.gz
//! matches/<id>/player-<mpid>.log
//! ```
//!
//! Row writes go through a temp file plus rename, so a crashed master never
//! leaves a half-written row behind.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::debug;

use crate::rpc::protocol::PlayerScore;
use crate::storage::{
    ChampionRow, ChampionStatus, ContestStore, MatchRow, MatchSeat, MatchStatus, StorageError,
    StorageResult,
};

/// Champion source archive file name
const SOURCES_FILENAME: &str = "champion.tgz";

/// Compiled artifact file name (same contract as the compile script)
const ARTIFACT_FILENAME: &str = "champion-compiled.tar.gz";

/// Compilation log file name
const LOG_FILENAME: &str = "compilation.log";

/// Filesystem-backed [`ContestStore`]
pub struct FsContestStore {
    champions_dir: PathBuf,
    matches_dir: PathBuf,
    next_champion_id: AtomicU64,
    next_match_id: AtomicU64,
}

impl FsContestStore {
    /// Open (or initialize) the store for one contest.
    pub async fn open(root: &Path, contest: &str) -> StorageResult<Self> {
        let contest_dir = root.join(contest);
        let champions_dir = contest_dir.join("champions");
        let matches_dir = contest_dir.join("matches");
        fs::create_dir_all(&champions_dir).await?;
        fs::create_dir_all(&matches_dir).await?;

        let next_champion_id = AtomicU64::new(max_row_id(&champions_dir).await? + 1);
        let next_match_id = AtomicU64::new(max_row_id(&matches_dir).await? + 1);

        Ok(Self {
            champions_dir,
            matches_dir,
            next_champion_id,
            next_match_id,
        })
    }

    fn champion_dir(&self, id: u64) -> PathBuf {
        self.champions_dir.join(id.to_string())
    }

    fn match_dir(&self, id: u64) -> PathBuf {
        self.matches_dir.join(id.to_string())
    }

    async fn read_champion_row(&self, id: u64) -> StorageResult<ChampionRow> {
        let path = self.champion_dir(id).join("champion.json");
        let bytes = fs::read(&path).await.map_err(|_| StorageError::NotFound {
            kind: "champion",
            id,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_champion_row(&self, row: &ChampionRow) -> StorageResult<()> {
        let path = self.champion_dir(row.id).join("champion.json");
        write_atomic(&path, &serde_json::to_vec_pretty(row)?).await?;
        Ok(())
    }

    async fn read_match_row(&self, id: u64) -> StorageResult<MatchRow> {
        let path = self.match_dir(id).join("match.json");
        let bytes = fs::read(&path).await.map_err(|_| StorageError::NotFound {
            kind: "match",
            id,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_match_row(&self, row: &MatchRow) -> StorageResult<()> {
        let path = self.match_dir(row.id).join("match.json");
        write_atomic(&path, &serde_json::to_vec_pretty(row)?).await?;
        Ok(())
    }
}

#[async_trait]
impl ContestStore for FsContestStore {
    async fn create_champion(&self, user: &str, name: &str, sources: &[u8]) -> StorageResult<u64> {
        let id = self.next_champion_id.fetch_add(1, Ordering::SeqCst);
        let dir = self.champion_dir(id);
        fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(SOURCES_FILENAME), sources).await?;

        let row = ChampionRow {
            id,
            user: user.to_string(),
            name: name.to_string(),
            status: ChampionStatus::New,
            ts: Utc::now(),
        };
        self.write_champion_row(&row).await?;
        debug!(champion = id, user, "champion created");
        Ok(id)
    }

    async fn champion(&self, id: u64) -> StorageResult<ChampionRow> {
        self.read_champion_row(id).await
    }

    async fn champion_sources(&self, id: u64) -> StorageResult<Vec<u8>> {
        fs::read(self.champion_dir(id).join(SOURCES_FILENAME))
            .await
            .map_err(|_| StorageError::NotFound {
                kind: "champion",
                id,
            })
    }

    async fn champion_artifact(&self, id: u64) -> StorageResult<Vec<u8>> {
        fs::read(self.champion_dir(id).join(ARTIFACT_FILENAME))
            .await
            .map_err(|_| StorageError::NotFound {
                kind: "champion",
                id,
            })
    }

    async fn set_champion_status(&self, id: u64, status: ChampionStatus) -> StorageResult<()> {
        let mut row = self.read_champion_row(id).await?;
        row.status = status;
        self.write_champion_row(&row).await
    }

    async fn store_compilation_result(
        &self,
        id: u64,
        artifact: Option<&[u8]>,
        log: &[u8],
    ) -> StorageResult<bool> {
        let mut row = self.read_champion_row(id).await?;
        if matches!(row.status, ChampionStatus::Ready | ChampionStatus::Error) {
            return Ok(false);
        }

        let dir = self.champion_dir(id);
        write_atomic(&dir.join(LOG_FILENAME), log).await?;
        if let Some(artifact) = artifact {
            write_atomic(&dir.join(ARTIFACT_FILENAME), artifact).await?;
            row.status = ChampionStatus::Ready;
        } else {
            row.status = ChampionStatus::Error;
        }
        self.write_champion_row(&row).await?;
        Ok(true)
    }

    async fn create_match(&self, seats: &[MatchSeat]) -> StorageResult<u64> {
        let id = self.next_match_id.fetch_add(1, Ordering::SeqCst);
        let dir = self.match_dir(id);
        fs::create_dir_all(&dir).await?;

        let row = MatchRow {
            id,
            status: MatchStatus::Creating,
            failed: false,
            seats: seats.to_vec(),
            scores: Vec::new(),
            ts: Utc::now(),
        };
        self.write_match_row(&row).await?;
        debug!(match_id = id, seats = seats.len(), "match created");
        Ok(id)
    }

    async fn match_row(&self, id: u64) -> StorageResult<MatchRow> {
        self.read_match_row(id).await
    }

    async fn set_match_status(&self, id: u64, status: MatchStatus) -> StorageResult<()> {
        let mut row = self.read_match_row(id).await?;
        row.status = status;
        self.write_match_row(&row).await
    }

    async fn finalize_match(
        &self,
        id: u64,
        scores: &[PlayerScore],
        dump: Option<&[u8]>,
        failed: bool,
    ) -> StorageResult<bool> {
        let mut row = self.read_match_row(id).await?;
        if row.status == MatchStatus::Done {
            return Ok(false);
        }

        if let Some(dump) = dump {
            write_atomic(&self.match_dir(id).join("dump.gz"), dump).await?;
        }
        row.status = MatchStatus::Done;
        row.failed = failed;
        row.scores = scores.to_vec();
        self.write_match_row(&row).await?;
        Ok(true)
    }

    async fn store_player_log(&self, match_id: u64, match_player_id: u64, log: &[u8]) -> StorageResult<()> {
        // The row must exist; the log itself is advisory
        self.read_match_row(match_id).await?;
        let path = self.match_dir(match_id).join(format!("player-{match_player_id}.log"));
        write_atomic(&path, log).await?;
        Ok(())
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

/// Highest numeric row directory under `dir`, or 0 when empty.
async fn max_row_id(dir: &Path) -> std::io::Result<u64> {
    let mut max = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(id) = entry.file_name().to_str().and_then(|name| name.parse::<u64>().ok()) {
            max = max.max(id);
        }
    }
    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, FsContestStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContestStore::open(dir.path(), "prologin").await.unwrap();
        (dir, store)
    }

    fn seats() -> Vec<MatchSeat> {
        vec![
            MatchSeat {
                champion_id: 7,
                match_player_id: 1,
                user: "alice".into(),
            },
            MatchSeat {
                champion_id: 8,
                match_player_id: 2,
                user: "bob".into(),
            },
        ]
    }

    #[tokio::test]
    async fn test_champion_lifecycle() {
        let (_dir, store) = open_store().await;

        let id = store.create_champion("alice", "MyBot", b"tgz-bytes").await.unwrap();
        let row = store.champion(id).await.unwrap();
        assert_eq!(row.status, ChampionStatus::New);
        assert_eq!(store.champion_sources(id).await.unwrap(), b"tgz-bytes");

        store.set_champion_status(id, ChampionStatus::Pending).await.unwrap();
        let stored = store
            .store_compilation_result(id, Some(b"artifact"), b"compiled ok")
            .await
            .unwrap();
        assert!(stored);

        let row = store.champion(id).await.unwrap();
        assert_eq!(row.status, ChampionStatus::Ready);
        assert_eq!(store.champion_artifact(id).await.unwrap(), b"artifact");
    }

    #[tokio::test]
    async fn test_compilation_failure_marks_error() {
        let (_dir, store) = open_store().await;
        let id = store.create_champion("alice", "MyBot", b"tgz").await.unwrap();

        store.store_compilation_result(id, None, b"gcc exploded").await.unwrap();
        let row = store.champion(id).await.unwrap();
        assert_eq!(row.status, ChampionStatus::Error);
        assert!(store.champion_artifact(id).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_compilation_result_is_noop() {
        let (_dir, store) = open_store().await;
        let id = store.create_champion("alice", "MyBot", b"tgz").await.unwrap();

        assert!(store
            .store_compilation_result(id, Some(b"artifact"), b"log")
            .await
            .unwrap());
        // Second delivery must not flip the row or the artifact
        assert!(!store
            .store_compilation_result(id, None, b"other log")
            .await
            .unwrap());

        let row = store.champion(id).await.unwrap();
        assert_eq!(row.status, ChampionStatus::Ready);
        assert_eq!(store.champion_artifact(id).await.unwrap(), b"artifact");
    }

    #[tokio::test]
    async fn test_match_lifecycle() {
        let (_dir, store) = open_store().await;

        let id = store.create_match(&seats()).await.unwrap();
        assert_eq!(store.match_row(id).await.unwrap().status, MatchStatus::Creating);

        store.set_match_status(id, MatchStatus::Pending).await.unwrap();
        let scores = vec![
            PlayerScore {
                match_player_id: 1,
                score: 50,
            },
            PlayerScore {
                match_player_id: 2,
                score: -10,
            },
        ];
        assert!(store.finalize_match(id, &scores, Some(b"gzip"), false).await.unwrap());

        let row = store.match_row(id).await.unwrap();
        assert_eq!(row.status, MatchStatus::Done);
        assert!(!row.failed);
        assert_eq!(row.scores, scores);
    }

    #[tokio::test]
    async fn test_duplicate_finalize_is_noop() {
        let (_dir, store) = open_store().await;
        let id = store.create_match(&seats()).await.unwrap();

        assert!(store.finalize_match(id, &[], None, true).await.unwrap());
        assert!(!store.finalize_match(id, &[], None, false).await.unwrap());
        assert!(store.match_row(id).await.unwrap().failed);
    }

    #[tokio::test]
    async fn test_ids_resume_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let store = FsContestStore::open(dir.path(), "prologin").await.unwrap();
            store.create_champion("alice", "MyBot", b"tgz").await.unwrap()
        };

        let store = FsContestStore::open(dir.path(), "prologin").await.unwrap();
        let second = store.create_champion("bob", "OtherBot", b"tgz").await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_player_log_requires_match() {
        let (_dir, store) = open_store().await;
        let err = store.store_player_log(999, 1, b"log").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { kind: "match", .. }));
    }
}
