// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The match board: every in-flight match and its transitions.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::rpc::protocol::{MatchSnapshot, PlayerScore};
use crate::scheduling::queue::TaskQueue;
use crate::scheduling::task::{MatchServerTask, PlayerTask, TaskSpec};
use crate::storage::{ContestStore, MatchSeat, MatchStatus, StorageResult};

/// What happened to a delivered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The callback advanced the match
    Applied,
    /// The match is unknown or already done; the callback was dropped
    Ignored,
}

/// In-memory state of one match
#[derive(Debug)]
struct MatchRecord {
    seats: Vec<MatchSeat>,
    options: BTreeMap<String, String>,
    server_worker: Option<String>,
    req_port: Option<u16>,
    sub_port: Option<u16>,
    /// Idempotency register: seats whose player task was already emitted
    dispatched_player_ids: HashSet<u64>,
    player_results: HashMap<u64, i32>,
    final_scores: Option<Vec<PlayerScore>>,
    dump: Option<Vec<u8>>,
    failed: bool,
    done: bool,
    created_at: DateTime<Utc>,
}

impl MatchRecord {
    /// All dispatched players reported and the referee scored
    fn ready_to_finalize(&self) -> bool {
        !self.done
            && self.final_scores.is_some()
            && self
                .dispatched_player_ids
                .iter()
                .all(|id| self.player_results.contains_key(id))
    }
}

/// Keyed table of matches plus the task queue they feed.
pub struct MatchBoard {
    matches: DashMap<u64, MatchRecord>,
    queue: Arc<TaskQueue>,
    store: Arc<dyn ContestStore>,
}

impl MatchBoard {
    /// Create an empty board.
    pub fn new(queue: Arc<TaskQueue>, store: Arc<dyn ContestStore>) -> Self {
        Self {
            matches: DashMap::new(),
            queue,
            store,
        }
    }

    /// Create a match: persist the shell, record the seats and enqueue the
    /// referee task. Returns the match id.
    pub async fn create_match(
        &self,
        seats: Vec<MatchSeat>,
        options: BTreeMap<String, String>,
        file_options: BTreeMap<String, String>,
    ) -> StorageResult<u64> {
        let match_id = self.store.create_match(&seats).await?;

        let player_count = seats.len() as u32;
        self.matches.insert(
            match_id,
            MatchRecord {
                seats,
                options: options.clone(),
                server_worker: None,
                req_port: None,
                sub_port: None,
                dispatched_player_ids: HashSet::new(),
                player_results: HashMap::new(),
                final_scores: None,
                dump: None,
                failed: false,
                done: false,
                created_at: Utc::now(),
            },
        );

        self.queue.enqueue(TaskSpec::MatchServer(MatchServerTask {
            match_id,
            player_count,
            options,
            file_options,
        }));
        self.store.set_match_status(match_id, MatchStatus::New).await?;

        info!(match_id, players = player_count, "match committed");
        Ok(match_id)
    }

    /// The referee task was accepted by a worker; its endpoints are known.
    ///
    /// Emits exactly one player task per seat across any number of
    /// invocations: a referee task re-executed after a transport glitch
    /// finds every seat already in the dispatch register.
    pub async fn server_started(
        &self,
        match_id: u64,
        server_host: &str,
        req_port: u16,
        sub_port: u16,
    ) -> CallbackOutcome {
        let fresh_tasks = {
            let Some(mut record) = self.matches.get_mut(&match_id) else {
                debug!(match_id, "server_started for unknown match, ignoring");
                return CallbackOutcome::Ignored;
            };
            if record.done {
                debug!(match_id, "server_started for done match, ignoring");
                return CallbackOutcome::Ignored;
            }

            record.server_worker = Some(server_host.to_string());
            record.req_port = Some(req_port);
            record.sub_port = Some(sub_port);

            let mut fresh = Vec::new();
            let seats = record.seats.clone();
            for seat in seats {
                if !record.dispatched_player_ids.insert(seat.match_player_id) {
                    continue;
                }
                fresh.push(TaskSpec::Player(PlayerTask {
                    match_id,
                    match_player_id: seat.match_player_id,
                    champion_id: seat.champion_id,
                    user: seat.user,
                    server_host: server_host.to_string(),
                    req_port,
                    sub_port,
                    options: record.options.clone(),
                }));
            }
            fresh
        };

        for task in fresh_tasks {
            self.queue.enqueue(task);
        }
        if let Err(err) = self.store.set_match_status(match_id, MatchStatus::Pending).await {
            error!(match_id, %err, "failed to persist match status");
        }
        CallbackOutcome::Applied
    }

    /// Referee scores and replay dump arrived.
    pub async fn match_done(
        &self,
        match_id: u64,
        scores: Vec<PlayerScore>,
        dump: Option<Vec<u8>>,
    ) -> CallbackOutcome {
        {
            let Some(mut record) = self.matches.get_mut(&match_id) else {
                debug!(match_id, "match_done for unknown match, ignoring");
                return CallbackOutcome::Ignored;
            };
            if record.done {
                debug!(match_id, "match_done for done match, ignoring");
                return CallbackOutcome::Ignored;
            }
            record.final_scores = Some(scores);
            record.dump = dump;
        }

        self.try_finalize(match_id).await;
        CallbackOutcome::Applied
    }

    /// A player exited. Scores stay the referee's judgment; exit codes only
    /// classify player failures.
    pub async fn client_done(&self, match_id: u64, match_player_id: u64, exit_code: i32) -> CallbackOutcome {
        {
            let Some(mut record) = self.matches.get_mut(&match_id) else {
                debug!(match_id, match_player_id, "client_done for unknown match, ignoring");
                return CallbackOutcome::Ignored;
            };
            if record.done {
                debug!(match_id, match_player_id, "client_done for done match, ignoring");
                return CallbackOutcome::Ignored;
            }
            if exit_code != 0 {
                warn!(match_id, match_player_id, exit_code, "player exited abnormally");
            }
            record.player_results.insert(match_player_id, exit_code);
        }

        self.try_finalize(match_id).await;
        CallbackOutcome::Applied
    }

    /// Finalize the match if the referee scored and everyone reported.
    async fn try_finalize(&self, match_id: u64) {
        let outcome = {
            let Some(mut record) = self.matches.get_mut(&match_id) else {
                return;
            };
            if !record.ready_to_finalize() {
                return;
            }
            record.done = true;
            (
                record.final_scores.clone().unwrap_or_default(),
                record.dump.clone(),
            )
        };

        let (scores, dump) = outcome;
        // A referee that scored nobody crashed or timed out
        let failed = scores.is_empty();
        match self
            .store
            .finalize_match(match_id, &scores, dump.as_deref(), failed)
            .await
        {
            Ok(_) => info!(match_id, scores = scores.len(), failed, "match done"),
            Err(err) => {
                error!(match_id, %err, "failed to persist match results");
                if let Some(mut record) = self.matches.get_mut(&match_id) {
                    record.done = false;
                    record.failed = true;
                }
            }
        }
    }

    /// Force matches pending for longer than `timeout` to a failed `done`
    /// state, cancelling their still-queued tasks. Returns the swept ids.
    pub async fn sweep(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<u64> {
        let stale: Vec<u64> = self
            .matches
            .iter()
            .filter(|entry| !entry.done && now - entry.created_at > timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut swept = Vec::new();
        for match_id in stale {
            if let Some(mut record) = self.matches.get_mut(&match_id) {
                if record.done {
                    continue;
                }
                record.done = true;
                record.failed = true;
            }
            let cancelled = self.queue.cancel_match(match_id);
            warn!(match_id, cancelled, "match timed out, forcing failure");

            if let Err(err) = self.store.finalize_match(match_id, &[], None, true).await {
                error!(match_id, %err, "failed to persist swept match");
            }
            swept.push(match_id);
        }
        swept
    }

    /// Snapshot of every match not yet done, for the status surface.
    pub fn snapshot(&self) -> Vec<MatchSnapshot> {
        let mut snapshots: Vec<MatchSnapshot> = self
            .matches
            .iter()
            .filter(|entry| !entry.done)
            .map(|entry| MatchSnapshot {
                match_id: *entry.key(),
                status: if entry.failed {
                    "pending (persist failed)".to_string()
                } else if entry.server_worker.is_some() {
                    "pending".to_string()
                } else {
                    "new".to_string()
                },
                dispatched_players: entry.dispatched_player_ids.len(),
                reported_players: entry.player_results.len(),
                has_scores: entry.final_scores.is_some(),
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.match_id);
        snapshots
    }

    /// Number of matches on the board (done ones included)
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    /// Whether the board is empty
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsContestStore;

    async fn board() -> (tempfile::TempDir, Arc<TaskQueue>, MatchBoard, Arc<FsContestStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsContestStore::open(dir.path(), "prologin").await.unwrap());
        let queue = Arc::new(TaskQueue::new());
        let board = MatchBoard::new(queue.clone(), store.clone());
        (dir, queue, board, store)
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

    fn scores() -> Vec<PlayerScore> {
        vec![
            PlayerScore {
                match_player_id: 1,
                score: 50,
            },
            PlayerScore {
                match_player_id: 2,
                score: -10,
            },
        ]
    }

    #[tokio::test]
    async fn test_create_match_enqueues_server_task() {
        let (_dir, queue, board, store) = board().await;
        let match_id = board
            .create_match(seats(), BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(store.match_row(match_id).await.unwrap().status, MatchStatus::New);
    }

    #[tokio::test]
    async fn test_server_started_emits_each_player_once() {
        let (_dir, queue, board, _store) = board().await;
        let match_id = board
            .create_match(seats(), BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap();

        board.server_started(match_id, "w1", 20000, 20001).await;
        assert_eq!(queue.len(), 3); // server task + 2 players

        // A requeued referee task executing twice must not duplicate players
        board.server_started(match_id, "w1", 20000, 20001).await;
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_match_completes_after_scores_and_all_clients() {
        let (_dir, _queue, board, store) = board().await;
        let match_id = board
            .create_match(seats(), BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap();
        board.server_started(match_id, "w1", 20000, 20001).await;

        board.client_done(match_id, 1, 0).await;
        board.match_done(match_id, scores(), Some(b"gzip".to_vec())).await;
        // One player still out: not done yet
        assert_eq!(store.match_row(match_id).await.unwrap().status, MatchStatus::Pending);

        board.client_done(match_id, 2, 1).await;
        let row = store.match_row(match_id).await.unwrap();
        assert_eq!(row.status, MatchStatus::Done);
        assert!(!row.failed);
        assert_eq!(row.scores, scores());
    }

    #[tokio::test]
    async fn test_client_done_before_server_completion_is_stored() {
        let (_dir, _queue, board, store) = board().await;
        let match_id = board
            .create_match(seats(), BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap();
        board.server_started(match_id, "w1", 20000, 20001).await;

        // Both exits land before the referee reports
        board.client_done(match_id, 1, 0).await;
        board.client_done(match_id, 2, 0).await;
        assert_eq!(store.match_row(match_id).await.unwrap().status, MatchStatus::Pending);

        board.match_done(match_id, scores(), None).await;
        assert_eq!(store.match_row(match_id).await.unwrap().status, MatchStatus::Done);
    }

    #[tokio::test]
    async fn test_empty_score_stream_finalizes_as_failed() {
        let (_dir, _queue, board, store) = board().await;
        let match_id = board
            .create_match(seats(), BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap();
        board.server_started(match_id, "w1", 20000, 20001).await;
        board.client_done(match_id, 1, 1).await;
        board.client_done(match_id, 2, 1).await;

        // Referee crashed or timed out: nothing matched the score pattern
        board.match_done(match_id, vec![], None).await;

        let row = store.match_row(match_id).await.unwrap();
        assert_eq!(row.status, MatchStatus::Done);
        assert!(row.failed);
    }

    #[tokio::test]
    async fn test_duplicate_callbacks_after_done_are_ignored() {
        let (_dir, _queue, board, store) = board().await;
        let match_id = board
            .create_match(seats(), BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap();
        board.server_started(match_id, "w1", 20000, 20001).await;
        board.client_done(match_id, 1, 0).await;
        board.client_done(match_id, 2, 0).await;
        board.match_done(match_id, scores(), None).await;

        let outcome = board
            .match_done(match_id, vec![], None)
            .await;
        assert_eq!(outcome, CallbackOutcome::Ignored);
        assert_eq!(board.client_done(match_id, 1, 9).await, CallbackOutcome::Ignored);

        // The persisted scores were not clobbered
        assert_eq!(store.match_row(match_id).await.unwrap().scores, scores());
    }

    #[tokio::test]
    async fn test_unknown_match_is_ignored() {
        let (_dir, _queue, board, _store) = board().await;
        assert_eq!(board.match_done(999, vec![], None).await, CallbackOutcome::Ignored);
        assert_eq!(board.client_done(999, 1, 0).await, CallbackOutcome::Ignored);
        assert_eq!(
            board.server_started(999, "w1", 20000, 20001).await,
            CallbackOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_sweep_fails_stale_match_and_cancels_tasks() {
        let (_dir, queue, board, store) = board().await;
        let match_id = board
            .create_match(seats(), BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap();
        board.server_started(match_id, "w1", 20000, 20001).await;
        assert_eq!(queue.len(), 3);

        let later = Utc::now() + Duration::seconds(1000);
        let swept = board.sweep(later, Duration::seconds(900)).await;
        assert_eq!(swept, vec![match_id]);

        // Queued tasks for the match are gone
        assert_eq!(queue.len(), 0);
        let row = store.match_row(match_id).await.unwrap();
        assert_eq!(row.status, MatchStatus::Done);
        assert!(row.failed);
        assert!(row.scores.is_empty());

        // Late callbacks hit the idempotent sink
        assert_eq!(board.match_done(match_id, scores(), None).await, CallbackOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_sweep_leaves_fresh_matches_alone() {
        let (_dir, _queue, board, _store) = board().await;
        board
            .create_match(seats(), BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap();

        let swept = board.sweep(Utc::now(), Duration::seconds(900)).await;
        assert!(swept.is_empty());
    }
}
