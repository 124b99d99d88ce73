// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Master node wiring and lifecycle.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::matches::MatchBoard;
use crate::rpc::protocol::{
    MatchPlayerSpec, PlayerScore, StatusSnapshot, WorkerInfo,
};
use crate::scheduling::dispatcher::{Dispatcher, HttpWorkerTransport, WorkerTransport};
use crate::scheduling::queue::TaskQueue;
use crate::scheduling::registry::WorkerRegistry;
use crate::scheduling::task::{CompileTask, TaskId, TaskSpec};
use crate::storage::{ChampionStatus, ContestStore, MatchSeat, StorageError, StorageResult};

/// Seconds between sweeper passes over stale matches
const SWEEP_INTERVAL_SECS: u64 = 30;

/// Errors surfaced by the master's intake operations
#[derive(Debug, Error)]
pub enum MasterError {
    /// Store failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A requested champion has not been compiled yet
    #[error("Champion {id} is not ready (status {status})")]
    ChampionNotReady {
        /// The champion
        id: u64,
        /// Its current status
        status: ChampionStatus,
    },

    /// A match was requested without players
    #[error("A match needs at least one player")]
    NoPlayers,
}

/// The master node
pub struct MasterNode {
    config: Config,
    registry: Arc<WorkerRegistry>,
    queue: Arc<TaskQueue>,
    board: Arc<MatchBoard>,
    store: Arc<dyn ContestStore>,
    dispatcher: Arc<Dispatcher>,
}

impl MasterNode {
    /// Wire a master over the given store, dialing workers over HTTP.
    pub fn new(config: Config, store: Arc<dyn ContestStore>) -> Arc<Self> {
        let transport = Arc::new(HttpWorkerTransport::new(&config.master.shared_secret));
        Self::with_transport(config, store, transport)
    }

    /// Wire a master with a custom worker transport (tests).
    pub fn with_transport(
        config: Config,
        store: Arc<dyn ContestStore>,
        transport: Arc<dyn WorkerTransport>,
    ) -> Arc<Self> {
        let registry = Arc::new(WorkerRegistry::new());
        let queue = Arc::new(TaskQueue::new());
        let board = Arc::new(MatchBoard::new(queue.clone(), store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            registry.clone(),
            board.clone(),
            store.clone(),
            transport,
        ));
        Arc::new(Self {
            config,
            registry,
            queue,
            board,
            store,
            dispatcher,
        })
    }

    /// The shared secret authenticating every RPC
    pub fn secret(&self) -> &str {
        &self.config.master.shared_secret
    }

    /// Serve the RPC surface and run the background loops until killed.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        self.spawn_loops();

        let addr = format!("0.0.0.0:{}", self.config.master.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind master on {addr}"))?;
        info!(%addr, contest = %self.config.master.contest, "master listening");

        axum::serve(listener, crate::master::api::router(self.clone()))
            .await
            .context("Master RPC server failed")?;
        Ok(())
    }

    /// Start the dispatcher, the dead-worker reaper and the match sweeper.
    pub fn spawn_loops(self: &Arc<Self>) {
        tokio::spawn(self.dispatcher.clone().run());

        let node = self.clone();
        tokio::spawn(async move {
            node.reaper_loop().await;
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.sweeper_loop().await;
        });
    }

    /// Periodically evict workers that stopped heartbeating.
    async fn reaper_loop(&self) {
        let mut ticker = interval(std::time::Duration::from_secs(self.config.master.heartbeat_secs));
        let timeout = Duration::seconds(self.config.master.heartbeat_timeout as i64);
        loop {
            ticker.tick().await;
            let orphans = self.registry.reap_dead(Utc::now(), timeout);
            if !orphans.is_empty() {
                warn!(requeued = orphans.len(), "requeueing tasks from dead workers");
                self.queue.requeue_specs(orphans);
            }
        }
    }

    /// Periodically force timed-out matches to a failed done state.
    async fn sweeper_loop(&self) {
        let mut ticker = interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        let timeout = Duration::seconds(self.config.master.match_timeout_secs as i64);
        loop {
            ticker.tick().await;
            self.board.sweep(Utc::now(), timeout).await;
        }
    }

    // --- intake (front-end role) ---

    /// Register a champion and enqueue its compilation.
    pub async fn submit_champion(&self, user: &str, name: &str, sources: &[u8]) -> StorageResult<u64> {
        let champion_id = self.store.create_champion(user, name, sources).await?;
        self.queue.enqueue(TaskSpec::Compile(CompileTask {
            champion_id,
            user: user.to_string(),
        }));
        info!(champion_id, user, "champion submitted");
        Ok(champion_id)
    }

    /// Request a match between compiled champions.
    pub async fn request_match(
        &self,
        players: Vec<MatchPlayerSpec>,
        options: std::collections::BTreeMap<String, String>,
        file_options: std::collections::BTreeMap<String, String>,
    ) -> Result<u64, MasterError> {
        if players.is_empty() {
            return Err(MasterError::NoPlayers);
        }
        for player in &players {
            let row = self.store.champion(player.champion_id).await?;
            if row.status != ChampionStatus::Ready {
                return Err(MasterError::ChampionNotReady {
                    id: player.champion_id,
                    status: row.status,
                });
            }
        }

        let seats: Vec<MatchSeat> = players
            .into_iter()
            .enumerate()
            .map(|(index, player)| MatchSeat {
                champion_id: player.champion_id,
                match_player_id: index as u64 + 1,
                user: player.user,
            })
            .collect();
        Ok(self.board.create_match(seats, options, file_options).await?)
    }

    // --- worker callbacks ---

    /// A worker heartbeat arrived.
    pub fn on_heartbeat(&self, info: &WorkerInfo, first_heartbeat: bool) {
        let orphans = self.registry.on_heartbeat(info, first_heartbeat, Utc::now());
        if !orphans.is_empty() {
            warn!(worker = %info.hostname, requeued = orphans.len(), "worker restarted, requeueing its tasks");
            self.queue.requeue_specs(orphans);
        }
        // Capacity may have appeared either way
        self.queue.wake();
    }

    /// A worker published its slot count.
    pub fn on_update_worker(&self, info: &WorkerInfo) {
        self.registry.on_worker_update(info);
        self.queue.wake();
    }

    /// A compilation finished on a worker.
    pub async fn on_compilation_result(
        &self,
        champion_id: u64,
        artifact: Option<Vec<u8>>,
        log: Vec<u8>,
    ) -> StorageResult<()> {
        let stored = self
            .store
            .store_compilation_result(champion_id, artifact.as_deref(), &log)
            .await?;
        if stored {
            info!(champion_id, ok = artifact.is_some(), "compilation result stored");
        } else {
            debug!(champion_id, "duplicate compilation result, ignoring");
        }
        self.registry.complete(&TaskId::compile(champion_id));
        Ok(())
    }

    /// A referee finished on a worker.
    pub async fn on_match_done(&self, match_id: u64, scores: Vec<PlayerScore>, dump: Option<Vec<u8>>) {
        self.board.match_done(match_id, scores, dump).await;
        self.registry.complete(&TaskId::match_server(match_id));
    }

    /// A player client finished on a worker.
    pub async fn on_client_done(&self, match_id: u64, match_player_id: u64, exit_code: i32, log: Vec<u8>) {
        if !log.is_empty() {
            if let Err(err) = self.store.store_player_log(match_id, match_player_id, &log).await {
                match err {
                    StorageError::NotFound { .. } => {
                        debug!(match_id, match_player_id, "player log for unknown match, dropping")
                    }
                    other => error!(match_id, match_player_id, err = %other, "failed to store player log"),
                }
            }
        }
        self.board.client_done(match_id, match_player_id, exit_code).await;
        self.registry.complete(&TaskId::player(match_id, match_player_id));
    }

    /// Cluster snapshot for operators.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            workers: self.registry.snapshot(),
            queued_tasks: self.queue.len(),
            matches: self.board.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::error::{RpcError, RpcResult};
    use crate::rpc::protocol::{CompileChampionRequest, RunClientRequest, RunServerRequest};
    use crate::scheduling::registry::WorkerId;
    use crate::storage::FsContestStore;
    use async_trait::async_trait;

    /// Transport that refuses everything; these tests never dispatch.
    struct DownTransport;

    #[async_trait]
    impl WorkerTransport for DownTransport {
        async fn available_server_port(&self, _worker: &WorkerId) -> RpcResult<u16> {
            Err(RpcError::Unreachable("down".into()))
        }
        async fn compile_champion(&self, _worker: &WorkerId, _request: CompileChampionRequest) -> RpcResult<u32> {
            Err(RpcError::Unreachable("down".into()))
        }
        async fn run_server(&self, _worker: &WorkerId, _request: RunServerRequest) -> RpcResult<u32> {
            Err(RpcError::Unreachable("down".into()))
        }
        async fn run_client(&self, _worker: &WorkerId, _request: RunClientRequest) -> RpcResult<u32> {
            Err(RpcError::Unreachable("down".into()))
        }
    }

    async fn node() -> (tempfile::TempDir, Arc<MasterNode>, Arc<FsContestStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsContestStore::open(dir.path(), "prologin").await.unwrap());
        let mut config = Config::default();
        config.master.shared_secret = "secret".into();
        let node = MasterNode::with_transport(config, store.clone(), Arc::new(DownTransport));
        (dir, node, store)
    }

    #[tokio::test]
    async fn test_submit_champion_enqueues_compile() {
        let (_dir, node, store) = node().await;
        let id = node.submit_champion("alice", "MyBot", b"tgz").await.unwrap();

        assert_eq!(store.champion(id).await.unwrap().status, ChampionStatus::New);
        assert_eq!(node.status_snapshot().queued_tasks, 1);
    }

    #[tokio::test]
    async fn test_request_match_needs_ready_champions() {
        let (_dir, node, _store) = node().await;
        let id = node.submit_champion("alice", "MyBot", b"tgz").await.unwrap();

        let err = node
            .request_match(
                vec![MatchPlayerSpec {
                    champion_id: id,
                    user: "alice".into(),
                }],
                Default::default(),
                Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MasterError::ChampionNotReady { .. }));
    }

    #[tokio::test]
    async fn test_request_match_assigns_seat_ids() {
        let (_dir, node, store) = node().await;
        let a = node.submit_champion("alice", "A", b"tgz").await.unwrap();
        let b = node.submit_champion("bob", "B", b"tgz").await.unwrap();
        for id in [a, b] {
            store.store_compilation_result(id, Some(b"artifact"), b"log").await.unwrap();
        }

        let match_id = node
            .request_match(
                vec![
                    MatchPlayerSpec {
                        champion_id: a,
                        user: "alice".into(),
                    },
                    MatchPlayerSpec {
                        champion_id: b,
                        user: "bob".into(),
                    },
                ],
                Default::default(),
                Default::default(),
            )
            .await
            .unwrap();

        let row = store.match_row(match_id).await.unwrap();
        assert_eq!(row.seats[0].match_player_id, 1);
        assert_eq!(row.seats[1].match_player_id, 2);
    }

    #[tokio::test]
    async fn test_compilation_result_is_idempotent() {
        let (_dir, node, store) = node().await;
        let id = node.submit_champion("alice", "MyBot", b"tgz").await.unwrap();

        node.on_compilation_result(id, Some(b"artifact".to_vec()), b"log".to_vec())
            .await
            .unwrap();
        node.on_compilation_result(id, None, b"late duplicate".to_vec())
            .await
            .unwrap();

        let row = store.champion(id).await.unwrap();
        assert_eq!(row.status, ChampionStatus::Ready);
    }

    #[tokio::test]
    async fn test_heartbeat_registers_and_snapshot_reports() {
        let (_dir, node, _store) = node().await;
        node.on_heartbeat(
            &WorkerInfo {
                hostname: "w1".into(),
                port: 21100,
                current_slots: 4,
                max_slots: 4,
            },
            true,
        );

        let snapshot = node.status_snapshot();
        assert_eq!(snapshot.workers.len(), 1);
        assert_eq!(snapshot.workers[0].max_slots, 4);
    }
}
