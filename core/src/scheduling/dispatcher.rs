// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The dispatch loop: marries the queue with the registry.
//!
//! Each drained task has its slots reserved before the worker RPC runs, so
//! the master never overcommits a worker. A synchronous RPC failure rolls
//! the reservation back and requeues the task at the tail; completion is
//! observed later through the worker's callback.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::matches::MatchBoard;
use crate::rpc::client::WorkerClient;
use crate::rpc::error::{RpcError, RpcResult};
use crate::rpc::protocol::{CompileChampionRequest, RunClientRequest, RunServerRequest};
use crate::scheduling::queue::{QueuedTask, TaskQueue};
use crate::scheduling::registry::{WorkerId, WorkerRegistry};
use crate::scheduling::task::TaskSpec;
use crate::storage::{ChampionStatus, ContestStore, StorageError};

/// The worker-facing RPC surface as the dispatcher sees it.
///
/// A trait seam so the dispatch logic can be exercised against a scripted
/// transport; production wires [`HttpWorkerTransport`].
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Reserve one referee port on the worker.
    async fn available_server_port(&self, worker: &WorkerId) -> RpcResult<u16>;

    /// Start a champion compilation.
    async fn compile_champion(&self, worker: &WorkerId, request: CompileChampionRequest) -> RpcResult<u32>;

    /// Start a match referee.
    async fn run_server(&self, worker: &WorkerId, request: RunServerRequest) -> RpcResult<u32>;

    /// Start a player client.
    async fn run_client(&self, worker: &WorkerId, request: RunClientRequest) -> RpcResult<u32>;
}

/// [`WorkerTransport`] over HTTP, one cached client per worker.
pub struct HttpWorkerTransport {
    secret: String,
    clients: DashMap<WorkerId, WorkerClient>,
}

impl HttpWorkerTransport {
    /// Create a transport authenticating with `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            clients: DashMap::new(),
        }
    }

    fn client(&self, worker: &WorkerId) -> RpcResult<WorkerClient> {
        if let Some(client) = self.clients.get(worker) {
            return Ok(client.clone());
        }
        let client = WorkerClient::new(&worker.hostname, worker.port, &self.secret)?;
        self.clients.insert(worker.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    async fn available_server_port(&self, worker: &WorkerId) -> RpcResult<u16> {
        self.client(worker)?.available_server_port().await
    }

    async fn compile_champion(&self, worker: &WorkerId, request: CompileChampionRequest) -> RpcResult<u32> {
        self.client(worker)?.compile_champion(&request).await
    }

    async fn run_server(&self, worker: &WorkerId, request: RunServerRequest) -> RpcResult<u32> {
        self.client(worker)?.run_server(&request).await
    }

    async fn run_client(&self, worker: &WorkerId, request: RunClientRequest) -> RpcResult<u32> {
        self.client(worker)?.run_client(&request).await
    }
}

/// Failure while executing one dispatch
#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The dispatch loop and its collaborators
pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    registry: Arc<WorkerRegistry>,
    board: Arc<MatchBoard>,
    store: Arc<dyn ContestStore>,
    transport: Arc<dyn WorkerTransport>,
}

impl Dispatcher {
    /// Wire a dispatcher over the master's shared state.
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<WorkerRegistry>,
        board: Arc<MatchBoard>,
        store: Arc<dyn ContestStore>,
        transport: Arc<dyn WorkerTransport>,
    ) -> Self {
        Self {
            queue,
            registry,
            board,
            store,
            transport,
        }
    }

    /// Run forever: sleep on the queue signal, drain on each wake.
    pub async fn run(self: Arc<Self>) {
        info!("dispatcher started");
        loop {
            self.queue.wait().await;
            self.drain().await;
        }
    }

    /// Dispatch every currently dispatchable task in FIFO order.
    ///
    /// Tasks that fail their RPC are requeued only after the drain, so one
    /// unreachable worker cannot make this loop spin.
    pub async fn drain(&self) {
        let mut to_requeue = Vec::new();
        while let Some((task, worker)) = self.queue.pop_dispatchable(&self.registry) {
            if let Some(failed) = self.dispatch(task, worker).await {
                to_requeue.push(failed);
            }
        }
        for task in to_requeue {
            self.queue.requeue(task);
        }
    }

    /// Execute one reserved dispatch; returns the task if it must requeue.
    async fn dispatch(&self, task: QueuedTask, worker: WorkerId) -> Option<QueuedTask> {
        let task_id = task.spec.id();
        debug!(task = %task.spec, worker = %worker, "dispatching");

        match self.execute(&task.spec, &worker).await {
            Ok(()) => {
                info!(task = %task.spec, worker = %worker, "dispatched");
                None
            }
            Err(DispatchError::Rpc(err)) if err.is_auth() => {
                let spec = self.registry.release_failed(&worker, &task_id);
                if self.registry.mark_auth_suspect(&worker) {
                    warn!(worker = %worker, "second auth rejection, evicting worker");
                    let orphans = self.registry.evict(&worker);
                    self.queue.requeue_specs(orphans);
                } else {
                    warn!(worker = %worker, %err, "auth rejection, retrying task once");
                }
                let spec = spec?;
                if task.auth_failures == 0 {
                    Some(QueuedTask {
                        spec,
                        auth_failures: task.auth_failures + 1,
                    })
                } else {
                    error!(task = %spec, "dropping task after repeated auth rejections");
                    None
                }
            }
            Err(DispatchError::Rpc(err)) => {
                warn!(task = %task.spec, worker = %worker, %err, "dispatch failed, requeueing");
                let spec = self.registry.release_failed(&worker, &task_id)?;
                Some(QueuedTask {
                    spec,
                    auth_failures: task.auth_failures,
                })
            }
            Err(DispatchError::Storage(err)) => {
                // A task whose inputs cannot be read would fail forever;
                // surface it to the operator instead of looping.
                error!(task = %task.spec, %err, "storage failure while dispatching, dropping task");
                self.registry.release_failed(&worker, &task_id);
                None
            }
        }
    }

    /// Run the RPC sequence of one task against its worker.
    async fn execute(&self, spec: &TaskSpec, worker: &WorkerId) -> Result<(), DispatchError> {
        match spec {
            TaskSpec::Compile(task) => {
                let sources = self.store.champion_sources(task.champion_id).await?;
                self.store
                    .set_champion_status(task.champion_id, ChampionStatus::Pending)
                    .await?;
                self.transport
                    .compile_champion(
                        worker,
                        CompileChampionRequest {
                            champion_id: task.champion_id,
                            user: task.user.clone(),
                            sources_b64: general_purpose::STANDARD.encode(&sources),
                        },
                    )
                    .await?;
            }
            TaskSpec::MatchServer(task) => {
                let req_port = self.transport.available_server_port(worker).await?;
                let sub_port = self.transport.available_server_port(worker).await?;
                self.transport
                    .run_server(
                        worker,
                        RunServerRequest {
                            match_id: task.match_id,
                            req_port,
                            sub_port,
                            player_count: task.player_count,
                            options: task.options.clone(),
                            file_options: task.file_options.clone(),
                        },
                    )
                    .await?;
                self.board
                    .server_started(task.match_id, &worker.hostname, req_port, sub_port)
                    .await;
            }
            TaskSpec::Player(task) => {
                let artifact = self.store.champion_artifact(task.champion_id).await?;
                self.transport
                    .run_client(
                        worker,
                        RunClientRequest {
                            match_id: task.match_id,
                            match_player_id: task.match_player_id,
                            champion_id: task.champion_id,
                            user: task.user.clone(),
                            server_host: task.server_host.clone(),
                            req_port: task.req_port,
                            sub_port: task.sub_port,
                            champion_b64: general_purpose::STANDARD.encode(&artifact),
                            options: task.options.clone(),
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::WorkerInfo;
    use crate::scheduling::task::CompileTask;
    use crate::storage::{FsContestStore, MatchSeat};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU16, Ordering};

    /// What the scripted transport should answer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Ok,
        Unreachable,
        Auth,
    }

    struct ScriptedTransport {
        mode: Mutex<Mode>,
        calls: Mutex<Vec<String>>,
        next_port: AtomicU16,
    }

    impl ScriptedTransport {
        fn new(mode: Mode) -> Self {
            Self {
                mode: Mutex::new(mode),
                calls: Mutex::new(Vec::new()),
                next_port: AtomicU16::new(20000),
            }
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock() = mode;
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn answer(&self, call: String, slots: u32) -> RpcResult<u32> {
            self.calls.lock().push(call);
            match *self.mode.lock() {
                Mode::Ok => Ok(slots),
                Mode::Unreachable => Err(RpcError::Unreachable("connection refused".into())),
                Mode::Auth => Err(RpcError::Auth("invalid signature".into())),
            }
        }
    }

    #[async_trait]
    impl WorkerTransport for ScriptedTransport {
        async fn available_server_port(&self, worker: &WorkerId) -> RpcResult<u16> {
            self.answer(format!("port@{worker}"), 0)?;
            Ok(self.next_port.fetch_add(1, Ordering::SeqCst))
        }

        async fn compile_champion(&self, worker: &WorkerId, request: CompileChampionRequest) -> RpcResult<u32> {
            self.answer(format!("compile-{}@{worker}", request.champion_id), 1)
        }

        async fn run_server(&self, worker: &WorkerId, request: RunServerRequest) -> RpcResult<u32> {
            self.answer(format!("server-{}@{worker}", request.match_id), 1)
        }

        async fn run_client(&self, worker: &WorkerId, request: RunClientRequest) -> RpcResult<u32> {
            self.answer(
                format!("client-{}-{}@{worker}", request.match_id, request.match_player_id),
                2,
            )
        }
    }

    struct Rig {
        _dir: tempfile::TempDir,
        queue: Arc<TaskQueue>,
        registry: Arc<WorkerRegistry>,
        board: Arc<MatchBoard>,
        store: Arc<FsContestStore>,
        transport: Arc<ScriptedTransport>,
        dispatcher: Dispatcher,
    }

    async fn rig(mode: Mode) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsContestStore::open(dir.path(), "prologin").await.unwrap());
        let queue = Arc::new(TaskQueue::new());
        let registry = Arc::new(WorkerRegistry::new());
        let board = Arc::new(MatchBoard::new(queue.clone(), store.clone()));
        let transport = Arc::new(ScriptedTransport::new(mode));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            registry.clone(),
            board.clone(),
            store.clone(),
            transport.clone(),
        );
        Rig {
            _dir: dir,
            queue,
            registry,
            board,
            store,
            transport,
            dispatcher,
        }
    }

    fn worker_info(hostname: &str, slots: u32) -> WorkerInfo {
        WorkerInfo {
            hostname: hostname.to_string(),
            port: 21100,
            current_slots: slots,
            max_slots: slots,
        }
    }

    #[tokio::test]
    async fn test_compile_dispatch_happy_path() {
        let rig = rig(Mode::Ok).await;
        rig.registry.on_heartbeat(&worker_info("w1", 4), true, Utc::now());

        let champion_id = rig.store.create_champion("alice", "MyBot", b"tgz").await.unwrap();
        rig.queue.enqueue(TaskSpec::Compile(CompileTask {
            champion_id,
            user: "alice".into(),
        }));

        rig.dispatcher.drain().await;

        assert_eq!(rig.transport.calls(), vec![format!("compile-{champion_id}@w1:21100")]);
        assert!(rig.queue.is_empty());
        let snapshot = rig.registry.snapshot();
        assert_eq!(snapshot[0].current_slots, 3);
        assert_eq!(snapshot[0].tasks_in_flight, 1);
        assert_eq!(
            rig.store.champion(champion_id).await.unwrap().status,
            ChampionStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_transport_failure_restores_and_requeues() {
        let rig = rig(Mode::Unreachable).await;
        rig.registry.on_heartbeat(&worker_info("w1", 4), true, Utc::now());

        let champion_id = rig.store.create_champion("alice", "MyBot", b"tgz").await.unwrap();
        rig.queue.enqueue(TaskSpec::Compile(CompileTask {
            champion_id,
            user: "alice".into(),
        }));

        rig.dispatcher.drain().await;

        // Requeued at the tail, reservation rolled back
        assert_eq!(rig.queue.len(), 1);
        let snapshot = rig.registry.snapshot();
        assert_eq!(snapshot[0].current_slots, 4);
        assert_eq!(snapshot[0].tasks_in_flight, 0);

        // Worker comes back: the same task dispatches cleanly
        rig.transport.set_mode(Mode::Ok);
        rig.dispatcher.drain().await;
        assert!(rig.queue.is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_retries_once_then_evicts_and_drops() {
        let rig = rig(Mode::Auth).await;
        rig.registry.on_heartbeat(&worker_info("w1", 4), true, Utc::now());

        let champion_id = rig.store.create_champion("alice", "MyBot", b"tgz").await.unwrap();
        rig.queue.enqueue(TaskSpec::Compile(CompileTask {
            champion_id,
            user: "alice".into(),
        }));

        // First rejection: task requeued once, worker marked suspect
        rig.dispatcher.drain().await;
        assert_eq!(rig.queue.len(), 1);
        assert_eq!(rig.registry.len(), 1);

        // Second rejection: worker evicted, task dropped
        rig.dispatcher.drain().await;
        assert!(rig.queue.is_empty());
        assert!(rig.registry.is_empty());
    }

    #[tokio::test]
    async fn test_match_server_dispatch_emits_players() {
        let rig = rig(Mode::Ok).await;
        rig.registry.on_heartbeat(&worker_info("w1", 4), true, Utc::now());

        // Ready champions for both seats
        let c1 = rig.store.create_champion("alice", "A", b"tgz").await.unwrap();
        let c2 = rig.store.create_champion("bob", "B", b"tgz").await.unwrap();
        for id in [c1, c2] {
            rig.store.store_compilation_result(id, Some(b"artifact"), b"log").await.unwrap();
        }

        let match_id = rig
            .board
            .create_match(
                vec![
                    MatchSeat {
                        champion_id: c1,
                        match_player_id: 1,
                        user: "alice".into(),
                    },
                    MatchSeat {
                        champion_id: c2,
                        match_player_id: 2,
                        user: "bob".into(),
                    },
                ],
                BTreeMap::new(),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        rig.dispatcher.drain().await;

        // Server placed (1 slot), first player placed (2 slots); the second
        // player needs 2 slots but only 1 is left, so it waits
        let calls = rig.transport.calls();
        assert_eq!(
            calls,
            vec![
                "port@w1:21100".to_string(),
                "port@w1:21100".to_string(),
                format!("server-{match_id}@w1:21100"),
                format!("client-{match_id}-1@w1:21100"),
            ]
        );
        assert_eq!(rig.queue.len(), 1);
        let snapshot = rig.registry.snapshot();
        assert_eq!(snapshot[0].current_slots, 1);

        // The worker finishes the player and reports slots back
        rig.registry.on_worker_update(&worker_info("w1", 3));
        rig.dispatcher.drain().await;
        assert!(rig.queue.is_empty());
        assert_eq!(
            rig.transport.calls().last().unwrap(),
            &format!("client-{match_id}-2@w1:21100")
        );
    }

    #[tokio::test]
    async fn test_missing_champion_drops_task() {
        let rig = rig(Mode::Ok).await;
        rig.registry.on_heartbeat(&worker_info("w1", 4), true, Utc::now());

        rig.queue.enqueue(TaskSpec::Compile(CompileTask {
            champion_id: 999,
            user: "ghost".into(),
        }));
        rig.dispatcher.drain().await;

        // Dropped, not requeued; no RPC was attempted
        assert!(rig.queue.is_empty());
        assert!(rig.transport.calls().is_empty());
        assert_eq!(rig.registry.snapshot()[0].current_slots, 4);
    }
}
