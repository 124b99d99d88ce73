// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The worker agent: slot accountant, heartbeat loop and job runner.
//!
//! The agent owns the authoritative slot counter. Jobs decrement it before
//! they run and restore it after, publishing the new count to the master on
//! both edges. Admission is lenient: a job arriving with no free slots logs
//! a warning and runs anyway, because placement is the master's call.

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::rpc::client::MasterClient;
use crate::rpc::protocol::{
    ClientDoneRequest, CompilationResultRequest, CompileChampionRequest, MatchDoneRequest,
    RunClientRequest, RunServerRequest, WorkerInfo,
};
use crate::scheduling::task::{COMPILE_SLOTS, PLAYER_SLOTS, SERVER_SLOTS};
use crate::worker::operations::{self, OperationError};
use crate::worker::ports::PortCursor;

/// The worker agent
pub struct WorkerAgent {
    config: Config,
    hostname: String,
    max_slots: u32,
    /// Authoritative free-slot count; may dip below zero under lenient
    /// admission, the published value clamps at zero
    slots: Mutex<i64>,
    ports: Mutex<PortCursor>,
    master: MasterClient,
}

impl WorkerAgent {
    /// Build an agent from the deployed configuration.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let hostname = hostname::get()
            .context("Failed to read the worker hostname")?
            .to_string_lossy()
            .into_owned();
        let master = MasterClient::new(
            &config.master.host,
            config.master.port,
            &config.master.shared_secret,
        )
        .map_err(|err| anyhow::anyhow!("Failed to build the master client: {err}"))?;

        let max_slots = config.worker.available_slots;
        let ports = PortCursor::new(config.worker.port_range_start, config.worker.port_range_end);
        Ok(Arc::new(Self {
            config,
            hostname,
            max_slots,
            slots: Mutex::new(max_slots as i64),
            ports: Mutex::new(ports),
            master,
        }))
    }

    /// The shared secret authenticating incoming RPCs
    pub fn secret(&self) -> &str {
        &self.config.master.shared_secret
    }

    /// Identity and capacity as sent to the master.
    pub fn worker_info(&self) -> WorkerInfo {
        let current = (*self.slots.lock()).clamp(0, self.max_slots as i64) as u32;
        WorkerInfo {
            hostname: self.hostname.clone(),
            port: self.config.worker.port,
            current_slots: current,
            max_slots: self.max_slots,
        }
    }

    /// Serve the RPC surface and heartbeat the master until killed.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            agent.heartbeat_loop().await;
        });

        let addr = format!("0.0.0.0:{}", self.config.worker.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind worker on {addr}"))?;
        info!(%addr, slots = self.max_slots, "worker listening");

        axum::serve(listener, crate::worker::api::router(self.clone()))
            .await
            .context("Worker RPC server failed")?;
        Ok(())
    }

    /// Heartbeat forever; `first_heartbeat` stays true until one delivery
    /// succeeds, so the master learns about exactly one restart.
    async fn heartbeat_loop(&self) {
        let secs = self.config.master.heartbeat_secs;
        let mut ticker = interval(std::time::Duration::from_secs(secs));
        let mut first_heartbeat = true;
        loop {
            ticker.tick().await;
            let info = self.worker_info();
            debug!(current = info.current_slots, max = info.max_slots, "sending heartbeat");
            match self.master.heartbeat(info, first_heartbeat).await {
                Ok(_) => first_heartbeat = false,
                Err(err) => warn!(%err, "master down, retrying heartbeat in {secs}s"),
            }
        }
    }

    /// Publish the current slot count to the master.
    async fn update_master(&self) {
        if let Err(err) = self.master.update_worker(self.worker_info()).await {
            warn!(%err, "master down, cannot update it");
        }
    }

    /// Take `slots` before running a job and tell the master.
    async fn take_slots(&self, slots: u32) {
        {
            let mut current = self.slots.lock();
            if *current < slots as i64 {
                warn!(
                    free = *current,
                    needed = slots,
                    "not enough free slots to start the job"
                );
            }
            *current -= slots as i64;
        }
        self.update_master().await;
    }

    /// Restore `slots` after a job and tell the master.
    async fn release_slots(&self, slots: u32) {
        {
            let mut current = self.slots.lock();
            *current = (*current + slots as i64).min(self.max_slots as i64);
        }
        self.update_master().await;
    }

    /// Hand out the next referee port.
    pub fn next_server_port(&self) -> u16 {
        self.ports.lock().next()
    }

    // --- job entry points (called by the RPC surface) ---

    /// Accept a compilation; the job runs in the background.
    pub fn accept_compile(self: &Arc<Self>, request: CompileChampionRequest) -> u32 {
        let agent = self.clone();
        tokio::spawn(async move {
            agent.compile_job(request).await;
        });
        COMPILE_SLOTS
    }

    /// Accept a referee run; the job runs in the background.
    pub fn accept_server(self: &Arc<Self>, request: RunServerRequest) -> u32 {
        let agent = self.clone();
        tokio::spawn(async move {
            agent.server_job(request).await;
        });
        SERVER_SLOTS
    }

    /// Accept a player run; the job runs in the background.
    pub fn accept_client(self: &Arc<Self>, request: RunClientRequest) -> u32 {
        let agent = self.clone();
        tokio::spawn(async move {
            agent.client_job(request).await;
        });
        PLAYER_SLOTS
    }

    async fn compile_job(&self, request: CompileChampionRequest) {
        self.take_slots(COMPILE_SLOTS).await;
        info!(champion_id = request.champion_id, user = %request.user, "compiling champion");

        let outcome = self.run_compile(&request).await;
        let (artifact_b64, log_b64) = match outcome {
            Ok(outcome) => (
                outcome
                    .artifact
                    .map(|bytes| general_purpose::STANDARD.encode(bytes))
                    .unwrap_or_default(),
                general_purpose::STANDARD.encode(outcome.log),
            ),
            Err(err) => {
                error!(champion_id = request.champion_id, %err, "compilation job failed");
                (String::new(), general_purpose::STANDARD.encode(err.to_string()))
            }
        };

        let callback = CompilationResultRequest {
            champion_id: request.champion_id,
            artifact_b64,
            log_b64,
        };
        if self.master.compilation_result(&callback).await.is_err() {
            warn!(
                champion_id = request.champion_id,
                "master down, cannot send compiled champion"
            );
        }
        self.release_slots(COMPILE_SLOTS).await;
    }

    async fn run_compile(&self, request: &CompileChampionRequest) -> Result<operations::CompileOutcome, OperationError> {
        let sources = operations::decode_b64("sources_b64", &request.sources_b64)?;
        operations::compile_champion(&self.config.paths, &self.config.timeouts, &sources).await
    }

    async fn server_job(&self, request: RunServerRequest) {
        self.take_slots(SERVER_SLOTS).await;
        info!(match_id = request.match_id, "starting referee");

        let (referee, dump) = tokio::join!(
            operations::run_referee(
                &self.config.paths,
                &self.config.timeouts,
                request.req_port,
                request.sub_port,
                request.player_count,
                &request.options,
                &request.file_options,
            ),
            operations::run_dumper(
                &self.config.paths,
                &self.config.timeouts,
                request.req_port,
                request.sub_port,
                &request.options,
                &request.file_options,
            ),
        );

        let scores = match &referee {
            Ok(output) => operations::parse_scores(&String::from_utf8_lossy(&output.stdout)),
            Err(err) => {
                error!(match_id = request.match_id, %err, "referee failed to run");
                Vec::new()
            }
        };
        let dump_b64 = match dump {
            Ok(Some(bytes)) => general_purpose::STANDARD.encode(bytes),
            Ok(None) => String::new(),
            Err(err) => {
                error!(match_id = request.match_id, %err, "dumper failed to run");
                String::new()
            }
        };
        info!(match_id = request.match_id, scores = scores.len(), "match done");

        let callback = MatchDoneRequest {
            match_id: request.match_id,
            scores,
            dump_b64,
        };
        if self.master.match_done(&callback).await.is_err() {
            warn!(match_id = request.match_id, "master down, cannot send match result");
        }
        self.release_slots(SERVER_SLOTS).await;
    }

    async fn client_job(&self, request: RunClientRequest) {
        self.take_slots(PLAYER_SLOTS).await;
        info!(
            match_id = request.match_id,
            match_player_id = request.match_player_id,
            "running player"
        );

        let (exit_code, log) = match self.run_client(&request).await {
            Ok(output) => (output.exit_code, output.stdout),
            Err(err) => {
                error!(
                    match_id = request.match_id,
                    match_player_id = request.match_player_id,
                    %err,
                    "player job failed"
                );
                (1, err.to_string().into_bytes())
            }
        };
        info!(
            match_id = request.match_id,
            match_player_id = request.match_player_id,
            exit_code,
            "player done"
        );

        let callback = ClientDoneRequest {
            match_id: request.match_id,
            match_player_id: request.match_player_id,
            exit_code,
            log_b64: general_purpose::STANDARD.encode(log),
        };
        if self.master.client_done(&callback).await.is_err() {
            warn!(
                match_id = request.match_id,
                match_player_id = request.match_player_id,
                "master down, cannot send player result"
            );
        }
        self.release_slots(PLAYER_SLOTS).await;
    }

    async fn run_client(&self, request: &RunClientRequest) -> Result<operations::CommandOutput, OperationError> {
        let champion = operations::decode_b64("champion_b64", &request.champion_b64)?;
        let scratch = tempfile::tempdir()?;
        operations::untar_gz(champion, scratch.path().to_path_buf()).await?;

        operations::run_player(
            &self.config.paths,
            &self.config.timeouts,
            scratch.path(),
            request.match_player_id,
            &request.server_host,
            request.req_port,
            request.sub_port,
            &request.options,
        )
        .await
    }
}
