// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The worker's RPC surface, called by the master.
//!
//! Jobs are accepted immediately and run in the background; the response
//! carries only the slot weight the job consumes. Results travel back
//! through master callbacks.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;

use crate::rpc::envelope::Envelope;
use crate::rpc::protocol::{
    methods, CompileChampionRequest, PortRequest, PortResponse, RunClientRequest, RunServerRequest,
    SlotsResponse,
};
use crate::rpc::server::{open_request, RpcRejection};
use crate::worker::agent::WorkerAgent;

/// Build the worker's router.
pub fn router(agent: Arc<WorkerAgent>) -> Router {
    Router::new()
        .route("/rpc/available_server_port", post(available_server_port))
        .route("/rpc/compile_champion", post(compile_champion))
        .route("/rpc/run_server", post(run_server))
        .route("/rpc/run_client", post(run_client))
        .with_state(agent)
}

async fn available_server_port(
    State(agent): State<Arc<WorkerAgent>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<PortResponse>, RpcRejection> {
    let _request: PortRequest = open_request(&envelope, methods::AVAILABLE_SERVER_PORT, agent.secret())?;
    Ok(Json(PortResponse {
        port: agent.next_server_port(),
    }))
}

async fn compile_champion(
    State(agent): State<Arc<WorkerAgent>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<SlotsResponse>, RpcRejection> {
    let request: CompileChampionRequest =
        open_request(&envelope, methods::COMPILE_CHAMPION, agent.secret())?;
    Ok(Json(SlotsResponse {
        slots: agent.accept_compile(request),
    }))
}

async fn run_server(
    State(agent): State<Arc<WorkerAgent>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<SlotsResponse>, RpcRejection> {
    let request: RunServerRequest = open_request(&envelope, methods::RUN_SERVER, agent.secret())?;
    Ok(Json(SlotsResponse {
        slots: agent.accept_server(request),
    }))
}

async fn run_client(
    State(agent): State<Arc<WorkerAgent>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<SlotsResponse>, RpcRejection> {
    let request: RunClientRequest = open_request(&envelope, methods::RUN_CLIENT, agent.secret())?;
    Ok(Json(SlotsResponse {
        slots: agent.accept_client(request),
    }))
}
