// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The master's RPC surface: worker callbacks plus the operator intake.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::{engine::general_purpose, Engine as _};
use std::sync::Arc;

use crate::master::node::{MasterError, MasterNode};
use crate::rpc::envelope::Envelope;
use crate::rpc::protocol::{
    methods, Ack, ClientDoneRequest, CompilationResultRequest, HeartbeatRequest, MatchDoneRequest,
    RequestMatchRequest, RequestMatchResponse, StatusRequest, StatusSnapshot,
    SubmitChampionRequest, SubmitChampionResponse, UpdateWorkerRequest,
};
use crate::rpc::server::{fault, open_request, RpcRejection};
use crate::storage::StorageError;

/// Build the master's router.
pub fn router(node: Arc<MasterNode>) -> Router {
    Router::new()
        .route("/rpc/heartbeat", post(heartbeat))
        .route("/rpc/update_worker", post(update_worker))
        .route("/rpc/compilation_result", post(compilation_result))
        .route("/rpc/match_done", post(match_done))
        .route("/rpc/client_done", post(client_done))
        .route("/rpc/status", post(status))
        .route("/rpc/submit_champion", post(submit_champion))
        .route("/rpc/request_match", post(request_match))
        .with_state(node)
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, RpcRejection> {
    general_purpose::STANDARD
        .decode(value)
        .map_err(|_| fault(StatusCode::BAD_REQUEST, format!("Invalid base64 in {field}")))
}

fn storage_fault(err: StorageError) -> RpcRejection {
    match err {
        StorageError::NotFound { .. } => fault(StatusCode::NOT_FOUND, err.to_string()),
        other => fault(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

async fn heartbeat(
    State(node): State<Arc<MasterNode>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Ack>, RpcRejection> {
    let request: HeartbeatRequest = open_request(&envelope, methods::HEARTBEAT, node.secret())?;
    node.on_heartbeat(&request.info, request.first_heartbeat);
    Ok(Json(Ack {}))
}

async fn update_worker(
    State(node): State<Arc<MasterNode>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Ack>, RpcRejection> {
    let request: UpdateWorkerRequest = open_request(&envelope, methods::UPDATE_WORKER, node.secret())?;
    node.on_update_worker(&request.info);
    Ok(Json(Ack {}))
}

async fn compilation_result(
    State(node): State<Arc<MasterNode>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Ack>, RpcRejection> {
    let request: CompilationResultRequest =
        open_request(&envelope, methods::COMPILATION_RESULT, node.secret())?;

    let artifact = if request.artifact_b64.is_empty() {
        None
    } else {
        Some(decode_b64("artifact_b64", &request.artifact_b64)?)
    };
    let log = decode_b64("log_b64", &request.log_b64)?;

    node.on_compilation_result(request.champion_id, artifact, log)
        .await
        .map_err(storage_fault)?;
    Ok(Json(Ack {}))
}

async fn match_done(
    State(node): State<Arc<MasterNode>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Ack>, RpcRejection> {
    let request: MatchDoneRequest = open_request(&envelope, methods::MATCH_DONE, node.secret())?;

    let dump = if request.dump_b64.is_empty() {
        None
    } else {
        Some(decode_b64("dump_b64", &request.dump_b64)?)
    };

    // An unknown match is treated as already done; the board ignores it
    node.on_match_done(request.match_id, request.scores, dump).await;
    Ok(Json(Ack {}))
}

async fn client_done(
    State(node): State<Arc<MasterNode>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Ack>, RpcRejection> {
    let request: ClientDoneRequest = open_request(&envelope, methods::CLIENT_DONE, node.secret())?;
    let log = if request.log_b64.is_empty() {
        Vec::new()
    } else {
        decode_b64("log_b64", &request.log_b64)?
    };

    node.on_client_done(request.match_id, request.match_player_id, request.exit_code, log)
        .await;
    Ok(Json(Ack {}))
}

async fn status(
    State(node): State<Arc<MasterNode>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<StatusSnapshot>, RpcRejection> {
    let _request: StatusRequest = open_request(&envelope, methods::STATUS, node.secret())?;
    Ok(Json(node.status_snapshot()))
}

async fn submit_champion(
    State(node): State<Arc<MasterNode>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<SubmitChampionResponse>, RpcRejection> {
    let request: SubmitChampionRequest = open_request(&envelope, methods::SUBMIT_CHAMPION, node.secret())?;
    let sources = decode_b64("sources_b64", &request.sources_b64)?;

    let champion_id = node
        .submit_champion(&request.user, &request.name, &sources)
        .await
        .map_err(storage_fault)?;
    Ok(Json(SubmitChampionResponse { champion_id }))
}

async fn request_match(
    State(node): State<Arc<MasterNode>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<RequestMatchResponse>, RpcRejection> {
    let request: RequestMatchRequest = open_request(&envelope, methods::REQUEST_MATCH, node.secret())?;

    let match_id = node
        .request_match(request.players, request.options, request.file_options)
        .await
        .map_err(|err| match err {
            MasterError::Storage(storage) => storage_fault(storage),
            other @ (MasterError::ChampionNotReady { .. } | MasterError::NoPlayers) => {
                fault(StatusCode::BAD_REQUEST, other.to_string())
            }
        })?;
    Ok(Json(RequestMatchResponse { match_id }))
}
