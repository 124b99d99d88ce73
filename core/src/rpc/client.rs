// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! RPC client over HTTP with typed wrappers for both surfaces.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::rpc::envelope::Envelope;
use crate::rpc::error::{RpcError, RpcResult};
use crate::rpc::protocol::{self, methods};
use crate::rpc::server::RpcFault;
use crate::rpc::{DEFAULT_RPC_TIMEOUT_SECS, RPC_PREFIX};

/// Low-level RPC client bound to one peer and the shared secret.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

impl RpcClient {
    /// Create a client for `base_url` (e.g. `http://worker1:21100`).
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>, timeout: Duration) -> RpcResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RpcError::Protocol(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        })
    }

    /// Create a client with the default timeout budget.
    pub fn with_default_timeout(base_url: impl Into<String>, secret: impl Into<String>) -> RpcResult<Self> {
        Self::new(base_url, secret, Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS))
    }

    /// The peer this client dials.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Invoke `method` with a signed envelope and decode the JSON response.
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> RpcResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let envelope = Envelope::seal(method, request, &self.secret)
            .map_err(|err| RpcError::Protocol(err.to_string()))?;
        let url = format!("{}{}/{}", self.base_url, RPC_PREFIX, method);

        let response = self.http.post(&url).json(&envelope).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<Resp>().await?);
        }

        let message = match response.json::<RpcFault>().await {
            Ok(fault) => fault.error,
            Err(_) => status.to_string(),
        };
        if status == StatusCode::UNAUTHORIZED {
            Err(RpcError::Auth(message))
        } else {
            Err(RpcError::App {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Typed client for the master's RPC surface (called by workers and the CLI).
#[derive(Debug, Clone)]
pub struct MasterClient {
    rpc: RpcClient,
}

impl MasterClient {
    /// Dial the master at `host:port`.
    pub fn new(host: &str, port: u16, secret: &str) -> RpcResult<Self> {
        Ok(Self {
            rpc: RpcClient::with_default_timeout(format!("http://{host}:{port}"), secret)?,
        })
    }

    /// Announce liveness and capacity.
    pub async fn heartbeat(&self, info: protocol::WorkerInfo, first_heartbeat: bool) -> RpcResult<protocol::Ack> {
        self.rpc
            .call(methods::HEARTBEAT, &protocol::HeartbeatRequest { info, first_heartbeat })
            .await
    }

    /// Publish a slot count change.
    pub async fn update_worker(&self, info: protocol::WorkerInfo) -> RpcResult<protocol::Ack> {
        self.rpc
            .call(methods::UPDATE_WORKER, &protocol::UpdateWorkerRequest { info })
            .await
    }

    /// Report a compilation outcome.
    pub async fn compilation_result(&self, request: &protocol::CompilationResultRequest) -> RpcResult<protocol::Ack> {
        self.rpc.call(methods::COMPILATION_RESULT, request).await
    }

    /// Report referee scores and the replay dump.
    pub async fn match_done(&self, request: &protocol::MatchDoneRequest) -> RpcResult<protocol::Ack> {
        self.rpc.call(methods::MATCH_DONE, request).await
    }

    /// Report a player exit.
    pub async fn client_done(&self, request: &protocol::ClientDoneRequest) -> RpcResult<protocol::Ack> {
        self.rpc.call(methods::CLIENT_DONE, request).await
    }

    /// Fetch the cluster snapshot.
    pub async fn status(&self) -> RpcResult<protocol::StatusSnapshot> {
        self.rpc.call(methods::STATUS, &protocol::StatusRequest {}).await
    }

    /// Register a champion for compilation.
    pub async fn submit_champion(
        &self,
        request: &protocol::SubmitChampionRequest,
    ) -> RpcResult<protocol::SubmitChampionResponse> {
        self.rpc.call(methods::SUBMIT_CHAMPION, request).await
    }

    /// Request a match between compiled champions.
    pub async fn request_match(
        &self,
        request: &protocol::RequestMatchRequest,
    ) -> RpcResult<protocol::RequestMatchResponse> {
        self.rpc.call(methods::REQUEST_MATCH, request).await
    }
}

/// Typed client for a worker's RPC surface (called by the master).
#[derive(Debug, Clone)]
pub struct WorkerClient {
    rpc: RpcClient,
}

impl WorkerClient {
    /// Dial the worker at `hostname:port`.
    pub fn new(hostname: &str, port: u16, secret: &str) -> RpcResult<Self> {
        Ok(Self {
            rpc: RpcClient::with_default_timeout(format!("http://{hostname}:{port}"), secret)?,
        })
    }

    /// Reserve one referee port on the worker.
    pub async fn available_server_port(&self) -> RpcResult<u16> {
        let response: protocol::PortResponse = self
            .rpc
            .call(methods::AVAILABLE_SERVER_PORT, &protocol::PortRequest {})
            .await?;
        Ok(response.port)
    }

    /// Start a champion compilation; returns the slots the job consumes.
    pub async fn compile_champion(&self, request: &protocol::CompileChampionRequest) -> RpcResult<u32> {
        let response: protocol::SlotsResponse = self.rpc.call(methods::COMPILE_CHAMPION, request).await?;
        Ok(response.slots)
    }

    /// Start a match referee; returns the slots the job consumes.
    pub async fn run_server(&self, request: &protocol::RunServerRequest) -> RpcResult<u32> {
        let response: protocol::SlotsResponse = self.rpc.call(methods::RUN_SERVER, request).await?;
        Ok(response.slots)
    }

    /// Start a player client; returns the slots the job consumes.
    pub async fn run_client(&self, request: &protocol::RunClientRequest) -> RpcResult<u32> {
        let response: protocol::SlotsResponse = self.rpc.call(methods::RUN_CLIENT, request).await?;
        Ok(response.slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_call_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/available_server_port"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "port": 20000 })))
            .mount(&server)
            .await;

        let client = RpcClient::with_default_timeout(server.uri(), "secret").unwrap();
        let response: protocol::PortResponse = client
            .call(methods::AVAILABLE_SERVER_PORT, &protocol::PortRequest {})
            .await
            .unwrap();
        assert_eq!(response.port, 20000);
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/heartbeat"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(serde_json::json!({ "error": "Invalid signature" })),
            )
            .mount(&server)
            .await;

        let client = RpcClient::with_default_timeout(server.uri(), "secret").unwrap();
        let err = client
            .call::<_, protocol::Ack>(
                methods::HEARTBEAT,
                &protocol::HeartbeatRequest {
                    info: protocol::WorkerInfo {
                        hostname: "w1".into(),
                        port: 21100,
                        current_slots: 4,
                        max_slots: 4,
                    },
                    first_heartbeat: true,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_server_error_maps_to_app_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc/status"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({ "error": "store offline" })))
            .mount(&server)
            .await;

        let client = RpcClient::with_default_timeout(server.uri(), "secret").unwrap();
        let err = client
            .call::<_, protocol::StatusSnapshot>(methods::STATUS, &protocol::StatusRequest {})
            .await
            .unwrap_err();
        match err {
            RpcError::App { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "store offline");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        // Nothing listens on this port
        let client = RpcClient::with_default_timeout("http://127.0.0.1:1", "secret").unwrap();
        let err = client
            .call::<_, protocol::Ack>(methods::STATUS, &protocol::StatusRequest {})
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
