// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Server-side envelope handling shared by both RPC surfaces.

use axum::http::StatusCode;
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::rpc::envelope::{Envelope, EnvelopeError};

/// Error body returned by RPC endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFault {
    /// Human-readable cause
    pub error: String,
}

/// Rejection produced when an envelope cannot be opened
pub type RpcRejection = (StatusCode, Json<RpcFault>);

/// Build a rejection with the given status and message.
pub fn fault(status: StatusCode, message: impl Into<String>) -> RpcRejection {
    (
        status,
        Json(RpcFault {
            error: message.into(),
        }),
    )
}

/// Open a request envelope for `method`, mapping failures to HTTP statuses.
///
/// Signature, replay and method-binding failures are authentication
/// rejections (401); version and payload failures are protocol errors (400).
pub fn open_request<T: DeserializeOwned>(
    envelope: &Envelope,
    method: &str,
    secret: &str,
) -> Result<T, RpcRejection> {
    envelope.open(method, secret).map_err(|err| match err {
        EnvelopeError::Signature | EnvelopeError::Stale(_) | EnvelopeError::Method { .. } => {
            fault(StatusCode::UNAUTHORIZED, err.to_string())
        }
        EnvelopeError::Version(_) | EnvelopeError::Payload(_) => {
            fault(StatusCode::BAD_REQUEST, err.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{Ack, PortRequest};

    #[test]
    fn test_open_request_ok() {
        let envelope = Envelope::seal("status", &PortRequest {}, "secret").unwrap();
        let opened: Result<PortRequest, _> = open_request(&envelope, "status", "secret");
        assert!(opened.is_ok());
    }

    #[test]
    fn test_bad_secret_is_unauthorized() {
        let envelope = Envelope::seal("status", &Ack {}, "secret").unwrap();
        let rejection = open_request::<Ack>(&envelope, "status", "wrong").unwrap_err();
        assert_eq!(rejection.0, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_method_mismatch_is_unauthorized() {
        let envelope = Envelope::seal("status", &Ack {}, "secret").unwrap();
        let rejection = open_request::<Ack>(&envelope, "heartbeat", "secret").unwrap_err();
        assert_eq!(rejection.0, StatusCode::UNAUTHORIZED);
    }
}
