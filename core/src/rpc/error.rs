// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! RPC error classification.

use thiserror::Error;

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors surfaced by an RPC exchange, classified the way the dispatcher
/// reacts to them: transport failures requeue, auth failures do not retry.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Peer could not be reached (refused, reset, DNS)
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    /// The exchange exceeded its timeout budget
    #[error("RPC timed out: {0}")]
    Timeout(String),

    /// The peer rejected our authentication envelope
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Malformed request or response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer accepted the request but failed to execute it
    #[error("Application error (status {status}): {message}")]
    App {
        /// HTTP status returned by the peer
        status: u16,
        /// Error body reported by the peer
        message: String,
    },
}

impl RpcError {
    /// Whether this error is an authentication rejection
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Whether this error is worth a requeue (everything but auth)
    pub fn is_retryable(&self) -> bool {
        !self.is_auth()
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::Unreachable(err.to_string())
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_is_not_retryable() {
        assert!(!RpcError::Auth("bad secret".into()).is_retryable());
        assert!(RpcError::Timeout("400s".into()).is_retryable());
        assert!(RpcError::Unreachable("refused".into()).is_retryable());
    }
}
