// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! HMAC-signed request envelope.
//!
//! The signature covers the method name, the timestamp, the nonce and the
//! canonical JSON of the payload, so a request cannot be replayed against a
//! different method or with a swapped body.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ring::hmac;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::rpc::{ENVELOPE_VERSION, REPLAY_WINDOW_SECS};

/// Errors produced while sealing or opening an envelope
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Envelope format version is not supported
    #[error("Unsupported envelope version {0}")]
    Version(u32),

    /// The envelope was signed for a different method
    #[error("Method mismatch: envelope carries '{carried}', endpoint is '{expected}'")]
    Method {
        /// Method recorded in the envelope
        carried: String,
        /// Method the endpoint serves
        expected: String,
    },

    /// Timestamp outside the accepted replay window
    #[error("Timestamp {0} outside the replay window")]
    Stale(i64),

    /// Signature did not verify under the shared secret
    #[error("Invalid signature")]
    Signature,

    /// Payload could not be serialized or deserialized
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A signed RPC request.
///
/// Unknown fields are rejected so that a peer speaking a newer protocol
/// fails loudly instead of being half-understood.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    /// Envelope format version
    pub version: u32,
    /// RPC method the payload is meant for
    pub method: String,
    /// Seconds since the Unix epoch at sealing time
    pub timestamp: i64,
    /// Random nonce (differentiates otherwise identical requests)
    pub nonce: Uuid,
    /// Method payload
    pub payload: serde_json::Value,
    /// Base64 HMAC-SHA256 over method, timestamp, nonce and payload
    pub signature: String,
}

impl Envelope {
    /// Seal a payload for `method` under the shared secret.
    pub fn seal<T: Serialize>(method: &str, payload: &T, secret: &str) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(payload)?;
        let timestamp = Utc::now().timestamp();
        let nonce = Uuid::new_v4();
        let signature = sign(method, timestamp, &nonce, &payload, secret)?;
        Ok(Self {
            version: ENVELOPE_VERSION,
            method: method.to_string(),
            timestamp,
            nonce,
            payload,
            signature,
        })
    }

    /// Open the envelope, verifying version, method, freshness and signature.
    pub fn open<T: DeserializeOwned>(&self, method: &str, secret: &str) -> Result<T, EnvelopeError> {
        self.open_at(method, secret, Utc::now())
    }

    /// [`Envelope::open`] against an explicit clock.
    pub fn open_at<T: DeserializeOwned>(
        &self,
        method: &str,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<T, EnvelopeError> {
        if self.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::Version(self.version));
        }
        if self.method != method {
            return Err(EnvelopeError::Method {
                carried: self.method.clone(),
                expected: method.to_string(),
            });
        }
        if (now.timestamp() - self.timestamp).abs() > REPLAY_WINDOW_SECS {
            return Err(EnvelopeError::Stale(self.timestamp));
        }

        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let message = signing_input(method, self.timestamp, &self.nonce, &self.payload)?;
        let tag = general_purpose::STANDARD
            .decode(&self.signature)
            .map_err(|_| EnvelopeError::Signature)?;
        hmac::verify(&key, &message, &tag).map_err(|_| EnvelopeError::Signature)?;

        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Compute the base64 signature for an envelope.
fn sign(
    method: &str,
    timestamp: i64,
    nonce: &Uuid,
    payload: &serde_json::Value,
    secret: &str,
) -> Result<String, EnvelopeError> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let message = signing_input(method, timestamp, nonce, payload)?;
    let tag = hmac::sign(&key, &message);
    Ok(general_purpose::STANDARD.encode(tag.as_ref()))
}

/// Canonical byte sequence covered by the signature.
///
/// The payload is re-serialized from its `Value` form, which orders object
/// keys deterministically, so sender and receiver sign identical bytes.
fn signing_input(
    method: &str,
    timestamp: i64,
    nonce: &Uuid,
    payload: &serde_json::Value,
) -> Result<Vec<u8>, EnvelopeError> {
    let mut message = Vec::new();
    message.extend_from_slice(method.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(timestamp.to_string().as_bytes());
    message.push(b'\n');
    message.extend_from_slice(nonce.to_string().as_bytes());
    message.push(b'\n');
    message.extend_from_slice(&serde_json::to_vec(payload)?);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        value: u32,
    }

    #[test]
    fn test_seal_and_open() {
        let envelope = Envelope::seal("ping", &Ping { value: 7 }, "secret").unwrap();
        let opened: Ping = envelope.open("ping", "secret").unwrap();
        assert_eq!(opened, Ping { value: 7 });
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let envelope = Envelope::seal("ping", &Ping { value: 7 }, "secret").unwrap();
        let err = envelope.open::<Ping>("ping", "other").unwrap_err();
        assert!(matches!(err, EnvelopeError::Signature));
    }

    #[test]
    fn test_method_binding() {
        let envelope = Envelope::seal("ping", &Ping { value: 7 }, "secret").unwrap();
        let err = envelope.open::<Ping>("pong", "secret").unwrap_err();
        assert!(matches!(err, EnvelopeError::Method { .. }));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let mut envelope = Envelope::seal("ping", &Ping { value: 7 }, "secret").unwrap();
        envelope.payload = serde_json::json!({ "value": 8 });
        let err = envelope.open::<Ping>("ping", "secret").unwrap_err();
        assert!(matches!(err, EnvelopeError::Signature));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let envelope = Envelope::seal("ping", &Ping { value: 7 }, "secret").unwrap();
        let late = Utc::now() + Duration::seconds(REPLAY_WINDOW_SECS + 60);
        let err = envelope.open_at::<Ping>("ping", "secret", late).unwrap_err();
        assert!(matches!(err, EnvelopeError::Stale(_)));
    }

    #[test]
    fn test_unknown_envelope_fields_rejected() {
        let parsed: Result<Envelope, _> = serde_json::from_str(
            r#"{
                "version": 1,
                "method": "ping",
                "timestamp": 0,
                "nonce": "00000000-0000-0000-0000-000000000000",
                "payload": {},
                "signature": "",
                "extra": true
            }"#,
        );
        assert!(parsed.is_err());
    }
}
