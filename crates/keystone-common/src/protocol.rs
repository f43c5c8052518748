//! Handshake payloads
//!
//! Every handshake message travels as a JSON envelope `{"type": ..., "payload": ...}`
//! inside a text frame. Binary fields (hashes, nonces, ciphertexts) are standard
//! base64. The envelope is only what the hardening handshake consumes; the
//! application protocol that runs after authentication is opaque to it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::AgentId;

/// Payload encoding errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope could not be serialized
    #[error("failed to encode {kind} message: {source}")]
    Encode {
        /// Message kind being encoded
        kind: &'static str,
        /// Underlying serializer error
        source: serde_json::Error,
    },

    /// Envelope could not be parsed
    #[error("failed to decode handshake message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Base64 (standard alphabet, padded) encoding for byte fields
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

/// Operating system and architecture of the agent host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system family (`linux`, `windows`, `macos`)
    pub os: String,
    /// CPU architecture (`x86_64`, `aarch64`)
    pub arch: String,
    /// Agent build version
    pub version: String,
}

impl Platform {
    /// Describe the running host with the given agent version
    pub fn current(version: impl Into<String>) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: version.into(),
        }
    }
}

/// Agent → server: request a long-term identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    /// PEM-encoded certificate signing request
    pub csr_pem: String,
    /// Digest of the agent binary
    #[serde(with = "b64")]
    pub abh: Vec<u8>,
    /// Requesting agent
    pub agent_id: AgentId,
    /// Host description
    pub platform: Platform,
    /// Free-form agent metadata (hostname, labels)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Server → agent: issued identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    /// PEM-encoded long-term agent certificate
    pub ltac_pem: String,
    /// Compact signed revocation token bound to this identity
    pub revocation_token: String,
    /// Optional auxiliary configuration pushed at provisioning time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Server → agent: binary-integrity challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRequest {
    /// Random nonce to encrypt under the challenge key
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
}

/// Agent → server: encrypted challenge nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// IV ‖ ciphertext of the nonce
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
}

/// Tunnel parameters negotiated once the agent is authenticated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel encapsulation kind
    pub kind: String,
    /// Kind-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Server → agent: start of an authenticated connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStart {
    /// Freshly presented revocation token
    pub revocation_token: String,
    /// Tunnel to set up for the session
    pub tunnel: TunnelConfig,
}

/// Agent → server: connection start accepted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStartAck {}

/// Why the server refused an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Transport or tunnel integrity error; the agent must discard its identity
    TunnelIntegrity,
    /// The server does not know this agent
    UnknownAgent,
    /// Challenge response did not match any known binary
    ChallengeFailed,
    /// The agent deployment has been revoked
    Revoked,
    /// Unclassified server-side error
    #[serde(other)]
    Internal,
}

/// Server → agent: authentication refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFailure {
    /// Failure reason code
    pub reason: FailureReason,
    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuthFailure {
    /// Whether this failure signals a compromised identity
    pub fn requires_reset(&self) -> bool {
        self.reason == FailureReason::TunnelIntegrity
    }
}

/// Liveness probe, echoed back unchanged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Opaque probe bytes
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
}

/// Envelope for every handshake message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// See [`BootstrapRequest`]
    BootstrapRequest(BootstrapRequest),
    /// See [`BootstrapResponse`]
    BootstrapResponse(BootstrapResponse),
    /// See [`ChallengeRequest`]
    ChallengeRequest(ChallengeRequest),
    /// See [`ChallengeResponse`]
    ChallengeResponse(ChallengeResponse),
    /// See [`ConnectionStart`]
    ConnectionStart(ConnectionStart),
    /// See [`ConnectionStartAck`]
    ConnectionStartAck(ConnectionStartAck),
    /// See [`AuthFailure`]
    AuthFailure(AuthFailure),
    /// Liveness probe from the server
    Ping(Ping),
    /// Echo of a [`Ping`]
    Pong(Ping),
}

impl HandshakeMessage {
    /// Wire name of the message kind
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeMessage::BootstrapRequest(_) => "bootstrap_request",
            HandshakeMessage::BootstrapResponse(_) => "bootstrap_response",
            HandshakeMessage::ChallengeRequest(_) => "challenge_request",
            HandshakeMessage::ChallengeResponse(_) => "challenge_response",
            HandshakeMessage::ConnectionStart(_) => "connection_start",
            HandshakeMessage::ConnectionStartAck(_) => "connection_start_ack",
            HandshakeMessage::AuthFailure(_) => "auth_failure",
            HandshakeMessage::Ping(_) => "ping",
            HandshakeMessage::Pong(_) => "pong",
        }
    }

    /// Serialize to the JSON envelope
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|source| ProtocolError::Encode {
            kind: self.kind(),
            source,
        })
    }

    /// Parse a JSON envelope
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}
