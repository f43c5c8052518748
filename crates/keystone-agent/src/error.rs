//! Hardening errors
//!
//! Errors carry the phase they came from and enough context to diagnose
//! the failure. Callers act on [`HardeningError::disposition`] only.

use keystone_common::protocol::FailureReason;
use keystone_common::{Disposition, Phase, SlotError, TransportError};
use keystone_infra::{CryptoError, MtlsError, PkiError, RevocationError};
use thiserror::Error;

use crate::machine::HandshakeState;
use crate::store::StoreError;

/// Errors raised by the agent side of the hardening protocol
#[derive(Debug, Error)]
pub enum HardeningError {
    /// Peer sent something the current step does not accept
    #[error("protocol violation during {phase}: {message}")]
    ProtocolViolation {
        /// Phase that failed
        phase: Phase,
        /// What was wrong
        message: String,
    },

    /// Operation called in a state that does not allow it
    #[error("{phase} step not allowed in state {state:?}")]
    UnexpectedState {
        /// Phase that was attempted
        phase: Phase,
        /// Current machine state
        state: HandshakeState,
    },

    /// Single-assignment slot already occupied (duplicated bootstrap)
    #[error("internal state violation during {phase}: {source}")]
    InternalState {
        /// Phase that failed
        phase: Phase,
        /// Slot error
        source: SlotError,
    },

    /// Material required by this step was never produced
    #[error("missing {slot} during {phase}")]
    MissingState {
        /// Phase that failed
        phase: Phase,
        /// Name of the empty slot
        slot: &'static str,
    },

    /// No long-term identity has been provisioned
    #[error("identity not provisioned")]
    NotProvisioned,

    /// Revocation token rejected; `reset` tells whether the identity was erased
    #[error("authentication failed during {phase}: {source}")]
    RevocationRejected {
        /// Phase that failed
        phase: Phase,
        /// Verification failure
        source: RevocationError,
        /// Whether the identity store was reset
        reset: bool,
    },

    /// Server refused authentication
    #[error("authentication refused by server ({reason:?}): {}", .message.as_deref().unwrap_or("no detail"))]
    AuthenticationFailed {
        /// Server reason code
        reason: FailureReason,
        /// Server detail
        message: Option<String>,
        /// Whether the identity store was reset
        reset: bool,
    },

    /// Issued certificate failed validation
    #[error("certificate validation failed during {phase}: {source}")]
    Pki {
        /// Phase that failed
        phase: Phase,
        /// Underlying PKI error
        source: PkiError,
    },

    /// Trust material (root authority, installation identity) is unusable
    #[error("invalid trust material: {0}")]
    Trust(String),

    /// TLS configuration could not be built
    #[error("TLS configuration error: {0}")]
    Tls(#[from] MtlsError),

    /// Cryptographic primitive failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Identity store error
    #[error("identity store error: {0}")]
    Store(StoreError),

    /// Tunnel negotiation failed
    #[error("tunnel negotiation failed: {message}")]
    Tunnel {
        /// Negotiator error
        message: String,
    },

    /// Transport failed while exchanging handshake messages
    #[error("transport error during {phase}: {source}")]
    Transport {
        /// Phase that failed
        phase: Phase,
        /// Underlying transport error
        source: TransportError,
    },

    /// Peer did not answer within the handshake deadline
    #[error("timed out waiting for peer during {phase}")]
    Timeout {
        /// Phase that timed out
        phase: Phase,
    },

    /// Handshake cancelled by the caller
    #[error("handshake cancelled during {phase}")]
    Cancelled {
        /// Phase that was cancelled
        phase: Phase,
    },
}

/// Result type for hardening operations
pub type Result<T> = std::result::Result<T, HardeningError>;

impl From<StoreError> for HardeningError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotProvisioned => HardeningError::NotProvisioned,
            other => HardeningError::Store(other),
        }
    }
}

impl HardeningError {
    /// Build a protocol violation
    pub fn protocol(phase: Phase, message: impl Into<String>) -> Self {
        HardeningError::ProtocolViolation {
            phase,
            message: message.into(),
        }
    }

    /// What the caller should do next
    pub fn disposition(&self) -> Disposition {
        match self {
            HardeningError::ProtocolViolation { .. }
            | HardeningError::UnexpectedState { .. }
            | HardeningError::Pki { .. }
            | HardeningError::Tunnel { .. }
            | HardeningError::Transport { .. }
            | HardeningError::Timeout { .. }
            | HardeningError::Cancelled { .. } => Disposition::RetryAsIs,

            HardeningError::MissingState { .. }
            | HardeningError::NotProvisioned
            | HardeningError::RevocationRejected { .. } => Disposition::Reprovision,

            HardeningError::AuthenticationFailed { reset, .. } => {
                if *reset {
                    Disposition::Reprovision
                } else {
                    Disposition::RetryAsIs
                }
            }

            HardeningError::Store(err) => err.disposition(),

            HardeningError::InternalState { .. }
            | HardeningError::Trust(_)
            | HardeningError::Tls(_)
            | HardeningError::Crypto(_) => Disposition::Fatal,
        }
    }

    /// Whether this error erased the local identity
    pub fn identity_reset(&self) -> bool {
        matches!(
            self,
            HardeningError::RevocationRejected { reset: true, .. }
                | HardeningError::AuthenticationFailed { reset: true, .. }
        )
    }
}
