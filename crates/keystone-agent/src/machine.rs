//! Hardening state machine
//!
//! Orchestrates both phases of the handshake for one agent:
//!
//! ```text
//! Uninitialized ──prepare_bootstrap_request──▶ BootstrapInFlight
//!       ▲                                            │
//!       │                             process_bootstrap_response
//!     reset                                          ▼
//!       │                                       Provisioned ◀──────────┐
//!       │                                            │                 │
//!       │                            prepare_challenge_response   failure/disconnect
//!       │                                            ▼                 │
//!       └──────── (any state) ────────────── ChallengeInFlight ────────┤
//!                                                    │                 │
//!                                       process_connection_request     │
//!                                                    ▼                 │
//!                                              Authenticated ──────────┘
//! ```
//!
//! The pending private key lives in a [`SingleSlot`]; the issuing authority
//! arrives from the TLS layer through the [`ScaReceiver`] handoff. Both are
//! consumed by `process_bootstrap_response` and discarded on any failure, so
//! a retry always starts clean.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keystone_common::protocol::{
    AuthFailure, BootstrapRequest, BootstrapResponse, ChallengeRequest, ChallengeResponse,
    ConnectionStart, ConnectionStartAck, HandshakeMessage, Ping, Platform, TunnelConfig,
};
use keystone_common::{AgentId, Phase, SingleSlot, SlotError};
use keystone_infra::pki::{self, AgentCertRequest};
use keystone_infra::{ChallengeKey, RevocationError, RevocationVerifier, ScaReceiver};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::abh::BinaryHashSource;
use crate::error::{HardeningError, Result};
use crate::store::{IdentityBundle, IdentityStore, StoreError};
use crate::tls::TrustMaterial;

const PENDING_KEY_SLOT: &str = "pending-key";
const ISSUING_AUTHORITY_SLOT: &str = "issuing-authority";

/// Handshake progress of one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// No long-term identity
    Uninitialized,
    /// Bootstrap request sent, waiting for the issued identity
    BootstrapInFlight,
    /// Long-term identity stored, no connection in progress
    Provisioned,
    /// Challenge answered, waiting for connection start
    ChallengeInFlight,
    /// Connection accepted and tunnel negotiated
    Authenticated,
}

/// Descriptive data sent with a bootstrap request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    /// Host platform
    pub platform: Platform,
    /// Free-form metadata (hostname, labels)
    pub metadata: BTreeMap<String, String>,
}

impl AgentInfo {
    /// Describe the running host with this crate's version and no metadata
    pub fn current() -> Self {
        Self {
            platform: Platform::current(env!("CARGO_PKG_VERSION")),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Sets up the tunnel requested by an accepted connection start
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelNegotiator: Send + Sync {
    /// Apply the tunnel parameters; the error message is surfaced as-is
    async fn negotiate(&self, tunnel: &TunnelConfig) -> std::result::Result<(), String>;
}

struct PendingKey {
    key_der: Zeroizing<Vec<u8>>,
    public_key_raw: Vec<u8>,
}

/// Agent-side orchestrator of the hardening handshake
pub struct HardeningStateMachine {
    agent_id: AgentId,
    abh: Arc<dyn BinaryHashSource>,
    verifier: RevocationVerifier,
    root_der: Vec<u8>,
    store: Arc<IdentityStore>,
    pending_key: SingleSlot<PendingKey>,
    sca: ScaReceiver,
    state: Mutex<HandshakeState>,
}

impl HardeningStateMachine {
    /// Create a state machine
    ///
    /// Starts in `Provisioned` when `store` already holds an identity.
    pub async fn new(
        agent_id: AgentId,
        trust: &TrustMaterial,
        store: Arc<IdentityStore>,
        abh: Arc<dyn BinaryHashSource>,
        sca: ScaReceiver,
    ) -> Result<Self> {
        let verifier = RevocationVerifier::from_root_der(trust.root_der())
            .map_err(|e| HardeningError::Trust(e.to_string()))?;

        let initial = match store.get().await {
            Ok(_) => HandshakeState::Provisioned,
            Err(StoreError::NotProvisioned) => HandshakeState::Uninitialized,
            Err(e) => return Err(e.into()),
        };
        info!(agent_id = %agent_id, state = ?initial, "hardening state machine ready");

        Ok(Self {
            agent_id,
            abh,
            verifier,
            root_der: trust.root_der().to_vec(),
            store,
            pending_key: SingleSlot::new(PENDING_KEY_SLOT),
            sca,
            state: Mutex::new(initial),
        })
    }

    /// Agent this machine runs for
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Current state
    pub fn state(&self) -> HandshakeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, to: HandshakeState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != to {
            debug!(agent_id = %self.agent_id, from = ?*state, to = ?to, "state transition");
            *state = to;
        }
    }

    fn transition_from(&self, phase: Phase, allowed: &[HandshakeState], to: HandshakeState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !allowed.contains(&state) {
            return Err(HardeningError::UnexpectedState {
                phase,
                state: *state,
            });
        }
        debug!(agent_id = %self.agent_id, from = ?*state, to = ?to, "state transition");
        *state = to;
        Ok(())
    }

    async fn resting_state(&self) -> HandshakeState {
        if self.store.is_provisioned().await {
            HandshakeState::Provisioned
        } else {
            HandshakeState::Uninitialized
        }
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    /// Generate a key pair and build the bootstrap request
    ///
    /// Only one bootstrap may be in flight: a second call before the first
    /// response is processed fails with [`HardeningError::InternalState`].
    pub fn prepare_bootstrap_request(&self, info: &AgentInfo) -> Result<HandshakeMessage> {
        let phase = Phase::Bootstrap;
        match self.state() {
            HandshakeState::ChallengeInFlight | HandshakeState::Authenticated => {
                return Err(HardeningError::UnexpectedState {
                    phase,
                    state: self.state(),
                })
            }
            _ => {}
        }

        // A capture taken for this attempt cannot be used once preparing it
        // failed; leaving it would block the next bootstrap handshake.
        self.build_bootstrap_request(phase, info).inspect_err(|e| {
            if self.sca.discard() {
                debug!(
                    agent_id = %self.agent_id,
                    error = %e,
                    "issuing authority dropped with failed bootstrap request"
                );
            }
        })
    }

    fn build_bootstrap_request(&self, phase: Phase, info: &AgentInfo) -> Result<HandshakeMessage> {
        let request = AgentCertRequest::new(&self.agent_id)
            .map_err(|source| HardeningError::Pki { phase, source })?;
        let csr_pem = request.csr_pem().to_string();
        let public_key_raw = request.public_key_raw().to_vec();

        self.pending_key
            .push(PendingKey {
                key_der: request.into_private_key(),
                public_key_raw,
            })
            .map_err(|source| {
                error!(agent_id = %self.agent_id, "bootstrap already in flight");
                HardeningError::InternalState { phase, source }
            })?;
        self.transition(HandshakeState::BootstrapInFlight);

        info!(agent_id = %self.agent_id, "bootstrap request prepared");
        Ok(HandshakeMessage::BootstrapRequest(BootstrapRequest {
            csr_pem,
            abh: self.abh.binary_hash(),
            agent_id: self.agent_id.clone(),
            platform: info.platform.clone(),
            metadata: info.metadata.clone(),
        }))
    }

    /// Validate and persist the issued identity
    ///
    /// Consumes the pending key and the captured issuing authority. On any
    /// failure both are discarded and nothing is written to the store.
    pub async fn process_bootstrap_response(&self, message: HandshakeMessage) -> Result<()> {
        match self.complete_bootstrap(message).await {
            Ok(()) => {
                self.transition(HandshakeState::Provisioned);
                info!(agent_id = %self.agent_id, "bootstrap complete, identity provisioned");
                Ok(())
            }
            Err(e) => {
                warn!(agent_id = %self.agent_id, error = %e, "bootstrap response rejected");
                self.reset_bootstrap().await;
                Err(e)
            }
        }
    }

    async fn complete_bootstrap(&self, message: HandshakeMessage) -> Result<()> {
        let phase = Phase::Bootstrap;
        let response = match message {
            HandshakeMessage::BootstrapResponse(response) => response,
            HandshakeMessage::AuthFailure(AuthFailure { reason, message }) => {
                return Err(HardeningError::AuthenticationFailed {
                    reason,
                    message,
                    reset: false,
                })
            }
            other => {
                return Err(HardeningError::protocol(
                    phase,
                    format!("expected bootstrap_response, got {}", other.kind()),
                ))
            }
        };

        let pending = self.pending_key.pop().map_err(|e| missing(phase, e))?;
        let sca = self.sca.take().map_err(|_| HardeningError::MissingState {
            phase,
            slot: ISSUING_AUTHORITY_SLOT,
        })?;

        let bundle = self.validate_issued(response, pending, sca.as_ref().to_vec())?;
        self.store.put(&bundle).await?;
        Ok(())
    }

    fn validate_issued(
        &self,
        response: BootstrapResponse,
        pending: PendingKey,
        sca_der: Vec<u8>,
    ) -> Result<IdentityBundle> {
        let phase = Phase::Bootstrap;
        let pki_err = |source| HardeningError::Pki { phase, source };

        let ltac_der = pki::parse_pem(&response.ltac_pem).map_err(pki_err)?;
        pki::verify_public_key(&ltac_der, &pending.public_key_raw).map_err(pki_err)?;
        pki::verify_issued_by(&ltac_der, &sca_der).map_err(pki_err)?;
        pki::verify_issued_by(&sca_der, &self.root_der).map_err(pki_err)?;

        let reject = |source| HardeningError::RevocationRejected {
            phase,
            source,
            reset: false,
        };
        let token = self
            .verifier
            .verify(&response.revocation_token)
            .map_err(reject)?;
        let revocation_canonical = token.canonical_bytes().map_err(reject)?;

        if response.config.is_some() {
            debug!(agent_id = %self.agent_id, "bootstrap response carries auxiliary config");
        }

        Ok(IdentityBundle {
            ltac_der,
            ltac_key_der: pending.key_der,
            sca_der,
            revocation_token: response.revocation_token,
            revocation_canonical,
        })
    }

    /// Discard an in-flight bootstrap attempt
    ///
    /// Drops the pending key and any captured issuing authority. The stored
    /// identity is untouched.
    pub async fn reset_bootstrap(&self) {
        let had_key = self.pending_key.clear();
        let had_sca = self.sca.discard();
        if had_key || had_sca {
            debug!(
                agent_id = %self.agent_id,
                pending_key = had_key,
                issuing_authority = had_sca,
                "discarded in-flight bootstrap material"
            );
        }
        self.transition(self.resting_state().await);
    }

    // ------------------------------------------------------------------
    // Steady state
    // ------------------------------------------------------------------

    /// Answer a binary-integrity challenge
    ///
    /// Allowed once per connection, from `Provisioned` only.
    pub fn prepare_challenge_response(&self, request: &ChallengeRequest) -> Result<HandshakeMessage> {
        let phase = Phase::Challenge;
        if request.nonce.is_empty() {
            return Err(HardeningError::protocol(phase, "empty challenge nonce"));
        }
        self.transition_from(
            phase,
            &[HandshakeState::Provisioned],
            HandshakeState::ChallengeInFlight,
        )?;

        let abh = self.abh.binary_hash();
        let ciphertext = ChallengeKey::derive(&self.agent_id, &abh).seal(&request.nonce)?;
        debug!(agent_id = %self.agent_id, "challenge answered");
        Ok(HandshakeMessage::ChallengeResponse(ChallengeResponse { ciphertext }))
    }

    /// Handle the server's verdict after the challenge
    ///
    /// A connection start has its revocation token checked against the root
    /// authority and the token bound at bootstrap; any failure there erases
    /// the identity. A tunnel-integrity failure from the server erases it
    /// too. Other failures return the machine to `Provisioned`.
    pub async fn process_connection_request(
        &self,
        message: HandshakeMessage,
        negotiator: &dyn TunnelNegotiator,
    ) -> Result<HandshakeMessage> {
        let result = match message {
            HandshakeMessage::ConnectionStart(start) => self.accept_connection(start, negotiator).await,
            HandshakeMessage::AuthFailure(failure) => Err(self.refused(failure).await),
            other => Err(HardeningError::protocol(
                Phase::Connection,
                format!("expected connection_start, got {}", other.kind()),
            )),
        };

        match result {
            Ok(()) => {
                self.transition(HandshakeState::Authenticated);
                info!(agent_id = %self.agent_id, "connection authenticated");
                Ok(HandshakeMessage::ConnectionStartAck(ConnectionStartAck {}))
            }
            Err(e) => {
                if !e.identity_reset() {
                    self.transition(self.resting_state().await);
                }
                Err(e)
            }
        }
    }

    async fn accept_connection(
        &self,
        start: ConnectionStart,
        negotiator: &dyn TunnelNegotiator,
    ) -> Result<()> {
        let phase = Phase::Connection;
        let state = self.state();
        if state != HandshakeState::ChallengeInFlight {
            return Err(HardeningError::UnexpectedState { phase, state });
        }

        let bundle = self.store.get().await?;
        let token = match self.verifier.verify(&start.revocation_token) {
            Ok(token) => token,
            Err(source) => return Err(self.revoked(source).await),
        };
        match token.matches_bound(&bundle.revocation_canonical) {
            Ok(true) => {}
            Ok(false) => return Err(self.revoked(RevocationError::Mismatch).await),
            Err(source) => return Err(self.revoked(source).await),
        }

        negotiator
            .negotiate(&start.tunnel)
            .await
            .map_err(|message| HardeningError::Tunnel { message })?;
        debug!(agent_id = %self.agent_id, tunnel = %start.tunnel.kind, "tunnel negotiated");
        Ok(())
    }

    async fn revoked(&self, source: RevocationError) -> HardeningError {
        warn!(
            agent_id = %self.agent_id,
            error = %source,
            "presented revocation token rejected, erasing identity"
        );
        HardeningError::RevocationRejected {
            phase: Phase::Connection,
            source,
            reset: self.erase_identity().await,
        }
    }

    async fn refused(&self, failure: AuthFailure) -> HardeningError {
        let reset = if failure.requires_reset() {
            warn!(
                agent_id = %self.agent_id,
                reason = ?failure.reason,
                "server reported tunnel integrity failure, erasing identity"
            );
            self.erase_identity().await
        } else {
            info!(agent_id = %self.agent_id, reason = ?failure.reason, "server refused connection");
            false
        };
        HardeningError::AuthenticationFailed {
            reason: failure.reason,
            message: failure.message,
            reset,
        }
    }

    async fn erase_identity(&self) -> bool {
        match self.reset().await {
            Ok(()) => true,
            Err(e) => {
                error!(agent_id = %self.agent_id, error = %e, "failed to erase identity");
                false
            }
        }
    }

    /// Return to `Provisioned` after the connection ends
    pub async fn disconnect(&self) {
        let state = self.state();
        if matches!(
            state,
            HandshakeState::ChallengeInFlight | HandshakeState::Authenticated
        ) {
            self.transition(self.resting_state().await);
        }
    }

    /// Echo a liveness probe
    pub fn generate_ping_response(&self, ping: &Ping) -> HandshakeMessage {
        HandshakeMessage::Pong(ping.clone())
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Erase the stored identity and any in-flight bootstrap material
    ///
    /// Idempotent.
    pub async fn reset(&self) -> Result<()> {
        self.store.reset().await?;
        self.pending_key.clear();
        self.sca.discard();
        self.transition(HandshakeState::Uninitialized);
        info!(agent_id = %self.agent_id, "identity reset");
        Ok(())
    }
}

impl std::fmt::Debug for HardeningStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardeningStateMachine")
            .field("agent_id", &self.agent_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn missing(phase: Phase, err: SlotError) -> HardeningError {
    let slot = match err {
        SlotError::Empty { slot } | SlotError::Occupied { slot } => slot,
    };
    HardeningError::MissingState { phase, slot }
}
