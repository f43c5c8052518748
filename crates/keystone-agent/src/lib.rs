//! Keystone Agent - hardening protocol client
//!
//! This crate provides the agent side of the two-phase mutual-trust
//! handshake:
//!
//! - **Binary identity**: digest of the running executable ([`abh`])
//! - **Identity store**: encrypted at-rest long-term identity ([`store`])
//! - **TLS phases**: bootstrap vs. steady-state client configs ([`tls`])
//! - **State machine**: bootstrap, challenge-response and revocation checks
//!   ([`machine`])
//! - **Driver**: bounded-wait message exchange over a transport
//!   ([`handshake`]); once authenticated, [`HandshakeDriver::serve`] answers
//!   pings under the liveness watchdog ([`pingee`])
//!
//! # Architecture
//!
//! Each component is independently testable and owned by the caller; the
//! [`HardeningStateMachine`] composes them. The TLS layer and the state
//! machine share nothing but the issuing-authority handoff created by
//! [`assemble`].

#![deny(missing_docs)]

use std::sync::Arc;

use keystone_common::AgentId;

pub mod abh;
pub mod config;
pub mod error;
pub mod handshake;
pub mod machine;
pub mod pingee;
pub mod store;
pub mod tls;

pub use abh::{BinaryHashSource, ExecutableHasher, FixedBinaryHash};
pub use config::{AgentConfig, StoreArgs};
pub use error::{HardeningError, Result};
pub use handshake::{HandshakeDriver, HandshakeTimeouts};
pub use machine::{AgentInfo, HandshakeState, HardeningStateMachine, TunnelNegotiator};
pub use pingee::Pingee;
pub use store::{IdentityBundle, IdentityStore, StoreError};
pub use tls::{PhaseConfig, TlsConfigurer, TrustMaterial};

/// The agent-side components wired together
pub struct Hardening {
    /// Phase-specific TLS configurations
    pub tls: TlsConfigurer,
    /// Handshake orchestrator
    pub machine: HardeningStateMachine,
    /// Encrypted identity store shared by both
    pub store: Arc<IdentityStore>,
}

/// Wire a TLS configurer and a state machine around one identity store
///
/// The state machine starts in `Provisioned` if the store already holds an
/// identity, `Uninitialized` otherwise.
pub async fn assemble(
    agent_id: AgentId,
    trust: Arc<TrustMaterial>,
    store_dir: impl Into<std::path::PathBuf>,
    abh: Arc<dyn BinaryHashSource>,
) -> Result<Hardening> {
    let store = Arc::new(IdentityStore::new(store_dir, agent_id.clone()));
    let (sca_tx, sca_rx) = keystone_infra::mtls::sca_handoff();

    let tls = TlsConfigurer::new(Arc::clone(&trust), Arc::clone(&store), sca_tx);
    let machine =
        HardeningStateMachine::new(agent_id, &trust, Arc::clone(&store), abh, sca_rx).await?;

    Ok(Hardening {
        tls,
        machine,
        store,
    })
}
