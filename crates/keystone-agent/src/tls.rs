//! Phase-specific TLS configuration
//!
//! Bootstrap authenticates with the installation certificate and captures
//! the issuing authority from the server chain; steady-state authenticates
//! with the long-term identity loaded from the store. Both trust only the
//! root authority and pin the same server name.

use std::sync::Arc;

use keystone_infra::mtls::{self, ScaSender, TlsIdentity};
use keystone_infra::pki;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tracing::{debug, warn};

use crate::error::{HardeningError, Result};
use crate::store::IdentityStore;

/// Out-of-band trust material baked into the agent
#[derive(Debug, Clone)]
pub struct TrustMaterial {
    root_der: Vec<u8>,
    installation: TlsIdentity,
    server_name: String,
}

impl TrustMaterial {
    /// Build from DER root authority and an installation identity
    pub fn new(
        root_der: Vec<u8>,
        installation: TlsIdentity,
        server_name: impl Into<String>,
    ) -> Result<Self> {
        let server_name = server_name.into();
        mtls::root_store(&root_der).map_err(|e| HardeningError::Trust(e.to_string()))?;
        mtls::server_name(&server_name).map_err(|e| HardeningError::Trust(e.to_string()))?;
        Ok(Self {
            root_der,
            installation,
            server_name,
        })
    }

    /// Build from PEM root authority, installation chain and key
    pub fn from_pem(
        root_pem: &str,
        installation_chain_pem: &str,
        installation_key_pem: &str,
        server_name: impl Into<String>,
    ) -> Result<Self> {
        let root_der = pki::parse_pem(root_pem)
            .map_err(|e| HardeningError::Trust(format!("root authority: {}", e)))?;
        let installation = TlsIdentity::from_pem(installation_chain_pem, installation_key_pem)
            .map_err(|e| HardeningError::Trust(format!("installation identity: {}", e)))?;
        Self::new(root_der, installation, server_name)
    }

    /// DER root authority certificate
    pub fn root_der(&self) -> &[u8] {
        &self.root_der
    }

    /// Installation identity presented during bootstrap
    pub fn installation(&self) -> &TlsIdentity {
        &self.installation
    }

    /// Server name pinned for SNI and certificate validation
    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// A client configuration together with the server name to connect as
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    /// rustls client configuration
    pub client: Arc<ClientConfig>,
    /// Pinned server name
    pub server_name: ServerName<'static>,
}

/// Produces TLS client configurations for each handshake phase
pub struct TlsConfigurer {
    trust: Arc<TrustMaterial>,
    store: Arc<IdentityStore>,
    capture: ScaSender,
}

impl TlsConfigurer {
    /// Create a configurer; captured issuing authorities go to `capture`
    pub fn new(trust: Arc<TrustMaterial>, store: Arc<IdentityStore>, capture: ScaSender) -> Self {
        Self {
            trust,
            store,
            capture,
        }
    }

    fn server_name(&self) -> Result<ServerName<'static>> {
        Ok(mtls::server_name(self.trust.server_name())?)
    }

    /// Configuration for the bootstrap phase
    ///
    /// Authenticates with the installation certificate and installs the
    /// issuing-authority capturing verifier. Each call starts a fresh
    /// attempt: a capture left pending by an earlier failed handshake is
    /// dropped.
    pub fn config_for_bootstrap(&self) -> Result<PhaseConfig> {
        if self.capture.discard_stale() {
            warn!("dropped issuing authority left by an earlier bootstrap attempt");
        }
        let client = mtls::bootstrap_client_config(
            self.trust.root_der(),
            self.trust.installation(),
            self.capture.clone(),
        )?;
        debug!(server_name = %self.trust.server_name(), "bootstrap TLS config ready");
        Ok(PhaseConfig {
            client: Arc::new(client),
            server_name: self.server_name()?,
        })
    }

    /// Configuration for the steady-state phase
    ///
    /// Authenticates with the long-term identity (LTAC followed by the bound
    /// issuing authority). Fails with [`HardeningError::NotProvisioned`]
    /// when the store holds no identity.
    pub async fn config_for_connection(&self) -> Result<PhaseConfig> {
        let bundle = self.store.get().await?;
        let identity = TlsIdentity::from_der(
            vec![bundle.ltac_der.clone(), bundle.sca_der.clone()],
            &bundle.ltac_key_der,
        )?;
        let client = mtls::connection_client_config(self.trust.root_der(), &identity)?;
        debug!(
            agent_id = %self.store.agent_id(),
            server_name = %self.trust.server_name(),
            "connection TLS config ready"
        );
        Ok(PhaseConfig {
            client: Arc::new(client),
            server_name: self.server_name()?,
        })
    }
}
