//! Agent configuration
//!
//! Command-line arguments with environment fallbacks. Trust material is
//! read from PEM files at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use keystone_common::{AgentId, DEFAULT_SERVER_NAME};

use crate::error::{HardeningError, Result};
use crate::handshake::{HandshakeTimeouts, DEFAULT_POLL_INTERVAL};
use crate::tls::TrustMaterial;

/// Default identity store directory
pub const DEFAULT_STORE_DIR: &str = "/var/lib/keystone";

/// Where the agent's identity lives
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Agent identifier (32 lowercase hex characters)
    #[arg(long, env = "KEYSTONE_AGENT_ID")]
    pub agent_id: AgentId,

    /// Directory holding the encrypted identity blob
    #[arg(long, env = "KEYSTONE_STORE_DIR", default_value = DEFAULT_STORE_DIR)]
    pub store_dir: PathBuf,
}

/// Full agent configuration
#[derive(Args, Debug, Clone)]
pub struct AgentConfig {
    #[command(flatten)]
    #[allow(missing_docs)]
    pub store: StoreArgs,

    /// Root authority certificate (PEM)
    #[arg(long, env = "KEYSTONE_ROOT_CA")]
    pub root_ca: PathBuf,

    /// Installation certificate chain (PEM, leaf first)
    #[arg(long, env = "KEYSTONE_IAC_CERT")]
    pub installation_cert: PathBuf,

    /// Installation private key (PEM, PKCS#8)
    #[arg(long, env = "KEYSTONE_IAC_KEY")]
    pub installation_key: PathBuf,

    /// Server name used for SNI and certificate validation
    #[arg(long, env = "KEYSTONE_SERVER_NAME", default_value = DEFAULT_SERVER_NAME)]
    pub server_name: String,

    /// Maximum wait for each handshake message, in seconds
    #[arg(long, env = "KEYSTONE_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Expected interval between server pings, in seconds
    #[arg(long, env = "KEYSTONE_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,
}

impl AgentConfig {
    /// Load the root authority and installation identity
    pub async fn trust_material(&self) -> Result<TrustMaterial> {
        let root_pem = read_pem(&self.root_ca).await?;
        let chain_pem = read_pem(&self.installation_cert).await?;
        let key_pem = zeroize::Zeroizing::new(read_pem(&self.installation_key).await?);
        TrustMaterial::from_pem(&root_pem, &chain_pem, &key_pem, self.server_name.clone())
    }

    /// Bounded-wait parameters for the handshake driver
    pub fn timeouts(&self) -> HandshakeTimeouts {
        HandshakeTimeouts {
            deadline: Duration::from_secs(self.handshake_timeout_secs),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Expected ping interval
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

async fn read_pem(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| HardeningError::Trust(format!("failed to read {}: {}", path.display(), e)))
}
