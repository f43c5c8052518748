//! mTLS configuration for agent ↔ server connections
//!
//! All configurations are TLS 1.3 only, built on the aws-lc-rs provider with
//! the key-exchange groups pinned to X25519, P-256 and P-384.
//!
//! # Bootstrap capture
//!
//! During bootstrap the agent knows only the root authority, but the server
//! presents `[leaf, issuing authority]`. [`ScaCapturingVerifier`] validates
//! that chain against the root, insists on exactly that shape (two raw
//! certificates, one verified chain of three) and hands the issuing
//! authority to the state machine over a single-message channel. The TLS
//! callback is synchronous, so the handoff uses a bounded channel of one
//! that fails instead of blocking when a capture is already pending.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::pki::{parse_pem, parse_pem_chain, verify_issued_by};

/// Raw certificates the server must present during bootstrap
pub const BOOTSTRAP_RAW_CHAIN_LEN: usize = 2;

/// Length of the verified bootstrap chain (leaf, issuing authority, root)
pub const BOOTSTRAP_VERIFIED_CHAIN_LEN: usize = 3;

/// mTLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    CertificateParseError(String),

    /// Key parsing error
    #[error("key parsing error: {0}")]
    KeyParseError(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfigError(String),

    /// Server chain does not have the bootstrap shape
    #[error("unexpected bootstrap chain: {0}")]
    ChainShape(String),

    /// A captured issuing authority is still waiting to be consumed
    #[error("an issuing authority capture is already pending")]
    ScaAlreadyPending,

    /// No issuing authority has been captured
    #[error("no issuing authority has been captured")]
    ScaMissing,

    /// The consuming side of the capture handoff is gone
    #[error("issuing authority handoff closed")]
    ScaHandoffClosed,
}

/// Result type for mTLS operations
pub type Result<T> = std::result::Result<T, MtlsError>;

/// aws-lc-rs provider with the pinned key-exchange preference list
pub fn crypto_provider() -> Arc<CryptoProvider> {
    let mut provider = aws_lc_rs::default_provider();
    provider.kx_groups = vec![
        aws_lc_rs::kx_group::X25519,
        aws_lc_rs::kx_group::SECP256R1,
        aws_lc_rs::kx_group::SECP384R1,
    ];
    Arc::new(provider)
}

/// Validate a server name used as the SNI/verification anchor
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| MtlsError::TlsConfigError(format!("invalid server name '{}': {}", name, e)))
}

/// Root store containing only the root authority
pub fn root_store(root_der: &[u8]) -> Result<Arc<RootCertStore>> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(root_der.to_vec()))
        .map_err(|e| MtlsError::CertificateParseError(format!("invalid root authority: {}", e)))?;
    Ok(Arc::new(roots))
}

/// Certificate chain and private key presented as a TLS client or server
pub struct TlsIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Build from DER certificates (leaf first) and a PKCS#8 key
    pub fn from_der(cert_chain: Vec<Vec<u8>>, key_pkcs8: &[u8]) -> Result<Self> {
        if cert_chain.is_empty() {
            return Err(MtlsError::CertificateParseError(
                "identity has no certificates".to_string(),
            ));
        }
        Ok(Self {
            cert_chain: cert_chain.into_iter().map(CertificateDer::from).collect(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pkcs8.to_vec())),
        })
    }

    /// Build from a PEM chain (leaf first) and a PEM PKCS#8 key
    pub fn from_pem(cert_chain_pem: &str, key_pem: &str) -> Result<Self> {
        let chain = parse_pem_chain(cert_chain_pem)
            .map_err(|e| MtlsError::CertificateParseError(e.to_string()))?;
        let key = Zeroizing::new(
            parse_pem(key_pem).map_err(|e| MtlsError::KeyParseError(e.to_string()))?,
        );
        Self::from_der(chain, &key)
    }

    /// Certificates, leaf first
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    fn parts(&self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        (self.cert_chain.clone(), self.key.clone_key())
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        let (cert_chain, key) = self.parts();
        Self { cert_chain, key }
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certificates", &self.cert_chain.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Create the issuing-authority handoff between the TLS layer and its consumer
pub fn sca_handoff() -> (ScaSender, ScaReceiver) {
    let (tx, rx) = mpsc::channel(1);
    let rx = Arc::new(Mutex::new(rx));
    (
        ScaSender {
            tx,
            pending: Arc::downgrade(&rx),
        },
        ScaReceiver { rx },
    )
}

/// Producing side of the issuing-authority handoff
#[derive(Debug, Clone)]
pub struct ScaSender {
    tx: mpsc::Sender<CertificateDer<'static>>,
    pending: Weak<Mutex<mpsc::Receiver<CertificateDer<'static>>>>,
}

impl ScaSender {
    /// Hand over a captured issuing authority
    ///
    /// Fails if a previous capture has not been consumed yet.
    pub fn offer(&self, sca: CertificateDer<'static>) -> Result<()> {
        match self.tx.try_send(sca) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(MtlsError::ScaAlreadyPending),
            Err(TrySendError::Closed(_)) => Err(MtlsError::ScaHandoffClosed),
        }
    }

    /// Drop a capture left behind by an earlier attempt
    ///
    /// A handshake can fail after the verifier ran, leaving its capture
    /// queued with nobody to consume it. Returns whether one was dropped.
    pub fn discard_stale(&self) -> bool {
        self.pending
            .upgrade()
            .is_some_and(|rx| try_take(&rx).is_some())
    }
}

/// Consuming side of the issuing-authority handoff
#[derive(Debug)]
pub struct ScaReceiver {
    rx: Arc<Mutex<mpsc::Receiver<CertificateDer<'static>>>>,
}

impl ScaReceiver {
    /// Take the captured issuing authority
    pub fn take(&self) -> Result<CertificateDer<'static>> {
        try_take(&self.rx).ok_or(MtlsError::ScaMissing)
    }

    /// Drop any pending capture. Returns whether one was discarded.
    pub fn discard(&self) -> bool {
        self.take().is_ok()
    }
}

fn try_take(
    rx: &Mutex<mpsc::Receiver<CertificateDer<'static>>>,
) -> Option<CertificateDer<'static>> {
    let mut rx = rx.lock().unwrap_or_else(|e| e.into_inner());
    match rx.try_recv() {
        Ok(sca) => Some(sca),
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
    }
}

/// Server certificate verifier that captures the issuing authority
///
/// Full WebPKI validation against the root authority (including the server
/// name) runs first; the chain-shape rules are layered on top.
pub struct ScaCapturingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    root_der: Vec<u8>,
    capture: ScaSender,
}

impl ScaCapturingVerifier {
    /// Create a verifier trusting only `root_der`
    pub fn new(root_der: &[u8], capture: ScaSender) -> Result<Self> {
        let inner =
            WebPkiServerVerifier::builder_with_provider(root_store(root_der)?, crypto_provider())
                .build()
                .map_err(|e| {
                    MtlsError::TlsConfigError(format!("failed to build server verifier: {}", e))
                })?;
        Ok(Self {
            inner,
            root_der: root_der.to_vec(),
            capture,
        })
    }

    fn check_chain_shape(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<CertificateDer<'static>> {
        let raw_len = 1 + intermediates.len();
        if raw_len != BOOTSTRAP_RAW_CHAIN_LEN {
            return Err(MtlsError::ChainShape(format!(
                "expected {} raw certificates, got {}",
                BOOTSTRAP_RAW_CHAIN_LEN, raw_len
            )));
        }
        let sca = &intermediates[0];

        // The verified path must be leaf → issuing authority → root. A leaf
        // signed directly by the root would verify with a chain of two.
        verify_issued_by(end_entity.as_ref(), sca.as_ref()).map_err(|e| {
            MtlsError::ChainShape(format!(
                "verified chain is not {} certificates long: {}",
                BOOTSTRAP_VERIFIED_CHAIN_LEN, e
            ))
        })?;
        verify_issued_by(sca.as_ref(), &self.root_der).map_err(|e| {
            MtlsError::ChainShape(format!("issuing authority not signed by root: {}", e))
        })?;

        Ok(sca.clone().into_owned())
    }
}

impl fmt::Debug for ScaCapturingVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScaCapturingVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for ScaCapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let verified = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;

        let sca = self.check_chain_shape(end_entity, intermediates).map_err(|e| {
            warn!(error = %e, "rejecting bootstrap server chain");
            rustls::Error::General(e.to_string())
        })?;

        self.capture.offer(sca).map_err(|e| {
            warn!(error = %e, "issuing authority capture failed");
            rustls::Error::General(e.to_string())
        })?;

        info!("captured issuing authority from bootstrap handshake");
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn client_builder() -> Result<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>> {
    ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| MtlsError::TlsConfigError(format!("unsupported protocol versions: {}", e)))
}

/// Client configuration for bootstrap: installation identity, root trust,
/// issuing-authority capture
pub fn bootstrap_client_config(
    root_der: &[u8],
    identity: &TlsIdentity,
    capture: ScaSender,
) -> Result<ClientConfig> {
    let verifier = ScaCapturingVerifier::new(root_der, capture)?;
    let (chain, key) = identity.parts();

    debug!(certificates = chain.len(), "building bootstrap client config");
    let mut config = client_builder()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(chain, key)
        .map_err(|e| MtlsError::KeyParseError(format!("invalid client identity: {}", e)))?;

    // A resumed session skips certificate verification, so nothing would be
    // captured and the chain shape would go unchecked.
    config.resumption = rustls::client::Resumption::disabled();
    config.enable_early_data = false;
    Ok(config)
}

/// Client configuration for steady-state: long-term identity, root trust
pub fn connection_client_config(root_der: &[u8], identity: &TlsIdentity) -> Result<ClientConfig> {
    let (chain, key) = identity.parts();

    debug!(certificates = chain.len(), "building connection client config");
    client_builder()?
        .with_root_certificates(root_store(root_der)?)
        .with_client_auth_cert(chain, key)
        .map_err(|e| MtlsError::KeyParseError(format!("invalid client identity: {}", e)))
}

/// Server-side mTLS configuration
pub struct ServerMtlsConfig {
    /// Server certificate chain PEM (leaf, then issuing authority)
    pub server_cert_pem: String,
    /// Server private key PEM (zeroized on drop)
    pub server_key_pem: Zeroizing<String>,
    /// Root authority PEM for verifying clients
    pub ca_cert_pem: String,
}

impl ServerMtlsConfig {
    /// Create a new server mTLS config
    pub fn new(
        server_cert_pem: String,
        server_key_pem: Zeroizing<String>,
        ca_cert_pem: String,
    ) -> Self {
        Self {
            server_cert_pem,
            server_key_pem,
            ca_cert_pem,
        }
    }

    /// Build a rustls server config that requires a client certificate
    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let identity = TlsIdentity::from_pem(&self.server_cert_pem, &self.server_key_pem)?;
        let root_der = parse_pem(&self.ca_cert_pem)
            .map_err(|e| MtlsError::CertificateParseError(e.to_string()))?;

        let provider = crypto_provider();
        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(root_store(&root_der)?, provider.clone())
                .build()
                .map_err(|e| {
                    MtlsError::TlsConfigError(format!("failed to build client verifier: {}", e))
                })?;

        let (chain, key) = identity.parts();
        ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| MtlsError::TlsConfigError(format!("unsupported protocol versions: {}", e)))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(chain, key)
            .map_err(|e| MtlsError::KeyParseError(format!("invalid server identity: {}", e)))
    }
}
