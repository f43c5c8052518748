//! PKI operations for the hardening protocol
//!
//! The trust hierarchy has three tiers:
//!
//! - **Root authority** (distributed out of band to every agent)
//! - **Issuing authority** (SCA), an intermediate signed by the root. It
//!   signs the server certificate and every long-term agent certificate.
//!   Agents never receive it out of band; they learn it from the server's
//!   chain during bootstrap.
//! - **Leaves**: the server certificate, installation certificates (IAC)
//!   and long-term agent certificates (LTAC)
//!
//! # Security Model
//!
//! - Agents generate their own key pairs locally and send only CSRs
//! - CSR signatures are checked before anything is issued
//! - An LTAC is only accepted if it carries the agent's pending public key
//!   and chains leaf → SCA → root

use keystone_common::AgentId;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    SignatureAlgorithm,
};
use thiserror::Error;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

/// Validity period for authority certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for leaf certificates (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Common name prefix of long-term agent certificates
pub const AGENT_CN_PREFIX: &str = "keystone-agent-";

const ORGANIZATION: &str = "Keystone";

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Signature of a certificate does not verify against its claimed issuer
    #[error("certificate {subject} is not signed by {issuer}")]
    NotIssuedBy {
        /// Subject of the certificate being checked
        subject: String,
        /// Subject of the claimed issuer
        issuer: String,
    },

    /// Certificate carries a different public key than expected
    #[error("certificate public key does not match the expected key")]
    KeyMismatch,
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Parse every PEM block in `pem_data`, in order
pub fn parse_pem_chain(pem_data: &str) -> Result<Vec<Vec<u8>>> {
    let blocks = ::pem::parse_many(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM chain: {}", e)))?;
    if blocks.is_empty() {
        return Err(PkiError::ParseError("no PEM blocks found".to_string()));
    }
    Ok(blocks.iter().map(|b| b.contents().to_vec()).collect())
}

/// Encode DER bytes as a PEM certificate
pub fn der_to_pem(der: &[u8]) -> String {
    ::pem::encode(&::pem::Pem::new("CERTIFICATE", der.to_vec()))
}

fn parse_cert<'a>(der: &'a [u8], what: &str) -> Result<X509Certificate<'a>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| PkiError::ParseError(format!("failed to parse {}: {}", what, e)))
}

fn subject_cn(cert: &X509Certificate<'_>) -> String {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Verify that `cert_der` was signed by the key in `issuer_der`
pub fn verify_issued_by(cert_der: &[u8], issuer_der: &[u8]) -> Result<()> {
    let cert = parse_cert(cert_der, "certificate")?;
    let issuer = parse_cert(issuer_der, "issuer certificate")?;

    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|_| PkiError::NotIssuedBy {
            subject: subject_cn(&cert),
            issuer: subject_cn(&issuer),
        })
}

/// Check that a certificate carries the given raw public key
pub fn verify_public_key(cert_der: &[u8], public_key_raw: &[u8]) -> Result<()> {
    let cert = parse_cert(cert_der, "certificate")?;
    if cert.public_key().subject_public_key.data.as_ref() != public_key_raw {
        return Err(PkiError::KeyMismatch);
    }
    Ok(())
}

/// Extract the agent id from a long-term agent certificate's CN
pub fn extract_agent_id(cert_der: &[u8]) -> Result<AgentId> {
    let cert = parse_cert(cert_der, "agent certificate")?;
    let cn = subject_cn(&cert);
    let raw = cn.strip_prefix(AGENT_CN_PREFIX).ok_or_else(|| {
        PkiError::ParseError(format!(
            "invalid CN format, expected {}<agent_id>",
            AGENT_CN_PREFIX
        ))
    })?;
    AgentId::parse(raw).map_err(|e| PkiError::ParseError(format!("invalid agent id in CN: {}", e)))
}

/// Key algorithm for generated authorities and leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyAlgorithm {
    /// ECDSA P-256 with SHA-256
    #[default]
    EcdsaP256,
    /// Ed25519
    Ed25519,
}

impl KeyAlgorithm {
    fn signature_algorithm(&self) -> &'static SignatureAlgorithm {
        match self {
            KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }

    fn generate(&self, what: &str) -> Result<KeyPair> {
        KeyPair::generate_for(self.signature_algorithm()).map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate {} key: {}", what, e))
        })
    }
}

/// A certificate authority (root or issuing intermediate)
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: Zeroizing<String>,
    /// PEM-encoded CA certificate
    ca_cert_pem: String,
    algorithm: KeyAlgorithm,
}

impl CertificateAuthority {
    /// Create a new self-signed root authority with ECDSA P-256 keys
    pub fn new(common_name: &str) -> Result<Self> {
        Self::new_with_algorithm(common_name, KeyAlgorithm::default())
    }

    /// Create a new self-signed root authority
    pub fn new_with_algorithm(common_name: &str, algorithm: KeyAlgorithm) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = algorithm.generate("CA")?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pair.serialize_pem()),
            ca_cert_pem: cert.pem(),
            algorithm,
        })
    }

    /// Load an authority from PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let _ = parse_pem(cert_pem)?;

        let algorithm = if key.algorithm() == &rcgen::PKCS_ED25519 {
            KeyAlgorithm::Ed25519
        } else {
            KeyAlgorithm::EcdsaP256
        };

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pem.to_string()),
            ca_cert_pem: cert_pem.to_string(),
            algorithm,
        })
    }

    /// PEM-encoded authority certificate
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// DER-encoded authority certificate
    pub fn ca_cert_der(&self) -> Result<Vec<u8>> {
        parse_pem(&self.ca_cert_pem)
    }

    /// PEM-encoded authority private key
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// PKCS#8 DER of the authority private key
    pub fn ca_key_pkcs8(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(self.load_key_pair()?.serialize_der()))
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    fn sign(&self, params: CertificateParams, subject_key: &KeyPair) -> Result<String> {
        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let cert = params.signed_by(subject_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;
        Ok(cert.pem())
    }

    /// Issue an intermediate authority that may only sign leaves
    pub fn issue_intermediate(&self, common_name: &str) -> Result<CertificateAuthority> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = self.algorithm.generate("intermediate CA")?;
        let ca_cert_pem = self.sign(params, &key_pair)?;

        Ok(Self {
            ca_key_pem: Zeroizing::new(key_pair.serialize_pem()),
            ca_cert_pem,
            algorithm: self.algorithm,
        })
    }

    /// Generate a TLS server certificate for the given SANs
    ///
    /// Returns `(cert_pem, key_pem)`.
    pub fn generate_server_cert(&self, sans: &[&str]) -> Result<(String, Zeroizing<String>)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name("Keystone Server");
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.to_string())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let server_key = self.algorithm.generate("server")?;
        let cert_pem = self.sign(params, &server_key)?;
        Ok((cert_pem, Zeroizing::new(server_key.serialize_pem())))
    }

    /// Generate an installation certificate baked into agent builds
    ///
    /// Returns `(cert_pem, key_pem)`.
    pub fn generate_installation_cert(
        &self,
        build_id: &str,
    ) -> Result<(String, Zeroizing<String>)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&format!("keystone-install-{}", build_id));
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key = self.algorithm.generate("installation")?;
        let cert_pem = self.sign(params, &key)?;
        Ok((cert_pem, Zeroizing::new(key.serialize_pem())))
    }

    /// Sign an agent CSR and return the long-term certificate in PEM format
    ///
    /// The CSR's own signature is verified while parsing, so a request whose
    /// signature does not match its public key is rejected here. Subject,
    /// validity and extensions are always overridden.
    pub fn sign_csr(&self, csr_pem: &str, agent_id: &AgentId) -> Result<String> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

        let agent_cn = format!("{}{}", AGENT_CN_PREFIX, agent_id);
        csr_params.params.distinguished_name = distinguished_name(&agent_cn);
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;
        csr_params.params.subject_alt_names =
            vec![SanType::DnsName(Ia5String::try_from(agent_cn.clone()).map_err(
                |e| {
                    PkiError::CertificateGenerationFailed(format!(
                        "invalid agent DNS name '{}': {}",
                        agent_cn, e
                    ))
                },
            )?)];

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
        let signed_cert = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(signed_cert.pem())
    }
}

/// Agent certificate request (generates keypair and CSR locally)
pub struct AgentCertRequest {
    /// PKCS#8 DER of the private key (never leaves the agent)
    key_der: Zeroizing<Vec<u8>>,
    /// Raw public key, matched against the issued certificate
    public_key_raw: Vec<u8>,
    /// CSR in PEM format (sent to the server)
    csr_pem: String,
}

impl AgentCertRequest {
    /// Generate a new ECDSA P-256 key pair and CSR for an agent
    pub fn new(agent_id: &AgentId) -> Result<Self> {
        Self::new_with_algorithm(agent_id, KeyAlgorithm::default())
    }

    /// Generate a new key pair of the given algorithm and a CSR for an agent
    pub fn new_with_algorithm(agent_id: &AgentId, algorithm: KeyAlgorithm) -> Result<Self> {
        let key_pair = algorithm.generate("agent")?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&format!("{}{}", AGENT_CN_PREFIX, agent_id));

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self {
            key_der: Zeroizing::new(key_pair.serialize_der()),
            public_key_raw: key_pair.public_key_raw().to_vec(),
            csr_pem,
        })
    }

    /// The CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// The raw public key embedded in the CSR
    pub fn public_key_raw(&self) -> &[u8] {
        &self.public_key_raw
    }

    /// The PKCS#8 private key
    pub fn private_key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// Consume the request, keeping only the private key
    pub fn into_private_key(self) -> Zeroizing<Vec<u8>> {
        self.key_der
    }
}

impl std::fmt::Debug for AgentCertRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCertRequest")
            .field("csr_pem", &self.csr_pem)
            .field("key_der", &"[REDACTED]")
            .finish()
    }
}
