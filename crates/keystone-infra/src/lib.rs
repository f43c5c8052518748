//! Cryptographic and TLS infrastructure for keystone
//!
//! Everything here is shared by the agent and the server side of the
//! hardening protocol, so both derive byte-identical keys:
//!
//! - **Crypto**: challenge and store key derivation, AEAD sealing, hashing
//! - **PKI**: authority creation, CSR generation and signing, chain checks
//! - **Revocation**: signed revocation token verification and issuance
//! - **mTLS**: rustls configurations for bootstrap and steady-state, and the
//!   verifier that captures the issuing authority during bootstrap
//! - **Challenge**: server-side binary-integrity challenge verification
//!
//! All primitives come from aws-lc-rs.

pub mod challenge;
pub mod crypto;
pub mod mtls;
pub mod pki;
pub mod revocation;

pub use crypto::{ChallengeKey, CryptoError, StoreKey};
pub use mtls::{MtlsError, ScaReceiver, ScaSender, ServerMtlsConfig, TlsIdentity};
pub use pki::{AgentCertRequest, CertificateAuthority, PkiError};
pub use revocation::{RevocationError, RevocationSigner, RevocationToken, RevocationVerifier};
