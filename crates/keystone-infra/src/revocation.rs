//! Revocation token verification
//!
//! A revocation token is a compact JWS (`header.payload.signature`) issued
//! offline by the holder of the root authority key. Its claims are a base64
//! nonce and an expiry:
//!
//! ```json
//! {"nonce": "q83vEjRWeJA=", "exp": 1767225600}
//! ```
//!
//! The verifier takes its public key from the root authority certificate, so
//! the signing algorithm follows the root key: `ES256` for P-256 roots and
//! `EdDSA` for Ed25519 roots.
//!
//! A token bound at bootstrap is compared to freshly presented ones through
//! [`RevocationToken::canonical_bytes`], which re-serializes only the claims.

use std::time::{SystemTime, UNIX_EPOCH};

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use x509_parser::prelude::*;

use crate::crypto::constant_time_eq;
use crate::pki::parse_pem;

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_ED25519: &str = "1.3.101.112";
const P256_UNCOMPRESSED_LEN: usize = 65;

/// Revocation token errors
#[derive(Debug, Error)]
pub enum RevocationError {
    /// Token structure or claims could not be decoded
    #[error("malformed revocation token: {0}")]
    Malformed(String),

    /// Header names an algorithm the root key cannot verify
    #[error("unsupported token algorithm {found}, root authority requires {expected}")]
    UnsupportedAlgorithm {
        /// Algorithm required by the root key
        expected: &'static str,
        /// Algorithm named in the token header
        found: String,
    },

    /// Signature does not verify against the root authority
    #[error("revocation token signature verification failed")]
    BadSignature,

    /// Token expiry is in the past
    #[error("revocation token expired at {expired_at} (now {now})")]
    Expired {
        /// Expiry claim
        expired_at: u64,
        /// Verification time
        now: u64,
    },

    /// Presented token differs from the one bound at provisioning
    #[error("revocation token does not match the token bound at provisioning")]
    Mismatch,

    /// Nonce claim is not valid base64
    #[error("invalid revocation token nonce: {0}")]
    InvalidNonce(String),

    /// Root authority certificate is unusable for verification
    #[error("invalid root authority: {0}")]
    Authority(String),

    /// Token could not be signed
    #[error("failed to sign revocation token: {0}")]
    Signing(String),
}

/// Result type for revocation operations
pub type Result<T> = std::result::Result<T, RevocationError>;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signature algorithm of a revocation token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAlgorithm {
    /// ECDSA P-256 / SHA-256, fixed-length signature
    Es256,
    /// Ed25519
    EdDsa,
}

impl TokenAlgorithm {
    /// JWS `alg` header value
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenAlgorithm::Es256 => "ES256",
            TokenAlgorithm::EdDsa => "EdDSA",
        }
    }

    fn verification(&self) -> &'static dyn signature::VerificationAlgorithm {
        match self {
            TokenAlgorithm::Es256 => &signature::ECDSA_P256_SHA256_FIXED,
            TokenAlgorithm::EdDsa => &signature::ED25519,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Revocation token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationClaims {
    /// Base64 nonce identifying the deployment
    pub nonce: String,
    /// Expiry (Unix seconds)
    pub exp: u64,
}

/// Claims in the form used for bound-token comparison
#[derive(Serialize)]
struct CanonicalToken<'a> {
    nonce: &'a str,
    expires_at: u64,
}

/// A revocation token whose signature has been verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationToken {
    raw: String,
    claims: RevocationClaims,
}

impl RevocationToken {
    /// The compact token as received
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Verified claims
    pub fn claims(&self) -> &RevocationClaims {
        &self.claims
    }

    /// Expiry (Unix seconds)
    pub fn expires_at(&self) -> u64 {
        self.claims.exp
    }

    /// Canonical serialization of the claims
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&CanonicalToken {
            nonce: &self.claims.nonce,
            expires_at: self.claims.exp,
        })
        .map_err(|e| RevocationError::Malformed(format!("failed to serialize claims: {}", e)))
    }

    /// Whether this token is byte-identical to a bound canonical form
    pub fn matches_bound(&self, bound: &[u8]) -> Result<bool> {
        Ok(constant_time_eq(&self.canonical_bytes()?, bound))
    }
}

/// Verifies revocation tokens against the root authority key
#[derive(Debug, Clone)]
pub struct RevocationVerifier {
    algorithm: TokenAlgorithm,
    public_key: Vec<u8>,
}

impl RevocationVerifier {
    /// Build a verifier from a PEM root authority certificate
    pub fn from_root_pem(root_pem: &str) -> Result<Self> {
        let der = parse_pem(root_pem).map_err(|e| RevocationError::Authority(e.to_string()))?;
        Self::from_root_der(&der)
    }

    /// Build a verifier from a DER root authority certificate
    pub fn from_root_der(root_der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(root_der).map_err(|e| {
            RevocationError::Authority(format!("failed to parse root certificate: {}", e))
        })?;

        let spki = cert.public_key();
        let oid = spki.algorithm.algorithm.to_id_string();
        let public_key = spki.subject_public_key.data.to_vec();

        let algorithm = match oid.as_str() {
            OID_ED25519 => TokenAlgorithm::EdDsa,
            OID_EC_PUBLIC_KEY
                if public_key.len() == P256_UNCOMPRESSED_LEN && public_key[0] == 0x04 =>
            {
                TokenAlgorithm::Es256
            }
            _ => {
                return Err(RevocationError::Authority(format!(
                    "unsupported root key type {} ({} bytes)",
                    oid,
                    public_key.len()
                )))
            }
        };

        Ok(Self {
            algorithm,
            public_key,
        })
    }

    /// Algorithm this verifier accepts
    pub fn algorithm(&self) -> TokenAlgorithm {
        self.algorithm
    }

    /// Verify signature, nonce and expiry against the current time
    pub fn verify(&self, token: &str) -> Result<RevocationToken> {
        self.verify_at(token, now_secs())
    }

    /// Verify signature, nonce and expiry against `now` (Unix seconds)
    pub fn verify_at(&self, token: &str, now: u64) -> Result<RevocationToken> {
        let mut parts = token.trim().split('.');
        let (header_b64, payload_b64, signature_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(s), None) => (h, p, s),
                _ => return Err(RevocationError::Malformed("expected three segments".into())),
            };

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|e| RevocationError::Malformed(format!("invalid header encoding: {}", e)))?;
        let header: TokenHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| RevocationError::Malformed(format!("invalid header: {}", e)))?;

        if header.alg != self.algorithm.as_str() {
            return Err(RevocationError::UnsupportedAlgorithm {
                expected: self.algorithm.as_str(),
                found: header.alg,
            });
        }

        let signature = URL_SAFE_NO_PAD.decode(signature_b64).map_err(|e| {
            RevocationError::Malformed(format!("invalid signature encoding: {}", e))
        })?;
        let message = format!("{}.{}", header_b64, payload_b64);
        UnparsedPublicKey::new(self.algorithm.verification(), &self.public_key)
            .verify(message.as_bytes(), &signature)
            .map_err(|_| {
                debug!("revocation token signature rejected");
                RevocationError::BadSignature
            })?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| RevocationError::Malformed(format!("invalid payload encoding: {}", e)))?;
        let claims: RevocationClaims = serde_json::from_slice(&payload_bytes)
            .map_err(|e| RevocationError::Malformed(format!("invalid claims: {}", e)))?;

        let nonce = STANDARD
            .decode(&claims.nonce)
            .map_err(|e| RevocationError::InvalidNonce(e.to_string()))?;
        if nonce.is_empty() {
            return Err(RevocationError::InvalidNonce("nonce is empty".into()));
        }

        if claims.exp <= now {
            debug!(exp = claims.exp, now, "revocation token expired");
            return Err(RevocationError::Expired {
                expired_at: claims.exp,
                now,
            });
        }

        Ok(RevocationToken {
            raw: token.trim().to_string(),
            claims,
        })
    }
}

enum SigningKey {
    Ecdsa(EcdsaKeyPair),
    Ed25519(Ed25519KeyPair),
}

/// Issues revocation tokens with the root authority key
///
/// Used by issuance tooling and to exercise the verifier.
pub struct RevocationSigner {
    key: SigningKey,
}

impl RevocationSigner {
    /// Load a PKCS#8 P-256 or Ed25519 private key
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self> {
        if let Ok(key) = EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8)
        {
            return Ok(Self {
                key: SigningKey::Ecdsa(key),
            });
        }
        let key = Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8)
            .map_err(|e| RevocationError::Signing(format!("unsupported signing key: {}", e)))?;
        Ok(Self {
            key: SigningKey::Ed25519(key),
        })
    }

    /// Algorithm of produced tokens
    pub fn algorithm(&self) -> TokenAlgorithm {
        match self.key {
            SigningKey::Ecdsa(_) => TokenAlgorithm::Es256,
            SigningKey::Ed25519(_) => TokenAlgorithm::EdDsa,
        }
    }

    /// Raw public key of the signer
    pub fn public_key(&self) -> Vec<u8> {
        match &self.key {
            SigningKey::Ecdsa(key) => key.public_key().as_ref().to_vec(),
            SigningKey::Ed25519(key) => key.public_key().as_ref().to_vec(),
        }
    }

    /// Sign a token for `nonce` expiring at `expires_at` (Unix seconds)
    pub fn sign(&self, nonce: &[u8], expires_at: u64) -> Result<String> {
        let header = TokenHeader {
            alg: self.algorithm().as_str().to_string(),
            typ: Some("JWT".to_string()),
        };
        let claims = RevocationClaims {
            nonce: STANDARD.encode(nonce),
            exp: expires_at,
        };

        let header_json = serde_json::to_vec(&header)
            .map_err(|e| RevocationError::Signing(format!("header: {}", e)))?;
        let claims_json = serde_json::to_vec(&claims)
            .map_err(|e| RevocationError::Signing(format!("claims: {}", e)))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );

        let signature = match &self.key {
            SigningKey::Ecdsa(key) => key
                .sign(&SystemRandom::new(), signing_input.as_bytes())
                .map_err(|_| RevocationError::Signing("ECDSA signing failed".into()))?
                .as_ref()
                .to_vec(),
            SigningKey::Ed25519(key) => key.sign(signing_input.as_bytes()).as_ref().to_vec(),
        };

        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}

impl std::fmt::Debug for RevocationSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationSigner")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}
