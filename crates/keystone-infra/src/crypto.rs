//! Key derivation and symmetric sealing
//!
//! Two symmetric keys exist in the protocol, both derived with SHA-256 and
//! never stored:
//!
//! - `ChallengeKey = SHA256(agent_id ‖ abh)`, sealing challenge nonces with
//!   AES-256-GCM
//! - `StoreKey = SHA256(agent_id ‖ STORE_KEY_SALT)`, sealing the local
//!   identity blob with ChaCha20-Poly1305
//!
//! Sealed output is always `nonce ‖ ciphertext ‖ tag` with a fresh random
//! 96-bit nonce.

use std::fmt;

use aws_lc_rs::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use aws_lc_rs::digest;
use keystone_common::AgentId;
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of every derived symmetric key
pub const KEY_LEN: usize = 32;

/// Length of a binary identity hash
pub const DIGEST_LEN: usize = 32;

/// Domain-separation salt mixed into the identity store key
pub const STORE_KEY_SALT: &[u8] = b"keystone/identity-store/v1";

/// Cryptographic operation errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Sealed input too short to contain nonce and tag
    #[error("sealed data too short: {len} bytes")]
    Truncated {
        /// Length of the rejected input
        len: usize,
    },

    /// AEAD authentication failed (wrong key or tampered data)
    #[error("decryption failed: authentication tag mismatch")]
    Open,

    /// AEAD encryption failed
    #[error("encryption failed")]
    Seal,

    /// System random source failed
    #[error("random number generation failed")]
    Random,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; DIGEST_LEN] {
    let digest = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(digest.as_ref());
    out
}

/// Fill a fresh buffer with `len` random bytes
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    aws_lc_rs::rand::fill(&mut buf).map_err(|_| CryptoError::Random)?;
    Ok(buf)
}

/// Constant-time equality
#[allow(deprecated)]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    aws_lc_rs::constant_time::verify_slices_are_equal(a, b).is_ok()
}

fn derive_key(parts: &[&[u8]]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for part in parts {
        ctx.update(part);
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(ctx.finish().as_ref());
    key
}

fn seal(algorithm: &'static aead::Algorithm, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let unbound = UnboundKey::new(algorithm, key).map_err(|_| CryptoError::Seal)?;
    let key = LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    aws_lc_rs::rand::fill(&mut nonce_bytes).map_err(|_| CryptoError::Random)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Seal)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

fn open(algorithm: &'static aead::Algorithm, key: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + algorithm.tag_len() {
        return Err(CryptoError::Truncated { len: sealed.len() });
    }

    let unbound = UnboundKey::new(algorithm, key).map_err(|_| CryptoError::Open)?;
    let key = LessSafeKey::new(unbound);

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Open)?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Open)?;
    Ok(plaintext.to_vec())
}

/// Per-challenge key binding the agent identity to its binary
#[derive(Clone)]
pub struct ChallengeKey(Zeroizing<[u8; KEY_LEN]>);

impl ChallengeKey {
    /// Derive from the agent identifier and binary identity hash
    pub fn derive(agent_id: &AgentId, abh: &[u8]) -> Self {
        Self(derive_key(&[agent_id.as_bytes(), abh]))
    }

    /// Encrypt a challenge nonce under a fresh IV
    pub fn seal(&self, nonce: &[u8]) -> Result<Vec<u8>> {
        seal(&aead::AES_256_GCM, self.0.as_ref(), nonce)
    }

    /// Decrypt a challenge response
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        open(&aead::AES_256_GCM, self.0.as_ref(), sealed)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl fmt::Debug for ChallengeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChallengeKey([REDACTED])")
    }
}

/// Key protecting the identity blob at rest
pub struct StoreKey(Zeroizing<[u8; KEY_LEN]>);

impl StoreKey {
    /// Derive from the agent identifier
    pub fn derive(agent_id: &AgentId) -> Self {
        Self(derive_key(&[agent_id.as_bytes(), STORE_KEY_SALT]))
    }

    /// Encrypt a serialized record
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        seal(&aead::CHACHA20_POLY1305, self.0.as_ref(), plaintext)
    }

    /// Decrypt a sealed record
    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        open(&aead::CHACHA20_POLY1305, self.0.as_ref(), sealed).map(Zeroizing::new)
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> AgentId {
        AgentId::parse(s).expect("valid id")
    }

    const AGENT_A: &str = "0123456789abcdef0123456789abcdef";
    const AGENT_B: &str = "fedcba9876543210fedcba9876543210";

    #[test]
    fn challenge_key_is_deterministic() {
        let abh = sha256(b"binary");
        let first = ChallengeKey::derive(&id(AGENT_A), &abh);
        let second = ChallengeKey::derive(&id(AGENT_A), &abh);
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn challenge_key_depends_on_both_inputs() {
        let abh = sha256(b"binary");
        let base = ChallengeKey::derive(&id(AGENT_A), &abh);

        let other_agent = ChallengeKey::derive(&id(AGENT_B), &abh);
        assert_ne!(base.as_bytes(), other_agent.as_bytes());

        let mut tweaked = abh;
        tweaked[31] ^= 0x01;
        let other_binary = ChallengeKey::derive(&id(AGENT_A), &tweaked);
        assert_ne!(base.as_bytes(), other_binary.as_bytes());
    }

    #[test]
    fn challenge_seal_uses_fresh_iv() {
        let key = ChallengeKey::derive(&id(AGENT_A), &sha256(b"binary"));
        let nonce = [7u8; 32];

        let a = key.seal(&nonce).expect("seal should succeed");
        let b = key.seal(&nonce).expect("seal should succeed");
        assert_ne!(a, b);
        assert_eq!(key.open(&a).expect("open should succeed"), nonce);
        assert_eq!(key.open(&b).expect("open should succeed"), nonce);
    }

    #[test]
    fn wrong_challenge_key_fails_to_open() {
        let sealed = ChallengeKey::derive(&id(AGENT_A), &sha256(b"good"))
            .seal(b"nonce")
            .expect("seal should succeed");
        let wrong = ChallengeKey::derive(&id(AGENT_A), &sha256(b"tampered"));
        assert!(matches!(wrong.open(&sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn store_key_rejects_tampering_and_truncation() {
        let key = StoreKey::derive(&id(AGENT_A));
        let mut sealed = key.seal(b"{\"ltac\":\"...\"}").expect("seal should succeed");

        assert!(matches!(
            key.open(&sealed[..NONCE_LEN]),
            Err(CryptoError::Truncated { .. })
        ));

        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(key.open(&sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn store_key_is_bound_to_agent() {
        let sealed = StoreKey::derive(&id(AGENT_A))
            .seal(b"secret")
            .expect("seal should succeed");
        assert!(StoreKey::derive(&id(AGENT_B)).open(&sealed).is_err());
        assert_eq!(
            StoreKey::derive(&id(AGENT_A))
                .open(&sealed)
                .expect("open should succeed")
                .as_slice(),
            b"secret"
        );
    }

    #[test]
    fn random_bytes_has_requested_length() {
        let a = random_bytes(32).expect("rng should work");
        let b = random_bytes(32).expect("rng should work");
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn debug_redacts_keys() {
        let key = ChallengeKey::derive(&id(AGENT_A), b"abh");
        assert_eq!(format!("{:?}", key), "ChallengeKey([REDACTED])");
    }
}
