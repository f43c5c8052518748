//! Server-side binary-integrity challenge
//!
//! The server sends a random nonce; the agent returns it sealed under
//! `ChallengeKey(agent_id, abh)`. The server does not know which build an
//! agent runs, so it tries the key of every known-good binary hash and
//! accepts the first one that opens the response to the same nonce.

use keystone_common::AgentId;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{constant_time_eq, random_bytes, ChallengeKey, CryptoError};

/// Length of a challenge nonce
pub const CHALLENGE_NONCE_LEN: usize = 32;

/// Challenge verification errors
#[derive(Debug, Error)]
pub enum ChallengeError {
    /// No known binary hash opens the response to the issued nonce
    #[error("challenge response from {agent_id} matches no known binary")]
    NoMatch {
        /// Agent that answered
        agent_id: AgentId,
    },

    /// Nonce generation failed
    #[error("challenge generation failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// An issued challenge awaiting its response
#[derive(Debug, Clone)]
pub struct Challenge {
    agent_id: AgentId,
    nonce: Vec<u8>,
}

impl Challenge {
    /// Nonce to send to the agent
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Agent the challenge was issued to
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }
}

/// Issues and verifies binary-integrity challenges
#[derive(Debug, Clone, Default)]
pub struct Challenger {
    known_hashes: Vec<Vec<u8>>,
}

impl Challenger {
    /// Create a challenger accepting any of the given binary hashes
    pub fn new<I, H>(known_hashes: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: Into<Vec<u8>>,
    {
        Self {
            known_hashes: known_hashes.into_iter().map(Into::into).collect(),
        }
    }

    /// Accept an additional binary hash (new release rolled out)
    pub fn allow(&mut self, abh: impl Into<Vec<u8>>) {
        self.known_hashes.push(abh.into());
    }

    /// Number of accepted binary hashes
    pub fn known_len(&self) -> usize {
        self.known_hashes.len()
    }

    /// Issue a fresh challenge for an agent
    pub fn issue(&self, agent_id: &AgentId) -> Result<Challenge, ChallengeError> {
        Ok(Challenge {
            agent_id: agent_id.clone(),
            nonce: random_bytes(CHALLENGE_NONCE_LEN)?,
        })
    }

    /// Verify a response; returns the matching binary hash
    pub fn verify(&self, challenge: &Challenge, response: &[u8]) -> Result<&[u8], ChallengeError> {
        for abh in &self.known_hashes {
            let key = ChallengeKey::derive(&challenge.agent_id, abh);
            match key.open(response) {
                Ok(plaintext) if constant_time_eq(&plaintext, &challenge.nonce) => {
                    debug!(agent_id = %challenge.agent_id, "challenge response accepted");
                    return Ok(abh);
                }
                Ok(_) | Err(_) => continue,
            }
        }

        warn!(
            agent_id = %challenge.agent_id,
            candidates = self.known_hashes.len(),
            "challenge response matched no known binary"
        );
        Err(ChallengeError::NoMatch {
            agent_id: challenge.agent_id.clone(),
        })
    }
}
