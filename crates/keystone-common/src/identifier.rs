//! Agent identifiers
//!
//! An agent is named by 32 lowercase hex characters. The identifier seeds
//! the local store key and salts challenge keys, so it is validated once at
//! construction and every derivation takes an [`AgentId`] rather than a raw
//! string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Required identifier length in characters
pub const AGENT_ID_LEN: usize = 32;

/// Identifier validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// Wrong number of characters
    #[error("agent id must be {expected} characters, got {actual}")]
    InvalidLength {
        /// Required length
        expected: usize,
        /// Length of the rejected value
        actual: usize,
    },

    /// Character outside `[0-9a-f]`
    #[error("agent id contains invalid character {character:?} at position {position}")]
    InvalidCharacter {
        /// The offending character
        character: char,
        /// Zero-based position in the input
        position: usize,
    },
}

/// Validated agent identifier
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(String);

impl AgentId {
    /// Validate and wrap an identifier
    pub fn parse(value: &str) -> Result<Self, IdentifierError> {
        if value.len() != AGENT_ID_LEN {
            return Err(IdentifierError::InvalidLength {
                expected: AGENT_ID_LEN,
                actual: value.chars().count(),
            });
        }

        if let Some((position, character)) = value
            .chars()
            .enumerate()
            .find(|(_, c)| !matches!(c, '0'..='9' | 'a'..='f'))
        {
            return Err(IdentifierError::InvalidCharacter {
                character,
                position,
            });
        }

        Ok(Self(value.to_string()))
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier bytes used as derivation input
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self.0)
    }
}

impl FromStr for AgentId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for AgentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AgentId::parse(&raw).map_err(serde::de::Error::custom)
    }
}
