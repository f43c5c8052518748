//! Relay errors

use std::fmt;

use keystone_common::TransportError;
use thiserror::Error;

/// Which way a pump was copying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client leg to server leg
    ClientToServer,
    /// Server leg to client leg
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// Relay failures
///
/// Normal peer-initiated closes never show up here; they end the relay with
/// `Ok`.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A pump failed to read or write
    #[error("relay {direction} failed: {source}")]
    Transport {
        /// Pump that failed
        direction: Direction,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },

    /// A pump task panicked or was aborted
    #[error("relay task failed: {0}")]
    Task(String),
}

impl RelayError {
    /// Pump the error came from, if any
    pub fn direction(&self) -> Option<Direction> {
        match self {
            RelayError::Transport { direction, .. } => Some(*direction),
            RelayError::Task(_) => None,
        }
    }
}
