//! Caller-facing error classification
//!
//! Internal errors carry as much context as needed to diagnose a failure,
//! but callers only need to know what to do next. Every error type in the
//! workspace that crosses a handshake boundary maps onto [`Disposition`].

use std::fmt;

/// What a caller should do after a handshake operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Transient failure; reconnect with backoff and try the same step again
    RetryAsIs,
    /// The local identity is missing or no longer trusted; run bootstrap
    Reprovision,
    /// Operator intervention required (bad trust material, broken store)
    Fatal,
}

impl Disposition {
    /// Whether the caller may retry without changing anything
    pub fn is_retryable(&self) -> bool {
        matches!(self, Disposition::RetryAsIs)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::RetryAsIs => write!(f, "retry"),
            Disposition::Reprovision => write!(f, "reprovision"),
            Disposition::Fatal => write!(f, "fatal"),
        }
    }
}

/// Handshake phase an error originated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Installation certificate exchanged for a long-term identity
    Bootstrap,
    /// Binary-integrity challenge-response
    Challenge,
    /// Connection start (revocation check + tunnel negotiation)
    Connection,
    /// Identity store reset
    Reset,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Bootstrap => write!(f, "bootstrap"),
            Phase::Challenge => write!(f, "challenge"),
            Phase::Connection => write!(f, "connection"),
            Phase::Reset => write!(f, "reset"),
        }
    }
}
