//! Common types for the keystone hardening protocol
//!
//! Shared between the agent, the infrastructure crate and the session relay:
//! - Agent identifiers and their validation
//! - Handshake payloads exchanged during bootstrap and steady-state
//! - The single-assignment slot used for in-flight key material
//! - Message-oriented transport traits plus an in-memory duplex pipe
//! - Error dispositions and telemetry setup

#![deny(missing_docs)]

pub mod error;
pub mod identifier;
pub mod protocol;
pub mod slot;
pub mod telemetry;
pub mod transport;

pub use error::{Disposition, Phase};
pub use identifier::{AgentId, IdentifierError};
pub use slot::{SingleSlot, SlotError};
pub use transport::{Frame, FrameReader, FrameWriter, TransportError};

/// Default TLS server name used as the SNI/validation anchor
pub const DEFAULT_SERVER_NAME: &str = "keystone.server";
