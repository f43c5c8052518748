//! Keystone Relay - bridges an operator session to an authenticated agent
//!
//! Once both legs of a session have finished their own handshakes, the relay
//! copies messages in both directions until one side closes, fails, or the
//! owning task is cancelled.
//!
//! - [`relay`]: the two-pump bridge and its termination rules
//! - [`registry`]: concurrent sessions under one shutdown token
//! - [`websocket`]: axum WebSocket halves as relay legs

#![deny(missing_docs)]

pub mod error;
pub mod registry;
pub mod relay;
pub mod websocket;

pub use error::{Direction, RelayError};
pub use registry::{RelayRegistry, RelaySession};
pub use relay::{relay, Leg, RelayOutcome, Termination};
pub use websocket::{websocket_leg, WsReader, WsWriter};
