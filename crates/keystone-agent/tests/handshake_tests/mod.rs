//! Handshake stories
//!
//! - `bootstrap_flow`: an agent with only its installation certificate
//!   captures the issuing authority over TLS, obtains a long-term identity
//!   and connects with it
//! - `steady_state`: a provisioned agent facing revocation token changes,
//!   challenge failures and integrity failures

mod bootstrap_flow;
mod helpers;
mod steady_state;
