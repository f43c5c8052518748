//! Cross-component handshake tests for the keystone agent
//!
//! These tests play the server side in-process: a certificate authority
//! issues identities, rustls connections are pumped in memory, and handshake
//! messages travel over in-memory pipes.
//!
//! ```bash
//! cargo test -p keystone-agent --test handshake
//! ```

mod handshake_tests;
