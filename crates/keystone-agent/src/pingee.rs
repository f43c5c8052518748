//! Ping responder and liveness watchdog
//!
//! Once authenticated, the server probes the agent periodically. The agent
//! echoes every probe and treats a silence of [`WATCHDOG_MULTIPLIER`] ping
//! intervals as a dead connection: the connection's cancellation token is
//! cancelled so every task bound to it winds down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use keystone_common::protocol::{HandshakeMessage, Ping};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::machine::HardeningStateMachine;

/// Default interval between server pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Missed intervals before the connection is considered dead
pub const WATCHDOG_MULTIPLIER: u32 = 3;

/// Answers pings and watches for their absence
pub struct Pingee {
    machine: Arc<HardeningStateMachine>,
    interval: Duration,
    last_ping: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Pingee {
    /// Create a responder for a connection governed by `cancel`
    pub fn new(
        machine: Arc<HardeningStateMachine>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            machine,
            interval,
            last_ping: Mutex::new(Instant::now()),
            cancel,
        }
    }

    /// Record a ping and build its echo
    pub fn handle(&self, ping: &Ping) -> HandshakeMessage {
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        trace!(agent_id = %self.machine.agent_id(), "ping received");
        self.machine.generate_ping_response(ping)
    }

    /// Time of the last ping (or of creation)
    pub fn last_ping(&self) -> Instant {
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Silence after which the watchdog fires
    pub fn limit(&self) -> Duration {
        self.interval * WATCHDOG_MULTIPLIER
    }

    /// Run until the connection is cancelled or pings stop
    ///
    /// Returns `true` if the watchdog fired (and cancelled the connection).
    pub async fn watch(&self) -> bool {
        let limit = self.limit();
        loop {
            let expires = self.last_ping() + limit;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(agent_id = %self.machine.agent_id(), "ping watchdog stopped");
                    return false;
                }
                _ = tokio::time::sleep_until(expires) => {
                    if self.last_ping() + limit <= Instant::now() {
                        warn!(
                            agent_id = %self.machine.agent_id(),
                            silence_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                            "no ping from server, closing connection"
                        );
                        self.cancel.cancel();
                        return true;
                    }
                }
            }
        }
    }
}
