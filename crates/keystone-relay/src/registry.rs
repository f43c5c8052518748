//! Registry of running relay sessions
//!
//! Thread-safe registry using DashMap for concurrent access. Each session
//! runs on its own task under a child of the registry's shutdown token and
//! removes itself when it ends.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RelayError;
use crate::relay::{relay, Leg, RelayOutcome};

struct SessionEntry {
    label: String,
    cancel: CancellationToken,
    started: Instant,
}

/// Running relay sessions keyed by session id
pub struct RelayRegistry {
    sessions: Arc<DashMap<Uuid, SessionEntry>>,
    shutdown: CancellationToken,
}

/// Handle to one spawned relay session
pub struct RelaySession {
    id: Uuid,
    handle: JoinHandle<Result<RelayOutcome, RelayError>>,
}

impl RelaySession {
    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the session to end
    pub async fn wait(self) -> Result<RelayOutcome, RelayError> {
        self.handle
            .await
            .map_err(|e| RelayError::Task(e.to_string()))?
    }
}

impl RelayRegistry {
    /// Create an empty registry; cancelling `shutdown` stops every session
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Spawn a relay between two authenticated legs
    pub fn start(&self, label: impl Into<String>, client: Leg, server: Leg) -> RelaySession {
        let id = Uuid::new_v4();
        let label = label.into();
        let cancel = self.shutdown.child_token();

        self.sessions.insert(
            id,
            SessionEntry {
                label: label.clone(),
                cancel: cancel.clone(),
                started: Instant::now(),
            },
        );
        info!(session = %id, label = %label, "Relay session started");

        let sessions = Arc::clone(&self.sessions);
        let handle = tokio::spawn(async move {
            let result = relay(client, server, &cancel).await;
            if let Some((_, entry)) = sessions.remove(&id) {
                debug!(
                    session = %id,
                    label = %entry.label,
                    elapsed = ?entry.started.elapsed(),
                    "Relay session removed"
                );
            }
            result
        });

        RelaySession { id, handle }
    }

    /// Cancel one session; returns false if it is not running
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.sessions.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether a session is still running
    pub fn contains(&self, id: &Uuid) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of running sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are running
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cancel every running session
    pub fn shutdown(&self) {
        info!(sessions = self.len(), "Shutting down relay sessions");
        self.shutdown.cancel();
    }
}
