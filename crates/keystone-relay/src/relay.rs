//! Bidirectional session relay
//!
//! Two pumps copy frames between the client leg and the server leg, one per
//! direction, each on its own task. A pump stops on end of stream, on a close
//! frame, or on the first read or write error, and reports how it stopped on
//! a shared channel sized so that reporting never blocks.
//!
//! The relay returns on whichever comes first:
//! - the caller's token is cancelled (`Ok`)
//! - a pump reports a close or an error (`Ok` for a normal close code,
//!   `Err` otherwise)
//! - both pumps reach end of stream (`Ok`)
//!
//! Before returning it stops both pumps, waits for their tasks to finish and
//! closes both legs.

use std::fmt;
use std::time::Duration;

use keystone_common::transport::{close_code, CloseFrame, PipeEnd};
use keystone_common::{Frame, FrameReader, FrameWriter, TransportError};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Direction, RelayError};

/// Upper bound for sending the final close frame on each leg
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One authenticated connection taking part in a relay
pub struct Leg {
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
}

impl Leg {
    /// Build a leg from the two halves of a connection
    pub fn new(reader: impl FrameReader + 'static, writer: impl FrameWriter + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl From<PipeEnd> for Leg {
    fn from(end: PipeEnd) -> Self {
        let (reader, writer) = end.split();
        Leg::new(reader, writer)
    }
}

/// Why a relay stopped without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The owning token was cancelled
    Cancelled,
    /// A peer sent a normal close frame
    PeerClosed(Direction),
    /// Both legs reached end of stream
    Drained,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Cancelled => write!(f, "cancelled"),
            Termination::PeerClosed(direction) => write!(f, "peer closed ({})", direction),
            Termination::Drained => write!(f, "drained"),
        }
    }
}

/// Result of a relay that ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// How the relay ended
    pub termination: Termination,
    /// Frames delivered from the client leg to the server leg
    pub client_to_server: u64,
    /// Frames delivered from the server leg to the client leg
    pub server_to_client: u64,
}

struct PumpExit {
    direction: Direction,
    result: Result<(), TransportError>,
}

type PumpDone = (Box<dyn FrameWriter>, u64);

/// Bridge two legs until one closes, fails, or `cancel` fires
///
/// Both legs are closed before this returns: with a normal close frame when
/// the relay ends cleanly, with an internal-error close frame otherwise.
pub async fn relay(
    client: Leg,
    server: Leg,
    cancel: &CancellationToken,
) -> Result<RelayOutcome, RelayError> {
    let stop = cancel.child_token();
    // One slot per pump; each reports at most once.
    let (exit_tx, mut exit_rx) = mpsc::channel(2);

    let upstream = tokio::spawn(pump(
        Direction::ClientToServer,
        client.reader,
        server.writer,
        stop.clone(),
        exit_tx.clone(),
    ));
    let downstream = tokio::spawn(pump(
        Direction::ServerToClient,
        server.reader,
        client.writer,
        stop.clone(),
        exit_tx,
    ));
    debug!("Relay started");

    let mut drained = 0;
    let ended = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(Termination::Cancelled),
            exit = exit_rx.recv() => match exit {
                Some(PumpExit { direction, result: Ok(()) }) => {
                    debug!(%direction, "Relay pump reached end of stream");
                    drained += 1;
                    if drained == 2 {
                        break Ok(Termination::Drained);
                    }
                }
                Some(PumpExit { direction, result: Err(e) }) if e.is_normal_close() => {
                    break Ok(Termination::PeerClosed(direction));
                }
                Some(PumpExit { direction, result: Err(source) }) => {
                    break Err(RelayError::Transport { direction, source });
                }
                // Both pumps gone without reporting; the join below says why.
                None => break Ok(Termination::Drained),
            }
        }
    };

    stop.cancel();
    let (upstream, downstream) = tokio::join!(upstream, downstream);

    let close = match &ended {
        Ok(_) => CloseFrame::normal("relay closed"),
        Err(_) => CloseFrame {
            code: close_code::INTERNAL_ERROR,
            reason: "relay failed".to_string(),
        },
    };
    let client_to_server = finish(upstream, &close).await;
    let server_to_client = finish(downstream, &close).await;

    let termination = match ended {
        Ok(termination) => termination,
        Err(e) => {
            warn!(error = %e, "Relay failed");
            return Err(e);
        }
    };
    let outcome = RelayOutcome {
        termination,
        client_to_server: client_to_server?,
        server_to_client: server_to_client?,
    };
    info!(
        termination = %outcome.termination,
        client_to_server = outcome.client_to_server,
        server_to_client = outcome.server_to_client,
        "Relay session ended"
    );
    Ok(outcome)
}

async fn pump(
    direction: Direction,
    mut reader: Box<dyn FrameReader>,
    mut writer: Box<dyn FrameWriter>,
    stop: CancellationToken,
    exits: mpsc::Sender<PumpExit>,
) -> PumpDone {
    let mut frames = 0u64;

    let result = loop {
        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            received = reader.recv() => Some(received),
        };
        let frame = match received {
            None => return (writer, frames),
            Some(Ok(Some(Frame::Close(close)))) => break Err(TransportError::from_close(close)),
            Some(Ok(Some(frame))) => frame,
            Some(Ok(None)) => break Ok(()),
            Some(Err(e)) => break Err(e),
        };

        let sent = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            sent = writer.send(frame) => Some(sent),
        };
        match sent {
            None => return (writer, frames),
            Some(Ok(())) => frames += 1,
            Some(Err(e)) => break Err(e),
        }
    };

    let _ = exits.send(PumpExit { direction, result }).await;
    (writer, frames)
}

/// Close the writer a pump handed back and return its frame count
async fn finish(
    joined: Result<PumpDone, JoinError>,
    close: &CloseFrame,
) -> Result<u64, RelayError> {
    let (mut writer, frames) = joined.map_err(|e| RelayError::Task(e.to_string()))?;
    match tokio::time::timeout(CLOSE_TIMEOUT, writer.close(Some(close.clone()))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Relay leg already closed"),
        Err(_) => warn!("Timed out closing relay leg"),
    }
    Ok(frames)
}
