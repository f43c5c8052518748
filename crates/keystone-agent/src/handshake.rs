//! Handshake driver
//!
//! Runs the bootstrap and steady-state exchanges of a
//! [`HardeningStateMachine`] over a message transport. Every peer message
//! is awaited with a bounded wait: the deadline is checked on a fixed poll
//! interval, and the caller's cancellation token aborts the wait at once.
//! Pings that arrive while waiting are answered in place; once authenticated,
//! [`HandshakeDriver::serve`] keeps answering them under the ping watchdog.

use std::sync::Arc;
use std::time::Duration;

use keystone_common::protocol::HandshakeMessage;
use keystone_common::{Frame, FrameReader, FrameWriter, Phase, TransportError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{HardeningError, Result};
use crate::machine::{AgentInfo, HardeningStateMachine, TunnelNegotiator};
use crate::pingee::Pingee;

/// Default bound on waiting for a peer message
pub const DEFAULT_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Default deadline poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bounded-wait parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimeouts {
    /// Maximum wait for one peer message
    pub deadline: Duration,
    /// How often the deadline is checked
    pub poll_interval: Duration,
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_HANDSHAKE_DEADLINE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Drives a state machine through the handshake over a transport
pub struct HandshakeDriver {
    machine: Arc<HardeningStateMachine>,
    timeouts: HandshakeTimeouts,
    cancel: CancellationToken,
}

impl HandshakeDriver {
    /// Create a driver; cancelling `cancel` aborts any pending wait
    pub fn new(
        machine: Arc<HardeningStateMachine>,
        timeouts: HandshakeTimeouts,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            machine,
            timeouts,
            cancel,
        }
    }

    /// The driven state machine
    pub fn machine(&self) -> &Arc<HardeningStateMachine> {
        &self.machine
    }

    /// Exchange the installation identity for a long-term identity
    ///
    /// Any failure after the request was prepared discards the attempt.
    pub async fn bootstrap<R, W>(&self, reader: &mut R, writer: &mut W, info: &AgentInfo) -> Result<()>
    where
        R: FrameReader + ?Sized,
        W: FrameWriter + ?Sized,
    {
        let phase = Phase::Bootstrap;
        let request = self.machine.prepare_bootstrap_request(info)?;

        let exchange = async {
            send(writer, &request, phase).await?;
            self.await_message(reader, writer, phase).await
        };
        let response = match exchange.await {
            Ok(response) => response,
            Err(e) => {
                warn!(agent_id = %self.machine.agent_id(), error = %e, "bootstrap exchange failed");
                self.machine.reset_bootstrap().await;
                return Err(e);
            }
        };

        self.machine.process_bootstrap_response(response).await
    }

    /// Answer the challenge and accept the connection start
    ///
    /// On failure the machine returns to `Provisioned` unless the failure
    /// erased the identity.
    pub async fn connect<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        negotiator: &dyn TunnelNegotiator,
    ) -> Result<()>
    where
        R: FrameReader + ?Sized,
        W: FrameWriter + ?Sized,
    {
        let result = self.steady_state(reader, writer, negotiator).await;
        if let Err(e) = &result {
            warn!(
                agent_id = %self.machine.agent_id(),
                error = %e,
                disposition = %e.disposition(),
                "connection handshake failed"
            );
            self.machine.disconnect().await;
        }
        result
    }

    /// Keep an authenticated connection alive
    ///
    /// Answers server pings until the peer closes the connection normally or
    /// the driver is cancelled. Fails with [`HardeningError::Timeout`] when
    /// no ping arrives for the watchdog limit. The machine returns to
    /// `Provisioned` in every case.
    pub async fn serve<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        ping_interval: Duration,
    ) -> Result<()>
    where
        R: FrameReader + ?Sized,
        W: FrameWriter + ?Sized,
    {
        let phase = Phase::Connection;
        let connection = self.cancel.child_token();
        let pingee = Pingee::new(Arc::clone(&self.machine), ping_interval, connection.clone());

        let result = tokio::select! {
            fired = pingee.watch() => {
                if fired {
                    Err(HardeningError::Timeout { phase })
                } else {
                    Ok(())
                }
            }
            result = answer_pings(reader, writer, &pingee) => result,
        };
        connection.cancel();

        if let Err(e) = &result {
            warn!(agent_id = %self.machine.agent_id(), error = %e, "authenticated connection lost");
        }
        self.machine.disconnect().await;
        result
    }

    async fn steady_state<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        negotiator: &dyn TunnelNegotiator,
    ) -> Result<()>
    where
        R: FrameReader + ?Sized,
        W: FrameWriter + ?Sized,
    {
        let challenge = match self.await_message(reader, writer, Phase::Challenge).await? {
            HandshakeMessage::ChallengeRequest(request) => request,
            refusal @ HandshakeMessage::AuthFailure(_) => {
                // Refused before the challenge: handled like a refused connection.
                self.machine
                    .process_connection_request(refusal, negotiator)
                    .await?;
                return Err(HardeningError::protocol(
                    Phase::Challenge,
                    "server refusal was accepted as a connection",
                ));
            }
            other => {
                return Err(HardeningError::protocol(
                    Phase::Challenge,
                    format!("expected challenge_request, got {}", other.kind()),
                ))
            }
        };

        let response = self.machine.prepare_challenge_response(&challenge)?;
        send(writer, &response, Phase::Challenge).await?;

        let start = self.await_message(reader, writer, Phase::Connection).await?;
        let ack = self
            .machine
            .process_connection_request(start, negotiator)
            .await?;
        send(writer, &ack, Phase::Connection).await
    }

    async fn await_message<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        phase: Phase,
    ) -> Result<HandshakeMessage>
    where
        R: FrameReader + ?Sized,
        W: FrameWriter + ?Sized,
    {
        let deadline = Instant::now() + self.timeouts.deadline;
        let mut poll = tokio::time::interval(self.timeouts.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let received = {
                let recv = reader.recv();
                tokio::pin!(recv);
                loop {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            debug!(%phase, "handshake wait cancelled");
                            return Err(HardeningError::Cancelled { phase });
                        }
                        received = &mut recv => break received,
                        _ = poll.tick() => {
                            if Instant::now() >= deadline {
                                return Err(HardeningError::Timeout { phase });
                            }
                        }
                    }
                }
            };

            let message = match received {
                Ok(Some(Frame::Text(text))) => HandshakeMessage::decode(&text).map_err(|e| {
                    HardeningError::protocol(phase, format!("undecodable message: {}", e))
                })?,
                Ok(Some(Frame::Binary(data))) => {
                    return Err(HardeningError::protocol(
                        phase,
                        format!("unexpected binary frame ({} bytes)", data.len()),
                    ))
                }
                Ok(Some(Frame::Close(close))) => {
                    return Err(HardeningError::Transport {
                        phase,
                        source: TransportError::from_close(close),
                    })
                }
                Ok(None) => {
                    return Err(HardeningError::Transport {
                        phase,
                        source: TransportError::Disconnected,
                    })
                }
                Err(source) => return Err(HardeningError::Transport { phase, source }),
            };

            match message {
                HandshakeMessage::Ping(ping) => {
                    trace!(%phase, "answering ping during handshake");
                    let pong = self.machine.generate_ping_response(&ping);
                    send(writer, &pong, phase).await?;
                }
                message => return Ok(message),
            }
        }
    }
}

async fn answer_pings<R, W>(reader: &mut R, writer: &mut W, pingee: &Pingee) -> Result<()>
where
    R: FrameReader + ?Sized,
    W: FrameWriter + ?Sized,
{
    let phase = Phase::Connection;
    loop {
        let text = match reader.recv().await {
            Ok(Some(Frame::Text(text))) => text,
            Ok(Some(Frame::Binary(data))) => {
                return Err(HardeningError::protocol(
                    phase,
                    format!("unexpected binary frame ({} bytes)", data.len()),
                ))
            }
            Ok(Some(Frame::Close(close))) => {
                let source = TransportError::from_close(close);
                if source.is_normal_close() {
                    debug!("server closed the connection");
                    return Ok(());
                }
                return Err(HardeningError::Transport { phase, source });
            }
            Ok(None) => {
                return Err(HardeningError::Transport {
                    phase,
                    source: TransportError::Disconnected,
                })
            }
            Err(source) => return Err(HardeningError::Transport { phase, source }),
        };

        match HandshakeMessage::decode(&text) {
            Ok(HandshakeMessage::Ping(ping)) => {
                send(writer, &pingee.handle(&ping), phase).await?;
            }
            Ok(other) => {
                return Err(HardeningError::protocol(
                    phase,
                    format!("unexpected {} after authentication", other.kind()),
                ))
            }
            Err(e) => {
                return Err(HardeningError::protocol(
                    phase,
                    format!("undecodable message: {}", e),
                ))
            }
        }
    }
}

async fn send<W>(writer: &mut W, message: &HandshakeMessage, phase: Phase) -> Result<()>
where
    W: FrameWriter + ?Sized,
{
    let text = message
        .encode()
        .map_err(|e| HardeningError::protocol(phase, e.to_string()))?;
    writer
        .send(Frame::Text(text))
        .await
        .map_err(|source| HardeningError::Transport { phase, source })
}
