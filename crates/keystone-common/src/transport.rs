//! Message-oriented transport abstraction
//!
//! Handshakes and relayed sessions both move whole messages, not byte
//! streams. [`FrameReader`] and [`FrameWriter`] are the two halves of such a
//! connection; a WebSocket, a tunnel channel or the in-memory [`pipe`] can
//! sit behind them.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// WebSocket-compatible close codes
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (page navigation, server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Close frame carried no status code
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame
    pub const ABNORMAL: u16 = 1006;
    /// Unexpected server condition
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Whether a close code represents an ordinary peer-initiated disconnect
    pub fn is_normal(code: u16) -> bool {
        matches!(code, NORMAL | GOING_AWAY | NO_STATUS)
    }
}

/// Close frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close status code
    pub code: u16,
    /// Optional human-readable reason
    pub reason: String,
}

impl CloseFrame {
    /// Normal closure with a reason
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: close_code::NORMAL,
            reason: reason.into(),
        }
    }
}

/// One transport message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text message
    Text(String),
    /// Binary message
    Binary(Vec<u8>),
    /// Peer-initiated close
    Close(Option<CloseFrame>),
}

impl Frame {
    /// Payload size in bytes (0 for close frames)
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
            Frame::Close(_) => 0,
        }
    }

    /// Whether the frame carries no payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Peer closed the connection with a close frame
    #[error("connection closed by peer with code {code}: {reason}")]
    Closed {
        /// Close status code
        code: u16,
        /// Close reason
        reason: String,
    },

    /// Local side already sent a close frame
    #[error("close frame already sent")]
    CloseSent,

    /// Peer vanished without closing
    #[error("connection dropped by peer")]
    Disconnected,

    /// Underlying socket error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Other transport failure
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Build a `Closed` error from an optional close frame
    pub fn from_close(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(CloseFrame { code, reason }) => TransportError::Closed { code, reason },
            None => TransportError::Closed {
                code: close_code::NO_STATUS,
                reason: String::new(),
            },
        }
    }

    /// Whether this error is an ordinary disconnect rather than a failure
    pub fn is_normal_close(&self) -> bool {
        match self {
            TransportError::Closed { code, .. } => close_code::is_normal(*code),
            TransportError::CloseSent => true,
            _ => false,
        }
    }
}

/// Receiving half of a message connection
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame. `Ok(None)` means the stream ended cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// Sending half of a message connection
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one frame
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Send a close frame. Further sends fail with [`TransportError::CloseSent`].
    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError>;
}

/// One end of an in-memory duplex pipe
#[derive(Debug)]
pub struct PipeEnd {
    reader: PipeReader,
    writer: PipeWriter,
}

impl PipeEnd {
    /// Split into independently owned halves
    pub fn split(self) -> (PipeReader, PipeWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a [`PipeEnd`]
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<Frame>,
}

/// Sending half of a [`PipeEnd`]
#[derive(Debug)]
pub struct PipeWriter {
    tx: mpsc::Sender<Frame>,
    close_sent: bool,
}

/// Create a connected pair of in-memory message pipes
///
/// Each direction buffers up to `capacity` frames.
pub fn pipe(capacity: usize) -> (PipeEnd, PipeEnd) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        PipeEnd {
            reader: PipeReader { rx: a_rx },
            writer: PipeWriter {
                tx: a_tx,
                close_sent: false,
            },
        },
        PipeEnd {
            reader: PipeReader { rx: b_rx },
            writer: PipeWriter {
                tx: b_tx,
                close_sent: false,
            },
        },
    )
}

#[async_trait]
impl FrameReader for PipeReader {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl FrameWriter for PipeWriter {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.close_sent {
            return Err(TransportError::CloseSent);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError> {
        if self.close_sent {
            return Err(TransportError::CloseSent);
        }
        self.close_sent = true;
        // A peer that already hung up has nothing left to notify.
        let _ = self.tx.send(Frame::Close(frame)).await;
        Ok(())
    }
}

#[async_trait]
impl FrameReader for PipeEnd {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        self.reader.recv().await
    }
}

#[async_trait]
impl FrameWriter for PipeEnd {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.writer.send(frame).await
    }

    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError> {
        self.writer.close(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipe_delivers_in_both_directions() {
        let (mut a, mut b) = pipe(4);

        a.send(Frame::Text("hello".into())).await.expect("send a->b");
        b.send(Frame::Binary(vec![1, 2])).await.expect("send b->a");

        assert_eq!(
            b.recv().await.expect("recv"),
            Some(Frame::Text("hello".into()))
        );
        assert_eq!(a.recv().await.expect("recv"), Some(Frame::Binary(vec![1, 2])));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (mut a, mut b) = pipe(4);
        a.close(Some(CloseFrame::normal("bye"))).await.expect("close");

        assert!(matches!(
            a.send(Frame::Text("late".into())).await,
            Err(TransportError::CloseSent)
        ));
        assert_eq!(
            b.recv().await.expect("recv"),
            Some(Frame::Close(Some(CloseFrame::normal("bye"))))
        );
    }

    #[tokio::test]
    async fn dropped_peer_ends_stream_and_fails_sends() {
        let (a, b) = pipe(4);
        let (mut reader, mut writer) = a.split();
        drop(b);

        assert_eq!(reader.recv().await.expect("recv"), None);
        assert!(matches!(
            writer.send(Frame::Text("x".into())).await,
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn normal_close_classification() {
        assert!(TransportError::from_close(Some(CloseFrame::normal(""))).is_normal_close());
        assert!(TransportError::from_close(None).is_normal_close());
        assert!(TransportError::Closed {
            code: close_code::GOING_AWAY,
            reason: String::new()
        }
        .is_normal_close());
        assert!(TransportError::CloseSent.is_normal_close());

        assert!(!TransportError::Closed {
            code: close_code::INTERNAL_ERROR,
            reason: "boom".into()
        }
        .is_normal_close());
        assert!(!TransportError::Disconnected.is_normal_close());
    }
}
