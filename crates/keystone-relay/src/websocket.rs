//! WebSocket halves as relay legs
//!
//! Converts between axum WebSocket messages and transport frames. Close
//! frames keep their code so a browser disconnect (1000/1001) ends a relay
//! cleanly while anything else is reported as a failure.

use std::fmt;

use async_trait::async_trait;
use axum::extract::ws::{self, Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use keystone_common::transport::CloseFrame;
use keystone_common::{Frame, FrameReader, FrameWriter, TransportError};

use crate::relay::Leg;

/// Convert an incoming WebSocket message; ping and pong yield `None`
///
/// axum answers pings on its own, so they never reach the relay.
pub fn message_to_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(Frame::Binary(data.to_vec())),
        Message::Close(close) => Some(Frame::Close(close.map(|c| CloseFrame {
            code: c.code,
            reason: c.reason.as_str().to_owned(),
        }))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

/// Convert an outgoing frame into a WebSocket message
pub fn frame_to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Close(close) => Message::Close(close.map(ws_close)),
    }
}

fn ws_close(close: CloseFrame) -> ws::CloseFrame {
    ws::CloseFrame {
        code: close.code,
        reason: close.reason.into(),
    }
}

fn transport_error(e: impl fmt::Display) -> TransportError {
    TransportError::Other(e.to_string())
}

/// Receiving half of a WebSocket
pub struct WsReader<S> {
    stream: S,
}

impl<S> WsReader<S> {
    /// Wrap a message stream
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S, E> FrameReader for WsReader<S>
where
    S: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: fmt::Display + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        while let Some(message) = self.stream.next().await {
            if let Some(frame) = message_to_frame(message.map_err(transport_error)?) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

/// Sending half of a WebSocket
pub struct WsWriter<S> {
    sink: S,
    close_sent: bool,
}

impl<S> WsWriter<S> {
    /// Wrap a message sink
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            close_sent: false,
        }
    }
}

#[async_trait]
impl<S> FrameWriter for WsWriter<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: fmt::Display + Send,
{
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.close_sent {
            return Err(TransportError::CloseSent);
        }
        if let Frame::Close(close) = frame {
            return self.close(close).await;
        }
        self.sink
            .send(frame_to_message(frame))
            .await
            .map_err(transport_error)
    }

    async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), TransportError> {
        if self.close_sent {
            return Err(TransportError::CloseSent);
        }
        self.close_sent = true;
        self.sink
            .send(Message::Close(frame.map(ws_close)))
            .await
            .map_err(transport_error)
    }
}

/// Split an upgraded WebSocket into a relay leg
pub fn websocket_leg(socket: WebSocket) -> Leg {
    let (sink, stream) = socket.split();
    Leg::new(WsReader::new(stream), WsWriter::new(sink))
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;
    use keystone_common::transport::close_code;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(close_code::NORMAL, true)]
    #[case(close_code::GOING_AWAY, true)]
    #[case(close_code::PROTOCOL_ERROR, false)]
    #[case(close_code::INTERNAL_ERROR, false)]
    fn close_codes_survive_conversion(#[case] code: u16, #[case] normal: bool) {
        let message = Message::Close(Some(ws::CloseFrame {
            code,
            reason: "bye".to_string().into(),
        }));

        let Some(Frame::Close(close)) = message_to_frame(message) else {
            panic!("expected a close frame");
        };
        let error = TransportError::from_close(close);
        assert_eq!(error.is_normal_close(), normal);
    }

    #[test]
    fn close_without_payload_is_normal() {
        let Some(Frame::Close(close)) = message_to_frame(Message::Close(None)) else {
            panic!("expected a close frame");
        };
        assert!(TransportError::from_close(close).is_normal_close());
    }

    #[tokio::test]
    async fn reader_skips_control_messages() {
        let stream = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Message::Ping(vec![1].into())),
            Ok(Message::Text("hello".to_string().into())),
            Ok(Message::Pong(vec![2].into())),
            Ok(Message::Binary(vec![3, 4].into())),
        ]);
        let mut reader = WsReader::new(stream);

        assert_eq!(
            reader.recv().await.expect("recv"),
            Some(Frame::Text("hello".into()))
        );
        assert_eq!(
            reader.recv().await.expect("recv"),
            Some(Frame::Binary(vec![3, 4]))
        );
        assert_eq!(reader.recv().await.expect("recv"), None);
    }

    #[tokio::test]
    async fn reader_surfaces_socket_errors() {
        let stream = futures::stream::iter(vec![Err::<Message, _>(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))]);
        let mut reader = WsReader::new(stream);

        let err = reader.recv().await.expect_err("must fail");
        assert!(matches!(err, TransportError::Other(_)));
        assert!(!err.is_normal_close());
    }

    #[tokio::test]
    async fn writer_sends_close_once() {
        let (tx, mut rx) = mpsc::unbounded::<Message>();
        let mut writer = WsWriter::new(tx);

        writer
            .send(Frame::Text("data".into()))
            .await
            .expect("send");
        writer
            .send(Frame::Close(Some(CloseFrame::normal("done"))))
            .await
            .expect("close through send");
        assert!(matches!(
            writer.send(Frame::Text("late".into())).await,
            Err(TransportError::CloseSent)
        ));
        assert!(matches!(
            writer.close(None).await,
            Err(TransportError::CloseSent)
        ));

        assert_eq!(
            message_to_frame(rx.next().await.expect("text")),
            Some(Frame::Text("data".into()))
        );
        assert_eq!(
            message_to_frame(rx.next().await.expect("close")),
            Some(Frame::Close(Some(CloseFrame::normal("done"))))
        );
    }

    #[tokio::test]
    async fn writer_reports_dropped_socket() {
        let (tx, rx) = mpsc::unbounded::<Message>();
        drop(rx);
        let mut writer = WsWriter::new(tx);

        let err = writer
            .send(Frame::Binary(vec![1]))
            .await
            .expect_err("receiver is gone");
        assert!(matches!(err, TransportError::Other(_)));
    }
}
