//! WebSocket adapters.
//!
//! Each adapter splits a socket into a [`WireSink`] and a [`WireStream`] for
//! the pumps. Ping replies are handled by the underlying libraries.

use crate::traits::{CloseReason, TransportError, WireMessage, WireSink, WireStream};
use axum::extract::ws::{self, WebSocket};
use futures_util::{future, SinkExt, StreamExt};
use std::borrow::Cow;

/// Split an upgraded axum socket.
pub fn split_axum(socket: WebSocket) -> (WireSink, WireStream) {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
        .with(|message: WireMessage| future::ready(Ok::<_, TransportError>(to_axum(message))));
    let stream = stream.map(|result| result.map(from_axum).map_err(receive_error));
    (Box::pin(sink), Box::pin(stream))
}

/// axum wraps tungstenite's errors; unwrap them so oversized messages surface
/// as `FrameTooLarge`.
fn receive_error(e: axum::Error) -> TransportError {
    #[cfg(feature = "websocket")]
    let e = match e.into_inner().downcast::<tokio_tungstenite::tungstenite::Error>() {
        Ok(inner) => return tungstenite_adapter::receive_error(*inner),
        Err(other) => other,
    };
    TransportError::ReceiveFailed(e.to_string())
}

fn to_axum(message: WireMessage) -> ws::Message {
    match message {
        WireMessage::Text(text) => ws::Message::Text(text),
        WireMessage::Binary(data) => ws::Message::Binary(data),
        WireMessage::Ping(data) => ws::Message::Ping(data),
        WireMessage::Pong(data) => ws::Message::Pong(data),
        WireMessage::Close(reason) => ws::Message::Close(reason.map(|r| ws::CloseFrame {
            code: r.code,
            reason: Cow::Owned(r.reason),
        })),
    }
}

fn from_axum(message: ws::Message) -> WireMessage {
    match message {
        ws::Message::Text(text) => WireMessage::Text(text),
        ws::Message::Binary(data) => WireMessage::Binary(data),
        ws::Message::Ping(data) => WireMessage::Ping(data),
        ws::Message::Pong(data) => WireMessage::Pong(data),
        ws::Message::Close(frame) => {
            WireMessage::Close(frame.map(|f| CloseReason::new(f.code, f.reason.into_owned())))
        }
    }
}

#[cfg(feature = "websocket")]
pub use tungstenite_adapter::split_tungstenite;

#[cfg(feature = "websocket")]
mod tungstenite_adapter {
    use super::*;
    use relay_protocol::ProtocolError;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_tungstenite::tungstenite::error::CapacityError;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::{Error, Message};
    use tokio_tungstenite::WebSocketStream;

    /// Split a tokio-tungstenite stream.
    pub fn split_tungstenite<S>(socket: WebSocketStream<S>) -> (WireSink, WireStream)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
            .with(|message: WireMessage| future::ready(Ok::<_, TransportError>(to_tungstenite(message))));
        let stream = stream.map(|result| result.map(from_tungstenite).map_err(receive_error));
        (Box::pin(sink), Box::pin(stream))
    }

    pub(super) fn receive_error(e: Error) -> TransportError {
        match e {
            Error::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                TransportError::Protocol(ProtocolError::FrameTooLarge { size, max: max_size })
            }
            other => TransportError::ReceiveFailed(other.to_string()),
        }
    }

    fn to_tungstenite(message: WireMessage) -> Message {
        match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(data) => Message::Binary(data),
            WireMessage::Ping(data) => Message::Ping(data),
            WireMessage::Pong(data) => Message::Pong(data),
            WireMessage::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
                code: CloseCode::from(r.code),
                reason: Cow::Owned(r.reason),
            })),
        }
    }

    fn from_tungstenite(message: Message) -> WireMessage {
        match message {
            Message::Text(text) => WireMessage::Text(text),
            Message::Binary(data) => WireMessage::Binary(data),
            Message::Ping(data) => WireMessage::Ping(data),
            Message::Pong(data) => WireMessage::Pong(data),
            Message::Close(frame) => WireMessage::Close(
                frame.map(|f| CloseReason::new(u16::from(f.code), f.reason.into_owned())),
            ),
            other @ Message::Frame(_) => WireMessage::Binary(other.into_data()),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::pump::{read_pump, write_pump, PumpConfig};
        use crate::traits::{close_signal, ExitReason, InboundHandler, CLOSE_TOO_BIG};
        use async_trait::async_trait;
        use bytes::Bytes;
        use relay_protocol::ClientFrame;
        use tokio::sync::mpsc;
        use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};

        struct Recorder(mpsc::UnboundedSender<ClientFrame>);

        #[async_trait]
        impl InboundHandler for Recorder {
            async fn on_frame(&mut self, frame: ClientFrame) -> bool {
                self.0.send(frame).is_ok()
            }
        }

        #[test]
        fn test_close_code_roundtrip() {
            let message = to_tungstenite(WireMessage::Close(Some(CloseReason::new(1009, "too big"))));
            assert_eq!(
                from_tungstenite(message),
                WireMessage::Close(Some(CloseReason::new(1009, "too big")))
            );
        }

        #[tokio::test]
        async fn test_pumps_over_real_websocket() {
            let (server_io, client_io) = tokio::io::duplex(4096);
            let (server, client) = tokio::join!(
                WebSocketStream::from_raw_socket(server_io, Role::Server, None),
                WebSocketStream::from_raw_socket(client_io, Role::Client, None),
            );

            let (sink, stream) = split_tungstenite(server);
            let (queue_tx, queue_rx) = mpsc::channel(8);
            let (frames_tx, mut frames) = mpsc::unbounded_channel();
            let writer = tokio::spawn(write_pump(sink, queue_rx, close_signal().1, PumpConfig::default()));
            let reader = tokio::spawn(read_pump(stream, PumpConfig::default(), Recorder(frames_tx)));

            let (mut client_tx, mut client_rx) = client.split();
            client_tx
                .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
                .await
                .unwrap();
            assert_eq!(frames.recv().await, Some(ClientFrame::Ping));

            queue_tx.send(Bytes::from_static(br#"{"type":"pong"}"#)).await.unwrap();
            assert_eq!(
                client_rx.next().await.unwrap().unwrap(),
                Message::Text(r#"{"type":"pong"}"#.to_string())
            );

            drop(queue_tx);
            assert!(matches!(client_rx.next().await, Some(Ok(Message::Close(_)))));
            assert_eq!(writer.await.unwrap(), ExitReason::QueueClosed);
            reader.abort();
        }

        #[tokio::test]
        async fn test_oversized_message_closes_with_1009() {
            let mut limits = WebSocketConfig::default();
            limits.max_message_size = Some(64);
            limits.max_frame_size = Some(64);
            let (server_io, client_io) = tokio::io::duplex(4096);
            let (server, client) = tokio::join!(
                WebSocketStream::from_raw_socket(server_io, Role::Server, Some(limits)),
                WebSocketStream::from_raw_socket(client_io, Role::Client, None),
            );

            let (sink, stream) = split_tungstenite(server);
            let (queue_tx, queue_rx) = mpsc::channel::<Bytes>(8);
            let (close_tx, close_rx) = close_signal();
            let (frames_tx, _frames) = mpsc::unbounded_channel();
            let writer = tokio::spawn(write_pump(sink, queue_rx, close_rx, PumpConfig::default()));

            let (mut client_tx, mut client_rx) = client.split();
            client_tx.send(Message::Text("x".repeat(1024))).await.unwrap();

            let reason = read_pump(stream, PumpConfig::default(), Recorder(frames_tx)).await;
            assert_eq!(reason, ExitReason::FrameTooLarge);
            close_tx.send_replace(reason.close_reason());
            drop(queue_tx);

            match client_rx.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    assert_eq!(u16::from(frame.code), CLOSE_TOO_BIG);
                }
                other => panic!("expected a close frame, got {other:?}"),
            }
            assert_eq!(writer.await.unwrap(), ExitReason::QueueClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axum_message_mapping() {
        assert_eq!(
            from_axum(to_axum(WireMessage::Text("hi".into()))),
            WireMessage::Text("hi".into())
        );
        assert_eq!(
            from_axum(to_axum(WireMessage::Close(Some(CloseReason::new(1000, ""))))),
            WireMessage::Close(Some(CloseReason::new(1000, "")))
        );
        assert_eq!(from_axum(ws::Message::Ping(vec![1])), WireMessage::Ping(vec![1]));
    }
}
