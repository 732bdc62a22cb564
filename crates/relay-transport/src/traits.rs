//! Transport-neutral message and handler types.
//!
//! The pumps speak [`WireMessage`] over any `Sink`/`Stream` pair, so the same
//! connection logic runs over axum's WebSocket, a raw tungstenite stream, or
//! an in-memory channel in tests.

use async_trait::async_trait;
use futures_util::{Sink, Stream};
use relay_protocol::ClientFrame;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::watch;

/// Close code sent when the server ends a connection normally.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for a message over the size limit.
pub const CLOSE_TOO_BIG: u16 = 1009;

/// Close frame details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    #[must_use]
    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "")
    }

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A single WebSocket-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),
}

/// Outbound half of a connection.
pub type WireSink = Pin<Box<dyn Sink<WireMessage, Error = TransportError> + Send>>;

/// Inbound half of a connection.
pub type WireStream = Pin<Box<dyn Stream<Item = Result<WireMessage, TransportError>> + Send>>;

/// Receives decoded client frames from the read pump.
#[async_trait]
pub trait InboundHandler: Send {
    /// Handle one frame. Return `false` to stop reading.
    async fn on_frame(&mut self, frame: ClientFrame) -> bool;
}

/// Tells the write pump which close frame to send once its queue closes.
pub type CloseSender = watch::Sender<CloseReason>;

/// Write pump's end of [`CloseSender`].
pub type CloseReceiver = watch::Receiver<CloseReason>;

/// A close signal preset to a normal close.
#[must_use]
pub fn close_signal() -> (CloseSender, CloseReceiver) {
    watch::channel(CloseReason::normal())
}

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The outbound queue was closed by the hub.
    QueueClosed,
    /// The peer closed the socket or the stream ended.
    PeerClosed,
    /// No traffic from the peer within the pong deadline.
    HeartbeatTimeout,
    /// A write did not complete within the write deadline.
    WriteTimeout,
    WriteFailed,
    ReadFailed,
    /// The peer sent a message over the size limit.
    FrameTooLarge,
    /// The inbound handler asked to stop.
    HandlerStopped,
}

impl ExitReason {
    /// Close frame to send the peer after this exit.
    #[must_use]
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ExitReason::FrameTooLarge => CloseReason::new(CLOSE_TOO_BIG, "message too large"),
            _ => CloseReason::normal(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::QueueClosed => "queue_closed",
            ExitReason::PeerClosed => "peer_closed",
            ExitReason::HeartbeatTimeout => "heartbeat_timeout",
            ExitReason::WriteTimeout => "write_timeout",
            ExitReason::WriteFailed => "write_failed",
            ExitReason::ReadFailed => "read_failed",
            ExitReason::FrameTooLarge => "frame_too_large",
            ExitReason::HandlerStopped => "handler_stopped",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
