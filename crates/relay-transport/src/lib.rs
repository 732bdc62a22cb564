//! # relay-transport
//!
//! Connection plumbing for the Relay gateway.
//!
//! Every socket is driven by two tasks:
//!
//! - **Write pump** - drains the connection's outbound queue, coalescing
//!   queued frames into one write, and sends heartbeat pings
//! - **Read pump** - enforces the size limit and pong deadline and hands
//!   decoded client frames to an [`InboundHandler`]
//!
//! The pumps are written against `Sink`/`Stream` of [`WireMessage`], with
//! adapters for axum and tokio-tungstenite sockets.
//!
//! ```rust,ignore
//! use relay_transport::{close_signal, read_pump, split_axum, write_pump, PumpConfig};
//!
//! let (sink, stream) = split_axum(socket);
//! let (close_tx, close_rx) = close_signal();
//! tokio::spawn(write_pump(sink, queue_rx, close_rx, config));
//! let reason = read_pump(stream, config, handler).await;
//! close_tx.send_replace(reason.close_reason());
//! ```

pub mod pump;
pub mod traits;
pub mod websocket;

pub use pump::{read_pump, write_pump, PumpConfig};
pub use traits::{
    close_signal, CloseReason, CloseReceiver, CloseSender, ExitReason, InboundHandler,
    TransportError, WireMessage, WireSink, WireStream, CLOSE_NORMAL, CLOSE_TOO_BIG,
};
pub use websocket::split_axum;

#[cfg(feature = "websocket")]
pub use websocket::split_tungstenite;
