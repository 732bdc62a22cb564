//! Read and write pumps for one connection.
//!
//! Each connection runs exactly one writer and one reader. The writer is the
//! only task that touches the socket's outbound half: it drains the
//! connection's queue, coalescing whatever is already waiting into a single
//! text message, and sends heartbeat pings. The reader enforces the size limit
//! and the pong deadline and hands decoded frames to an [`InboundHandler`].

use crate::traits::{CloseReceiver, ExitReason, InboundHandler, TransportError, WireMessage};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use relay_protocol::{codec, ProtocolError, MAX_FRAME_SIZE};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

/// Upper bound on frames joined into one write.
pub const MAX_COALESCE: usize = 256;

/// Pump timing and size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    /// Deadline for a single write.
    pub write_wait: Duration,
    /// How long the reader waits for any traffic before giving up.
    pub pong_wait: Duration,
    /// Interval between pings. Shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Largest inbound message accepted.
    pub max_message_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(10), MAX_FRAME_SIZE)
    }
}

impl PumpConfig {
    /// Build a config with the ping period at nine tenths of `pong_wait`.
    #[must_use]
    pub fn new(pong_wait: Duration, write_wait: Duration, max_message_size: usize) -> Self {
        Self {
            write_wait,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_size,
        }
    }
}

/// Drain `queue` into `sink` until the queue closes or a write fails.
///
/// On queue closure the close frame currently held by `close` is sent before
/// returning.
pub async fn write_pump<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Bytes>,
    close: CloseReceiver,
    config: PumpConfig,
) -> ExitReason
where
    S: Sink<WireMessage, Error = TransportError> + Unpin,
{
    let mut ticker = interval_at(Instant::now() + config.ping_period, config.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch: Vec<Bytes> = Vec::new();

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(first) = frame else {
                    debug!("Outbound queue closed");
                    let frame = WireMessage::Close(Some(close.borrow().clone()));
                    if let Err(reason) = send(&mut sink, frame, config.write_wait).await {
                        trace!(%reason, "Close frame not delivered");
                    }
                    return ExitReason::QueueClosed;
                };

                batch.clear();
                batch.push(first);
                while batch.len() < MAX_COALESCE {
                    match queue.try_recv() {
                        Ok(next) => batch.push(next),
                        Err(_) => break,
                    }
                }

                let text = match String::from_utf8(Vec::from(codec::encode_batch(&batch))) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "Outbound frame is not UTF-8, dropping batch");
                        continue;
                    }
                };
                trace!(frames = batch.len(), bytes = text.len(), "Writing batch");
                if let Err(reason) = send(&mut sink, WireMessage::Text(text), config.write_wait).await {
                    return reason;
                }
            }
            _ = ticker.tick() => {
                trace!("Sending ping");
                if let Err(reason) = send(&mut sink, WireMessage::Ping(Vec::new()), config.write_wait).await {
                    return reason;
                }
            }
        }
    }
}

async fn send<S>(sink: &mut S, message: WireMessage, write_wait: Duration) -> Result<(), ExitReason>
where
    S: Sink<WireMessage, Error = TransportError> + Unpin,
{
    match timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "Write failed");
            Err(ExitReason::WriteFailed)
        }
        Err(_) => {
            warn!(write_wait_ms = write_wait.as_millis() as u64, "Write timed out");
            Err(ExitReason::WriteTimeout)
        }
    }
}

/// Read from `stream` until the peer leaves, the deadline passes, or a fatal
/// frame arrives.
///
/// Any inbound message re-arms the pong deadline. Malformed frames are logged
/// and dropped; oversized ones end the connection.
pub async fn read_pump<S, H>(mut stream: S, config: PumpConfig, mut handler: H) -> ExitReason
where
    S: Stream<Item = Result<WireMessage, TransportError>> + Unpin,
    H: InboundHandler,
{
    loop {
        let next = match timeout(config.pong_wait, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(pong_wait_ms = config.pong_wait.as_millis() as u64, "Heartbeat timed out");
                return ExitReason::HeartbeatTimeout;
            }
        };

        let data = match next {
            Some(Ok(WireMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WireMessage::Binary(data))) => data,
            Some(Ok(WireMessage::Pong(_))) => {
                trace!("Pong received");
                continue;
            }
            Some(Ok(WireMessage::Ping(_))) => continue,
            Some(Ok(WireMessage::Close(reason))) => {
                debug!(?reason, "Peer sent close");
                return ExitReason::PeerClosed;
            }
            Some(Err(TransportError::Protocol(ProtocolError::FrameTooLarge { size, max }))) => {
                warn!(size, max, "Inbound message too large");
                return ExitReason::FrameTooLarge;
            }
            Some(Err(e)) => {
                debug!(error = %e, "Read failed");
                return ExitReason::ReadFailed;
            }
            None => return ExitReason::PeerClosed,
        };

        match codec::decode_client(&data, config.max_message_size) {
            Ok(frame) => {
                if !handler.on_frame(frame).await {
                    return ExitReason::HandlerStopped;
                }
            }
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                warn!(size, max, "Inbound message too large");
                return ExitReason::FrameTooLarge;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed client frame");
            }
        }
    }
}
