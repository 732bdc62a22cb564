//! One WebSocket connection, from upgrade to teardown.

use async_trait::async_trait;
use axum::extract::ws::WebSocket;
use relay_core::{ConnectionHandle, HubError, Identity, InboundRouter};
use relay_protocol::ClientFrame;
use relay_transport::{close_signal, read_pump, split_axum, write_pump, ExitReason, InboundHandler};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::handlers::AppState;
use crate::metrics::{self, ConnectionMetricsGuard};

/// Feeds decoded frames from the read pump into the router.
struct RouterHandler {
    router: InboundRouter,
}

#[async_trait]
impl InboundHandler for RouterHandler {
    async fn on_frame(&mut self, frame: ClientFrame) -> bool {
        let started = Instant::now();
        let tag = frame.tag().to_string();
        let result = self.router.handle(frame).await;
        metrics::record_inbound_frame(&tag, started.elapsed().as_secs_f64());

        match result {
            Ok(route) => {
                trace!(frame = %tag, ?route, "Frame routed");
                true
            }
            Err(HubError::Closed) => {
                debug!("Hub stopped, closing connection");
                false
            }
        }
    }
}

enum Finished {
    Reader(ExitReason),
    Writer(Result<ExitReason, JoinError>),
}

/// Run a connection to completion.
///
/// The writer runs on its own task and drains the hub-fed queue. The reader
/// runs here. Whichever stops first ends the session; the connection is
/// then unregistered, which closes its queue and lets the writer send a
/// close frame. A reader exit picks that frame's code, so an oversized
/// message is answered with 1009.
pub async fn run(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let _guard = ConnectionMetricsGuard::new();
    let (handle, queue) = ConnectionHandle::new(identity.clone(), state.config.limits.outbound_queue);
    let id = handle.id;
    let span = info_span!("connection", connection = %id, user_id = %identity.user_id);

    async move {
        if state.hub.register(handle).is_err() {
            warn!("Hub is not running, dropping connection");
            return;
        }

        let pump_config = state.config.pump_config();
        let (sink, stream) = split_axum(socket);
        let (close_tx, close_rx) = close_signal();
        let mut writer =
            tokio::spawn(write_pump(sink, queue, close_rx, pump_config).in_current_span());

        let handler = RouterHandler {
            router: InboundRouter::new(id, identity, Arc::clone(&state.bridge)),
        };

        let finished = tokio::select! {
            reason = read_pump(stream, pump_config, handler) => Finished::Reader(reason),
            joined = &mut writer => Finished::Writer(joined),
        };

        if let Finished::Reader(reason) = &finished {
            close_tx.send_replace(reason.close_reason());
        }
        if state.hub.unregister(id).is_err() {
            debug!("Hub already stopped");
        }

        match finished {
            Finished::Reader(reason) => {
                info!(reason = %reason, "Reader finished");
                match writer.await {
                    Ok(reason) => debug!(reason = %reason, "Writer finished"),
                    Err(e) => warn!(error = %e, "Writer task failed"),
                }
            }
            Finished::Writer(Ok(reason)) => info!(reason = %reason, "Writer finished"),
            Finished::Writer(Err(e)) => warn!(error = %e, "Writer task failed"),
        }
    }
    .instrument(span)
    .await;
}
