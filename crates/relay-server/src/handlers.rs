//! HTTP surface of the gateway.
//!
//! - `GET <websocket_path>`: authenticated upgrade, then [`session::run`]
//! - `GET /health`: liveness plus the live connection count
//! - `GET /events/metrics`: hub and bridge counters as JSON
//! - `POST /events`: publish a domain event envelope onto the bus
//! - `POST /events/system`: publish a `system.*` event onto the bus

use crate::auth::TokenValidator;
use crate::config::Config;
use crate::metrics;
use crate::session;
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay_core::bus::{self, channels};
use relay_core::{BridgeStats, EventBridge, EventPublisher, Hub, HubStats, MemoryBus};
use relay_protocol::events::{levels, types};
use relay_protocol::{EventEnvelope, EventType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    pub hub: Hub,
    pub bridge: Arc<EventBridge>,
    /// In-process event bus the bridge listens on.
    pub bus: MemoryBus,
    pub auth: TokenValidator,
}

/// Tasks started alongside the state.
pub struct Background {
    hub: JoinHandle<()>,
    bridge: JoinHandle<()>,
}

impl Background {
    /// Stop the hub, wait for it to close every connection, then stop the
    /// bridge.
    pub async fn stop(self, hub: &Hub) {
        hub.shutdown();
        if let Err(e) = self.hub.await {
            error!(error = %e, "Hub task failed");
        }
        self.bridge.abort();
    }
}

impl AppState {
    /// Build the state and start the hub and bridge tasks.
    #[must_use]
    pub fn start(config: Config) -> (Arc<Self>, Background) {
        let (hub, hub_task) = Hub::spawn(config.hub_config());
        let bus = MemoryBus::new();
        let publisher: Arc<dyn EventPublisher> = Arc::new(bus.clone());
        let bridge = Arc::new(EventBridge::with_default_handlers(
            hub.clone(),
            publisher,
            config.events.dedup_window,
        ));

        let subscription = bus.subscribe(config.events.channels.clone());
        let bridge_task = tokio::spawn(Arc::clone(&bridge).run(subscription));

        let state = Arc::new(Self {
            auth: TokenValidator::new(&config.auth),
            config,
            hub,
            bridge,
            bus,
        });
        let background = Background {
            hub: hub_task,
            bridge: bridge_task,
        };
        (state, background)
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/events", post(publish_handler))
        .route("/events/metrics", get(events_metrics_handler))
        .route("/events/system", post(system_event_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let metrics_enabled = config.metrics.enabled;
    let (state, background) = AppState::start(config);
    if metrics_enabled {
        metrics::spawn_stats_poller(Arc::clone(&state.bridge), metrics::STATS_INTERVAL);
    }

    axum::serve(listener, build_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped accepting connections, closing sessions");
    background.stop(&state.hub).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Upgrade query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct UpgradeParams {
    token: Option<String>,
}

/// WebSocket upgrade handler. Unauthenticated requests get a 401 and are
/// never upgraded.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<UpgradeParams>,
    headers: HeaderMap,
) -> Response {
    let claims = match state.auth.authenticate(params.token.as_deref(), &headers) {
        Ok(claims) => claims,
        Err(e) => {
            metrics::record_auth_failure();
            warn!(error = %e, "Rejected WebSocket upgrade");
            return e.into_response();
        }
    };

    let identity = claims.identity();
    let limit = state.config.limits.max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| session::run(socket, state, identity))
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.stats().await {
        Ok(stats) => Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "connections": stats.connections,
        }))
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        )
            .into_response(),
    }
}

/// Counters exposed on `/events/metrics`.
#[derive(Debug, Serialize)]
pub struct EventMetrics {
    pub hub: HubStats,
    pub bridge: BridgeStats,
    pub bus_subscribers: usize,
}

async fn events_metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.stats().await {
        Ok(hub) => Json(EventMetrics {
            hub,
            bridge: state.bridge.stats(),
            bus_subscribers: state.bus.subscriber_count(),
        })
        .into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "hub stopped"),
    }
}

async fn publish(state: &AppState, event: &EventEnvelope) -> Response {
    match bus::publish_event(&state.bus, event).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "id": event.id,
                "channels": channels::for_event(event),
            })),
        )
            .into_response(),
        Err(e) => {
            error!(event_id = %event.id, error = %e, "Failed to publish event");
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// Publish a complete event envelope.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<EventEnvelope>,
) -> Response {
    if EventType::parse(&event.event_type).is_none() {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid event type: {}", event.event_type),
        );
    }
    publish(&state, &event).await
}

fn default_system_type() -> String {
    types::SYSTEM_BROADCAST.to_string()
}

/// Body of `POST /events/system`.
#[derive(Debug, Deserialize)]
pub struct SystemEventRequest {
    #[serde(rename = "type", default = "default_system_type")]
    event_type: String,
    #[serde(default)]
    data: Map<String, Value>,
}

async fn system_event_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SystemEventRequest>,
) -> Response {
    match EventType::parse(&request.event_type) {
        Some(parsed) if parsed.level() == levels::SYSTEM => {}
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("not a system event type: {}", request.event_type),
            )
        }
    }
    let event = EventEnvelope::system_event(&request.event_type, request.data);
    publish(&state, &event).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{issue_token, test_claims};
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use uuid::Uuid;

    const SECRET: &str = "test-secret";

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
        let mut config = Config::default();
        config.auth.jwt_secret = SECRET.to_string();
        config.metrics.enabled = false;

        let (state, _background) = AppState::start(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn connect(addr: SocketAddr, user_id: Uuid) -> Client {
        let token = issue_token(SECRET, &test_claims(user_id));
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
            .await
            .unwrap();
        let ack = wait_for(&mut ws, "auth").await;
        assert_eq!(ack["data"]["user_id"], user_id.to_string());
        assert_eq!(ack["data"]["status"], "connected");
        ws
    }

    /// Next text message, split into its coalesced frames.
    async fn next_frames(ws: &mut Client) -> Vec<Value> {
        loop {
            let message = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection ended")
                .unwrap();
            match message {
                WsMessage::Text(text) => {
                    return text
                        .split('\n')
                        .map(|line| serde_json::from_str(line).unwrap())
                        .collect()
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    async fn wait_for(ws: &mut Client, kind: &str) -> Value {
        loop {
            if let Some(frame) = next_frames(ws).await.into_iter().find(|f| f["type"] == kind) {
                return frame;
            }
        }
    }

    async fn join(state: &AppState, user_id: Uuid, room_id: Uuid) {
        let event =
            EventEnvelope::room_event(types::ROOM_JOIN, room_id, Map::new(), Some(user_id));
        bus::publish_event(&state.bus, &event).await.unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_requires_token() {
        let (addr, _state) = spawn_server().await;

        match connect_async(format!("ws://{addr}/ws")).await {
            Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
            other => panic!("expected 401, got {other:?}"),
        }

        let forged = issue_token("wrong", &test_claims(Uuid::new_v4()));
        match connect_async(format!("ws://{addr}/ws?token={forged}")).await {
            Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
            other => panic!("expected 401, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (addr, _state) = spawn_server().await;
        let mut ws = connect(addr, Uuid::new_v4()).await;

        ws.send(WsMessage::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        let pong = wait_for(&mut ws, "pong").await;
        assert!(pong["id"].is_string());
    }

    #[tokio::test]
    async fn test_bus_message_reaches_room_member() {
        let (addr, state) = spawn_server().await;
        let (alice, room) = (Uuid::new_v4(), Uuid::new_v4());
        let mut ws = connect(addr, alice).await;

        join(&state, alice, room).await;
        let joined = wait_for(&mut ws, "user_join").await;
        assert_eq!(joined["data"]["room_id"], room.to_string());

        let mut data = Map::new();
        data.insert("content".into(), json!("hello"));
        let event = EventEnvelope::message_event(
            types::MESSAGE_SEND,
            room,
            Uuid::new_v4(),
            data,
            Some(Uuid::new_v4()),
        );
        let response = publish_handler(State(Arc::clone(&state)), Json(event)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let message = wait_for(&mut ws, "message").await;
        assert_eq!(message["data"]["content"], "hello");
    }

    #[tokio::test]
    async fn test_typing_crosses_connections() {
        let (addr, state) = spawn_server().await;
        let (alice, bob, room) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut alice_ws = connect(addr, alice).await;
        let mut bob_ws = connect(addr, bob).await;

        join(&state, alice, room).await;
        join(&state, bob, room).await;
        wait_for(&mut bob_ws, "user_join").await;
        assert_eq!(state.hub.room_connections(room).await.unwrap().len(), 2);

        let frame = json!({ "type": "typing_start", "data": { "room_id": room } });
        alice_ws
            .send(WsMessage::Text(frame.to_string()))
            .await
            .unwrap();

        let typing = wait_for(&mut bob_ws, "typing_start").await;
        assert_eq!(typing["data"]["user_id"], alice.to_string());
        assert_eq!(typing["data"]["room_id"], room.to_string());
    }

    #[tokio::test]
    async fn test_oversized_message_closes_with_1009() {
        let (addr, state) = spawn_server().await;
        let mut ws = connect(addr, Uuid::new_v4()).await;

        let oversized = "x".repeat(state.config.limits.max_message_size * 4);
        ws.send(WsMessage::Text(oversized)).await.unwrap();

        let close = timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(frame))) => return frame,
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended without a close frame: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for close");
        let frame = close.expect("close frame should carry a code");
        assert_eq!(u16::from(frame.code), relay_transport::CLOSE_TOO_BIG);
    }

    #[tokio::test]
    async fn test_system_broadcast_and_disconnect() {
        let (addr, state) = spawn_server().await;
        let mut ws = connect(addr, Uuid::new_v4()).await;

        let request = SystemEventRequest {
            event_type: types::SYSTEM_BROADCAST.to_string(),
            data: Map::from_iter([("text".to_string(), json!("maintenance at noon"))]),
        };
        let response = system_event_handler(State(Arc::clone(&state)), Json(request)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        wait_for(&mut ws, "notification").await;

        let bad = SystemEventRequest {
            event_type: "room.create".to_string(),
            data: Map::new(),
        };
        let response = system_event_handler(State(Arc::clone(&state)), Json(bad)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        ws.close(None).await.unwrap();
        drop(ws);
        timeout(Duration::from_secs(5), async {
            while state.hub.stats().await.unwrap().connections > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection should be unregistered after close");
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (_addr, state) = spawn_server().await;

        let response = health_handler(State(Arc::clone(&state))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = events_metrics_handler(State(Arc::clone(&state))).await;
        assert_eq!(response.status(), StatusCode::OK);

        state.hub.shutdown();
        while !state.hub.is_closed() {
            tokio::task::yield_now().await;
        }
        let response = health_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
