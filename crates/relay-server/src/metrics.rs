//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. Hub and bridge counters live in their own actors and
//! are copied into the registry by [`spawn_stats_poller`].

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::{BridgeStats, EventBridge, HubStats};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How often hub and bridge counters are sampled.
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const FRAMES_TOTAL: &str = "relay_frames_total";
    pub const ROOMS_ACTIVE: &str = "relay_rooms_active";
    pub const USERS_ONLINE: &str = "relay_users_online";
    pub const EVICTIONS_TOTAL: &str = "relay_slow_consumers_total";
    pub const REJECTED_TOTAL: &str = "relay_connections_rejected_total";
    pub const EVENTS_TOTAL: &str = "relay_events_total";
    pub const AUTH_FAILURES_TOTAL: &str = "relay_auth_failures_total";
    pub const FRAME_LATENCY_SECONDS: &str = "relay_frame_latency_seconds";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames processed, by direction");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one live connection");
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one live connection");
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections dropped because their outbound queue was full"
    );
    metrics::describe_counter!(
        names::REJECTED_TOTAL,
        "Connections refused by the connection limit"
    );
    metrics::describe_counter!(names::EVENTS_TOTAL, "Bus events seen by the bridge, by outcome");
    metrics::describe_counter!(names::AUTH_FAILURES_TOTAL, "Rejected upgrade requests");
    metrics::describe_histogram!(
        names::FRAME_LATENCY_SECONDS,
        "Time to route one inbound frame in seconds"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an inbound frame and how long it took to route.
pub fn record_inbound_frame(tag: &str, seconds: f64) {
    counter!(names::FRAMES_TOTAL, "direction" => "inbound", "type" => tag.to_string())
        .increment(1);
    histogram!(names::FRAME_LATENCY_SECONDS).record(seconds);
}

/// Record a rejected upgrade.
pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

/// Copy a hub snapshot into the registry.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::ROOMS_ACTIVE).set(stats.rooms as f64);
    gauge!(names::USERS_ONLINE).set(stats.users as f64);
    counter!(names::FRAMES_TOTAL, "direction" => "outbound").absolute(stats.frames_sent);
    counter!(names::EVICTIONS_TOTAL).absolute(stats.evictions);
    counter!(names::REJECTED_TOTAL).absolute(stats.rejected);
}

/// Copy bridge counters into the registry.
pub fn record_bridge_stats(stats: &BridgeStats) {
    counter!(names::EVENTS_TOTAL, "outcome" => "handled").absolute(stats.handled);
    counter!(names::EVENTS_TOTAL, "outcome" => "unhandled").absolute(stats.unhandled);
    counter!(names::EVENTS_TOTAL, "outcome" => "duplicate").absolute(stats.duplicates);
    counter!(names::EVENTS_TOTAL, "outcome" => "failed").absolute(stats.failed);
    counter!(names::EVENTS_TOTAL, "outcome" => "published").absolute(stats.published);
}

/// Sample hub and bridge counters until the hub stops.
pub fn spawn_stats_poller(bridge: Arc<EventBridge>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match bridge.hub().stats().await {
                Ok(stats) => record_hub_stats(&stats),
                Err(_) => {
                    debug!("Hub stopped, stats poller exiting");
                    return;
                }
            }
            record_bridge_stats(&bridge.stats());
        }
    })
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Hub, HubConfig, MemoryBus};

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; just must not panic.
        let _guard = ConnectionMetricsGuard::new();
        record_inbound_frame("ping", 0.001);
        record_hub_stats(&HubStats::default());
        record_bridge_stats(&BridgeStats::default());
    }

    #[tokio::test]
    async fn test_stats_poller_stops_with_hub() {
        let (hub, task) = Hub::spawn(HubConfig::default());
        let bridge = Arc::new(EventBridge::with_default_handlers(
            hub.clone(),
            Arc::new(MemoryBus::new()),
            16,
        ));

        let poller = spawn_stats_poller(bridge, Duration::from_millis(10));
        hub.shutdown();
        task.await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .expect("poller should exit once the hub stops")
            .unwrap();
    }
}
