//! End-to-end round-trip benchmark against a running relay server.
//!
//! Each client sends `ping` frames as fast as the socket accepts them and
//! counts the `pong` frames that come back, so every counted frame crossed
//! the network twice and passed through the hub.
//!
//! ```bash
//! RELAY_AUTH__JWT_SECRET=dev relay &
//! RELAY_AUTH__JWT_SECRET=dev e2e_throughput 16
//! ```

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let secret = std::env::var("RELAY_AUTH__JWT_SECRET")
        .map_err(|_| "RELAY_AUTH__JWT_SECRET must match the server's secret")?;

    println!("Relay end-to-end ping benchmark");
    println!("  Clients: {num_clients}, warmup: {WARMUP_SECS}s, measurement: {BENCH_SECS}s");
    println!();

    let pongs = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));
    let mut handles = Vec::with_capacity(num_clients);

    for client_id in 0..num_clients {
        let token = mint_token(&secret, client_id)?;
        let pongs = Arc::clone(&pongs);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(&token, pongs, barrier).await {
                eprintln!("Client {client_id} error: {e}");
            }
        }));
    }

    barrier.wait().await;
    println!("All {num_clients} clients connected, warming up");
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    pongs.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed();
    let total = pongs.load(Ordering::SeqCst);

    let per_sec = total as f64 / elapsed.as_secs_f64();
    println!();
    println!("  Duration:     {:>10.2}s", elapsed.as_secs_f64());
    println!("  Round trips:  {:>10}", total);
    println!("  Throughput:   {:>10.0} pongs/s", per_sec);
    println!("  Per client:   {:>10.0} pongs/s", per_sec / num_clients as f64);

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

fn mint_token(secret: &str, client_id: usize) -> Result<String, BoxError> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let claims = json!({
        "user_id": Uuid::new_v4(),
        "username": format!("bench-{client_id}"),
        "device_id": "bench",
        "iat": now,
        "exp": now + 3600,
    });
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}

async fn run_client(token: &str, pongs: Arc<AtomicU64>, barrier: Arc<Barrier>) -> Result<(), BoxError> {
    let (ws, _) = connect_async(format!("{SERVER_URL}?token={token}")).await?;
    let (mut sender, mut receiver) = ws.split();

    // The first frame is the auth acknowledgement.
    receiver.next().await.ok_or("closed before auth ack")??;

    barrier.wait().await;

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Text(text) = message {
                let count = text.split('\n').filter(|f| f.contains(r#""type":"pong""#)).count();
                pongs.fetch_add(count as u64, Ordering::Relaxed);
            }
        }
    });

    let ping = Message::Text(json!({ "type": "ping" }).to_string());
    loop {
        if sender.send(ping.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
