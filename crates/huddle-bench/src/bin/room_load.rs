//! End-to-end room load generator for Huddle.
//!
//! Connects N clients to one room of a running server, has every client send
//! messages as fast as the server accepts them, and reports how many
//! `receive_message` events the clients got per second.
//!
//! ```bash
//! huddle &
//! room_load 16 ws://127.0.0.1:8080/ws
//! ```

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, ClientEvent, ServerEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const ROOM: &str = "load";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "room_load", about = "Room chat load generator for Huddle")]
struct Cli {
    /// Number of clients to connect.
    #[arg(default_value = "16")]
    clients: usize,

    /// WebSocket endpoint of the server.
    #[arg(default_value = DEFAULT_URL)]
    url: String,
}

#[tokio::main]
async fn main() {
    let Cli {
        clients: num_clients,
        url,
    } = Cli::parse();

    println!("Huddle room load: {} clients on {}", num_clients, url);
    println!("Warmup: {}s, measurement: {}s", WARMUP_SECS, BENCH_SECS);

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let handles: Vec<_> = (0..num_clients)
        .map(|client_id| {
            let received = Arc::clone(&received);
            let barrier = Arc::clone(&barrier);
            let url = url.clone();
            tokio::spawn(async move {
                if let Err(e) = run_client(client_id, &url, received, barrier).await {
                    eprintln!("Client {} error: {}", client_id, e);
                }
            })
        })
        .collect();

    barrier.wait().await;
    println!("All {} clients joined '{}'", num_clients, ROOM);

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed();
    let total = received.load(Ordering::SeqCst);

    let per_sec = total as f64 / elapsed.as_secs_f64();
    println!();
    println!("Clients:          {:>12}", num_clients);
    println!("Duration:         {:>11.2}s", elapsed.as_secs_f64());
    println!("Messages received:{:>12}", total);
    println!("Throughput:       {:>8.0} msg/s", per_sec);
    println!(
        "Per client:       {:>8.0} msg/s",
        per_sec / num_clients as f64
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();
    let username = format!("load-{}", client_id);

    let join = codec::encode_json(&ClientEvent::join_room(&username, ROOM))?;
    sender.send(Message::Text(join)).await?;

    // Wait until our own join is confirmed
    while let Some(message) = receiver.next().await {
        if let Message::Text(text) = message? {
            if let ServerEvent::UserList { users, .. } = codec::decode_json(&text)? {
                if users.contains(&username) {
                    break;
                }
            }
        }
    }

    barrier.wait().await;

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Text(text) = message {
                if let Ok(ServerEvent::ReceiveMessage { .. }) = codec::decode_json(&text) {
                    received.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    let text = codec::encode_json(&ClientEvent::send_message(&username, ROOM, "x".repeat(64)))?;
    let message = Message::Text(text);
    while sender.send(message.clone()).await.is_ok() {
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
