//! End-to-end throughput benchmark for Surge.
//!
//! Connects subscribers to the broadcast endpoint and one publisher to the
//! ingestion endpoint of a running server, then counts deliveries.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// End-to-end fan-out benchmark against a running server.
#[derive(Parser, Debug)]
#[command(name = "e2e_throughput")]
struct Args {
    /// Number of subscribers.
    #[arg(default_value_t = 16)]
    clients: usize,

    /// Broadcast endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:5000/out")]
    output: String,

    /// Ingestion endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:4000/in")]
    input: String,

    /// Wire format requested by subscribers.
    #[arg(long, default_value = "msgpack")]
    format: String,

    /// Warmup seconds.
    #[arg(long, default_value_t = 2)]
    warmup: u64,

    /// Measurement seconds.
    #[arg(long, default_value_t = 10)]
    duration: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Surge End-to-End Throughput Benchmark                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_fanout_benchmark(&args).await;
}

async fn run_fanout_benchmark(args: &Args) {
    println!("📊 Fan-out Benchmark: {} subscribers", args.clients);
    println!(
        "   Warmup: {}s, Measurement: {}s",
        args.warmup, args.duration
    );
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let published = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(args.clients + 1));

    let mut handles = Vec::new();

    // Spawn subscriber tasks
    for client_id in 0..args.clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);
        let url = format!("{}?format={}", args.output, args.format);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_subscriber(&url, msg_count, barrier).await {
                eprintln!("Subscriber {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all subscribers to connect
    barrier.wait().await;
    println!("✓ All {} subscribers connected", args.clients);

    let publisher = {
        let url = args.input.clone();
        let published = Arc::clone(&published);
        tokio::spawn(async move {
            if let Err(e) = run_publisher(&url, published).await {
                eprintln!("Publisher error: {}", e);
            }
        })
    };

    // Warmup phase
    println!("⏳ Warming up for {}s...", args.warmup);
    tokio::time::sleep(Duration::from_secs(args.warmup)).await;

    // Reset counters and start measurement
    message_count.store(0, Ordering::SeqCst);
    published.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", args.duration);
    tokio::time::sleep(Duration::from_secs(args.duration)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);
    let total_published = published.load(Ordering::SeqCst);

    // Calculate throughput
    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let published_per_sec = total_published as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Subscribers:          {:>10}                           ║",
        args.clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Published:            {:>10.0} msg/s                    ║",
        published_per_sec
    );
    println!(
        "║  Delivered:            {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Subscriber:       {:>10.0} msg/s                    ║",
        msgs_per_sec / args.clients.max(1) as f64
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    // Signal clients to stop
    publisher.abort();
    for handle in handles {
        handle.abort();
    }
}

async fn run_subscriber(
    url: &str,
    message_count: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(url).await?;
    let (_sender, mut receiver) = ws.split();

    barrier.wait().await;

    while let Some(result) = receiver.next().await {
        match result? {
            Message::Text(_) | Message::Binary(_) => {
                message_count.fetch_add(1, Ordering::Relaxed);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

async fn run_publisher(
    url: &str,
    published: Arc<AtomicU64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, _receiver) = ws.split();

    let payload = Message::Binary(vec![0u8; 64]);

    // Send loop - the ingest queue pushes back when the hub falls behind
    loop {
        sender.send(payload.clone()).await?;
        published.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
    }
}
