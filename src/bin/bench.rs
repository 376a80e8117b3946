//! Unary call throughput benchmark
//!
//! Spawns a number of workers that each issue unary calls back to back and
//! reports throughput and latency percentiles. With `--loopback` the server
//! runs in-process and no sockets are used.
//!
//! Run with: cargo run --bin rpc-bench -- --help

use anyhow::{anyhow, Result};
use bytes::Bytes;
use clap::Parser;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use unary_rpc::{status, Channel, Metadata, RequestHandler, Server, Transport};

#[derive(Parser, Debug, Clone)]
#[command(name = "rpc-bench")]
#[command(about = "Unary call throughput benchmark")]
struct Args {
    /// Server address (ignored with --loopback)
    #[arg(long, default_value = "127.0.0.1:8999")]
    server_addr: String,

    /// Total number of calls
    #[arg(long, default_value = "10000")]
    num_calls: usize,

    /// Number of concurrent workers (tokio tasks, not OS threads)
    #[arg(long, default_value = "16")]
    num_workers: usize,

    /// Payload size in bytes (supports suffixes: KB, MB, e.g., 16KB, 1MB)
    #[arg(long, default_value = "64B")]
    payload_size: String,

    /// Method to call
    #[arg(long, default_value = "/hello")]
    method: String,

    /// Run an echo server in-process over the loopback transport
    #[arg(long, default_value_t = false)]
    loopback: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Parse size string like "16KB", "1MB", etc.
fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim().to_uppercase();

    if let Some(stripped) = s.strip_suffix("KB") {
        Ok(stripped.parse::<usize>()? * 1024)
    } else if let Some(stripped) = s.strip_suffix("MB") {
        Ok(stripped.parse::<usize>()? * 1024 * 1024)
    } else if let Some(stripped) = s.strip_suffix('B') {
        Ok(stripped.parse::<usize>()?)
    } else {
        // Assume bytes if no suffix
        Ok(s.parse::<usize>()?)
    }
}

/// Latency at `pct` (0..=100) of a sorted sample
fn percentile(sorted: &[Duration], pct: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() - 1) as f64 * pct / 100.0).round() as usize;
    sorted[idx]
}

/// Start an in-process echo server and return its handle and address
async fn start_loopback_server(transport: Transport) -> Result<(Server, tokio::task::JoinHandle<()>)> {
    let server = Server::with_transport("bench:0", transport);
    let runner = server.clone();
    let handle = tokio::spawn(async move {
        let result = runner
            .run(|request: RequestHandler| async move {
                let mut payload = None;
                request
                    .receive_message(Metadata::new(), |message| payload = message)
                    .await?;
                request
                    .send_response(payload, status::OK, status::OK_MESSAGE, Metadata::new())
                    .await?;
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::error!("Loopback server failed: {}", e);
        }
    });
    Ok((server, handle))
}

async fn run_bench(args: Args) -> Result<()> {
    if args.num_workers == 0 {
        return Err(anyhow!("--num-workers must be at least 1"));
    }
    let payload_size = parse_size(&args.payload_size)?;
    let payload = Bytes::from(vec![b'x'; payload_size]);

    let (channel, server) = if args.loopback {
        let transport = Transport::loopback();
        let (server, handle) = start_loopback_server(transport.clone()).await?;
        let addr = server.listening().await?;
        (Channel::with_transport(addr, transport), Some((server, handle)))
    } else {
        (Channel::new(args.server_addr.clone()), None)
    };

    println!("\n=== Benchmark ===");
    println!(
        "{} calls to {} with {} byte payloads, {} workers, transport: {}",
        args.num_calls,
        args.method,
        payload_size,
        args.num_workers,
        if args.loopback { "loopback" } else { "TCP" }
    );

    let errors = Arc::new(AtomicU64::new(0));
    let mut tasks = JoinSet::new();
    let start = Instant::now();

    for worker_id in 0..args.num_workers {
        let channel = channel.clone();
        let payload = payload.clone();
        let method = args.method.clone();
        let errors = Arc::clone(&errors);
        let calls = args.num_calls / args.num_workers
            + usize::from(worker_id < args.num_calls % args.num_workers);

        tasks.spawn(async move {
            let mut latencies = Vec::with_capacity(calls);
            for _ in 0..calls {
                let call_start = Instant::now();
                match channel
                    .unary(method.as_str(), Metadata::new(), Some(payload.clone()))
                    .await
                {
                    Ok(response) if response.is_ok() => latencies.push(call_start.elapsed()),
                    Ok(response) => {
                        tracing::warn!(
                            "Worker {}: status {} {}",
                            worker_id,
                            response.status_code,
                            response.status_message
                        );
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::error!("Worker {}: call failed: {}", worker_id, e);
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            latencies
        });
    }

    let mut latencies = Vec::with_capacity(args.num_calls);
    while let Some(result) = tasks.join_next().await {
        latencies.extend(result?);
    }
    let duration = start.elapsed();

    if let Some((server, handle)) = server {
        server.stop();
        handle.await?;
    }

    if latencies.is_empty() {
        return Err(anyhow!("no call succeeded"));
    }
    latencies.sort();

    let ok = latencies.len();
    println!("Completed {} calls ({} errors) in {:.2}s", ok, errors.load(Ordering::Relaxed), duration.as_secs_f64());
    println!("Throughput: {:.0} calls/sec", ok as f64 / duration.as_secs_f64());
    println!(
        "Latency: p50={:?} p99={:?} max={:?}",
        percentile(&latencies, 50.0),
        percentile(&latencies, 99.0),
        percentile(&latencies, 100.0)
    );

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    run_bench(args).await
}
