//! Unary RPC demo server
//!
//! Answers every call with a greeting and stops after serving `/goodbye`.
//!
//! Run with: cargo run --bin rpc-server -- --help

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use unary_rpc::{status, Metadata, RequestHandler, Server};

#[derive(Parser, Debug)]
#[command(name = "rpc-server")]
#[command(about = "Unary RPC demo server")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8999")]
    listen_addr: String,

    /// Reply payload
    #[arg(long, default_value = "hello, client!")]
    reply: String,

    /// Method that stops the server once answered
    #[arg(long, default_value = "/goodbye")]
    stop_method: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of worker threads for processing calls
    #[arg(long, default_value = "4")]
    worker_threads: usize,
}

async fn run_with_config(args: Args) -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    tracing::info!("=== Unary RPC Server Configuration ===");
    tracing::info!("Worker threads: {}", args.worker_threads);
    tracing::info!("Listen address: {}", args.listen_addr);
    tracing::info!("Stop method: {}", args.stop_method);
    tracing::info!("======================================");

    let server = Server::new(args.listen_addr.clone());
    let reply = Bytes::from(args.reply.into_bytes());
    let stop_method = args.stop_method;

    server.on_completion(|| tracing::info!("Server completed"));

    let handle = server.clone();
    server
        .run(move |request: RequestHandler| {
            let server = handle.clone();
            let reply = reply.clone();
            let stop_method = stop_method.clone();
            async move {
                tracing::info!(
                    "{} from host {} with {} metadata entries",
                    request.method(),
                    request.host(),
                    request.request_metadata().count()
                );

                let initial = Metadata::from([("a", "Apple"), ("b", "Banana"), ("c", "Cherry")]);
                request
                    .receive_message(initial, |message| {
                        let len = message.as_ref().map_or(0, |m| m.len());
                        tracing::debug!("Received {} byte message", len);
                    })
                    .await?;

                if request.method() == stop_method {
                    server.stop();
                }

                let trailing = Metadata::from([("0", "zero"), ("1", "one"), ("2", "two")]);
                request
                    .send_response(Some(reply), status::OK, status::OK_MESSAGE, trailing)
                    .await?;
                Ok(())
            }
        })
        .await?;

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let worker_threads = args.worker_threads;

    // Build tokio runtime with specified number of worker threads
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(run_with_config(args))
}
